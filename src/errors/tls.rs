use thiserror::Error;

/// Problems found in TLS material carried by Kubernetes Secrets and ConfigMaps.
///
/// These never abort a build. The graph builder turns them into status
/// conditions on whichever object referenced the bad Secret.
#[derive(Debug, Error)]
pub enum TlsError {
    /// The Secret has no `tls.crt` entry.
    #[error("missing {key} entry")]
    MissingCertificate { key: &'static str },

    /// The Secret has no `tls.key` entry.
    #[error("missing {key} entry")]
    MissingPrivateKey { key: &'static str },

    /// The Secret has no CA bundle entry.
    #[error("missing {key} entry")]
    MissingCaBundle { key: &'static str },

    /// No certificates were found in the supplied PEM data.
    #[error("{key} does not contain any certificates")]
    EmptyCertificateChain { key: &'static str },

    /// The PEM contents were invalid or unreadable.
    #[error("{key} is not a valid PEM: {source}")]
    InvalidCertificatePem {
        key: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// The private key PEM contents were invalid or unsupported.
    #[error("{key} does not contain a supported private key")]
    InvalidPrivateKey {
        key: &'static str,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// The supplied certificate and key do not match.
    #[error("certificate and private key do not match")]
    CertificateKeyMismatch,

    /// Generic metadata extraction failure.
    #[error("failed to parse certificate: {source}")]
    CertificateMetadata {
        #[source]
        source: anyhow::Error,
    },
}
