use anyhow::anyhow;
use chrono::{DateTime, TimeZone, Utc};
use ring::{
    rand::SystemRandom,
    signature::{
        EcdsaKeyPair, Ed25519KeyPair, KeyPair, RsaKeyPair, ECDSA_P256_SHA256_ASN1_SIGNING,
        ECDSA_P384_SHA384_ASN1_SIGNING,
    },
};
use rustls::pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer};
use x509_parser::certificate::X509Certificate;

use crate::errors::TlsError;

/// Secret data key holding the PEM certificate chain.
pub const TLS_CERT_KEY: &str = "tls.crt";
/// Secret data key holding the PEM private key.
pub const TLS_KEY_KEY: &str = "tls.key";
/// Secret or ConfigMap data key holding a PEM CA bundle.
pub const CA_CERT_KEY: &str = "ca.crt";

/// Metadata extracted from the leaf certificate for logging and validation.
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

const OID_ED25519: &str = "1.3.101.112";
const OID_EC_PUBLIC_KEY: &str = "1.2.840.10045.2.1";
const OID_RSA_ENCRYPTION: &str = "1.2.840.113549.1.1.1";

/// Validate a PEM certificate chain and its private key.
///
/// The chain must hold at least one certificate, the key must be a PKCS#8,
/// PKCS#1 or SEC1 key, and where the key algorithm is one `ring` can load the
/// key must belong to the leaf certificate.
pub fn validate_key_pair(cert_pem: &[u8], key_pem: &[u8]) -> Result<CertificateInfo, TlsError> {
    let chain = parse_certificates(cert_pem, TLS_CERT_KEY)?;
    let leaf = &chain[0];

    let private_key = PrivateKeyDer::from_pem_slice(key_pem).map_err(|err| {
        TlsError::InvalidPrivateKey { key: TLS_KEY_KEY, source: Some(anyhow!(err)) }
    })?;

    let (_, parsed) = x509_parser::parse_x509_certificate(leaf.as_ref())
        .map_err(|err| TlsError::CertificateMetadata { source: anyhow!(err.to_string()) })?;

    let spki = parsed.public_key();
    let algorithm_oid = spki.algorithm.algorithm.to_id_string();
    enforce_public_key_match(&algorithm_oid, &spki.subject_public_key.data, &private_key)?;

    certificate_info(&parsed)
}

/// Validate a PEM CA bundle, returning the number of certificates it holds.
pub fn validate_ca_bundle(ca_pem: &[u8]) -> Result<usize, TlsError> {
    let chain = parse_certificates(ca_pem, CA_CERT_KEY)?;
    for cert in &chain {
        x509_parser::parse_x509_certificate(cert.as_ref())
            .map_err(|err| TlsError::CertificateMetadata { source: anyhow!(err.to_string()) })?;
    }
    Ok(chain.len())
}

fn parse_certificates(
    pem: &[u8],
    key: &'static str,
) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let chain: Vec<CertificateDer<'static>> = CertificateDer::pem_slice_iter(pem)
        .map(|result| {
            result.map_err(|err| TlsError::InvalidCertificatePem { key, source: anyhow!(err) })
        })
        .collect::<Result<_, _>>()?;

    if chain.is_empty() {
        return Err(TlsError::EmptyCertificateChain { key });
    }
    Ok(chain)
}

fn certificate_info(cert: &X509Certificate<'_>) -> Result<CertificateInfo, TlsError> {
    let validity = cert.validity();
    Ok(CertificateInfo {
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        not_before: asn1_to_chrono(validity.not_before.timestamp())?,
        not_after: asn1_to_chrono(validity.not_after.timestamp())?,
    })
}

fn asn1_to_chrono(timestamp: i64) -> Result<DateTime<Utc>, TlsError> {
    Utc.timestamp_opt(timestamp, 0).single().ok_or_else(|| TlsError::CertificateMetadata {
        source: anyhow!("failed to convert certificate time"),
    })
}

fn enforce_public_key_match(
    algorithm_oid: &str,
    public_key: &[u8],
    private_key: &PrivateKeyDer<'_>,
) -> Result<(), TlsError> {
    let key_bytes = private_key.secret_der();

    match (algorithm_oid, private_key) {
        (OID_ED25519, PrivateKeyDer::Pkcs8(_)) => {
            let key_pair = Ed25519KeyPair::from_pkcs8_maybe_unchecked(key_bytes)
                .map_err(|_| TlsError::CertificateKeyMismatch)?;
            compare_bytes(key_pair.public_key().as_ref(), public_key)
        }
        (OID_EC_PUBLIC_KEY, PrivateKeyDer::Pkcs8(_)) => {
            let rng = SystemRandom::new();
            for alg in [&ECDSA_P256_SHA256_ASN1_SIGNING, &ECDSA_P384_SHA384_ASN1_SIGNING] {
                if let Ok(key_pair) = EcdsaKeyPair::from_pkcs8(alg, key_bytes, &rng) {
                    return compare_bytes(key_pair.public_key().as_ref(), public_key);
                }
            }
            Err(TlsError::CertificateKeyMismatch)
        }
        (OID_RSA_ENCRYPTION, PrivateKeyDer::Pkcs8(_)) => {
            let key_pair =
                RsaKeyPair::from_pkcs8(key_bytes).map_err(|_| TlsError::CertificateKeyMismatch)?;
            compare_bytes(key_pair.public().as_ref(), public_key)
        }
        (OID_RSA_ENCRYPTION, PrivateKeyDer::Pkcs1(_)) => {
            let key_pair =
                RsaKeyPair::from_der(key_bytes).map_err(|_| TlsError::CertificateKeyMismatch)?;
            compare_bytes(key_pair.public().as_ref(), public_key)
        }
        // SEC1 EC keys cannot be loaded by ring; accept them unverified.
        (OID_EC_PUBLIC_KEY, PrivateKeyDer::Sec1(_)) => Ok(()),
        (OID_ED25519 | OID_EC_PUBLIC_KEY | OID_RSA_ENCRYPTION, _) => {
            Err(TlsError::CertificateKeyMismatch)
        }
        _ => Ok(()),
    }
}

fn compare_bytes(expected: &[u8], actual: &[u8]) -> Result<(), TlsError> {
    if expected == actual {
        Ok(())
    } else {
        Err(TlsError::CertificateKeyMismatch)
    }
}
