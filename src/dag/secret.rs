//! Resolve Secrets and ConfigMaps into validated TLS material.

use thiserror::Error;

use super::{CaBundle, TlsSecret};
use crate::errors::TlsError;
use crate::k8s::{NamespacedName, Secret};
use crate::store::ResourceStore;
use crate::utils::certificates::{
    validate_ca_bundle, validate_key_pair, CA_CERT_KEY, TLS_CERT_KEY, TLS_KEY_KEY,
};

pub const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";
pub const OPAQUE_SECRET_TYPE: &str = "Opaque";

/// Why a referenced Secret cannot be used.
#[derive(Debug, Error)]
pub enum SecretError {
    #[error("Secret \"{0}\" not found")]
    NotFound(NamespacedName),

    #[error("certificate delegation not permitted for Secret \"{0}\"")]
    NotDelegated(NamespacedName),

    #[error("Secret \"{0}\" has unsupported type \"{1}\"")]
    UnsupportedType(NamespacedName, String),

    #[error("Secret \"{name}\" is invalid: {source}")]
    Invalid {
        name: NamespacedName,
        #[source]
        source: TlsError,
    },
}

impl SecretError {
    /// Status reason for this error.
    pub fn reason(&self) -> &'static str {
        match self {
            SecretError::NotFound(_) => "SecretNotFound",
            SecretError::NotDelegated(_) => "DelegationNotPermitted",
            SecretError::UnsupportedType(..) | SecretError::Invalid { .. } => "SecretNotValid",
        }
    }
}

/// Read a data entry, accepting both `data` and `stringData`.
pub fn secret_data<'a>(secret: &'a Secret, key: &str) -> Option<&'a [u8]> {
    if let Some(value) = secret.data.as_ref().and_then(|d| d.get(key)) {
        return Some(value.0.as_slice());
    }
    secret.string_data.as_ref().and_then(|d| d.get(key)).map(|s| s.as_bytes())
}

/// Look up a certificate/key Secret on behalf of an object in `namespace`,
/// honouring TLSCertificateDelegation for cross-namespace references.
pub fn lookup_tls_secret(
    store: &ResourceStore,
    name: &NamespacedName,
    namespace: &str,
) -> Result<TlsSecret, SecretError> {
    if !store.delegation_permitted(name, namespace) {
        return Err(SecretError::NotDelegated(name.clone()));
    }
    tls_secret(store, name)
}

/// Look up a certificate/key Secret with no delegation check.
pub fn tls_secret(store: &ResourceStore, name: &NamespacedName) -> Result<TlsSecret, SecretError> {
    let secret = store.secret(name).ok_or_else(|| SecretError::NotFound(name.clone()))?;
    let secret_type = secret.type_.as_deref().unwrap_or(OPAQUE_SECRET_TYPE);
    if secret_type != TLS_SECRET_TYPE && secret_type != OPAQUE_SECRET_TYPE {
        return Err(SecretError::UnsupportedType(name.clone(), secret_type.to_string()));
    }
    let invalid = |source| SecretError::Invalid { name: name.clone(), source };
    let cert = secret_data(secret, TLS_CERT_KEY)
        .ok_or_else(|| invalid(TlsError::MissingCertificate { key: TLS_CERT_KEY }))?;
    let key = secret_data(secret, TLS_KEY_KEY)
        .ok_or_else(|| invalid(TlsError::MissingPrivateKey { key: TLS_KEY_KEY }))?;
    validate_key_pair(cert, key).map_err(invalid)?;
    Ok(TlsSecret { name: name.clone(), certificate_chain: cert.to_vec(), private_key: key.to_vec() })
}

/// Look up a CA bundle Secret (`ca.crt`) on behalf of an object in `namespace`.
pub fn lookup_ca_secret(
    store: &ResourceStore,
    name: &NamespacedName,
    namespace: &str,
) -> Result<CaBundle, SecretError> {
    if !store.delegation_permitted(name, namespace) {
        return Err(SecretError::NotDelegated(name.clone()));
    }
    let secret = store.secret(name).ok_or_else(|| SecretError::NotFound(name.clone()))?;
    let invalid = |source| SecretError::Invalid { name: name.clone(), source };
    let ca = secret_data(secret, CA_CERT_KEY)
        .ok_or_else(|| invalid(TlsError::MissingCaBundle { key: CA_CERT_KEY }))?;
    validate_ca_bundle(ca).map_err(invalid)?;
    Ok(CaBundle { name: name.clone(), ca_certificate: ca.to_vec() })
}

/// Look up a CA bundle held in a ConfigMap's `ca.crt` entry.
pub fn lookup_ca_config_map(
    store: &ResourceStore,
    name: &NamespacedName,
) -> Result<CaBundle, SecretError> {
    let config_map = store.config_map(name).ok_or_else(|| SecretError::NotFound(name.clone()))?;
    let invalid = |source| SecretError::Invalid { name: name.clone(), source };
    let ca = config_map
        .data
        .as_ref()
        .and_then(|d| d.get(CA_CERT_KEY))
        .ok_or_else(|| invalid(TlsError::MissingCaBundle { key: CA_CERT_KEY }))?;
    validate_ca_bundle(ca.as_bytes()).map_err(invalid)?;
    Ok(CaBundle { name: name.clone(), ca_certificate: ca.as_bytes().to_vec() })
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::k8s::ObjectMeta;

    #[test]
    fn valid_tls_secret_resolves() {
        let mut store = ResourceStore::default();
        store.insert(tls_secret_object("default", "cert").into());
        let secret = lookup_tls_secret(&store, &NamespacedName::new("default", "cert"), "default")
            .unwrap();
        assert!(!secret.certificate_chain.is_empty());
    }

    #[test]
    fn missing_and_undelegated_secrets() {
        let mut store = ResourceStore::default();
        store.insert(tls_secret_object("secrets", "cert").into());
        let name = NamespacedName::new("secrets", "cert");
        let err = lookup_tls_secret(&store, &name, "default").unwrap_err();
        assert_eq!(err.reason(), "DelegationNotPermitted");
        let err = tls_secret(&store, &NamespacedName::new("default", "nope")).unwrap_err();
        assert_eq!(err.reason(), "SecretNotFound");
    }

    #[test]
    fn malformed_secret_is_invalid() {
        let mut store = ResourceStore::default();
        let mut secret = tls_secret_object("default", "cert");
        secret.data.as_mut().unwrap().remove(TLS_KEY_KEY);
        store.insert(secret.into());
        let err = tls_secret(&store, &NamespacedName::new("default", "cert")).unwrap_err();
        assert_eq!(err.reason(), "SecretNotValid");

        let mut store = ResourceStore::default();
        store.insert(
            Secret {
                metadata: ObjectMeta {
                    namespace: Some("default".into()),
                    name: Some("token".into()),
                    ..Default::default()
                },
                type_: Some("kubernetes.io/service-account-token".into()),
                ..Default::default()
            }
            .into(),
        );
        let err = tls_secret(&store, &NamespacedName::new("default", "token")).unwrap_err();
        assert!(matches!(err, SecretError::UnsupportedType(..)));
    }

    #[test]
    fn ca_bundle_resolves() {
        let mut store = ResourceStore::default();
        store.insert(ca_secret_object("default", "ca").into());
        let ca = lookup_ca_secret(&store, &NamespacedName::new("default", "ca"), "default").unwrap();
        assert!(String::from_utf8(ca.ca_certificate).unwrap().contains("BEGIN CERTIFICATE"));
    }
}
