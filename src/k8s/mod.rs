//! Kubernetes object model.
//!
//! Core objects (Service, Secret, ConfigMap, Namespace, Ingress) use the
//! `k8s-openapi` types. The projectcontour.io and Gateway API custom resources
//! are plain serde structs sharing `ObjectMeta`, since only the fields the
//! graph builder reads are modelled.

pub mod annotation;
pub mod gateway;
pub mod manifest;
pub mod projectcontour;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use gateway::{
    BackendTLSPolicy, Gateway, GatewayClass, HTTPRoute, ReferenceGrant, TCPRoute, TLSRoute,
};
pub use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret, Service};
pub use k8s_openapi::api::networking::v1::Ingress;
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
pub use projectcontour::{ExtensionService, HTTPProxy, TLSCertificateDelegation};

/// Every object kind the resource store understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Kind {
    Service,
    Secret,
    ConfigMap,
    Namespace,
    Ingress,
    HTTPProxy,
    TLSCertificateDelegation,
    ExtensionService,
    GatewayClass,
    Gateway,
    HTTPRoute,
    TLSRoute,
    TCPRoute,
    BackendTLSPolicy,
    ReferenceGrant,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Service => "Service",
            Kind::Secret => "Secret",
            Kind::ConfigMap => "ConfigMap",
            Kind::Namespace => "Namespace",
            Kind::Ingress => "Ingress",
            Kind::HTTPProxy => "HTTPProxy",
            Kind::TLSCertificateDelegation => "TLSCertificateDelegation",
            Kind::ExtensionService => "ExtensionService",
            Kind::GatewayClass => "GatewayClass",
            Kind::Gateway => "Gateway",
            Kind::HTTPRoute => "HTTPRoute",
            Kind::TLSRoute => "TLSRoute",
            Kind::TCPRoute => "TCPRoute",
            Kind::BackendTLSPolicy => "BackendTLSPolicy",
            Kind::ReferenceGrant => "ReferenceGrant",
        }
    }

    /// Look a kind up by its manifest `kind` field.
    pub fn from_manifest_kind(kind: &str) -> Option<Self> {
        [
            Kind::Service,
            Kind::Secret,
            Kind::ConfigMap,
            Kind::Namespace,
            Kind::Ingress,
            Kind::HTTPProxy,
            Kind::TLSCertificateDelegation,
            Kind::ExtensionService,
            Kind::GatewayClass,
            Kind::Gateway,
            Kind::HTTPRoute,
            Kind::TLSRoute,
            Kind::TCPRoute,
            Kind::BackendTLSPolicy,
            Kind::ReferenceGrant,
        ]
        .into_iter()
        .find(|candidate| candidate.as_str() == kind)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `namespace/name` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Parse `namespace/name`. Both halves must be non-empty.
    pub fn parse(value: &str) -> Option<Self> {
        let (namespace, name) = value.trim().split_once('/')?;
        if namespace.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some(Self::new(namespace, name))
    }

    /// Resolve a reference that is either `name` (in `default_namespace`) or
    /// `namespace/name`.
    pub fn from_reference(reference: &str, default_namespace: &str) -> Option<Self> {
        if reference.contains('/') {
            Self::parse(reference)
        } else if reference.is_empty() {
            None
        } else {
            Some(Self::new(default_namespace, reference))
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Identity of a stored object: kind, namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub kind: Kind,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: Kind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind, namespace: namespace.into(), name: name.into() }
    }

    pub fn from_meta(kind: Kind, meta: &ObjectMeta) -> Self {
        Self::new(kind, namespace_of(meta), name_of(meta))
    }

    pub fn namespaced_name(&self) -> NamespacedName {
        NamespacedName::new(self.namespace.clone(), self.name.clone())
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{} {}", self.kind, self.name)
        } else {
            write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
        }
    }
}

/// Any object accepted by the resource store.
#[derive(Debug, Clone, PartialEq)]
pub enum KubernetesObject {
    Service(Service),
    Secret(Secret),
    ConfigMap(ConfigMap),
    Namespace(Namespace),
    Ingress(Ingress),
    HTTPProxy(HTTPProxy),
    TLSCertificateDelegation(TLSCertificateDelegation),
    ExtensionService(ExtensionService),
    GatewayClass(GatewayClass),
    Gateway(Gateway),
    HTTPRoute(HTTPRoute),
    TLSRoute(TLSRoute),
    TCPRoute(TCPRoute),
    BackendTLSPolicy(BackendTLSPolicy),
    ReferenceGrant(ReferenceGrant),
}

impl KubernetesObject {
    pub fn kind(&self) -> Kind {
        match self {
            KubernetesObject::Service(_) => Kind::Service,
            KubernetesObject::Secret(_) => Kind::Secret,
            KubernetesObject::ConfigMap(_) => Kind::ConfigMap,
            KubernetesObject::Namespace(_) => Kind::Namespace,
            KubernetesObject::Ingress(_) => Kind::Ingress,
            KubernetesObject::HTTPProxy(_) => Kind::HTTPProxy,
            KubernetesObject::TLSCertificateDelegation(_) => Kind::TLSCertificateDelegation,
            KubernetesObject::ExtensionService(_) => Kind::ExtensionService,
            KubernetesObject::GatewayClass(_) => Kind::GatewayClass,
            KubernetesObject::Gateway(_) => Kind::Gateway,
            KubernetesObject::HTTPRoute(_) => Kind::HTTPRoute,
            KubernetesObject::TLSRoute(_) => Kind::TLSRoute,
            KubernetesObject::TCPRoute(_) => Kind::TCPRoute,
            KubernetesObject::BackendTLSPolicy(_) => Kind::BackendTLSPolicy,
            KubernetesObject::ReferenceGrant(_) => Kind::ReferenceGrant,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            KubernetesObject::Service(o) => &o.metadata,
            KubernetesObject::Secret(o) => &o.metadata,
            KubernetesObject::ConfigMap(o) => &o.metadata,
            KubernetesObject::Namespace(o) => &o.metadata,
            KubernetesObject::Ingress(o) => &o.metadata,
            KubernetesObject::HTTPProxy(o) => &o.metadata,
            KubernetesObject::TLSCertificateDelegation(o) => &o.metadata,
            KubernetesObject::ExtensionService(o) => &o.metadata,
            KubernetesObject::GatewayClass(o) => &o.metadata,
            KubernetesObject::Gateway(o) => &o.metadata,
            KubernetesObject::HTTPRoute(o) => &o.metadata,
            KubernetesObject::TLSRoute(o) => &o.metadata,
            KubernetesObject::TCPRoute(o) => &o.metadata,
            KubernetesObject::BackendTLSPolicy(o) => &o.metadata,
            KubernetesObject::ReferenceGrant(o) => &o.metadata,
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::from_meta(self.kind(), self.metadata())
    }
}

macro_rules! impl_from_object {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for KubernetesObject {
                fn from(object: $variant) -> Self {
                    KubernetesObject::$variant(object)
                }
            }
        )*
    };
}

impl_from_object!(
    Service,
    Secret,
    ConfigMap,
    Namespace,
    Ingress,
    HTTPProxy,
    TLSCertificateDelegation,
    ExtensionService,
    GatewayClass,
    Gateway,
    HTTPRoute,
    TLSRoute,
    TCPRoute,
    BackendTLSPolicy,
    ReferenceGrant,
);

pub fn namespace_of(meta: &ObjectMeta) -> String {
    meta.namespace.clone().unwrap_or_default()
}

pub fn name_of(meta: &ObjectMeta) -> String {
    meta.name.clone().unwrap_or_default()
}

pub fn annotations(meta: &ObjectMeta) -> Option<&BTreeMap<String, String>> {
    meta.annotations.as_ref()
}

pub fn labels(meta: &ObjectMeta) -> Option<&BTreeMap<String, String>> {
    meta.labels.as_ref()
}

/// Creation timestamp of an object as a chrono `DateTime`.
///
/// The k8s-openapi `Time` wrapper is converted through its RFC 3339 wire form
/// so the comparison does not depend on the wrapped time library.
pub fn creation_time(meta: &ObjectMeta) -> Option<DateTime<Utc>> {
    let time = meta.creation_timestamp.as_ref()?;
    let value = serde_json::to_value(time).ok()?;
    let text = value.as_str()?;
    DateTime::parse_from_rfc3339(text).ok().map(|t| t.with_timezone(&Utc))
}

/// Ordering used whenever two objects compete: older creation time first,
/// objects without a timestamp before all others, then namespace and name.
pub fn age_order(
    a_created: Option<DateTime<Utc>>,
    a_key: &ObjectKey,
    b_created: Option<DateTime<Utc>>,
    b_key: &ObjectKey,
) -> std::cmp::Ordering {
    a_created
        .cmp(&b_created)
        .then_with(|| a_key.namespace.cmp(&b_key.namespace))
        .then_with(|| a_key.name.cmp(&b_key.name))
        .then_with(|| a_key.kind.cmp(&b_key.kind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn meta(name: &str, created: Option<&str>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            creation_timestamp: created.map(|ts| {
                serde_json::from_value::<Time>(serde_json::Value::String(ts.to_string()))
                    .expect("valid timestamp")
            }),
            ..Default::default()
        }
    }

    #[test]
    fn namespaced_name_parsing() {
        assert_eq!(NamespacedName::parse("ns/name"), Some(NamespacedName::new("ns", "name")));
        assert_eq!(NamespacedName::parse("name"), None);
        assert_eq!(NamespacedName::parse("/name"), None);
        assert_eq!(NamespacedName::parse("a/b/c"), None);
        assert_eq!(
            NamespacedName::from_reference("secret", "default"),
            Some(NamespacedName::new("default", "secret"))
        );
        assert_eq!(
            NamespacedName::from_reference("other/secret", "default"),
            Some(NamespacedName::new("other", "secret"))
        );
    }

    #[test]
    fn creation_time_is_read_from_metadata() {
        let m = meta("a", Some("2024-01-01T00:00:00Z"));
        let created = creation_time(&m).expect("timestamp");
        assert_eq!(created.to_rfc3339(), "2024-01-01T00:00:00+00:00");
        assert!(creation_time(&meta("b", None)).is_none());
    }

    #[test]
    fn older_objects_order_first() {
        let older = meta("z", Some("2020-01-01T00:00:00Z"));
        let newer = meta("a", Some("2021-01-01T00:00:00Z"));
        let older_key = ObjectKey::from_meta(Kind::Ingress, &older);
        let newer_key = ObjectKey::from_meta(Kind::Ingress, &newer);
        assert_eq!(
            age_order(creation_time(&older), &older_key, creation_time(&newer), &newer_key),
            std::cmp::Ordering::Less
        );
    }

    #[test]
    fn object_key_display() {
        let key = ObjectKey::new(Kind::HTTPProxy, "default", "root");
        assert_eq!(key.to_string(), "HTTPProxy default/root");
        assert_eq!(Kind::from_manifest_kind("HTTPRoute"), Some(Kind::HTTPRoute));
    }
}
