//! Resolve Service references into clusters.

use std::fmt;
use std::time::Duration;

use k8s_openapi::api::core::v1::ServicePort;
use thiserror::Error;

use super::{Cluster, ServiceUpstream};
use crate::k8s::annotation::{self, CircuitBreakerAnnotations};
use crate::k8s::{NamespacedName, Service};
use crate::store::ResourceStore;

/// A Service port reference: by number or by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortRef {
    Number(i32),
    Name(String),
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortRef::Number(n) => write!(f, "{}", n),
            PortRef::Name(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("service \"{0}\" not found")]
    ServiceNotFound(NamespacedName),

    #[error("port \"{port}\" on service \"{service}\" not matched")]
    PortNotFound { service: NamespacedName, port: String },
}

/// Defaults applied to every cluster built from a Service.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterDefaults {
    pub connect_timeout: Duration,
    pub dns_lookup_family: String,
}

impl Default for ClusterDefaults {
    fn default() -> Self {
        Self { connect_timeout: Duration::from_secs(2), dns_lookup_family: "auto".to_string() }
    }
}

/// Whether a cluster protocol talks TLS to the upstream.
pub fn uses_tls(protocol: &str) -> bool {
    matches!(protocol, "tls" | "h2")
}

fn find_port<'a>(service: &'a Service, port: &PortRef) -> Option<&'a ServicePort> {
    let ports = service.spec.as_ref()?.ports.as_ref()?;
    ports.iter().find(|p| match port {
        PortRef::Number(n) => p.port == *n,
        PortRef::Name(name) => p.name.as_deref() == Some(name.as_str()),
    })
}

/// Build the cluster for `name:port`, applying the Service's circuit breaker
/// and upstream protocol annotations.
pub fn service_cluster(
    store: &ResourceStore,
    name: &NamespacedName,
    port: &PortRef,
    defaults: &ClusterDefaults,
) -> Result<Cluster, BackendError> {
    let service =
        store.service(name).ok_or_else(|| BackendError::ServiceNotFound(name.clone()))?;
    let service_port = find_port(service, port).ok_or_else(|| BackendError::PortNotFound {
        service: name.clone(),
        port: port.to_string(),
    })?;

    let spec = service.spec.as_ref();
    let external_name = spec
        .filter(|s| s.type_.as_deref() == Some("ExternalName"))
        .and_then(|s| s.external_name.clone());
    let port_name = service_port.name.clone().unwrap_or_default();

    let upstream = ServiceUpstream {
        name: name.clone(),
        port: service_port.port,
        port_name: port_name.clone(),
        external_name,
    };
    let mut cluster = Cluster::new(upstream, defaults.connect_timeout);
    cluster.dns_lookup_family = defaults.dns_lookup_family.clone();
    cluster.circuit_breakers = CircuitBreakerAnnotations::from_meta(&service.metadata);
    if let Some(protocol) =
        annotation::upstream_protocol(&service.metadata, &port_name, service_port.port)
    {
        cluster.protocol = protocol.to_string();
    }
    if cluster.protocol == "tls" {
        if let Some(external) = &cluster.upstream.external_name {
            cluster.sni = external.clone();
        }
    }
    Ok(cluster)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

    use crate::k8s::{ObjectMeta, Service};

    /// A ClusterIP Service with `(name, port, target)` ports.
    pub fn service(namespace: &str, name: &str, ports: &[(&str, i32, i32)]) -> Service {
        Service {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                ports: Some(
                    ports
                        .iter()
                        .map(|(port_name, port, target)| ServicePort {
                            name: (!port_name.is_empty()).then(|| port_name.to_string()),
                            port: *port,
                            protocol: Some("TCP".to_string()),
                            target_port: Some(IntOrString::Int(*target)),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn with_annotations(mut service: Service, pairs: &[(&str, &str)]) -> Service {
        let annotations: BTreeMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        service.metadata.annotations = Some(annotations);
        service
    }
}
