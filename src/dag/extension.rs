//! ExtensionService processor: gRPC clusters for external services.

use tracing::debug;

use super::backend::{service_cluster, BackendError, ClusterDefaults, PortRef};
use super::builder::Processor;
use super::policy::{load_balancer_policy, Timeout, TimeoutPolicy};
use super::secret::{lookup_ca_secret, tls_secret};
use super::status::StatusAccumulator;
use super::{Dag, ExtensionCluster, PeerValidation, ServiceUpstream, TlsSecret};
use crate::config::Config;
use crate::k8s::projectcontour::ExtensionService;
use crate::k8s::{Kind, NamespacedName, ObjectKey};
use crate::store::ResourceStore;

pub const SERVICE_ERROR: &str = "ServiceError";
pub const PROTOCOL_ERROR: &str = "ProtocolError";
pub const TLS_ERROR: &str = "TLSError";
pub const TIMEOUT_ERROR: &str = "TimeoutPolicyError";

/// Name of the cluster for an ExtensionService.
pub fn extension_cluster_name(name: &NamespacedName) -> String {
    format!("extension/{}/{}", name.namespace, name.name)
}

#[derive(Debug, Clone)]
pub struct ExtensionServiceProcessor {
    cluster_defaults: ClusterDefaults,
    client_certificate: Option<NamespacedName>,
}

impl ExtensionServiceProcessor {
    pub fn from_config(config: &Config) -> Self {
        Self {
            cluster_defaults: ClusterDefaults {
                connect_timeout: config.cluster.connect_timeout(),
                dns_lookup_family: config.cluster.dns_lookup_family.clone(),
            },
            client_certificate: config.tls.envoy_client_certificate(),
        }
    }
}

impl Processor for ExtensionServiceProcessor {
    fn name(&self) -> &'static str {
        "extensionservice"
    }

    fn run(&self, dag: &mut Dag, store: &ResourceStore, status: &mut StatusAccumulator) {
        let client_certificate =
            self.client_certificate.as_ref().and_then(|name| tls_secret(store, name).ok());
        for (name, extension) in &store.extension_services {
            let key = ObjectKey::new(Kind::ExtensionService, name.namespace.clone(), name.name.clone());
            status.touch(&key);
            match self.extension_cluster(store, name, extension, client_certificate.as_ref()) {
                Ok(cluster) => {
                    debug!(extension = %name, cluster = %cluster.name, "Added extension cluster");
                    dag.extension_clusters.insert(cluster.name.clone(), cluster);
                }
                Err((condition_type, reason, message)) => {
                    status.add_error(&key, condition_type, reason, message);
                }
            }
        }
    }
}

type ExtensionError = (&'static str, &'static str, String);

impl ExtensionServiceProcessor {
    fn extension_cluster(
        &self,
        store: &ResourceStore,
        name: &NamespacedName,
        extension: &ExtensionService,
        client_certificate: Option<&TlsSecret>,
    ) -> Result<ExtensionCluster, ExtensionError> {
        let spec = &extension.spec;
        let protocol = match spec.protocol.as_deref().unwrap_or("h2") {
            p @ ("h2" | "h2c") => p.to_string(),
            other => {
                return Err((
                    PROTOCOL_ERROR,
                    "UnsupportedProtocol",
                    format!("unsupported protocol \"{}\"", other),
                ))
            }
        };
        if let Some(version) = spec.protocol_version.as_deref().filter(|v| *v != "v3") {
            return Err((
                PROTOCOL_ERROR,
                "UnsupportedProtocolVersion",
                format!("unsupported protocol version \"{}\"", version),
            ));
        }
        if spec.services.is_empty() {
            return Err((SERVICE_ERROR, "NoServicesPresent", "at least one service is required".into()));
        }

        let mut upstreams: Vec<(ServiceUpstream, u32)> = Vec::with_capacity(spec.services.len());
        for target in &spec.services {
            let service_name = NamespacedName::new(name.namespace.clone(), target.name.clone());
            let cluster = service_cluster(
                store,
                &service_name,
                &PortRef::Number(target.port),
                &self.cluster_defaults,
            )
            .map_err(|e| {
                let reason = match e {
                    BackendError::ServiceNotFound(_) => "ServiceUnresolvedReference",
                    BackendError::PortNotFound { .. } => "ServicePortUnresolved",
                };
                (SERVICE_ERROR, reason, e.to_string())
            })?;
            upstreams.push((cluster.upstream, target.weight.unwrap_or_default()));
        }

        let mut upstream_validation = None;
        let mut sni = String::new();
        if let Some(validation) = spec.validation.as_ref() {
            if protocol != "h2" {
                return Err((
                    TLS_ERROR,
                    "InconsistentProtocol",
                    "upstream validation requires the h2 protocol".into(),
                ));
            }
            let ca_name = NamespacedName::from_reference(&validation.ca_secret, &name.namespace)
                .ok_or_else(|| {
                    (TLS_ERROR, "SecretNotValid", format!("invalid CA Secret reference \"{}\"", validation.ca_secret))
                })?;
            let ca = lookup_ca_secret(store, &ca_name, &name.namespace)
                .map_err(|e| (TLS_ERROR, e.reason(), format!("upstream validation is invalid: {}", e)))?;
            sni = validation.subject_name.clone();
            upstream_validation = Some(PeerValidation { ca, subject_name: validation.subject_name.clone() });
        }

        let parse = |value: Option<&str>, field: &str| {
            Timeout::parse(value.unwrap_or_default()).map_err(|e| {
                (TIMEOUT_ERROR, "TimeoutPolicyNotValid", format!("timeoutPolicy.{} failed to parse: {}", field, e))
            })
        };
        let timeouts = spec.timeout_policy.as_ref();
        let timeout_policy = TimeoutPolicy {
            response: parse(timeouts.map(|t| t.response.as_str()), "response")?,
            idle_stream: parse(timeouts.map(|t| t.idle.as_str()), "idle")?,
        };
        let idle_connection_timeout =
            parse(timeouts.map(|t| t.idle_connection.as_str()), "idleConnection")?;
        let (lb_strategy, _) = load_balancer_policy(spec.load_balancer_policy.as_ref());

        Ok(ExtensionCluster {
            name: extension_cluster_name(name),
            source: name.clone(),
            upstreams,
            client_certificate: (protocol == "h2").then(|| client_certificate.cloned()).flatten(),
            protocol,
            sni,
            upstream_validation,
            lb_strategy,
            timeout_policy,
            idle_connection_timeout,
            connect_timeout: self.cluster_defaults.connect_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::dag::backend::test_support::service;
    use crate::dag::secret::test_support::ca_secret_object;
    use crate::dag::StatusUpdate;
    use crate::k8s::projectcontour::{
        ExtensionServiceSpec, ExtensionServiceTarget, TimeoutPolicy as ProxyTimeoutPolicy,
        UpstreamValidation,
    };
    use crate::k8s::ObjectMeta;

    fn extension(name: &str, spec: ExtensionServiceSpec) -> ExtensionService {
        ExtensionService {
            metadata: ObjectMeta {
                namespace: Some("auth".into()),
                name: Some(name.into()),
                ..Default::default()
            },
            spec,
        }
    }

    fn target(name: &str, port: i32) -> ExtensionServiceTarget {
        ExtensionServiceTarget { name: name.into(), port, weight: None }
    }

    fn build(store: &ResourceStore) -> (Dag, Vec<StatusUpdate>) {
        let mut dag = Dag::default();
        let mut status = StatusAccumulator::new();
        ExtensionServiceProcessor::from_config(&Config::default()).run(&mut dag, store, &mut status);
        (dag, status.into_updates())
    }

    #[test]
    fn h2c_extension_cluster() {
        let mut store = ResourceStore::default();
        store.insert(service("auth", "authz", &[("grpc", 9000, 9000)]).into());
        store.insert(
            extension(
                "authz",
                ExtensionServiceSpec {
                    services: vec![target("authz", 9000)],
                    protocol: Some("h2c".into()),
                    timeout_policy: Some(ProxyTimeoutPolicy {
                        response: "5s".into(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .into(),
        );
        let (dag, updates) = build(&store);
        let cluster = &dag.extension_clusters["extension/auth/authz"];
        assert_eq!(cluster.protocol, "h2c");
        assert_eq!(cluster.upstreams.len(), 1);
        assert_eq!(cluster.timeout_policy.response, Timeout::Duration(Duration::from_secs(5)));
        assert!(updates[0].is_valid());
    }

    #[test]
    fn validated_extension_uses_subject_as_sni() {
        let mut store = ResourceStore::default();
        store.insert(service("auth", "authz", &[("grpc", 9000, 9000)]).into());
        store.insert(ca_secret_object("auth", "ca").into());
        store.insert(
            extension(
                "authz",
                ExtensionServiceSpec {
                    services: vec![target("authz", 9000)],
                    validation: Some(UpstreamValidation {
                        ca_secret: "ca".into(),
                        subject_name: "authz.auth".into(),
                    }),
                    ..Default::default()
                },
            )
            .into(),
        );
        let (dag, _) = build(&store);
        let cluster = &dag.extension_clusters["extension/auth/authz"];
        assert_eq!(cluster.protocol, "h2");
        assert_eq!(cluster.sni, "authz.auth");
        assert!(cluster.upstream_validation.is_some());
    }

    #[test]
    fn invalid_extensions_are_reported() {
        let mut store = ResourceStore::default();
        store.insert(
            extension("missing", ExtensionServiceSpec { services: vec![target("nope", 1)], ..Default::default() })
                .into(),
        );
        store.insert(
            extension(
                "proto",
                ExtensionServiceSpec {
                    services: vec![target("nope", 1)],
                    protocol: Some("http/1.1".into()),
                    ..Default::default()
                },
            )
            .into(),
        );
        let (dag, updates) = build(&store);
        assert!(dag.extension_clusters.is_empty());
        let by_name = |n: &str| updates.iter().find(|u| u.key.name == n).unwrap();
        assert!(by_name("missing").has_error(SERVICE_ERROR, "ServiceUnresolvedReference"));
        assert!(by_name("proto").has_error(PROTOCOL_ERROR, "UnsupportedProtocol"));
    }
}
