//! Whole-graph translation into the four xDS resource sets.

use std::collections::BTreeMap;

use envoy_types::pb::envoy::config::cluster::v3::Cluster as EnvoyCluster;
use envoy_types::pb::envoy::config::listener::v3::Listener as EnvoyListener;
use envoy_types::pb::envoy::config::route::v3::RouteConfiguration;
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::Secret;
use tracing::debug;

use super::{cluster, listener, route, secret, BuiltResource, ResourceType};
use crate::dag::{Dag, ListenerProtocol, VirtualHost};

/// Envoy resources for one graph, each set sorted by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Translation {
    pub clusters: Vec<EnvoyCluster>,
    pub route_configs: Vec<RouteConfiguration>,
    pub listeners: Vec<EnvoyListener>,
    pub secrets: Vec<Secret>,
}

impl Translation {
    /// The resources of one type, ready for the snapshot cache.
    pub fn resources(&self, resource_type: ResourceType) -> Vec<BuiltResource> {
        let url = resource_type.type_url();
        match resource_type {
            ResourceType::Cluster => {
                self.clusters.iter().map(|c| BuiltResource::new(&c.name, url, c)).collect()
            }
            ResourceType::Route => {
                self.route_configs.iter().map(|r| BuiltResource::new(&r.name, url, r)).collect()
            }
            ResourceType::Listener => {
                self.listeners.iter().map(|l| BuiltResource::new(&l.name, url, l)).collect()
            }
            ResourceType::Secret => {
                self.secrets.iter().map(|s| BuiltResource::new(&s.name, url, s)).collect()
            }
        }
    }
}

pub fn translate(dag: &Dag) -> Translation {
    let mut clusters: BTreeMap<String, EnvoyCluster> = BTreeMap::new();
    for c in dag.clusters() {
        let built = cluster::cluster(c);
        clusters.entry(built.name.clone()).or_insert(built);
    }
    for extension in dag.extension_clusters.values() {
        clusters.insert(extension.name.clone(), cluster::extension_cluster(extension));
    }

    let translation = Translation {
        clusters: clusters.into_values().collect(),
        route_configs: route_configurations(dag),
        listeners: dag.listeners.values().filter_map(listener::listener).collect(),
        secrets: secret::secrets(dag.secrets()),
    };
    debug!(
        clusters = translation.clusters.len(),
        routes = translation.route_configs.len(),
        listeners = translation.listeners.len(),
        secrets = translation.secrets.len(),
        "Translated routing graph"
    );
    translation
}

/// Insecure virtual hosts share their listener's RouteConfiguration; every
/// TLS-terminated HTTP host gets its own, and fallback-enabled hosts are
/// collected into the listener's fallback RouteConfiguration.
fn route_configurations(dag: &Dag) -> Vec<RouteConfiguration> {
    let mut configs: BTreeMap<String, Vec<&VirtualHost>> = BTreeMap::new();
    for l in dag.listeners.values() {
        match l.protocol {
            ListenerProtocol::Http => {
                configs.entry(l.route_config_name.clone()).or_default().extend(l.virtual_hosts.values());
            }
            ListenerProtocol::Https => {
                for svhost in l.secure_virtual_hosts.values() {
                    if svhost.secret.is_none() || svhost.tcp_proxy.is_some() {
                        continue;
                    }
                    configs
                        .entry(l.secure_route_config_name(svhost.name()))
                        .or_default()
                        .push(&svhost.virtual_host);
                    if svhost.fallback_certificate.is_some() {
                        configs
                            .entry(l.fallback_route_config_name.clone())
                            .or_default()
                            .push(&svhost.virtual_host);
                    }
                }
            }
            ListenerProtocol::Tcp => {}
        }
    }
    configs.into_iter().map(|(name, vhosts)| route::route_configuration(&name, vhosts)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{
        Cluster, Listener, PathMatch, Route, RouteAction, RouteConditions, SecureVirtualHost,
        ServiceUpstream, TlsSecret,
    };
    use crate::k8s::{Kind, NamespacedName, ObjectKey};
    use crate::xds::naming::DEFAULT_CONNECT_TIMEOUT;
    use pretty_assertions::assert_eq;

    fn kuard_route() -> Route {
        Route::new(
            RouteConditions::path(PathMatch::root()),
            RouteAction::Clusters(vec![Cluster::new(
                ServiceUpstream {
                    name: NamespacedName::new("default", "kuard"),
                    port: 80,
                    port_name: String::new(),
                    external_name: None,
                },
                DEFAULT_CONNECT_TIMEOUT,
            )]),
            ObjectKey::new(Kind::Ingress, "default", "kuard"),
            None,
        )
    }

    fn dag() -> Dag {
        let mut dag = Dag::default();
        dag.add_listener(Listener::new("ingress_http", ListenerProtocol::Http, "0.0.0.0", 8080));
        dag.add_listener(
            Listener::new("ingress_https", ListenerProtocol::Https, "0.0.0.0", 8443)
                .with_route_config_name("https")
                .with_fallback_route_config_name("ingress_fallbackcert"),
        );
        dag
    }

    #[test]
    fn empty_graph_keeps_the_http_route_configuration() {
        let out = translate(&dag());
        assert!(out.clusters.is_empty());
        assert!(out.listeners.is_empty());
        assert!(out.secrets.is_empty());
        let names: Vec<&str> = out.route_configs.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["ingress_http"]);
    }

    #[test]
    fn shared_clusters_are_emitted_once() {
        let mut dag = dag();
        for host in ["a.example.com", "b.example.com"] {
            dag.virtual_host("ingress_http", host).unwrap().add_route(kuard_route());
        }
        let out = translate(&dag);
        assert_eq!(out.clusters.len(), 1);
        assert_eq!(out.clusters[0].name, "default/kuard/80/da39a3ee5e");
        assert_eq!(out.listeners.len(), 1);
        assert_eq!(out.route_configs[0].virtual_hosts.len(), 2);
        assert_eq!(out.resources(ResourceType::Cluster)[0].name, "default/kuard/80/da39a3ee5e");
    }

    #[test]
    fn secure_hosts_get_their_own_route_configuration() {
        let mut dag = dag();
        let secret = TlsSecret {
            name: NamespacedName::new("default", "tls"),
            certificate_chain: b"cert".to_vec(),
            private_key: b"key".to_vec(),
        };
        let svhost: &mut SecureVirtualHost =
            dag.secure_virtual_host("ingress_https", "example.com").unwrap();
        svhost.secret = Some(secret.clone());
        svhost.fallback_certificate = Some(secret);
        svhost.virtual_host.add_route(kuard_route());

        let out = translate(&dag);
        let names: Vec<&str> = out.route_configs.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["https/example.com", "ingress_fallbackcert", "ingress_http"]);
        assert_eq!(out.secrets.len(), 1);
        assert_eq!(out.listeners[0].name, "ingress_https");
    }
}
