//! Cluster translation.
//!
//! Service clusters are EDS clusters fed over ADS; `ExternalName` services
//! become STRICT_DNS clusters resolving the external name directly.

use std::collections::HashMap;

use envoy_types::pb::envoy::config::cluster::v3::circuit_breakers::Thresholds;
use envoy_types::pb::envoy::config::cluster::v3::cluster::{
    ClusterDiscoveryType, CommonLbConfig, DiscoveryType, DnsLookupFamily, EdsClusterConfig, LbPolicy,
};
use envoy_types::pb::envoy::config::cluster::v3::{CircuitBreakers, Cluster as EnvoyCluster};
use envoy_types::pb::envoy::config::core::v3::{
    address, health_check, socket_address::PortSpecifier, transport_socket, Address,
    HealthCheck as EnvoyHealthCheck, Http2ProtocolOptions, HttpProtocolOptions as CommonHttpOptions,
    SocketAddress, TransportSocket,
};
use envoy_types::pb::envoy::config::endpoint::v3::{
    lb_endpoint::HostIdentifier, ClusterLoadAssignment, Endpoint, LbEndpoint, LocalityLbEndpoints,
};
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{
    common_tls_context::ValidationContextType, subject_alt_name_matcher::SanType,
    CertificateValidationContext, CommonTlsContext, SdsSecretConfig, SubjectAltNameMatcher,
    UpstreamTlsContext,
};
use envoy_types::pb::envoy::extensions::upstreams::http::v3::http_protocol_options::explicit_http_config::ProtocolConfig;
use envoy_types::pb::envoy::extensions::upstreams::http::v3::http_protocol_options::{
    ExplicitHttpConfig, UpstreamProtocolOptions,
};
use envoy_types::pb::envoy::extensions::upstreams::http::v3::HttpProtocolOptions;
use envoy_types::pb::envoy::r#type::matcher::v3::{string_matcher::MatchPattern, StringMatcher};
use envoy_types::pb::envoy::r#type::v3::{Int64Range, Percent};
use envoy_types::pb::google::protobuf::{Any, UInt32Value};

use super::naming::{alt_stat_name, cluster_name, secret_name};
use super::secret::{inline_bytes, tls_parameters};
use super::{ads_config_source, any, proto_duration};
use crate::dag::{
    Cluster, ExtensionCluster, HealthCheck, LoadBalancerStrategy, PeerValidation, TcpHealthCheck,
    Timeout, TlsSecret, UpstreamTls,
};

pub const HTTP_PROTOCOL_OPTIONS_KEY: &str = "envoy.extensions.upstreams.http.v3.HttpProtocolOptions";
const HTTP_PROTOCOL_OPTIONS_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.upstreams.http.v3.HttpProtocolOptions";
const UPSTREAM_TLS_CONTEXT_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.UpstreamTlsContext";
pub const TLS_TRANSPORT_SOCKET: &str = "envoy.transport_sockets.tls";

/// Translate a service cluster.
pub fn cluster(cluster: &Cluster) -> EnvoyCluster {
    let name = cluster_name(cluster);
    let mut out = EnvoyCluster {
        name: name.clone(),
        alt_stat_name: alt_stat_name(cluster),
        connect_timeout: Some(proto_duration(cluster.connect_timeout)),
        lb_policy: lb_policy(cluster.lb_strategy) as i32,
        common_lb_config: Some(common_lb_config()),
        ..Default::default()
    };

    match &cluster.upstream.external_name {
        Some(external) => {
            out.cluster_discovery_type =
                Some(ClusterDiscoveryType::Type(DiscoveryType::StrictDns as i32));
            out.dns_lookup_family = dns_lookup_family(&cluster.dns_lookup_family) as i32;
            out.load_assignment = Some(dns_load_assignment(&name, external, cluster.upstream.port));
        }
        None => {
            out.cluster_discovery_type = Some(ClusterDiscoveryType::Type(DiscoveryType::Eds as i32));
            out.eds_cluster_config = Some(EdsClusterConfig {
                eds_config: Some(ads_config_source()),
                service_name: cluster.upstream.eds_service_name(),
            });
        }
    }

    if let Some(breakers) = circuit_breakers(cluster) {
        out.circuit_breakers = Some(breakers);
    }
    if let Some(check) = &cluster.health_check {
        out.health_checks = vec![http_health_check(check)];
    } else if let Some(check) = &cluster.tcp_health_check {
        out.health_checks = vec![tcp_health_check(check)];
    }

    out.typed_extension_protocol_options = protocol_options(
        matches!(cluster.protocol.as_str(), "h2" | "h2c"),
        cluster.idle_connection_timeout,
    );
    if matches!(cluster.protocol.as_str(), "tls" | "h2") {
        let alpn = if cluster.protocol == "h2" { vec!["h2".to_string()] } else { Vec::new() };
        out.transport_socket = Some(upstream_tls(
            &cluster.sni,
            alpn,
            cluster.upstream_tls.unwrap_or_default(),
            cluster.upstream_validation.as_ref(),
            cluster.client_certificate.as_ref(),
        ));
    }
    out
}

/// Translate an ExtensionService cluster. `h2` talks TLS, `h2c` cleartext.
pub fn extension_cluster(extension: &ExtensionCluster) -> EnvoyCluster {
    let mut out = EnvoyCluster {
        name: extension.name.clone(),
        alt_stat_name: extension.name.replace('/', "_"),
        connect_timeout: Some(proto_duration(extension.connect_timeout)),
        lb_policy: lb_policy(extension.lb_strategy) as i32,
        common_lb_config: Some(common_lb_config()),
        cluster_discovery_type: Some(ClusterDiscoveryType::Type(DiscoveryType::Eds as i32)),
        eds_cluster_config: Some(EdsClusterConfig {
            eds_config: Some(ads_config_source()),
            service_name: extension.name.clone(),
        }),
        ..Default::default()
    };
    out.typed_extension_protocol_options =
        protocol_options(true, extension.idle_connection_timeout);
    if extension.protocol == "h2" {
        out.transport_socket = Some(upstream_tls(
            &extension.sni,
            vec!["h2".to_string()],
            UpstreamTls::default(),
            extension.upstream_validation.as_ref(),
            extension.client_certificate.as_ref(),
        ));
    }
    out
}

fn lb_policy(strategy: LoadBalancerStrategy) -> LbPolicy {
    match strategy {
        LoadBalancerStrategy::RoundRobin => LbPolicy::RoundRobin,
        LoadBalancerStrategy::WeightedLeastRequest => LbPolicy::LeastRequest,
        LoadBalancerStrategy::Random => LbPolicy::Random,
        LoadBalancerStrategy::RequestHash | LoadBalancerStrategy::Cookie => LbPolicy::RingHash,
    }
}

fn dns_lookup_family(value: &str) -> DnsLookupFamily {
    match value {
        "v4" => DnsLookupFamily::V4Only,
        "v6" => DnsLookupFamily::V6Only,
        "all" => DnsLookupFamily::All,
        _ => DnsLookupFamily::Auto,
    }
}

/// Envoy keeps routing to unhealthy hosts by default once too many are down;
/// a zero panic threshold turns that off.
fn common_lb_config() -> CommonLbConfig {
    CommonLbConfig { healthy_panic_threshold: Some(Percent { value: 0.0 }), ..Default::default() }
}

fn dns_load_assignment(cluster_name: &str, host: &str, port: i32) -> ClusterLoadAssignment {
    let address = Address {
        address: Some(address::Address::SocketAddress(SocketAddress {
            address: host.to_string(),
            port_specifier: Some(PortSpecifier::PortValue(u32::try_from(port).unwrap_or_default())),
            ..Default::default()
        })),
    };
    ClusterLoadAssignment {
        cluster_name: cluster_name.to_string(),
        endpoints: vec![LocalityLbEndpoints {
            lb_endpoints: vec![LbEndpoint {
                host_identifier: Some(HostIdentifier::Endpoint(Endpoint {
                    address: Some(address),
                    ..Default::default()
                })),
                ..Default::default()
            }],
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn circuit_breakers(cluster: &Cluster) -> Option<CircuitBreakers> {
    let b = &cluster.circuit_breakers;
    if b.max_connections.is_none()
        && b.max_pending_requests.is_none()
        && b.max_requests.is_none()
        && b.max_retries.is_none()
    {
        return None;
    }
    let value = |v: Option<u32>| v.map(|value| UInt32Value { value });
    Some(CircuitBreakers {
        thresholds: vec![Thresholds {
            max_connections: value(b.max_connections),
            max_pending_requests: value(b.max_pending_requests),
            max_requests: value(b.max_requests),
            max_retries: value(b.max_retries),
            ..Default::default()
        }],
        ..Default::default()
    })
}

fn http_health_check(check: &HealthCheck) -> EnvoyHealthCheck {
    EnvoyHealthCheck {
        timeout: Some(proto_duration(check.timeout)),
        interval: Some(proto_duration(check.interval)),
        unhealthy_threshold: Some(UInt32Value { value: check.unhealthy_threshold }),
        healthy_threshold: Some(UInt32Value { value: check.healthy_threshold }),
        health_checker: Some(health_check::HealthChecker::HttpHealthCheck(
            health_check::HttpHealthCheck {
                host: check.host.clone(),
                path: check.path.clone(),
                expected_statuses: check
                    .expected_statuses
                    .iter()
                    .map(|&(start, end)| Int64Range { start, end })
                    .collect(),
                ..Default::default()
            },
        )),
        ..Default::default()
    }
}

fn tcp_health_check(check: &TcpHealthCheck) -> EnvoyHealthCheck {
    EnvoyHealthCheck {
        timeout: Some(proto_duration(check.timeout)),
        interval: Some(proto_duration(check.interval)),
        unhealthy_threshold: Some(UInt32Value { value: check.unhealthy_threshold }),
        healthy_threshold: Some(UInt32Value { value: check.healthy_threshold }),
        health_checker: Some(health_check::HealthChecker::TcpHealthCheck(
            health_check::TcpHealthCheck::default(),
        )),
        ..Default::default()
    }
}

fn protocol_options(http2: bool, idle: Timeout) -> HashMap<String, Any> {
    let idle_timeout = match idle {
        Timeout::Default => None,
        Timeout::Disabled => Some(proto_duration(std::time::Duration::ZERO)),
        Timeout::Duration(d) => Some(proto_duration(d)),
    };
    if !http2 && idle_timeout.is_none() {
        return HashMap::new();
    }
    let options = HttpProtocolOptions {
        common_http_protocol_options: idle_timeout
            .map(|t| CommonHttpOptions { idle_timeout: Some(t), ..Default::default() }),
        upstream_protocol_options: http2.then(|| {
            UpstreamProtocolOptions::ExplicitHttpConfig(ExplicitHttpConfig {
                protocol_config: Some(ProtocolConfig::Http2ProtocolOptions(
                    Http2ProtocolOptions::default(),
                )),
            })
        }),
        ..Default::default()
    };
    HashMap::from([(
        HTTP_PROTOCOL_OPTIONS_KEY.to_string(),
        any(HTTP_PROTOCOL_OPTIONS_TYPE_URL, &options),
    )])
}

/// SDS reference to a certificate served by this control plane.
pub fn sds_secret_config(secret: &TlsSecret) -> SdsSecretConfig {
    SdsSecretConfig { name: secret_name(secret), sds_config: Some(ads_config_source()) }
}

fn upstream_tls(
    sni: &str,
    alpn: Vec<String>,
    versions: UpstreamTls,
    validation: Option<&PeerValidation>,
    client_certificate: Option<&TlsSecret>,
) -> TransportSocket {
    let validation_context = validation.map(|v| {
        ValidationContextType::ValidationContext(CertificateValidationContext {
            trusted_ca: Some(inline_bytes(&v.ca.ca_certificate)),
            match_typed_subject_alt_names: vec![SubjectAltNameMatcher {
                san_type: SanType::Dns as i32,
                matcher: Some(StringMatcher {
                    match_pattern: Some(MatchPattern::Exact(v.subject_name.clone())),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        })
    });
    let context = UpstreamTlsContext {
        sni: sni.to_string(),
        common_tls_context: Some(CommonTlsContext {
            alpn_protocols: alpn,
            tls_params: tls_parameters(versions.min_version, versions.max_version),
            validation_context_type: validation_context,
            tls_certificate_sds_secret_configs: client_certificate
                .map(sds_secret_config)
                .into_iter()
                .collect(),
            ..Default::default()
        }),
        ..Default::default()
    };
    TransportSocket {
        name: TLS_TRANSPORT_SOCKET.to_string(),
        config_type: Some(transport_socket::ConfigType::TypedConfig(any(
            UPSTREAM_TLS_CONTEXT_TYPE_URL,
            &context,
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::dag::{CaBundle, ServiceUpstream};
    use crate::k8s::NamespacedName;
    use crate::xds::naming::DEFAULT_CONNECT_TIMEOUT;
    use pretty_assertions::assert_eq;

    fn kuard(port_name: &str) -> Cluster {
        Cluster::new(
            ServiceUpstream {
                name: NamespacedName::new("default", "kuard"),
                port: 80,
                port_name: port_name.into(),
                external_name: None,
            },
            DEFAULT_CONNECT_TIMEOUT,
        )
    }

    #[test]
    fn eds_cluster_defaults() {
        let out = cluster(&kuard(""));
        assert_eq!(out.name, "default/kuard/80/da39a3ee5e");
        assert_eq!(out.alt_stat_name, "default_kuard_80");
        assert_eq!(
            out.cluster_discovery_type,
            Some(ClusterDiscoveryType::Type(DiscoveryType::Eds as i32))
        );
        assert_eq!(out.eds_cluster_config.unwrap().service_name, "default/kuard");
        assert_eq!(out.connect_timeout.unwrap().seconds, 2);
        assert_eq!(out.lb_policy, LbPolicy::RoundRobin as i32);
        assert_eq!(
            out.common_lb_config.unwrap().healthy_panic_threshold,
            Some(Percent { value: 0.0 })
        );
        assert!(out.transport_socket.is_none());
        assert!(out.typed_extension_protocol_options.is_empty());
    }

    #[test]
    fn named_port_changes_only_service_name() {
        let out = cluster(&kuard("http"));
        assert_eq!(out.name, "default/kuard/80/da39a3ee5e");
        assert_eq!(out.eds_cluster_config.unwrap().service_name, "default/kuard/http");
    }

    #[test]
    fn external_name_uses_strict_dns() {
        let mut c = kuard("");
        c.upstream.external_name = Some("foo.io".into());
        let out = cluster(&c);
        assert_eq!(
            out.cluster_discovery_type,
            Some(ClusterDiscoveryType::Type(DiscoveryType::StrictDns as i32))
        );
        assert!(out.eds_cluster_config.is_none());
        let endpoint = &out.load_assignment.unwrap().endpoints[0].lb_endpoints[0];
        assert!(endpoint.host_identifier.is_some());
    }

    #[test]
    fn h2_with_validation_is_tls() {
        let mut c = kuard("");
        c.protocol = "h2".into();
        c.sni = "kuard.example.com".into();
        c.upstream_validation = Some(PeerValidation {
            ca: CaBundle { name: NamespacedName::new("default", "ca"), ca_certificate: b"ca".to_vec() },
            subject_name: "kuard.example.com".into(),
        });
        c.circuit_breakers.max_connections = Some(9000);
        c.idle_connection_timeout = Timeout::Duration(Duration::from_secs(30));
        let out = cluster(&c);
        assert_eq!(out.transport_socket.unwrap().name, TLS_TRANSPORT_SOCKET);
        assert!(out.typed_extension_protocol_options.contains_key(HTTP_PROTOCOL_OPTIONS_KEY));
        let thresholds = &out.circuit_breakers.unwrap().thresholds[0];
        assert_eq!(thresholds.max_connections, Some(UInt32Value { value: 9000 }));
        assert_eq!(thresholds.max_requests, None);
    }

    #[test]
    fn health_checks_are_attached() {
        let mut c = kuard("");
        c.health_check = Some(HealthCheck {
            path: "/healthz".into(),
            host: "contour-envoy-healthcheck".into(),
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(2),
            unhealthy_threshold: 3,
            healthy_threshold: 2,
            expected_statuses: vec![(200, 300)],
        });
        let out = cluster(&c);
        assert_eq!(out.name, "default/kuard/80/da39a3ee5e");
        assert_eq!(out.health_checks.len(), 1);
        match out.health_checks[0].health_checker.as_ref().unwrap() {
            health_check::HealthChecker::HttpHealthCheck(http) => {
                assert_eq!(http.path, "/healthz");
                assert_eq!(http.expected_statuses, vec![Int64Range { start: 200, end: 300 }]);
            }
            other => panic!("unexpected health checker {other:?}"),
        }
    }
}
