//! Listener translation.
//!
//! Plaintext HTTP listeners carry one HCM over RDS. TLS listeners inspect the
//! ClientHello and select a filter chain per SNI name, with an optional
//! fallback chain for clients that send no (or an unknown) SNI name.

use envoy_types::pb::envoy::config::core::v3::{
    address::Address as AddressType, transport_socket::ConfigType as TransportSocketConfigType,
    socket_address::PortSpecifier, Address, SocketAddress, TransportSocket,
};
use envoy_types::pb::envoy::config::listener::v3::{
    filter, listener_filter, Filter, FilterChain, FilterChainMatch, Listener as EnvoyListener,
    ListenerFilter,
};
use envoy_types::pb::envoy::extensions::filters::http::router::v3::Router;
use envoy_types::pb::envoy::extensions::filters::listener::tls_inspector::v3::TlsInspector;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::{
    http_connection_manager::{CodecType, RouteSpecifier},
    http_filter::ConfigType as HttpFilterConfigType,
    HttpConnectionManager, HttpFilter, Rds,
};
use envoy_types::pb::envoy::extensions::filters::network::tcp_proxy::v3::{
    tcp_proxy::{self, weighted_cluster::ClusterWeight},
    TcpProxy as EnvoyTcpProxy,
};
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{
    certificate_validation_context::TrustChainVerification, common_tls_context,
    CertificateValidationContext, CommonTlsContext, DownstreamTlsContext,
};
use envoy_types::pb::google::protobuf::BoolValue;
use tracing::debug;

use super::cluster::{sds_secret_config, TLS_TRANSPORT_SOCKET};
use super::naming::cluster_name;
use super::secret::{inline_bytes, tls_parameters};
use super::{ads_config_source, any};
use crate::dag::{
    DownstreamValidation, Listener, ListenerProtocol, SecureVirtualHost, TcpProxy, TlsSecret,
    TlsVersion, WILDCARD_HOST,
};

pub const HTTP_CONNECTION_MANAGER: &str = "envoy.filters.network.http_connection_manager";
pub const TCP_PROXY: &str = "envoy.filters.network.tcp_proxy";
pub const TLS_INSPECTOR: &str = "envoy.filters.listener.tls_inspector";
const ROUTER: &str = "envoy.filters.http.router";

const HCM_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";
const TCP_PROXY_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.tcp_proxy.v3.TcpProxy";
const ROUTER_TYPE_URL: &str = "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";
const TLS_INSPECTOR_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.listener.tls_inspector.v3.TlsInspector";
const DOWNSTREAM_TLS_CONTEXT_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.DownstreamTlsContext";

/// Translate a listener. Listeners with nothing to serve yield `None`.
pub fn listener(listener: &Listener) -> Option<EnvoyListener> {
    let filter_chains = match listener.protocol {
        ListenerProtocol::Http if !listener.virtual_hosts.is_empty() => {
            vec![FilterChain {
                filters: vec![http_connection_manager(&listener.name, &listener.route_config_name)],
                ..Default::default()
            }]
        }
        ListenerProtocol::Http => Vec::new(),
        ListenerProtocol::Https => secure_filter_chains(listener),
        ListenerProtocol::Tcp => listener
            .tcp_proxy
            .iter()
            .map(|proxy| FilterChain {
                filters: vec![tcp_proxy_filter(&listener.name, proxy)],
                ..Default::default()
            })
            .collect(),
    };
    if filter_chains.is_empty() {
        debug!(listener = %listener.name, "Skipping listener without filter chains");
        return None;
    }

    let listener_filters = if listener.protocol == ListenerProtocol::Https {
        vec![ListenerFilter {
            name: TLS_INSPECTOR.to_string(),
            config_type: Some(listener_filter::ConfigType::TypedConfig(any(
                TLS_INSPECTOR_TYPE_URL,
                &TlsInspector::default(),
            ))),
            ..Default::default()
        }]
    } else {
        Vec::new()
    };

    Some(EnvoyListener {
        name: listener.name.clone(),
        address: Some(socket_address(&listener.address, listener.port)),
        filter_chains,
        listener_filters,
        ..Default::default()
    })
}

fn socket_address(address: &str, port: u32) -> Address {
    Address {
        address: Some(AddressType::SocketAddress(SocketAddress {
            address: address.to_string(),
            port_specifier: Some(PortSpecifier::PortValue(port)),
            ..Default::default()
        })),
    }
}

fn secure_filter_chains(listener: &Listener) -> Vec<FilterChain> {
    let mut chains = Vec::new();
    for svhost in listener.secure_virtual_hosts.values() {
        let host = svhost.name();
        let filter_chain_match = Some(FilterChainMatch {
            server_names: if host == WILDCARD_HOST { Vec::new() } else { vec![host.to_string()] },
            ..Default::default()
        });

        if svhost.is_passthrough() {
            if let Some(proxy) = &svhost.tcp_proxy {
                chains.push(FilterChain {
                    name: host.to_string(),
                    filter_chain_match,
                    filters: vec![tcp_proxy_filter(&listener.name, proxy)],
                    ..Default::default()
                });
            }
            continue;
        }
        let Some(secret) = &svhost.secret else { continue };
        let filter = match &svhost.tcp_proxy {
            Some(proxy) => tcp_proxy_filter(&listener.name, proxy),
            None => http_connection_manager(
                &listener.name,
                &listener.secure_route_config_name(host),
            ),
        };
        chains.push(FilterChain {
            name: host.to_string(),
            filter_chain_match,
            filters: vec![filter],
            transport_socket: Some(downstream_tls(
                secret,
                svhost,
                svhost.tcp_proxy.is_none(),
            )),
            ..Default::default()
        });
    }

    let fallback = listener
        .secure_virtual_hosts
        .values()
        .find_map(|svhost| svhost.fallback_certificate.as_ref().map(|cert| (cert, svhost)));
    if let Some((certificate, svhost)) = fallback {
        chains.push(FilterChain {
            name: "fallback-certificate".to_string(),
            filter_chain_match: Some(FilterChainMatch {
                transport_protocol: "tls".to_string(),
                ..Default::default()
            }),
            filters: vec![http_connection_manager(
                &listener.name,
                &listener.fallback_route_config_name,
            )],
            transport_socket: Some(downstream_tls(certificate, svhost, true)),
            ..Default::default()
        });
    }
    chains
}

fn http_connection_manager(stat_prefix: &str, route_config_name: &str) -> Filter {
    let hcm = HttpConnectionManager {
        codec_type: CodecType::Auto as i32,
        stat_prefix: stat_prefix.to_string(),
        route_specifier: Some(RouteSpecifier::Rds(Rds {
            route_config_name: route_config_name.to_string(),
            config_source: Some(ads_config_source()),
        })),
        http_filters: vec![HttpFilter {
            name: ROUTER.to_string(),
            config_type: Some(HttpFilterConfigType::TypedConfig(any(
                ROUTER_TYPE_URL,
                &Router::default(),
            ))),
            ..Default::default()
        }],
        use_remote_address: Some(BoolValue { value: true }),
        ..Default::default()
    };
    Filter {
        name: HTTP_CONNECTION_MANAGER.to_string(),
        config_type: Some(filter::ConfigType::TypedConfig(any(HCM_TYPE_URL, &hcm))),
    }
}

fn tcp_proxy_filter(stat_prefix: &str, proxy: &TcpProxy) -> Filter {
    let cluster_specifier = match proxy.clusters.as_slice() {
        [only] => tcp_proxy::ClusterSpecifier::Cluster(cluster_name(only)),
        clusters => {
            let all_zero = clusters.iter().all(|c| c.weight == 0);
            let mut weighted: Vec<ClusterWeight> = clusters
                .iter()
                .map(|c| ClusterWeight {
                    name: cluster_name(c),
                    weight: if all_zero { 1 } else { c.weight },
                    ..Default::default()
                })
                .collect();
            weighted.sort_by(|a, b| a.name.cmp(&b.name));
            tcp_proxy::ClusterSpecifier::WeightedClusters(tcp_proxy::WeightedCluster {
                clusters: weighted,
            })
        }
    };
    let proxy = EnvoyTcpProxy {
        stat_prefix: stat_prefix.to_string(),
        cluster_specifier: Some(cluster_specifier),
        ..Default::default()
    };
    Filter {
        name: TCP_PROXY.to_string(),
        config_type: Some(filter::ConfigType::TypedConfig(any(TCP_PROXY_TYPE_URL, &proxy))),
    }
}

fn downstream_tls(secret: &TlsSecret, svhost: &SecureVirtualHost, http: bool) -> TransportSocket {
    let min = match svhost.min_tls_version {
        TlsVersion::Auto => TlsVersion::V1_2,
        v => v,
    };
    let max = match svhost.max_tls_version {
        TlsVersion::Auto => TlsVersion::V1_3,
        v => v,
    };
    let alpn = if http { vec!["h2".to_string(), "http/1.1".to_string()] } else { Vec::new() };
    let mut context = DownstreamTlsContext {
        common_tls_context: Some(CommonTlsContext {
            tls_params: tls_parameters(min, max),
            tls_certificate_sds_secret_configs: vec![sds_secret_config(secret)],
            alpn_protocols: alpn,
            validation_context_type: svhost
                .downstream_validation
                .as_ref()
                .map(client_validation),
            ..Default::default()
        }),
        ..Default::default()
    };
    if svhost.downstream_validation.is_some() {
        context.require_client_certificate = Some(BoolValue { value: true });
    }
    TransportSocket {
        name: TLS_TRANSPORT_SOCKET.to_string(),
        config_type: Some(TransportSocketConfigType::TypedConfig(any(
            DOWNSTREAM_TLS_CONTEXT_TYPE_URL,
            &context,
        ))),
    }
}

fn client_validation(validation: &DownstreamValidation) -> common_tls_context::ValidationContextType {
    let context = if validation.skip_client_cert_validation {
        CertificateValidationContext {
            trust_chain_verification: TrustChainVerification::AcceptUntrusted as i32,
            ..Default::default()
        }
    } else {
        CertificateValidationContext {
            trusted_ca: validation.ca.as_ref().map(|ca| inline_bytes(&ca.ca_certificate)),
            ..Default::default()
        }
    };
    common_tls_context::ValidationContextType::ValidationContext(context)
}
