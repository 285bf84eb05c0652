//! Listener processor: lays down the listeners routes attach to.

use std::collections::BTreeMap;

use super::builder::Processor;
use super::status::StatusAccumulator;
use super::{Dag, Listener, ListenerProtocol};
use crate::config::Config;
use crate::k8s::gateway;
use crate::store::ResourceStore;

pub const HTTP_LISTENER_NAME: &str = "ingress_http";
pub const HTTPS_LISTENER_NAME: &str = "ingress_https";
pub const HTTP_ROUTE_CONFIG_NAME: &str = "ingress_http";
pub const HTTPS_ROUTE_CONFIG_PREFIX: &str = "https";
pub const FALLBACK_ROUTE_CONFIG_NAME: &str = "ingress_fallbackcert";

/// Ports below this are shifted by the configured offset.
const PRIVILEGED_PORT_LIMIT: u32 = 1024;

/// Why a Gateway listener cannot be programmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerProblem {
    UnsupportedProtocol,
    ProtocolConflict,
    HostnameConflict,
    PortUnavailable,
    InvalidPort,
}

impl ListenerProblem {
    pub fn reason(&self) -> &'static str {
        match self {
            ListenerProblem::UnsupportedProtocol => "UnsupportedProtocol",
            ListenerProblem::ProtocolConflict => "ProtocolConflict",
            ListenerProblem::HostnameConflict => "HostnameConflict",
            ListenerProblem::PortUnavailable => "PortUnavailable",
            ListenerProblem::InvalidPort => "InvalidPort",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            ListenerProblem::UnsupportedProtocol => "listener protocol is not supported",
            ListenerProblem::ProtocolConflict => {
                "listener protocol conflicts with another listener on the same port"
            }
            ListenerProblem::HostnameConflict => {
                "listener hostname conflicts with another listener on the same port"
            }
            ListenerProblem::PortUnavailable => {
                "listener port maps to the same Envoy port as another listener port"
            }
            ListenerProblem::InvalidPort => "listener port must be between 1 and 65535",
        }
    }
}

/// How one Gateway listener maps onto an Envoy listener.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedListener {
    pub gateway_listener: gateway::Listener,
    pub envoy_name: String,
    pub protocol: ListenerProtocol,
    pub envoy_port: u32,
    pub problem: Option<ListenerProblem>,
}

impl PlannedListener {
    pub fn is_valid(&self) -> bool {
        self.problem.is_none()
    }

    /// `Passthrough` TLS listeners forward TLS without terminating it.
    pub fn is_passthrough(&self) -> bool {
        self.gateway_listener.protocol == "TLS"
            && self.gateway_listener.tls.as_ref().and_then(|t| t.mode.as_deref())
                == Some("Passthrough")
    }
}

fn protocol_of(protocol: &str) -> Option<ListenerProtocol> {
    match protocol {
        "HTTP" => Some(ListenerProtocol::Http),
        "HTTPS" | "TLS" => Some(ListenerProtocol::Https),
        "TCP" => Some(ListenerProtocol::Tcp),
        _ => None,
    }
}

/// Envoy port for a Gateway listener port.
pub fn envoy_port(port: u32, offset: u32) -> u32 {
    if port < PRIVILEGED_PORT_LIMIT {
        port + offset
    } else {
        port
    }
}

/// Map every Gateway listener to an Envoy listener and flag conflicts.
pub fn plan_gateway_listeners(gateway: &gateway::Gateway, offset: u32) -> Vec<PlannedListener> {
    let mut planned: Vec<PlannedListener> = gateway
        .spec
        .listeners
        .iter()
        .map(|l| {
            let protocol = protocol_of(&l.protocol);
            let port = u32::try_from(l.port).ok().filter(|p| (1..=65535).contains(p));
            let problem = match (protocol, port) {
                (None, _) => Some(ListenerProblem::UnsupportedProtocol),
                (_, None) => Some(ListenerProblem::InvalidPort),
                _ => None,
            };
            let protocol = protocol.unwrap_or(ListenerProtocol::Tcp);
            let port = port.unwrap_or_default();
            PlannedListener {
                gateway_listener: l.clone(),
                envoy_name: format!("{}-{}", protocol.as_str(), port),
                protocol,
                envoy_port: envoy_port(port, offset),
                problem,
            }
        })
        .collect();

    let mut by_port: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
    for (index, p) in planned.iter().enumerate() {
        if p.is_valid() {
            by_port.entry(p.envoy_port).or_default().push(index);
        }
    }
    for indexes in by_port.values() {
        let first_port = planned[indexes[0]].gateway_listener.port;
        if indexes.iter().any(|&i| planned[i].gateway_listener.port != first_port) {
            for &i in indexes {
                planned[i].problem = Some(ListenerProblem::PortUnavailable);
            }
            continue;
        }
        let first = planned[indexes[0]].protocol;
        let mixed = indexes.iter().any(|&i| planned[i].protocol != first);
        if mixed {
            for &i in indexes {
                planned[i].problem = Some(ListenerProblem::ProtocolConflict);
            }
            continue;
        }
        let mut hostnames: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for &i in indexes {
            let host = planned[i].gateway_listener.hostname.clone().unwrap_or_default();
            hostnames.entry(host).or_default().push(i);
        }
        for duplicates in hostnames.values().filter(|d| d.len() > 1) {
            for &i in duplicates {
                planned[i].problem = Some(ListenerProblem::HostnameConflict);
            }
        }
    }
    planned
}

/// Creates the Envoy listeners, either the fixed Ingress pair or one per
/// distinct port of the selected Gateway.
#[derive(Debug, Clone)]
pub struct ListenerProcessor {
    address: String,
    http_port: u32,
    https_port: u32,
    port_offset: u32,
}

impl ListenerProcessor {
    pub fn from_config(config: &Config) -> Self {
        Self {
            address: config.listener.address.clone(),
            http_port: config.listener.http_port,
            https_port: config.listener.https_port,
            port_offset: config.gateway.port_offset,
        }
    }
}

impl Processor for ListenerProcessor {
    fn name(&self) -> &'static str {
        "listener"
    }

    fn run(&self, dag: &mut Dag, store: &ResourceStore, _status: &mut StatusAccumulator) {
        let Some((_, gateway)) = store.selected_gateway() else {
            dag.add_listener(
                Listener::new(HTTP_LISTENER_NAME, ListenerProtocol::Http, &self.address, self.http_port)
                    .with_route_config_name(HTTP_ROUTE_CONFIG_NAME),
            );
            dag.add_listener(
                Listener::new(
                    HTTPS_LISTENER_NAME,
                    ListenerProtocol::Https,
                    &self.address,
                    self.https_port,
                )
                .with_route_config_name(HTTPS_ROUTE_CONFIG_PREFIX)
                .with_fallback_route_config_name(FALLBACK_ROUTE_CONFIG_NAME),
            );
            return;
        };

        for planned in plan_gateway_listeners(gateway, self.port_offset) {
            if !planned.is_valid() || dag.listeners.contains_key(&planned.envoy_name) {
                continue;
            }
            dag.add_listener(Listener::new(
                planned.envoy_name.clone(),
                planned.protocol,
                &self.address,
                planned.envoy_port,
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::gateway::{Gateway, GatewaySpec, GatewayTLSConfig};

    fn listener(name: &str, protocol: &str, port: i32, hostname: Option<&str>) -> gateway::Listener {
        gateway::Listener {
            name: name.to_string(),
            protocol: protocol.to_string(),
            port,
            hostname: hostname.map(str::to_string),
            ..Default::default()
        }
    }

    fn gateway(listeners: Vec<gateway::Listener>) -> Gateway {
        Gateway { spec: GatewaySpec { gateway_class_name: "contour".into(), listeners }, ..Default::default() }
    }

    #[test]
    fn names_and_offsets() {
        let plan = plan_gateway_listeners(
            &gateway(vec![
                listener("http", "HTTP", 80, None),
                listener("https", "HTTPS", 443, Some("a.com")),
                listener("tls", "TLS", 443, Some("b.com")),
                listener("tcp", "TCP", 5432, None),
            ]),
            10000,
        );
        let summary: Vec<(String, u32, bool)> =
            plan.iter().map(|p| (p.envoy_name.clone(), p.envoy_port, p.is_valid())).collect();
        assert_eq!(
            summary,
            vec![
                ("http-80".to_string(), 10080, true),
                ("https-443".to_string(), 10443, true),
                ("https-443".to_string(), 10443, true),
                ("tcp-5432".to_string(), 5432, true),
            ]
        );
    }

    #[test]
    fn conflicts_are_flagged() {
        let plan = plan_gateway_listeners(
            &gateway(vec![
                listener("http", "HTTP", 80, None),
                listener("tcp", "TCP", 80, None),
                listener("a", "HTTPS", 443, Some("a.com")),
                listener("b", "HTTPS", 443, Some("a.com")),
                listener("udp", "UDP", 53, None),
            ]),
            10000,
        );
        let problems: Vec<Option<ListenerProblem>> = plan.iter().map(|p| p.problem).collect();
        assert_eq!(
            problems,
            vec![
                Some(ListenerProblem::ProtocolConflict),
                Some(ListenerProblem::ProtocolConflict),
                Some(ListenerProblem::HostnameConflict),
                Some(ListenerProblem::HostnameConflict),
                Some(ListenerProblem::UnsupportedProtocol),
            ]
        );
    }

    #[test]
    fn offset_ports_that_collide_are_flagged() {
        let plan = plan_gateway_listeners(
            &gateway(vec![
                listener("http", "HTTP", 80, Some("a.com")),
                listener("alt", "HTTP", 10080, Some("b.com")),
                listener("other", "HTTP", 8080, None),
            ]),
            10000,
        );
        let summary: Vec<(String, u32, Option<ListenerProblem>)> =
            plan.iter().map(|p| (p.envoy_name.clone(), p.envoy_port, p.problem)).collect();
        assert_eq!(
            summary,
            vec![
                ("http-80".to_string(), 10080, Some(ListenerProblem::PortUnavailable)),
                ("http-10080".to_string(), 10080, Some(ListenerProblem::PortUnavailable)),
                ("http-8080".to_string(), 8080, None),
            ]
        );
        assert_eq!(ListenerProblem::PortUnavailable.reason(), "PortUnavailable");
    }

    #[test]
    fn passthrough_detection() {
        let mut l = listener("tls", "TLS", 443, None);
        l.tls = Some(GatewayTLSConfig { mode: Some("Passthrough".into()), certificate_refs: vec![] });
        let plan = plan_gateway_listeners(&gateway(vec![l]), 10000);
        assert!(plan[0].is_passthrough());
    }

    #[test]
    fn ingress_listeners_without_gateway() {
        let mut dag = Dag::default();
        let processor = ListenerProcessor::from_config(&Config::default());
        processor.run(&mut dag, &ResourceStore::default(), &mut StatusAccumulator::new());
        let http = &dag.listeners[HTTP_LISTENER_NAME];
        assert_eq!(http.port, 8080);
        assert_eq!(http.route_config_name, "ingress_http");
        let https = &dag.listeners[HTTPS_LISTENER_NAME];
        assert_eq!(https.port, 8443);
        assert_eq!(https.secure_route_config_name("example.com"), "https/example.com");
        assert_eq!(dag.http_listener_name().as_deref(), Some(HTTP_LISTENER_NAME));
        assert_eq!(dag.https_listener_name().as_deref(), Some(HTTPS_LISTENER_NAME));
    }
}
