//! # Routing graph
//!
//! The intermediate graph built from the resource store on every rebuild:
//! listeners own virtual hosts, virtual hosts own routes, routes point at
//! clusters. The xDS translator walks this graph; nothing here knows about
//! Envoy protobufs.

pub mod backend;
pub mod builder;
pub mod extension;
pub mod gatewayapi;
pub mod httpproxy;
pub mod ingress;
pub mod listener;
pub mod policy;
pub mod rewrite;
pub mod secret;
pub mod status;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::k8s::annotation::CircuitBreakerAnnotations;
use crate::k8s::{NamespacedName, ObjectKey};

pub use builder::{Builder, Processor};
pub use policy::{
    HashPolicy, HeadersPolicy, HealthCheck, LoadBalancerStrategy, RetryPolicy, TcpHealthCheck,
    Timeout, TimeoutPolicy,
};
pub use status::{Condition, ConditionStatus, StatusAccumulator, StatusUpdate, ValidityState};

use status::{REASON_ROUTE_CONFLICT, ROUTE_ERROR};

/// Wildcard virtual host name.
pub const WILDCARD_HOST: &str = "*";

/// The complete routing graph for one build.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dag {
    pub listeners: BTreeMap<String, Listener>,
    pub extension_clusters: BTreeMap<String, ExtensionCluster>,
}

impl Dag {
    pub fn add_listener(&mut self, listener: Listener) {
        self.listeners.insert(listener.name.clone(), listener);
    }

    /// Name of the first plaintext HTTP listener, in port order.
    pub fn http_listener_name(&self) -> Option<String> {
        self.first_listener(ListenerProtocol::Http)
    }

    /// Name of the first TLS-terminating HTTP listener, in port order.
    pub fn https_listener_name(&self) -> Option<String> {
        self.first_listener(ListenerProtocol::Https)
    }

    fn first_listener(&self, protocol: ListenerProtocol) -> Option<String> {
        self.listeners
            .values()
            .filter(|l| l.protocol == protocol)
            .min_by_key(|l| (l.port, l.name.clone()))
            .map(|l| l.name.clone())
    }

    pub fn listener_mut(&mut self, name: &str) -> Option<&mut Listener> {
        self.listeners.get_mut(name)
    }

    /// Insecure virtual host `host` on listener `listener`, created on demand.
    pub fn virtual_host(&mut self, listener: &str, host: &str) -> Option<&mut VirtualHost> {
        let listener = self.listeners.get_mut(listener)?;
        Some(
            listener
                .virtual_hosts
                .entry(host.to_string())
                .or_insert_with(|| VirtualHost::new(host)),
        )
    }

    /// Secure virtual host `host` on listener `listener`, created on demand.
    pub fn secure_virtual_host(
        &mut self,
        listener: &str,
        host: &str,
    ) -> Option<&mut SecureVirtualHost> {
        let listener = self.listeners.get_mut(listener)?;
        Some(
            listener
                .secure_virtual_hosts
                .entry(host.to_string())
                .or_insert_with(|| SecureVirtualHost::new(host)),
        )
    }

    /// Every cluster reachable from a route or TCP proxy.
    pub fn clusters(&self) -> Vec<&Cluster> {
        let mut clusters = Vec::new();
        for listener in self.listeners.values() {
            for vhost in listener.virtual_hosts.values() {
                vhost.collect_clusters(&mut clusters);
            }
            for svhost in listener.secure_virtual_hosts.values() {
                svhost.virtual_host.collect_clusters(&mut clusters);
                if let Some(tcp) = &svhost.tcp_proxy {
                    clusters.extend(tcp.clusters.iter());
                }
            }
            if let Some(tcp) = &listener.tcp_proxy {
                clusters.extend(tcp.clusters.iter());
            }
        }
        clusters
    }

    /// Every TLS certificate referenced by a secure virtual host or cluster.
    pub fn secrets(&self) -> Vec<&TlsSecret> {
        let mut secrets = Vec::new();
        for listener in self.listeners.values() {
            for svhost in listener.secure_virtual_hosts.values() {
                secrets.extend(svhost.secret.iter());
                secrets.extend(svhost.fallback_certificate.iter());
            }
        }
        for cluster in self.clusters() {
            secrets.extend(cluster.client_certificate.iter());
        }
        for extension in self.extension_clusters.values() {
            secrets.extend(extension.client_certificate.iter());
        }
        secrets
    }

    /// Drop virtual hosts that ended up with nothing to serve.
    pub fn remove_empty_virtual_hosts(&mut self) {
        for listener in self.listeners.values_mut() {
            listener.virtual_hosts.retain(|_, vhost| !vhost.routes.is_empty());
            listener.secure_virtual_hosts.retain(|_, svhost| svhost.is_servable());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ListenerProtocol {
    Http,
    Https,
    Tcp,
}

impl ListenerProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerProtocol::Http => "http",
            ListenerProtocol::Https => "https",
            ListenerProtocol::Tcp => "tcp",
        }
    }
}

/// A bound address and port.
#[derive(Debug, Clone, PartialEq)]
pub struct Listener {
    pub name: String,
    pub protocol: ListenerProtocol,
    pub address: String,
    pub port: u32,
    /// RouteConfiguration name for insecure virtual hosts, and the prefix of
    /// per-host secure RouteConfiguration names.
    pub route_config_name: String,
    pub fallback_route_config_name: String,
    pub virtual_hosts: BTreeMap<String, VirtualHost>,
    pub secure_virtual_hosts: BTreeMap<String, SecureVirtualHost>,
    pub tcp_proxy: Option<TcpProxy>,
}

impl Listener {
    pub fn new(name: impl Into<String>, protocol: ListenerProtocol, address: &str, port: u32) -> Self {
        let name = name.into();
        Self {
            route_config_name: name.clone(),
            fallback_route_config_name: format!("{}/fallbackcert", name),
            name,
            protocol,
            address: address.to_string(),
            port,
            virtual_hosts: BTreeMap::new(),
            secure_virtual_hosts: BTreeMap::new(),
            tcp_proxy: None,
        }
    }

    pub fn with_route_config_name(mut self, name: impl Into<String>) -> Self {
        self.route_config_name = name.into();
        self
    }

    pub fn with_fallback_route_config_name(mut self, name: impl Into<String>) -> Self {
        self.fallback_route_config_name = name.into();
        self
    }

    /// RouteConfiguration name for a secure virtual host on this listener.
    pub fn secure_route_config_name(&self, host: &str) -> String {
        format!("{}/{}", self.route_config_name, host)
    }

    pub fn is_empty(&self) -> bool {
        self.virtual_hosts.is_empty()
            && self.secure_virtual_hosts.is_empty()
            && self.tcp_proxy.is_none()
    }
}

/// Outcome of offering a route to a virtual host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddRouteOutcome {
    Added,
    /// The new route is older and replaced a route from `displaced`.
    Replaced { displaced: ObjectKey },
    /// An older route from `winner` already owns these conditions.
    Rejected { winner: ObjectKey },
}

/// A hostname with its routes, keyed by match conditions.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualHost {
    pub name: String,
    pub routes: BTreeMap<RouteConditions, Route>,
}

impl VirtualHost {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), routes: BTreeMap::new() }
    }

    /// Add a route, resolving collisions by age.
    ///
    /// Routes from the same source replace each other. Otherwise the route
    /// with the older creation time keeps the conditions, with namespace and
    /// name breaking ties.
    pub fn add_route(&mut self, route: Route) -> AddRouteOutcome {
        let Some(existing) = self.routes.get(&route.conditions) else {
            self.routes.insert(route.conditions.clone(), route);
            return AddRouteOutcome::Added;
        };
        if existing.source == route.source {
            self.routes.insert(route.conditions.clone(), route);
            return AddRouteOutcome::Added;
        }
        if route.is_older_than(existing) {
            let displaced = existing.source.clone();
            self.routes.insert(route.conditions.clone(), route);
            AddRouteOutcome::Replaced { displaced }
        } else {
            AddRouteOutcome::Rejected { winner: existing.source.clone() }
        }
    }

    /// Add a route and record a `RouteConflict` error on whichever source
    /// lost. Returns whether `route` is now part of the virtual host.
    pub fn add_route_reporting(&mut self, route: Route, status: &mut StatusAccumulator) -> bool {
        let description = describe_conditions(&route.conditions);
        let source = route.source.clone();
        match self.add_route(route) {
            AddRouteOutcome::Added => true,
            AddRouteOutcome::Replaced { displaced } => {
                status.add_error(
                    &displaced,
                    ROUTE_ERROR,
                    REASON_ROUTE_CONFLICT,
                    format!(
                        "route {} on host \"{}\" conflicts with {}",
                        description, self.name, source
                    ),
                );
                true
            }
            AddRouteOutcome::Rejected { winner } => {
                status.add_error(
                    &source,
                    ROUTE_ERROR,
                    REASON_ROUTE_CONFLICT,
                    format!(
                        "route {} on host \"{}\" conflicts with {}",
                        description, self.name, winner
                    ),
                );
                false
            }
        }
    }

    /// The source of an existing route that would win against `route`.
    pub fn conflicting_owner(&self, route: &Route) -> Option<&ObjectKey> {
        self.routes
            .get(&route.conditions)
            .filter(|existing| existing.source != route.source && !route.is_older_than(existing))
            .map(|existing| &existing.source)
    }

    pub fn has_conditions(&self, conditions: &RouteConditions) -> bool {
        self.routes.contains_key(conditions)
    }

    fn collect_clusters<'a>(&'a self, out: &mut Vec<&'a Cluster>) {
        for route in self.routes.values() {
            if let RouteAction::Clusters(clusters) = &route.action {
                out.extend(clusters.iter());
            }
            out.extend(route.mirrors.iter());
        }
    }
}

fn describe_conditions(conditions: &RouteConditions) -> String {
    match &conditions.path {
        PathMatch::Prefix { prefix, .. } => format!("\"{}\"", prefix),
        PathMatch::Exact(path) => format!("\"{}\"", path),
        PathMatch::Regex(regex) => format!("\"{}\"", regex),
    }
}

/// TLS protocol version bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum TlsVersion {
    #[default]
    Auto,
    V1_2,
    V1_3,
}

impl TlsVersion {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "" => Some(TlsVersion::Auto),
            "1.2" => Some(TlsVersion::V1_2),
            "1.3" => Some(TlsVersion::V1_3),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Auto => "",
            TlsVersion::V1_2 => "1.2",
            TlsVersion::V1_3 => "1.3",
        }
    }
}

/// A TLS-terminating (or passthrough) virtual host selected by SNI.
#[derive(Debug, Clone, PartialEq)]
pub struct SecureVirtualHost {
    pub virtual_host: VirtualHost,
    pub secret: Option<TlsSecret>,
    pub min_tls_version: TlsVersion,
    pub max_tls_version: TlsVersion,
    pub fallback_certificate: Option<TlsSecret>,
    pub downstream_validation: Option<DownstreamValidation>,
    pub tcp_proxy: Option<TcpProxy>,
}

impl SecureVirtualHost {
    pub fn new(name: &str) -> Self {
        Self {
            virtual_host: VirtualHost::new(name),
            secret: None,
            min_tls_version: TlsVersion::Auto,
            max_tls_version: TlsVersion::Auto,
            fallback_certificate: None,
            downstream_validation: None,
            tcp_proxy: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.virtual_host.name
    }

    pub fn is_passthrough(&self) -> bool {
        self.secret.is_none() && self.tcp_proxy.is_some()
    }

    /// Secure hosts need a certificate and routes, or a TCP proxy.
    fn is_servable(&self) -> bool {
        self.tcp_proxy.is_some() || (self.secret.is_some() && !self.virtual_host.routes.is_empty())
    }
}

/// Client certificate validation on a secure virtual host.
#[derive(Debug, Clone, PartialEq)]
pub struct DownstreamValidation {
    pub ca: Option<CaBundle>,
    pub skip_client_cert_validation: bool,
}

/// A certificate and private key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TlsSecret {
    pub name: NamespacedName,
    pub certificate_chain: Vec<u8>,
    pub private_key: Vec<u8>,
}

/// A trusted CA bundle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CaBundle {
    pub name: NamespacedName,
    pub ca_certificate: Vec<u8>,
}

/// Upstream certificate validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerValidation {
    pub ca: CaBundle,
    pub subject_name: String,
}

/// How a route matches the request path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathMatch {
    /// `segment` prefixes only match at `/` boundaries.
    Prefix { prefix: String, segment: bool },
    Exact(String),
    Regex(String),
}

impl PathMatch {
    pub fn string_prefix(prefix: impl Into<String>) -> Self {
        PathMatch::Prefix { prefix: prefix.into(), segment: false }
    }

    pub fn segment_prefix(prefix: impl Into<String>) -> Self {
        PathMatch::Prefix { prefix: prefix.into(), segment: true }
    }

    pub fn root() -> Self {
        Self::string_prefix("/")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HeaderMatchKind {
    Exact,
    Contains,
    Present,
    Regex,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeaderMatch {
    pub name: String,
    pub kind: HeaderMatchKind,
    pub value: String,
    pub invert: bool,
}

impl HeaderMatch {
    pub fn new(name: &str, kind: HeaderMatchKind, value: &str) -> Self {
        Self { name: name.to_string(), kind, value: value.to_string(), invert: false }
    }

    pub fn inverted(mut self) -> Self {
        self.invert = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueryMatchKind {
    Exact,
    Prefix,
    Suffix,
    Regex,
    Contains,
    Present,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryParamMatch {
    pub name: String,
    pub kind: QueryMatchKind,
    pub value: String,
    pub ignore_case: bool,
}

/// The identity of a route inside a virtual host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteConditions {
    pub path: PathMatch,
    pub headers: Vec<HeaderMatch>,
    pub query_params: Vec<QueryParamMatch>,
}

impl RouteConditions {
    /// Header and query conditions are kept sorted so equal sets compare equal.
    pub fn new(
        path: PathMatch,
        mut headers: Vec<HeaderMatch>,
        mut query_params: Vec<QueryParamMatch>,
    ) -> Self {
        headers.sort();
        headers.dedup();
        query_params.sort();
        query_params.dedup();
        Self { path, headers, query_params }
    }

    pub fn path(path: PathMatch) -> Self {
        Self::new(path, Vec::new(), Vec::new())
    }
}

/// What a matched route does.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteAction {
    /// Forward to one or more weighted clusters.
    Clusters(Vec<Cluster>),
    Redirect(Redirect),
    DirectResponse(DirectResponse),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Redirect {
    pub https_redirect: bool,
    pub scheme: Option<String>,
    pub hostname: Option<String>,
    pub port: Option<u32>,
    pub path: Option<String>,
    pub prefix: Option<String>,
    pub status_code: u32,
}

impl Redirect {
    /// Permanent redirect to the same URL over HTTPS.
    pub fn https_upgrade() -> Self {
        Self { https_redirect: true, status_code: 301, ..Default::default() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectResponse {
    pub status_code: u32,
    pub body: Option<String>,
}

/// How the matched path is rewritten before forwarding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathRewrite {
    Prefix(String),
    FullPath(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub conditions: RouteConditions,
    pub action: RouteAction,
    pub source: ObjectKey,
    pub created: Option<DateTime<Utc>>,
    pub path_rewrite: Option<PathRewrite>,
    pub host_rewrite: Option<String>,
    pub timeout_policy: TimeoutPolicy,
    pub retry_policy: Option<RetryPolicy>,
    pub request_headers: Option<HeadersPolicy>,
    pub response_headers: Option<HeadersPolicy>,
    pub mirrors: Vec<Cluster>,
    pub websocket: bool,
    pub hash_policies: Vec<HashPolicy>,
}

impl Route {
    pub fn new(
        conditions: RouteConditions,
        action: RouteAction,
        source: ObjectKey,
        created: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            conditions,
            action,
            source,
            created,
            path_rewrite: None,
            host_rewrite: None,
            timeout_policy: TimeoutPolicy::default(),
            retry_policy: None,
            request_headers: None,
            response_headers: None,
            mirrors: Vec::new(),
            websocket: false,
            hash_policies: Vec::new(),
        }
    }

    /// A copy of this route answering with an HTTPS redirect.
    pub fn https_upgrade(&self) -> Self {
        Route::new(
            self.conditions.clone(),
            RouteAction::Redirect(Redirect::https_upgrade()),
            self.source.clone(),
            self.created,
        )
    }

    pub fn clusters(&self) -> &[Cluster] {
        match &self.action {
            RouteAction::Clusters(clusters) => clusters,
            _ => &[],
        }
    }

    fn is_older_than(&self, other: &Route) -> bool {
        crate::k8s::age_order(self.created, &self.source, other.created, &other.source)
            == std::cmp::Ordering::Less
    }
}

/// The Kubernetes Service and port behind a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceUpstream {
    pub name: NamespacedName,
    pub port: i32,
    pub port_name: String,
    /// DNS name for `ExternalName` services.
    pub external_name: Option<String>,
}

impl ServiceUpstream {
    /// EDS service name: `<ns>/<name>[/<port name>]`.
    pub fn eds_service_name(&self) -> String {
        if self.port_name.is_empty() {
            format!("{}/{}", self.name.namespace, self.name.name)
        } else {
            format!("{}/{}/{}", self.name.namespace, self.name.name, self.port_name)
        }
    }
}

/// Upstream TLS protocol version bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct UpstreamTls {
    pub min_version: TlsVersion,
    pub max_version: TlsVersion,
}

/// An upstream service port and how to talk to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub upstream: ServiceUpstream,
    /// `""`, `h2`, `h2c` or `tls`.
    pub protocol: String,
    pub weight: u32,
    pub lb_strategy: LoadBalancerStrategy,
    pub health_check: Option<HealthCheck>,
    pub tcp_health_check: Option<TcpHealthCheck>,
    pub upstream_validation: Option<PeerValidation>,
    pub sni: String,
    pub upstream_tls: Option<UpstreamTls>,
    pub circuit_breakers: CircuitBreakerAnnotations,
    pub connect_timeout: Duration,
    pub idle_connection_timeout: Timeout,
    pub client_certificate: Option<TlsSecret>,
    pub dns_lookup_family: String,
    /// Per-backend header changes, applied on the weighted cluster entry.
    pub request_headers: Option<HeadersPolicy>,
    pub response_headers: Option<HeadersPolicy>,
}

impl Cluster {
    pub fn new(upstream: ServiceUpstream, connect_timeout: Duration) -> Self {
        Self {
            upstream,
            protocol: String::new(),
            weight: 0,
            lb_strategy: LoadBalancerStrategy::RoundRobin,
            health_check: None,
            tcp_health_check: None,
            upstream_validation: None,
            sni: String::new(),
            upstream_tls: None,
            circuit_breakers: CircuitBreakerAnnotations::default(),
            connect_timeout,
            idle_connection_timeout: Timeout::Default,
            client_certificate: None,
            dns_lookup_family: "auto".to_string(),
            request_headers: None,
            response_headers: None,
        }
    }
}

/// Listener-level TCP forwarding.
#[derive(Debug, Clone, PartialEq)]
pub struct TcpProxy {
    pub clusters: Vec<Cluster>,
    pub source: ObjectKey,
}

/// A cluster for an ExtensionService, named `extension/<ns>/<name>`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtensionCluster {
    pub name: String,
    pub source: NamespacedName,
    pub upstreams: Vec<(ServiceUpstream, u32)>,
    pub protocol: String,
    pub sni: String,
    pub upstream_validation: Option<PeerValidation>,
    pub client_certificate: Option<TlsSecret>,
    pub lb_strategy: LoadBalancerStrategy,
    pub timeout_policy: TimeoutPolicy,
    pub idle_connection_timeout: Timeout,
    pub connect_timeout: Duration,
}
