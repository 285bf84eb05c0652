//! Annotation parsing for Ingress and Service objects.
//!
//! Unparseable annotation values are treated as absent.

use super::ObjectMeta;

pub const INGRESS_CLASS: &str = "projectcontour.io/ingress.class";
pub const LEGACY_INGRESS_CLASS: &str = "kubernetes.io/ingress.class";
pub const TLS_MINIMUM_PROTOCOL_VERSION: &str = "projectcontour.io/tls-minimum-protocol-version";
pub const FORCE_SSL_REDIRECT: &str = "ingress.kubernetes.io/force-ssl-redirect";
pub const ALLOW_HTTP: &str = "kubernetes.io/ingress.allow-http";
pub const WEBSOCKET_ROUTES: &str = "projectcontour.io/websocket-routes";
pub const RESPONSE_TIMEOUT: &str = "projectcontour.io/response-timeout";
pub const RETRY_ON: &str = "projectcontour.io/retry-on";
pub const NUM_RETRIES: &str = "projectcontour.io/num-retries";
pub const PER_TRY_TIMEOUT: &str = "projectcontour.io/per-try-timeout";
pub const MAX_CONNECTIONS: &str = "projectcontour.io/max-connections";
pub const MAX_PENDING_REQUESTS: &str = "projectcontour.io/max-pending-requests";
pub const MAX_REQUESTS: &str = "projectcontour.io/max-requests";
pub const MAX_RETRIES: &str = "projectcontour.io/max-retries";
pub const UPSTREAM_PROTOCOL_PREFIX: &str = "projectcontour.io/upstream-protocol.";

/// Ingress class assumed for objects that carry none.
pub const DEFAULT_INGRESS_CLASS: &str = "contour";

pub fn get<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.annotations.as_ref()?.get(key).map(|v| v.as_str())
}

/// Ingress class from annotations, preferring the projectcontour.io key.
pub fn ingress_class(meta: &ObjectMeta) -> Option<&str> {
    get(meta, INGRESS_CLASS).or_else(|| get(meta, LEGACY_INGRESS_CLASS))
}

/// Whether an object's ingress class is accepted by the configured class set.
///
/// An empty configured set accepts objects with no class or the default
/// class. A non-empty set requires an explicit match.
pub fn matches_ingress_class(
    annotation_class: Option<&str>,
    spec_class: Option<&str>,
    configured: &[String],
) -> bool {
    let class = annotation_class.or(spec_class).map(str::trim).filter(|c| !c.is_empty());
    match class {
        None => configured.is_empty(),
        Some(class) if configured.is_empty() => class == DEFAULT_INGRESS_CLASS,
        Some(class) => configured.iter().any(|c| c == class),
    }
}

/// Minimum TLS protocol version, normalized to `1.2` or `1.3`.
pub fn tls_minimum_version(meta: &ObjectMeta) -> Option<&'static str> {
    parse_tls_version(get(meta, TLS_MINIMUM_PROTOCOL_VERSION)?)
}

pub fn parse_tls_version(value: &str) -> Option<&'static str> {
    match value.trim() {
        "1.2" => Some("1.2"),
        "1.3" => Some("1.3"),
        _ => None,
    }
}

pub fn force_ssl_redirect(meta: &ObjectMeta) -> bool {
    get(meta, FORCE_SSL_REDIRECT) == Some("true")
}

/// `kubernetes.io/ingress.allow-http: "false"` suppresses insecure routes.
pub fn http_allowed(meta: &ObjectMeta) -> bool {
    get(meta, ALLOW_HTTP) != Some("false")
}

pub fn websocket_routes(meta: &ObjectMeta) -> Vec<String> {
    get(meta, WEBSOCKET_ROUTES)
        .map(|value| {
            value.split(',').map(str::trim).filter(|p| !p.is_empty()).map(str::to_string).collect()
        })
        .unwrap_or_default()
}

pub fn response_timeout(meta: &ObjectMeta) -> Option<&str> {
    get(meta, RESPONSE_TIMEOUT)
}

pub fn retry_on(meta: &ObjectMeta) -> Option<&str> {
    get(meta, RETRY_ON).filter(|v| !v.trim().is_empty())
}

pub fn num_retries(meta: &ObjectMeta) -> Option<u32> {
    get(meta, NUM_RETRIES)?.trim().parse().ok()
}

pub fn per_try_timeout(meta: &ObjectMeta) -> Option<&str> {
    get(meta, PER_TRY_TIMEOUT)
}

/// Circuit breaker thresholds set on a Service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct CircuitBreakerAnnotations {
    pub max_connections: Option<u32>,
    pub max_pending_requests: Option<u32>,
    pub max_requests: Option<u32>,
    pub max_retries: Option<u32>,
}

impl CircuitBreakerAnnotations {
    pub fn from_meta(meta: &ObjectMeta) -> Self {
        let parse = |key| get(meta, key).and_then(|v| v.trim().parse::<u32>().ok());
        Self {
            max_connections: parse(MAX_CONNECTIONS),
            max_pending_requests: parse(MAX_PENDING_REQUESTS),
            max_requests: parse(MAX_REQUESTS),
            max_retries: parse(MAX_RETRIES),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Upstream protocol for a Service port, from
/// `projectcontour.io/upstream-protocol.{h2,h2c,tls}: <port name or number>,...`.
pub fn upstream_protocol(meta: &ObjectMeta, port_name: &str, port: i32) -> Option<&'static str> {
    let port_number = port.to_string();
    ["h2", "h2c", "tls"].into_iter().find(|protocol| {
        let key = format!("{}{}", UPSTREAM_PROTOCOL_PREFIX, protocol);
        get(meta, &key)
            .map(|ports| {
                ports.split(',').map(str::trim).any(|p| {
                    !p.is_empty() && (p == port_number || (!port_name.is_empty() && p == port_name))
                })
            })
            .unwrap_or(false)
    })
}
