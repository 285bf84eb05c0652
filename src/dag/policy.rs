//! Route and cluster policies shared by the processors.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::k8s::projectcontour;
use crate::utils::{format_duration, parse_duration};

/// A timeout setting that distinguishes "not set" from "disabled".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Timeout {
    /// Use Envoy's default.
    #[default]
    Default,
    /// Explicitly disabled (`infinity`, or zero).
    Disabled,
    Duration(Duration),
}

impl Timeout {
    /// Parse a timeout string: empty is the default, `infinity`/`infinite`
    /// disable the timeout, anything else is a duration such as `1m30s`.
    pub fn parse(value: &str) -> Result<Self, String> {
        match value.trim() {
            "" => Ok(Timeout::Default),
            "infinity" | "infinite" => Ok(Timeout::Disabled),
            other => {
                let duration = parse_duration(other).map_err(|e| e.to_string())?;
                if duration.is_zero() {
                    Ok(Timeout::Disabled)
                } else {
                    Ok(Timeout::Duration(duration))
                }
            }
        }
    }

    /// Like [`Timeout::parse`] but unparseable values fall back to the default.
    pub fn parse_or_default(value: Option<&str>) -> Self {
        value.and_then(|v| Self::parse(v).ok()).unwrap_or_default()
    }

    pub fn is_default(&self) -> bool {
        matches!(self, Timeout::Default)
    }
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timeout::Default => Ok(()),
            Timeout::Disabled => f.write_str("0s"),
            Timeout::Duration(d) => f.write_str(&format_duration(*d)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeoutPolicy {
    pub response: Timeout,
    pub idle_stream: Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retry_on: String,
    pub num_retries: u32,
    pub per_try_timeout: Timeout,
    pub retriable_status_codes: Vec<u32>,
}

impl RetryPolicy {
    pub fn from_httpproxy(policy: &projectcontour::RetryPolicy) -> Result<Self, String> {
        let per_try_timeout = Timeout::parse(&policy.per_try_timeout)
            .map_err(|e| format!("retryPolicy.perTryTimeout failed to parse: {}", e))?;
        let retry_on =
            if policy.retry_on.is_empty() { "5xx".to_string() } else { policy.retry_on.join(",") };
        let num_retries = match policy.count {
            None => 1,
            Some(count) if count < 0 => 0,
            Some(count) => u32::try_from(count).unwrap_or(u32::MAX),
        };
        Ok(Self {
            retry_on,
            num_retries,
            per_try_timeout,
            retriable_status_codes: policy.retriable_status_codes.clone(),
        })
    }
}

/// Headers to set and remove on a request or response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HeadersPolicy {
    pub set: BTreeMap<String, String>,
    pub add: BTreeMap<String, String>,
    pub remove: Vec<String>,
}

impl HeadersPolicy {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.add.is_empty() && self.remove.is_empty()
    }

    /// Convert an HTTPProxy headers policy. Header names are canonicalized;
    /// duplicate names are rejected. `Host` is returned separately so it can
    /// become a host rewrite.
    pub fn from_httpproxy(
        policy: &projectcontour::HeadersPolicy,
        allow_host_rewrite: bool,
    ) -> Result<(Self, Option<String>), String> {
        let mut out = HeadersPolicy::default();
        let mut host_rewrite = None;
        for header in &policy.set {
            let name = canonical_header_name(&header.name);
            if name.eq_ignore_ascii_case("host") {
                if !allow_host_rewrite {
                    return Err("rewriting the Host header is not supported here".to_string());
                }
                host_rewrite = Some(header.value.clone());
                continue;
            }
            if out.set.insert(name.clone(), header.value.clone()).is_some() {
                return Err(format!("duplicate header addition: {:?}", name));
            }
        }
        for name in &policy.remove {
            let name = canonical_header_name(name);
            if out.remove.contains(&name) {
                return Err(format!("duplicate header removal: {:?}", name));
            }
            out.remove.push(name);
        }
        Ok((out, host_rewrite))
    }
}

/// `x-foo-bar` becomes `X-Foo-Bar`.
pub fn canonical_header_name(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => {
                    first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LoadBalancerStrategy {
    #[default]
    RoundRobin,
    WeightedLeastRequest,
    Random,
    RequestHash,
    Cookie,
}

impl LoadBalancerStrategy {
    /// Unknown strategies fall back to round robin.
    pub fn parse(value: &str) -> Self {
        match value {
            "WeightedLeastRequest" => LoadBalancerStrategy::WeightedLeastRequest,
            "Random" => LoadBalancerStrategy::Random,
            "RequestHash" => LoadBalancerStrategy::RequestHash,
            "Cookie" => LoadBalancerStrategy::Cookie,
            _ => LoadBalancerStrategy::RoundRobin,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalancerStrategy::RoundRobin => "RoundRobin",
            LoadBalancerStrategy::WeightedLeastRequest => "WeightedLeastRequest",
            LoadBalancerStrategy::Random => "Random",
            LoadBalancerStrategy::RequestHash => "RequestHash",
            LoadBalancerStrategy::Cookie => "Cookie",
        }
    }

    /// Contribution to the cluster name hash. Round robin is the default and
    /// contributes nothing.
    pub fn hash_key(&self) -> &'static str {
        match self {
            LoadBalancerStrategy::RoundRobin => "",
            other => other.as_str(),
        }
    }
}

/// Name of the session affinity cookie used by the `Cookie` strategy.
pub const SESSION_AFFINITY_COOKIE: &str = "X-Contour-Session-Affinity";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashPolicy {
    Header { name: String, terminal: bool },
    QueryParameter { name: String, terminal: bool },
    SourceIp { terminal: bool },
    Cookie { name: String, ttl: Duration, path: String },
}

/// Load balancing strategy plus request hash policies for a route.
pub fn load_balancer_policy(
    policy: Option<&projectcontour::LoadBalancerPolicy>,
) -> (LoadBalancerStrategy, Vec<HashPolicy>) {
    let Some(policy) = policy else {
        return (LoadBalancerStrategy::RoundRobin, Vec::new());
    };
    let strategy = LoadBalancerStrategy::parse(&policy.strategy);
    let hashes = match strategy {
        LoadBalancerStrategy::Cookie => vec![HashPolicy::Cookie {
            name: SESSION_AFFINITY_COOKIE.to_string(),
            ttl: Duration::ZERO,
            path: "/".to_string(),
        }],
        LoadBalancerStrategy::RequestHash => policy
            .request_hash_policies
            .iter()
            .filter_map(|p| {
                if let Some(header) = p.header_hash_options.as_ref() {
                    (!header.header_name.is_empty()).then(|| HashPolicy::Header {
                        name: canonical_header_name(&header.header_name),
                        terminal: p.terminal,
                    })
                } else if let Some(query) = p.query_parameter_hash_options.as_ref() {
                    (!query.parameter_name.is_empty()).then(|| HashPolicy::QueryParameter {
                        name: query.parameter_name.clone(),
                        terminal: p.terminal,
                    })
                } else if p.hash_source_ip {
                    Some(HashPolicy::SourceIp { terminal: p.terminal })
                } else {
                    None
                }
            })
            .collect(),
        _ => Vec::new(),
    };
    (strategy, hashes)
}

/// Active HTTP health checking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    pub path: String,
    pub host: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,
    /// Half-open `[start, end)` status ranges.
    pub expected_statuses: Vec<(i64, i64)>,
}

pub const DEFAULT_HEALTH_CHECK_HOST: &str = "contour-envoy-healthcheck";
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_UNHEALTHY_THRESHOLD: u32 = 3;
pub const DEFAULT_HEALTHY_THRESHOLD: u32 = 2;

impl HealthCheck {
    pub fn from_httpproxy(policy: &projectcontour::HTTPHealthCheckPolicy) -> Result<Self, String> {
        for range in &policy.expected_statuses {
            if range.start < 100 || range.start > 599 {
                return Err(format!(
                    "expected status range start {} must be between 100 and 599",
                    range.start
                ));
            }
            if range.end < 101 || range.end > 600 {
                return Err(format!(
                    "expected status range end {} must be between 101 and 600",
                    range.end
                ));
            }
            if range.start >= range.end {
                return Err(format!(
                    "expected status range start {} must be less than end {}",
                    range.start, range.end
                ));
            }
        }
        let seconds = |value: i64, default: Duration| {
            if value > 0 {
                Duration::from_secs(value as u64)
            } else {
                default
            }
        };
        let count = |value: i64, default: u32| {
            if value > 0 {
                u32::try_from(value).unwrap_or(u32::MAX)
            } else {
                default
            }
        };
        Ok(Self {
            path: policy.path.clone(),
            host: if policy.host.is_empty() {
                DEFAULT_HEALTH_CHECK_HOST.to_string()
            } else {
                policy.host.clone()
            },
            interval: seconds(policy.interval_seconds, DEFAULT_HEALTH_CHECK_INTERVAL),
            timeout: seconds(policy.timeout_seconds, DEFAULT_HEALTH_CHECK_TIMEOUT),
            unhealthy_threshold: count(
                policy.unhealthy_threshold_count,
                DEFAULT_UNHEALTHY_THRESHOLD,
            ),
            healthy_threshold: count(policy.healthy_threshold_count, DEFAULT_HEALTHY_THRESHOLD),
            expected_statuses: policy.expected_statuses.iter().map(|r| (r.start, r.end)).collect(),
        })
    }
}

/// Active TCP health checking for TCP proxies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHealthCheck {
    pub interval: Duration,
    pub timeout: Duration,
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,
}

impl TcpHealthCheck {
    pub fn from_httpproxy(policy: &projectcontour::TCPHealthCheckPolicy) -> Self {
        let seconds = |value: i64, default: Duration| {
            if value > 0 {
                Duration::from_secs(value as u64)
            } else {
                default
            }
        };
        Self {
            interval: seconds(policy.interval_seconds, DEFAULT_HEALTH_CHECK_INTERVAL),
            timeout: seconds(policy.timeout_seconds, DEFAULT_HEALTH_CHECK_TIMEOUT),
            unhealthy_threshold: policy.unhealthy_threshold_count,
            healthy_threshold: policy.healthy_threshold_count,
        }
    }
}
