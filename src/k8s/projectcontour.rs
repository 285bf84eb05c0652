//! projectcontour.io/v1 and v1alpha1 custom resources.

use serde::{Deserialize, Serialize};

use super::ObjectMeta;

/// HTTPProxy: the richer routing resource with delegation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HTTPProxy {
    pub metadata: ObjectMeta,
    pub spec: HTTPProxySpec,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HTTPProxySpec {
    pub virtualhost: Option<VirtualHost>,
    pub routes: Vec<Route>,
    pub tcpproxy: Option<TCPProxy>,
    pub includes: Vec<Include>,
    pub ingress_class_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VirtualHost {
    pub fqdn: String,
    pub tls: Option<TLS>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TLS {
    pub secret_name: String,
    pub minimum_protocol_version: String,
    pub maximum_protocol_version: String,
    pub passthrough: bool,
    pub client_validation: Option<DownstreamValidation>,
    pub enable_fallback_certificate: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DownstreamValidation {
    pub ca_secret: String,
    pub skip_client_cert_validation: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Include {
    pub name: String,
    pub namespace: Option<String>,
    pub conditions: Vec<MatchCondition>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MatchCondition {
    pub prefix: Option<String>,
    pub header: Option<HeaderMatchCondition>,
    pub query_parameter: Option<QueryParameterMatchCondition>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderMatchCondition {
    pub name: String,
    pub present: bool,
    #[serde(rename = "notpresent")]
    pub not_present: bool,
    pub contains: Option<String>,
    #[serde(rename = "notcontains")]
    pub not_contains: Option<String>,
    pub exact: Option<String>,
    #[serde(rename = "notexact")]
    pub not_exact: Option<String>,
    pub regex: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryParameterMatchCondition {
    pub name: String,
    pub exact: Option<String>,
    pub prefix: Option<String>,
    pub suffix: Option<String>,
    pub regex: Option<String>,
    pub contains: Option<String>,
    pub present: bool,
    pub ignore_case: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Route {
    pub conditions: Vec<MatchCondition>,
    pub services: Vec<Service>,
    pub enable_websockets: bool,
    pub permit_insecure: bool,
    pub timeout_policy: Option<TimeoutPolicy>,
    pub retry_policy: Option<RetryPolicy>,
    pub health_check_policy: Option<HTTPHealthCheckPolicy>,
    pub load_balancer_policy: Option<LoadBalancerPolicy>,
    pub path_rewrite_policy: Option<PathRewritePolicy>,
    pub request_headers_policy: Option<HeadersPolicy>,
    pub response_headers_policy: Option<HeadersPolicy>,
    pub request_redirect_policy: Option<HTTPRequestRedirectPolicy>,
    pub direct_response_policy: Option<HTTPDirectResponsePolicy>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Service {
    pub name: String,
    pub port: i32,
    pub protocol: Option<String>,
    pub weight: Option<u32>,
    pub validation: Option<UpstreamValidation>,
    pub mirror: bool,
    pub request_headers_policy: Option<HeadersPolicy>,
    pub response_headers_policy: Option<HeadersPolicy>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpstreamValidation {
    pub ca_secret: String,
    pub subject_name: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutPolicy {
    pub response: String,
    pub idle: String,
    pub idle_connection: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    pub count: Option<i64>,
    pub per_try_timeout: String,
    pub retry_on: Vec<String>,
    pub retriable_status_codes: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HTTPHealthCheckPolicy {
    pub path: String,
    pub host: String,
    pub interval_seconds: i64,
    pub timeout_seconds: i64,
    pub unhealthy_threshold_count: i64,
    pub healthy_threshold_count: i64,
    pub expected_statuses: Vec<StatusRange>,
}

/// Half-open HTTP status range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusRange {
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TCPHealthCheckPolicy {
    pub interval_seconds: i64,
    pub timeout_seconds: i64,
    pub unhealthy_threshold_count: u32,
    pub healthy_threshold_count: u32,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoadBalancerPolicy {
    pub strategy: String,
    pub request_hash_policies: Vec<RequestHashPolicy>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestHashPolicy {
    pub terminal: bool,
    pub header_hash_options: Option<HeaderHashOptions>,
    pub query_parameter_hash_options: Option<QueryParameterHashOptions>,
    #[serde(rename = "hashSourceIP")]
    pub hash_source_ip: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeaderHashOptions {
    pub header_name: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryParameterHashOptions {
    pub parameter_name: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PathRewritePolicy {
    pub replace_prefix: Vec<ReplacePrefix>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplacePrefix {
    pub prefix: String,
    pub replacement: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadersPolicy {
    pub set: Vec<HeaderValue>,
    pub remove: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderValue {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HTTPRequestRedirectPolicy {
    pub scheme: Option<String>,
    pub hostname: Option<String>,
    pub port: Option<i32>,
    pub status_code: Option<i32>,
    pub path: Option<String>,
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HTTPDirectResponsePolicy {
    pub status_code: i32,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TCPProxy {
    pub load_balancer_policy: Option<LoadBalancerPolicy>,
    pub services: Vec<Service>,
    pub include: Option<TCPProxyInclude>,
    pub health_check_policy: Option<TCPHealthCheckPolicy>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TCPProxyInclude {
    pub name: String,
    pub namespace: Option<String>,
}

/// Grants other namespaces permission to reference Secrets in this namespace.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TLSCertificateDelegation {
    pub metadata: ObjectMeta,
    pub spec: TLSCertificateDelegationSpec,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TLSCertificateDelegationSpec {
    pub delegations: Vec<CertificateDelegation>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CertificateDelegation {
    pub secret_name: String,
    /// `*` permits every namespace.
    pub target_namespaces: Vec<String>,
}

/// A gRPC backend used by Envoy extensions such as external authorization.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionService {
    pub metadata: ObjectMeta,
    pub spec: ExtensionServiceSpec,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtensionServiceSpec {
    pub services: Vec<ExtensionServiceTarget>,
    pub protocol: Option<String>,
    pub protocol_version: Option<String>,
    pub validation: Option<UpstreamValidation>,
    pub load_balancer_policy: Option<LoadBalancerPolicy>,
    pub timeout_policy: Option<TimeoutPolicy>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionServiceTarget {
    pub name: String,
    pub port: i32,
    pub weight: Option<u32>,
}
