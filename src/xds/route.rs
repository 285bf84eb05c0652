//! RouteConfiguration translation.

use std::cmp::Ordering;

use envoy_types::pb::envoy::config::core::v3::{
    data_source::Specifier, header_value_option::HeaderAppendAction, DataSource, HeaderValue,
    HeaderValueOption,
};
use envoy_types::pb::envoy::config::route::v3::route_action::{
    hash_policy, ClusterSpecifier, HashPolicy as EnvoyHashPolicy, HostRewriteSpecifier,
    RequestMirrorPolicy, UpgradeConfig,
};
use envoy_types::pb::envoy::config::route::v3::{
    header_matcher::HeaderMatchSpecifier, query_parameter_matcher::QueryParameterMatchSpecifier,
    redirect_action, route, route_match::PathSpecifier, weighted_cluster::ClusterWeight,
    DirectResponseAction, HeaderMatcher, QueryParameterMatcher, RedirectAction,
    RetryPolicy as EnvoyRetryPolicy, Route as EnvoyRoute, RouteAction, RouteConfiguration,
    RouteMatch, VirtualHost as EnvoyVirtualHost, WeightedCluster,
};
use envoy_types::pb::envoy::r#type::matcher::v3::{
    string_matcher::MatchPattern, RegexMatchAndSubstitute, RegexMatcher, StringMatcher,
};
use envoy_types::pb::google::protobuf::{Duration as ProtoDuration, UInt32Value};

use super::naming::cluster_name;
use super::proto_duration;
use crate::dag::RouteAction as DagRouteAction;
use crate::dag::{
    Cluster, DirectResponse, HashPolicy, HeaderMatch, HeaderMatchKind, HeadersPolicy, PathMatch,
    PathRewrite, QueryMatchKind, QueryParamMatch, Redirect, RetryPolicy, Route, Timeout,
    VirtualHost, WILDCARD_HOST,
};
use crate::utils::quote_meta;

/// Build a RouteConfiguration holding `vhosts`, sorted by name.
pub fn route_configuration<'a>(
    name: &str,
    vhosts: impl IntoIterator<Item = &'a VirtualHost>,
) -> RouteConfiguration {
    let mut vhosts: Vec<&VirtualHost> = vhosts.into_iter().collect();
    vhosts.sort_by(|a, b| a.name.cmp(&b.name));
    RouteConfiguration {
        name: name.to_string(),
        virtual_hosts: vhosts.into_iter().map(virtual_host).collect(),
        ..Default::default()
    }
}

pub fn virtual_host(vhost: &VirtualHost) -> EnvoyVirtualHost {
    let authority = wildcard_authority(&vhost.name);
    EnvoyVirtualHost {
        name: vhost.name.clone(),
        domains: domains(&vhost.name),
        routes: sorted_routes(vhost)
            .into_iter()
            .map(|r| {
                let mut out = envoy_route(r);
                if let (Some(authority), Some(m)) = (&authority, out.r#match.as_mut()) {
                    m.headers.insert(0, authority.clone());
                }
                out
            })
            .collect(),
        ..Default::default()
    }
}

fn domains(host: &str) -> Vec<String> {
    if host == WILDCARD_HOST || host.starts_with("*.") {
        vec![host.to_string()]
    } else {
        vec![host.to_string(), format!("{}:*", host)]
    }
}

/// Envoy's `*.example.com` also matches `a.b.example.com`; this pins the
/// wildcard to a single label.
fn wildcard_authority(host: &str) -> Option<HeaderMatcher> {
    let rest = host.strip_prefix("*.")?;
    let regex = format!("^[a-z0-9]([-a-z0-9]*[a-z0-9])?\\.{}(:[0-9]+)?", quote_meta(rest));
    Some(HeaderMatcher {
        name: ":authority".to_string(),
        header_match_specifier: Some(HeaderMatchSpecifier::StringMatch(safe_regex(regex))),
        ..Default::default()
    })
}

/// Routes in the order Envoy must try them.
pub fn sorted_routes(vhost: &VirtualHost) -> Vec<&Route> {
    let mut routes: Vec<&Route> = vhost.routes.values().collect();
    routes.sort_by(|a, b| compare_routes(a, b));
    routes
}

fn path_rank(path: &PathMatch) -> u8 {
    match path {
        PathMatch::Exact(_) => 0,
        PathMatch::Regex(_) => 1,
        PathMatch::Prefix { .. } => 2,
    }
}

fn compare_routes(a: &Route, b: &Route) -> Ordering {
    let (pa, pb) = (&a.conditions.path, &b.conditions.path);
    path_rank(pa)
        .cmp(&path_rank(pb))
        .then_with(|| match (pa, pb) {
            (PathMatch::Exact(x), PathMatch::Exact(y)) | (PathMatch::Regex(x), PathMatch::Regex(y)) => {
                y.cmp(x)
            }
            (
                PathMatch::Prefix { prefix: x, segment: sx },
                PathMatch::Prefix { prefix: y, segment: sy },
            ) => y.cmp(x).then_with(|| sy.cmp(sx)),
            _ => Ordering::Equal,
        })
        .then_with(|| b.conditions.headers.len().cmp(&a.conditions.headers.len()))
        .then_with(|| b.conditions.query_params.len().cmp(&a.conditions.query_params.len()))
        .then_with(|| crate::k8s::age_order(a.created, &a.source, b.created, &b.source))
        .then_with(|| a.conditions.cmp(&b.conditions))
}

pub fn envoy_route(r: &Route) -> EnvoyRoute {
    let mut out = EnvoyRoute {
        r#match: Some(route_match(r)),
        action: Some(action(r)),
        ..Default::default()
    };
    if let Some(headers) = &r.request_headers {
        out.request_headers_to_add = header_options(headers);
        out.request_headers_to_remove = headers.remove.clone();
    }
    if let Some(headers) = &r.response_headers {
        out.response_headers_to_add = header_options(headers);
        out.response_headers_to_remove = headers.remove.clone();
    }
    out
}

fn route_match(r: &Route) -> RouteMatch {
    let path = match &r.conditions.path {
        PathMatch::Exact(path) => PathSpecifier::Path(path.clone()),
        PathMatch::Regex(regex) => PathSpecifier::SafeRegex(regex_matcher(regex)),
        PathMatch::Prefix { prefix, segment: true } if !prefix.trim_end_matches('/').is_empty() => {
            PathSpecifier::PathSeparatedPrefix(prefix.trim_end_matches('/').to_string())
        }
        PathMatch::Prefix { prefix, .. } => PathSpecifier::Prefix(prefix.clone()),
    };
    RouteMatch {
        path_specifier: Some(path),
        headers: r.conditions.headers.iter().map(header_matcher).collect(),
        query_parameters: r.conditions.query_params.iter().map(query_matcher).collect(),
        ..Default::default()
    }
}

fn regex_matcher(regex: &str) -> RegexMatcher {
    RegexMatcher { regex: regex.to_string(), ..Default::default() }
}

fn string_matcher(pattern: MatchPattern, ignore_case: bool) -> StringMatcher {
    StringMatcher { match_pattern: Some(pattern), ignore_case }
}

fn safe_regex(regex: String) -> StringMatcher {
    string_matcher(MatchPattern::SafeRegex(regex_matcher(&regex)), false)
}

fn header_matcher(m: &HeaderMatch) -> HeaderMatcher {
    let specifier = match m.kind {
        HeaderMatchKind::Present => HeaderMatchSpecifier::PresentMatch(true),
        HeaderMatchKind::Exact => {
            HeaderMatchSpecifier::StringMatch(string_matcher(MatchPattern::Exact(m.value.clone()), false))
        }
        HeaderMatchKind::Contains => HeaderMatchSpecifier::StringMatch(string_matcher(
            MatchPattern::Contains(m.value.clone()),
            false,
        )),
        HeaderMatchKind::Regex => HeaderMatchSpecifier::StringMatch(safe_regex(m.value.clone())),
    };
    HeaderMatcher {
        name: m.name.clone(),
        header_match_specifier: Some(specifier),
        invert_match: m.invert,
        ..Default::default()
    }
}

fn query_matcher(m: &QueryParamMatch) -> QueryParameterMatcher {
    let pattern = match m.kind {
        QueryMatchKind::Present => {
            return QueryParameterMatcher {
                name: m.name.clone(),
                query_parameter_match_specifier: Some(QueryParameterMatchSpecifier::PresentMatch(
                    true,
                )),
            }
        }
        QueryMatchKind::Exact => MatchPattern::Exact(m.value.clone()),
        QueryMatchKind::Prefix => MatchPattern::Prefix(m.value.clone()),
        QueryMatchKind::Suffix => MatchPattern::Suffix(m.value.clone()),
        QueryMatchKind::Contains => MatchPattern::Contains(m.value.clone()),
        QueryMatchKind::Regex => MatchPattern::SafeRegex(regex_matcher(&m.value)),
    };
    QueryParameterMatcher {
        name: m.name.clone(),
        query_parameter_match_specifier: Some(QueryParameterMatchSpecifier::StringMatch(
            string_matcher(pattern, m.ignore_case),
        )),
    }
}

fn action(r: &Route) -> route::Action {
    match &r.action {
        DagRouteAction::Clusters(clusters) => route::Action::Route(route_action(r, clusters)),
        DagRouteAction::Redirect(redirect) => route::Action::Redirect(redirect_action(redirect)),
        DagRouteAction::DirectResponse(direct) => {
            route::Action::DirectResponse(direct_response(direct))
        }
    }
}

fn timeout(value: Timeout) -> Option<ProtoDuration> {
    match value {
        Timeout::Default => None,
        Timeout::Disabled => Some(ProtoDuration::default()),
        Timeout::Duration(d) => Some(proto_duration(d)),
    }
}

fn route_action(r: &Route, clusters: &[Cluster]) -> RouteAction {
    let mut out = RouteAction {
        cluster_specifier: Some(cluster_specifier(clusters)),
        timeout: timeout(r.timeout_policy.response),
        idle_timeout: timeout(r.timeout_policy.idle_stream),
        retry_policy: r.retry_policy.as_ref().map(retry_policy),
        request_mirror_policies: r
            .mirrors
            .iter()
            .map(|m| RequestMirrorPolicy { cluster: cluster_name(m), ..Default::default() })
            .collect(),
        hash_policy: r.hash_policies.iter().map(hash_policy).collect(),
        ..Default::default()
    };
    match &r.path_rewrite {
        Some(PathRewrite::Prefix(prefix)) => out.prefix_rewrite = prefix.clone(),
        Some(PathRewrite::FullPath(path)) => {
            out.regex_rewrite = Some(RegexMatchAndSubstitute {
                pattern: Some(regex_matcher("^/.*$")),
                substitution: path.clone(),
            })
        }
        None => {}
    }
    if let Some(host) = &r.host_rewrite {
        out.host_rewrite_specifier = Some(HostRewriteSpecifier::HostRewriteLiteral(host.clone()));
    }
    if r.websocket {
        out.upgrade_configs =
            vec![UpgradeConfig { upgrade_type: "websocket".to_string(), ..Default::default() }];
    }
    out
}

/// A lone cluster without header changes is referenced directly; anything
/// else becomes a weighted cluster. All-zero weights split evenly.
fn cluster_specifier(clusters: &[Cluster]) -> ClusterSpecifier {
    let per_cluster_headers =
        |c: &Cluster| c.request_headers.is_some() || c.response_headers.is_some();
    if let [only] = clusters {
        if !per_cluster_headers(only) {
            return ClusterSpecifier::Cluster(cluster_name(only));
        }
    }
    let all_zero = clusters.iter().all(|c| c.weight == 0);
    let mut weighted: Vec<ClusterWeight> = clusters
        .iter()
        .map(|c| {
            let mut entry = ClusterWeight {
                name: cluster_name(c),
                weight: Some(UInt32Value { value: if all_zero { 1 } else { c.weight } }),
                ..Default::default()
            };
            if let Some(headers) = &c.request_headers {
                entry.request_headers_to_add = header_options(headers);
                entry.request_headers_to_remove = headers.remove.clone();
            }
            if let Some(headers) = &c.response_headers {
                entry.response_headers_to_add = header_options(headers);
                entry.response_headers_to_remove = headers.remove.clone();
            }
            entry
        })
        .collect();
    weighted.sort_by(|a, b| a.name.cmp(&b.name));
    ClusterSpecifier::WeightedClusters(WeightedCluster { clusters: weighted, ..Default::default() })
}

fn retry_policy(policy: &RetryPolicy) -> EnvoyRetryPolicy {
    EnvoyRetryPolicy {
        retry_on: policy.retry_on.clone(),
        num_retries: Some(UInt32Value { value: policy.num_retries }),
        per_try_timeout: timeout(policy.per_try_timeout),
        retriable_status_codes: policy.retriable_status_codes.clone(),
        ..Default::default()
    }
}

fn hash_policy(policy: &HashPolicy) -> EnvoyHashPolicy {
    let (specifier, terminal) = match policy {
        HashPolicy::Header { name, terminal } => (
            hash_policy::PolicySpecifier::Header(hash_policy::Header {
                header_name: name.clone(),
                ..Default::default()
            }),
            *terminal,
        ),
        HashPolicy::QueryParameter { name, terminal } => (
            hash_policy::PolicySpecifier::QueryParameter(hash_policy::QueryParameter {
                name: name.clone(),
            }),
            *terminal,
        ),
        HashPolicy::SourceIp { terminal } => (
            hash_policy::PolicySpecifier::ConnectionProperties(hash_policy::ConnectionProperties {
                source_ip: true,
            }),
            *terminal,
        ),
        HashPolicy::Cookie { name, ttl, path } => (
            hash_policy::PolicySpecifier::Cookie(hash_policy::Cookie {
                name: name.clone(),
                ttl: Some(proto_duration(*ttl)),
                path: path.clone(),
                ..Default::default()
            }),
            false,
        ),
    };
    EnvoyHashPolicy { policy_specifier: Some(specifier), terminal }
}

/// `set` overwrites, `add` appends.
fn header_options(headers: &HeadersPolicy) -> Vec<HeaderValueOption> {
    let option = |key: &String, value: &String, action: HeaderAppendAction| HeaderValueOption {
        header: Some(HeaderValue { key: key.clone(), value: value.clone(), ..Default::default() }),
        append_action: action as i32,
        ..Default::default()
    };
    headers
        .set
        .iter()
        .map(|(k, v)| option(k, v, HeaderAppendAction::OverwriteIfExistsOrAdd))
        .chain(headers.add.iter().map(|(k, v)| option(k, v, HeaderAppendAction::AppendIfExistsOrAdd)))
        .collect()
}

fn redirect_action(redirect: &Redirect) -> RedirectAction {
    let response_code = match redirect.status_code {
        302 => redirect_action::RedirectResponseCode::Found,
        303 => redirect_action::RedirectResponseCode::SeeOther,
        307 => redirect_action::RedirectResponseCode::TemporaryRedirect,
        308 => redirect_action::RedirectResponseCode::PermanentRedirect,
        _ => redirect_action::RedirectResponseCode::MovedPermanently,
    };
    let scheme = if redirect.https_redirect {
        Some(redirect_action::SchemeRewriteSpecifier::HttpsRedirect(true))
    } else {
        redirect.scheme.clone().map(redirect_action::SchemeRewriteSpecifier::SchemeRedirect)
    };
    let path = match (&redirect.path, &redirect.prefix) {
        (Some(path), _) => Some(redirect_action::PathRewriteSpecifier::PathRedirect(path.clone())),
        (None, Some(prefix)) => {
            Some(redirect_action::PathRewriteSpecifier::PrefixRewrite(prefix.clone()))
        }
        (None, None) => None,
    };
    RedirectAction {
        scheme_rewrite_specifier: scheme,
        host_redirect: redirect.hostname.clone().unwrap_or_default(),
        port_redirect: redirect.port.unwrap_or_default(),
        path_rewrite_specifier: path,
        response_code: response_code as i32,
        ..Default::default()
    }
}

fn direct_response(direct: &DirectResponse) -> DirectResponseAction {
    DirectResponseAction {
        status: direct.status_code,
        body: direct.body.as_ref().map(|body| DataSource {
            specifier: Some(Specifier::InlineString(body.clone())),
            ..Default::default()
        }),
        ..Default::default()
    }
}
