//! HTTPProxy processor.
//!
//! Root proxies (those with `spec.virtualhost`) own a virtual host; their
//! routes, and the routes of every proxy reachable through `includes`, are
//! attached to it. Problems are reported per proxy: a proxy whose routes
//! fail validation contributes no routes, but the rest of the tree is kept.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::backend::{service_cluster, uses_tls, BackendError, ClusterDefaults, PortRef};
use super::builder::Processor;
use super::policy::{
    load_balancer_policy, HeadersPolicy, HealthCheck, RetryPolicy, TcpHealthCheck, Timeout,
    TimeoutPolicy,
};
use super::rewrite::{self, PREFIX_REPLACE_ERROR};
use super::secret::{lookup_ca_secret, lookup_tls_secret, tls_secret};
use super::status::StatusAccumulator;
use super::{
    Cluster, Dag, DirectResponse, DownstreamValidation, HashPolicy, HeaderMatch, HeaderMatchKind,
    PathMatch, PeerValidation, QueryMatchKind, QueryParamMatch, Redirect, Route, RouteAction,
    RouteConditions, TcpProxy, TlsSecret, TlsVersion,
};
use crate::config::Config;
use crate::k8s::projectcontour::{self, HTTPProxy, MatchCondition};
use crate::k8s::{age_order, creation_time, Kind, NamespacedName, ObjectKey};
use crate::store::ResourceStore;

pub const VIRTUAL_HOST_ERROR: &str = "VirtualHostError";
pub const ROOT_NAMESPACE_ERROR: &str = "RootNamespaceError";
pub const TLS_ERROR: &str = "TLSError";
pub const INCLUDE_ERROR: &str = "IncludeError";
pub const ROUTE_ERROR: &str = "RouteError";
pub const SERVICE_ERROR: &str = "ServiceError";
pub const TCP_PROXY_ERROR: &str = "TCPProxyError";
pub const TCP_PROXY_INCLUDE_ERROR: &str = "TCPProxyIncludeError";

/// A validation failure, recorded against the proxy that caused it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Invalid {
    condition_type: &'static str,
    reason: &'static str,
    message: String,
}

fn invalid(condition_type: &'static str, reason: &'static str, message: impl Into<String>) -> Invalid {
    Invalid { condition_type, reason, message: message.into() }
}

impl Invalid {
    fn record(self, status: &mut StatusAccumulator, key: &ObjectKey) {
        status.add_error(key, self.condition_type, self.reason, self.message);
    }
}

/// A route plus whether it may be served over plain HTTP on a TLS vhost.
#[derive(Debug, Clone)]
struct ProxyRoute {
    route: Route,
    permit_insecure: bool,
}

/// Translates HTTPProxy trees into virtual hosts, routes and TCP proxies.
#[derive(Debug, Clone)]
pub struct HttpProxyProcessor {
    root_namespaces: Vec<String>,
    fallback_certificate: Option<NamespacedName>,
    client_certificate: Option<NamespacedName>,
    min_tls_version: TlsVersion,
    cluster_defaults: ClusterDefaults,
}

impl HttpProxyProcessor {
    pub fn from_config(config: &Config) -> Self {
        Self {
            root_namespaces: config.httpproxy.root_namespaces.clone(),
            fallback_certificate: config.tls.fallback_certificate(),
            client_certificate: config.tls.envoy_client_certificate(),
            min_tls_version: TlsVersion::parse(&config.tls.minimum_protocol_version)
                .unwrap_or(TlsVersion::V1_2),
            cluster_defaults: ClusterDefaults {
                connect_timeout: config.cluster.connect_timeout(),
                dns_lookup_family: config.cluster.dns_lookup_family.clone(),
            },
        }
    }
}

/// State shared while one root's include tree is walked.
struct Walk<'a> {
    store: &'a ResourceStore,
    status: &'a mut StatusAccumulator,
    reached: &'a mut BTreeSet<NamespacedName>,
    stack: Vec<NamespacedName>,
    client_certificate: Option<TlsSecret>,
}

fn proxy_key(name: &NamespacedName) -> ObjectKey {
    ObjectKey::new(Kind::HTTPProxy, name.namespace.clone(), name.name.clone())
}

impl Processor for HttpProxyProcessor {
    fn name(&self) -> &'static str {
        "httpproxy"
    }

    fn run(&self, dag: &mut Dag, store: &ResourceStore, status: &mut StatusAccumulator) {
        if store.httpproxies.is_empty() {
            return;
        }
        for name in store.httpproxies.keys() {
            status.touch(&proxy_key(name));
        }
        let client_certificate =
            self.client_certificate.as_ref().and_then(|name| tls_secret(store, name).ok());

        let mut reached = BTreeSet::new();
        for (name, proxy) in self.valid_roots(store, status) {
            reached.insert(name.clone());
            let mut walk = Walk {
                store,
                status: &mut *status,
                reached: &mut reached,
                stack: Vec::new(),
                client_certificate: client_certificate.clone(),
            };
            self.process_root(dag, &mut walk, name, proxy);
        }

        for name in store.httpproxies.keys().filter(|n| !reached.contains(*n)) {
            debug!(httpproxy = %name, "HTTPProxy is not reachable from a root");
            status.set_orphaned(&proxy_key(name));
        }
    }
}

impl HttpProxyProcessor {
    /// Root proxies that passed validation, oldest first.
    fn valid_roots<'s>(
        &self,
        store: &'s ResourceStore,
        status: &mut StatusAccumulator,
    ) -> Vec<(&'s NamespacedName, &'s HTTPProxy)> {
        let mut roots: Vec<(&NamespacedName, &HTTPProxy)> = Vec::new();
        let mut by_fqdn: BTreeMap<&str, Vec<&NamespacedName>> = BTreeMap::new();

        for (name, proxy) in &store.httpproxies {
            let Some(vhost) = proxy.spec.virtualhost.as_ref() else {
                continue;
            };
            let key = proxy_key(name);
            if !self.root_namespaces.is_empty() && !self.root_namespaces.contains(&name.namespace) {
                status.add_error(
                    &key,
                    ROOT_NAMESPACE_ERROR,
                    "RootProxyNotAllowedInNamespace",
                    "root HTTPProxy cannot be defined in this namespace",
                );
                continue;
            }
            if let Err(e) = validate_fqdn(&vhost.fqdn) {
                e.record(status, &key);
                continue;
            }
            by_fqdn.entry(vhost.fqdn.as_str()).or_default().push(name);
            roots.push((name, proxy));
        }

        for (fqdn, claimants) in by_fqdn.iter().filter(|(_, c)| c.len() > 1) {
            let names: Vec<String> = claimants.iter().map(|n| n.to_string()).collect();
            let message =
                format!("fqdn \"{}\" is used in multiple HTTPProxies: {}", fqdn, names.join(", "));
            warn!(fqdn, proxies = %names.join(", "), "Duplicate HTTPProxy virtual host");
            for name in claimants {
                status.add_error(&proxy_key(name), VIRTUAL_HOST_ERROR, "DuplicateVhost", &message);
            }
        }
        roots.retain(|(_, proxy)| {
            let fqdn = proxy.spec.virtualhost.as_ref().map(|v| v.fqdn.as_str()).unwrap_or_default();
            by_fqdn.get(fqdn).map(|c| c.len() == 1).unwrap_or(false)
        });
        roots.sort_by(|(a_name, a), (b_name, b)| {
            age_order(
                creation_time(&a.metadata),
                &proxy_key(a_name),
                creation_time(&b.metadata),
                &proxy_key(b_name),
            )
        });
        roots
    }

    fn process_root(&self, dag: &mut Dag, walk: &mut Walk<'_>, name: &NamespacedName, proxy: &HTTPProxy) {
        let key = proxy_key(name);
        let Some(vhost) = proxy.spec.virtualhost.as_ref() else {
            return;
        };
        let fqdn = vhost.fqdn.as_str();

        let tls = match vhost.tls.as_ref() {
            Some(tls) => match self.secure_settings(walk, name, proxy, tls) {
                Ok(settings) => Some(settings),
                Err(e) => {
                    e.record(walk.status, &key);
                    return;
                }
            },
            None => {
                if proxy.spec.tcpproxy.is_some() {
                    walk.status.add_error(
                        &key,
                        TCP_PROXY_ERROR,
                        "TLSMustBeConfigured",
                        "tcpproxy: missing tls.passthrough or tls.secretName",
                    );
                    return;
                }
                None
            }
        };

        let routes = self.proxy_routes(walk, name, proxy, &[]);
        let (Some(http), https) = (dag.http_listener_name(), dag.https_listener_name()) else {
            return;
        };

        match (tls, https) {
            (Some(settings), Some(https)) => {
                let passthrough = settings.passthrough;
                if let Some(svhost) = dag.secure_virtual_host(&https, fqdn) {
                    svhost.secret = settings.secret;
                    svhost.min_tls_version = settings.min_version;
                    svhost.max_tls_version = settings.max_version;
                    svhost.fallback_certificate = settings.fallback_certificate;
                    svhost.downstream_validation = settings.downstream_validation;
                    svhost.tcp_proxy = settings.tcp_proxy;
                    if !passthrough {
                        for r in &routes {
                            svhost.virtual_host.add_route_reporting(r.route.clone(), walk.status);
                        }
                    }
                }
                if let Some(insecure) = dag.virtual_host(&http, fqdn) {
                    for r in routes {
                        let route = if passthrough || r.permit_insecure {
                            r.route
                        } else {
                            r.route.https_upgrade()
                        };
                        insecure.add_route_reporting(route, walk.status);
                    }
                }
            }
            (Some(_), None) => {
                warn!(httpproxy = %name, "No TLS listener available for secure HTTPProxy");
            }
            (None, _) => {
                if let Some(insecure) = dag.virtual_host(&http, fqdn) {
                    for r in routes {
                        insecure.add_route_reporting(r.route, walk.status);
                    }
                }
            }
        }
    }

    fn secure_settings(
        &self,
        walk: &mut Walk<'_>,
        name: &NamespacedName,
        proxy: &HTTPProxy,
        tls: &projectcontour::TLS,
    ) -> Result<SecureSettings, Invalid> {
        let namespace = name.namespace.as_str();
        let mut settings = SecureSettings {
            passthrough: tls.passthrough,
            min_version: self.min_tls_version,
            ..Default::default()
        };

        if tls.passthrough {
            if !tls.secret_name.is_empty() {
                return Err(invalid(
                    TLS_ERROR,
                    "TLSConfigNotValid",
                    "Spec.VirtualHost.TLS: both Passthrough and SecretName were specified",
                ));
            }
            if proxy.spec.tcpproxy.is_none() {
                return Err(invalid(
                    TCP_PROXY_ERROR,
                    "NotFound",
                    "tcpproxy: tls.passthrough requires a tcpproxy",
                ));
            }
        } else {
            if tls.secret_name.is_empty() {
                return Err(invalid(
                    TLS_ERROR,
                    "SecretNotValid",
                    "Spec.VirtualHost.TLS.SecretName must be specified",
                ));
            }
            let secret_name = NamespacedName::from_reference(&tls.secret_name, namespace)
                .ok_or_else(|| {
                    invalid(TLS_ERROR, "SecretNotValid", format!("invalid Secret reference \"{}\"", tls.secret_name))
                })?;
            let secret = lookup_tls_secret(walk.store, &secret_name, namespace).map_err(|e| {
                invalid(TLS_ERROR, e.reason(), format!("Spec.VirtualHost.TLS Secret \"{}\" is invalid: {}", tls.secret_name, e))
            })?;
            settings.secret = Some(secret);
        }

        if !tls.minimum_protocol_version.is_empty() {
            settings.min_version = TlsVersion::parse(&tls.minimum_protocol_version).ok_or_else(|| {
                invalid(
                    TLS_ERROR,
                    "TLSVersionNotValid",
                    format!("invalid minimum TLS version \"{}\"", tls.minimum_protocol_version),
                )
            })?;
        }
        if !tls.maximum_protocol_version.is_empty() {
            settings.max_version = TlsVersion::parse(&tls.maximum_protocol_version).ok_or_else(|| {
                invalid(
                    TLS_ERROR,
                    "TLSVersionNotValid",
                    format!("invalid maximum TLS version \"{}\"", tls.maximum_protocol_version),
                )
            })?;
            if settings.max_version < settings.min_version {
                return Err(invalid(
                    TLS_ERROR,
                    "TLSVersionNotValid",
                    "maximum TLS version must not be lower than the minimum TLS version",
                ));
            }
        }

        if let Some(validation) = tls.client_validation.as_ref() {
            if tls.enable_fallback_certificate {
                return Err(invalid(
                    TLS_ERROR,
                    "TLSIncompatibleFeatures",
                    "Spec.Virtualhost.TLS fallback & client validation are incompatible",
                ));
            }
            let ca = if validation.ca_secret.is_empty() {
                if !validation.skip_client_cert_validation {
                    return Err(invalid(
                        TLS_ERROR,
                        "ClientValidationInvalid",
                        "Spec.VirtualHost.TLS client validation is invalid: CA Secret must be specified",
                    ));
                }
                None
            } else {
                let ca_name = NamespacedName::from_reference(&validation.ca_secret, namespace)
                    .ok_or_else(|| {
                        invalid(TLS_ERROR, "ClientValidationInvalid", "invalid CA Secret reference")
                    })?;
                let ca = lookup_ca_secret(walk.store, &ca_name, namespace).map_err(|e| {
                    invalid(
                        TLS_ERROR,
                        "ClientValidationInvalid",
                        format!("Spec.VirtualHost.TLS client validation is invalid: {}", e),
                    )
                })?;
                Some(ca)
            };
            settings.downstream_validation = Some(DownstreamValidation {
                ca,
                skip_client_cert_validation: validation.skip_client_cert_validation,
            });
        }

        if tls.enable_fallback_certificate {
            let Some(fallback) = self.fallback_certificate.as_ref() else {
                return Err(invalid(
                    TLS_ERROR,
                    "FallbackNotPresent",
                    "Spec.Virtualhost.TLS enabled fallback but the fallback Certificate Secret is not configured",
                ));
            };
            let secret = tls_secret(walk.store, fallback).map_err(|e| {
                invalid(
                    TLS_ERROR,
                    "FallbackNotValid",
                    format!("Spec.Virtualhost.TLS fallback Secret \"{}\" is invalid: {}", fallback, e),
                )
            })?;
            settings.fallback_certificate = Some(secret);
        }

        if let Some(tcpproxy) = proxy.spec.tcpproxy.as_ref() {
            let mut chain = vec![name.clone()];
            settings.tcp_proxy = Some(self.tcp_proxy(walk, name, tcpproxy, &mut chain)?);
        }
        Ok(settings)
    }

    /// Clusters for a TCP proxy, following a `tcpproxy.include` chain.
    fn tcp_proxy(
        &self,
        walk: &mut Walk<'_>,
        name: &NamespacedName,
        tcpproxy: &projectcontour::TCPProxy,
        chain: &mut Vec<NamespacedName>,
    ) -> Result<TcpProxy, Invalid> {
        if let Some(include) = tcpproxy.include.as_ref() {
            if !tcpproxy.services.is_empty() {
                return Err(invalid(
                    TCP_PROXY_ERROR,
                    "NoServicesAndInclude",
                    "cannot specify services and include in the same httpproxy",
                ));
            }
            let child_name = NamespacedName::new(
                include.namespace.clone().unwrap_or_else(|| name.namespace.clone()),
                include.name.clone(),
            );
            if chain.contains(&child_name) {
                return Err(invalid(
                    TCP_PROXY_INCLUDE_ERROR,
                    "IncludeCreatesCycle",
                    format!("tcpproxy include creates a cycle: {}", child_name),
                ));
            }
            let Some(child) = walk.store.httpproxies.get(&child_name) else {
                return Err(invalid(
                    TCP_PROXY_INCLUDE_ERROR,
                    "IncludeNotFound",
                    format!("include {} not found", child_name),
                ));
            };
            let Some(child_tcpproxy) = child.spec.tcpproxy.as_ref() else {
                return Err(invalid(
                    TCP_PROXY_INCLUDE_ERROR,
                    "NoTCPProxy",
                    format!("included httpproxy {} has no tcpproxy", child_name),
                ));
            };
            walk.reached.insert(child_name.clone());
            chain.push(child_name.clone());
            return match self.tcp_proxy(walk, &child_name, child_tcpproxy, chain) {
                Ok(proxy) => Ok(proxy),
                Err(e) => {
                    e.clone().record(walk.status, &proxy_key(&child_name));
                    Err(e)
                }
            };
        }

        if tcpproxy.services.is_empty() {
            return Err(invalid(
                TCP_PROXY_ERROR,
                "NoServicesPresent",
                "tcpproxy: either services or inclusion must be specified",
            ));
        }
        let (lb_strategy, _) = load_balancer_policy(tcpproxy.load_balancer_policy.as_ref());
        let health_check = tcpproxy.health_check_policy.as_ref().map(TcpHealthCheck::from_httpproxy);
        let mut clusters = Vec::with_capacity(tcpproxy.services.len());
        for service in &tcpproxy.services {
            let mut cluster = self.service_cluster(walk, name, service)?;
            cluster.lb_strategy = lb_strategy;
            cluster.tcp_health_check = health_check.clone();
            clusters.push(cluster);
        }
        Ok(TcpProxy { clusters, source: proxy_key(name) })
    }

    /// Routes of `proxy` and everything it includes, with `inherited`
    /// conditions prepended.
    fn proxy_routes(
        &self,
        walk: &mut Walk<'_>,
        name: &NamespacedName,
        proxy: &HTTPProxy,
        inherited: &[MatchCondition],
    ) -> Vec<ProxyRoute> {
        let key = proxy_key(name);
        walk.reached.insert(name.clone());
        walk.stack.push(name.clone());

        let mut routes = Vec::new();
        match self.validate_includes(proxy) {
            Ok(()) => {
                for include in &proxy.spec.includes {
                    routes.extend(self.include_routes(walk, name, include, inherited));
                }
                match self.own_routes(walk, name, proxy, inherited) {
                    Ok(own) => routes.extend(own),
                    Err(errors) => {
                        for e in errors {
                            e.record(walk.status, &key);
                        }
                    }
                }
            }
            Err(e) => e.record(walk.status, &key),
        }

        walk.stack.pop();
        routes
    }

    fn validate_includes(&self, proxy: &HTTPProxy) -> Result<(), Invalid> {
        let mut seen: Vec<RouteConditions> = Vec::new();
        for include in &proxy.spec.includes {
            validate_match_conditions(&include.conditions)
                .map_err(|e| invalid(INCLUDE_ERROR, e.reason, e.message))?;
            let conditions = merge_conditions(&include.conditions);
            if seen.contains(&conditions) {
                return Err(invalid(
                    INCLUDE_ERROR,
                    "DuplicateMatchConditions",
                    "duplicate conditions defined on an include",
                ));
            }
            seen.push(conditions);
        }
        Ok(())
    }

    fn include_routes(
        &self,
        walk: &mut Walk<'_>,
        parent: &NamespacedName,
        include: &projectcontour::Include,
        inherited: &[MatchCondition],
    ) -> Vec<ProxyRoute> {
        let parent_key = proxy_key(parent);
        let child_name = NamespacedName::new(
            include.namespace.clone().unwrap_or_else(|| parent.namespace.clone()),
            include.name.clone(),
        );
        let Some(child) = walk.store.httpproxies.get(&child_name) else {
            walk.status.add_error(
                &parent_key,
                INCLUDE_ERROR,
                "IncludeNotFound",
                format!("include {} not found", child_name),
            );
            return Vec::new();
        };
        if child.spec.virtualhost.is_some() {
            walk.status.add_error(
                &parent_key,
                INCLUDE_ERROR,
                "RootIncludesRoot",
                "root httpproxy cannot include another root httpproxy",
            );
            return Vec::new();
        }
        if walk.stack.contains(&child_name) {
            let mut path: Vec<String> = walk.stack.iter().map(|n| n.to_string()).collect();
            path.push(child_name.to_string());
            walk.status.add_error(
                &parent_key,
                INCLUDE_ERROR,
                "IncludeCreatesCycle",
                format!("include creates an include cycle: {}", path.join(" -> ")),
            );
            return Vec::new();
        }

        let mut conditions = inherited.to_vec();
        conditions.extend(include.conditions.iter().cloned());
        self.proxy_routes(walk, &child_name, child, &conditions)
    }

    /// The routes a proxy defines itself. Any invalid route voids them all.
    fn own_routes(
        &self,
        walk: &mut Walk<'_>,
        name: &NamespacedName,
        proxy: &HTTPProxy,
        inherited: &[MatchCondition],
    ) -> Result<Vec<ProxyRoute>, Vec<Invalid>> {
        let created = creation_time(&proxy.metadata);
        let mut errors = Vec::new();

        let mut planned = Vec::with_capacity(proxy.spec.routes.len());
        for route in &proxy.spec.routes {
            if let Err(e) = validate_match_conditions(&route.conditions) {
                errors.push(invalid(ROUTE_ERROR, e.reason, e.message));
                continue;
            }
            let mut all = inherited.to_vec();
            all.extend(route.conditions.iter().cloned());
            planned.push((route, merge_conditions(&all)));
        }
        let explicit: BTreeSet<RouteConditions> = planned.iter().map(|(_, c)| c.clone()).collect();

        let mut routes = Vec::new();
        for (route, conditions) in planned {
            match self.build_routes(walk, name, created, route, conditions, &explicit) {
                Ok(built) => routes.extend(built),
                Err(e) => errors.push(e),
            }
        }
        if errors.is_empty() {
            Ok(routes)
        } else {
            Err(errors)
        }
    }

    fn build_routes(
        &self,
        walk: &mut Walk<'_>,
        name: &NamespacedName,
        created: Option<DateTime<Utc>>,
        spec: &projectcontour::Route,
        conditions: RouteConditions,
        explicit: &BTreeSet<RouteConditions>,
    ) -> Result<Vec<ProxyRoute>, Invalid> {
        let key = proxy_key(name);
        let actions = [
            !spec.services.is_empty(),
            spec.request_redirect_policy.is_some(),
            spec.direct_response_policy.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count();
        if actions == 0 {
            return Err(invalid(
                ROUTE_ERROR,
                "NoServicesPresent",
                "route.services must have at least one entry",
            ));
        }
        if actions > 1 {
            return Err(invalid(
                ROUTE_ERROR,
                "MultipleActions",
                "route must specify only one of services, requestRedirectPolicy or directResponsePolicy",
            ));
        }

        let response_policy = match spec.response_headers_policy.as_ref() {
            Some(policy) => Some(HeadersPolicy::from_httpproxy(policy, false).map_err(|e| {
                invalid(ROUTE_ERROR, "ResponseHeadersPolicyInvalid", format!("route.responseHeadersPolicy: {}", e))
            })?),
            None => None,
        };
        let request_policy = match spec.request_headers_policy.as_ref() {
            Some(policy) => Some(HeadersPolicy::from_httpproxy(policy, true).map_err(|e| {
                invalid(ROUTE_ERROR, "RequestHeadersPolicyInvalid", format!("route.requestHeadersPolicy: {}", e))
            })?),
            None => None,
        };

        let timeout_policy = spec.timeout_policy.as_ref();
        let parse_timeout = |value: Option<&String>, field: &str| {
            Timeout::parse(value.map(String::as_str).unwrap_or_default()).map_err(|e| {
                invalid(ROUTE_ERROR, "TimeoutPolicyNotValid", format!("route.timeoutPolicy.{} failed to parse: {}", field, e))
            })
        };
        let response_timeout = parse_timeout(timeout_policy.map(|t| &t.response), "response")?;
        let idle_stream = parse_timeout(timeout_policy.map(|t| &t.idle), "idle")?;
        let idle_connection =
            parse_timeout(timeout_policy.map(|t| &t.idle_connection), "idleConnection")?;

        let retry_policy = match spec.retry_policy.as_ref() {
            Some(policy) => Some(
                RetryPolicy::from_httpproxy(policy)
                    .map_err(|e| invalid(ROUTE_ERROR, "RetryPolicyNotValid", e))?,
            ),
            None => None,
        };
        let health_check = match spec.health_check_policy.as_ref() {
            Some(policy) => Some(
                HealthCheck::from_httpproxy(policy)
                    .map_err(|e| invalid(ROUTE_ERROR, "HealthCheckPolicyNotValid", e))?,
            ),
            None => None,
        };
        let (lb_strategy, hash_policies) = load_balancer_policy(spec.load_balancer_policy.as_ref());

        let action = if let Some(redirect) = spec.request_redirect_policy.as_ref() {
            RouteAction::Redirect(redirect_action(redirect)?)
        } else if let Some(direct) = spec.direct_response_policy.as_ref() {
            if !(200..=599).contains(&direct.status_code) {
                return Err(invalid(
                    ROUTE_ERROR,
                    "DirectResponseNotValid",
                    format!("invalid direct response status code {}", direct.status_code),
                ));
            }
            RouteAction::DirectResponse(DirectResponse {
                status_code: direct.status_code as u32,
                body: (!direct.body.is_empty()).then(|| direct.body.clone()),
            })
        } else {
            let mut clusters = Vec::new();
            let mut mirrors = Vec::new();
            for service in &spec.services {
                let mut cluster = self.service_cluster(walk, name, service)?;
                cluster.lb_strategy = lb_strategy;
                cluster.health_check = health_check.clone();
                cluster.idle_connection_timeout = idle_connection;
                if service.mirror {
                    mirrors.push(cluster);
                } else {
                    clusters.push(cluster);
                }
            }
            if mirrors.len() > 1 {
                return Err(invalid(
                    ROUTE_ERROR,
                    "OnlyOneMirror",
                    "only one service per route may be nominated as mirror",
                ));
            }
            if clusters.is_empty() {
                return Err(invalid(
                    ROUTE_ERROR,
                    "NoServicesPresent",
                    "route.services must have at least one non-mirror entry",
                ));
            }
            let mut route = Route::new(
                conditions.clone(),
                RouteAction::Clusters(clusters),
                key.clone(),
                created,
            );
            route.mirrors = mirrors;
            return self.finish_routes(
                route,
                spec,
                request_policy,
                response_policy,
                TimeoutPolicy { response: response_timeout, idle_stream },
                retry_policy,
                hash_policies,
                explicit,
            );
        };

        let route = Route::new(conditions, action, key, created);
        self.finish_routes(
            route,
            spec,
            request_policy,
            response_policy,
            TimeoutPolicy { response: response_timeout, idle_stream },
            retry_policy,
            hash_policies,
            explicit,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_routes(
        &self,
        mut route: Route,
        spec: &projectcontour::Route,
        request_policy: Option<(HeadersPolicy, Option<String>)>,
        response_policy: Option<(HeadersPolicy, Option<String>)>,
        timeout_policy: TimeoutPolicy,
        retry_policy: Option<RetryPolicy>,
        hash_policies: Vec<HashPolicy>,
        explicit: &BTreeSet<RouteConditions>,
    ) -> Result<Vec<ProxyRoute>, Invalid> {
        if let Some((policy, host)) = request_policy {
            route.host_rewrite = host;
            route.request_headers = (!policy.is_empty()).then_some(policy);
        }
        if let Some((policy, _)) = response_policy {
            route.response_headers = (!policy.is_empty()).then_some(policy);
        }
        route.timeout_policy = timeout_policy;
        route.retry_policy = retry_policy;
        route.hash_policies = hash_policies;
        route.websocket = spec.enable_websockets;

        let permit_insecure = spec.permit_insecure;
        let Some(policy) = spec.path_rewrite_policy.as_ref() else {
            return Ok(vec![ProxyRoute { route, permit_insecure }]);
        };
        rewrite::validate(policy)
            .map_err(|e| invalid(PREFIX_REPLACE_ERROR, e.reason(), e.to_string()))?;

        let PathMatch::Prefix { prefix, .. } = route.conditions.path.clone() else {
            return Ok(vec![ProxyRoute { route, permit_insecure }]);
        };
        let Some(replacement) = rewrite::replacement_for(policy, &prefix) else {
            return Ok(vec![ProxyRoute { route, permit_insecure }]);
        };

        let own = route.conditions.clone();
        let expanded = rewrite::expand(&prefix, replacement)
            .into_iter()
            .filter_map(|(path, rewrite)| {
                let conditions = RouteConditions::new(
                    path,
                    own.headers.clone(),
                    own.query_params.clone(),
                );
                if conditions != own && explicit.contains(&conditions) {
                    return None;
                }
                let mut expanded = route.clone();
                expanded.conditions = conditions;
                expanded.path_rewrite = Some(rewrite);
                Some(ProxyRoute { route: expanded, permit_insecure })
            })
            .collect();
        Ok(expanded)
    }

    fn service_cluster(
        &self,
        walk: &mut Walk<'_>,
        name: &NamespacedName,
        service: &projectcontour::Service,
    ) -> Result<Cluster, Invalid> {
        let namespace = name.namespace.as_str();
        let service_name = NamespacedName::new(namespace, service.name.clone());
        let mut cluster = service_cluster(
            walk.store,
            &service_name,
            &PortRef::Number(service.port),
            &self.cluster_defaults,
        )
        .map_err(|e| {
            let reason = match e {
                BackendError::ServiceNotFound(_) => "ServiceUnresolvedReference",
                BackendError::PortNotFound { .. } => "ServicePortUnresolved",
            };
            invalid(SERVICE_ERROR, reason, format!("Spec.Routes unresolved service reference: {}", e))
        })?;

        if let Some(protocol) = service.protocol.as_deref() {
            match protocol {
                "h2" | "h2c" | "tls" => cluster.protocol = protocol.to_string(),
                other => {
                    return Err(invalid(
                        SERVICE_ERROR,
                        "UnsupportedProtocol",
                        format!("unsupported protocol: {}", other),
                    ))
                }
            }
        }
        cluster.weight = service.weight.unwrap_or_default();

        if let Some(validation) = service.validation.as_ref() {
            if validation.subject_name.is_empty() {
                return Err(invalid(
                    SERVICE_ERROR,
                    "TLSSubjectNameNotValid",
                    "upstream validation requires a subjectName",
                ));
            }
            let ca_name = NamespacedName::from_reference(&validation.ca_secret, namespace)
                .ok_or_else(|| invalid(SERVICE_ERROR, "TLSUpstreamValidation", "invalid CA Secret reference"))?;
            let ca = lookup_ca_secret(walk.store, &ca_name, namespace).map_err(|e| {
                invalid(SERVICE_ERROR, "TLSUpstreamValidation", format!("upstream validation is invalid: {}", e))
            })?;
            if cluster.protocol.is_empty() {
                cluster.protocol = "tls".to_string();
            }
            cluster.upstream_validation =
                Some(PeerValidation { ca, subject_name: validation.subject_name.clone() });
        }
        if uses_tls(&cluster.protocol) {
            cluster.client_certificate = walk.client_certificate.clone();
        }

        if let Some(policy) = service.request_headers_policy.as_ref() {
            let (policy, _) = HeadersPolicy::from_httpproxy(policy, false).map_err(|e| {
                invalid(SERVICE_ERROR, "RequestHeadersPolicyInvalid", format!("service.requestHeadersPolicy: {}", e))
            })?;
            cluster.request_headers = (!policy.is_empty()).then_some(policy);
        }
        if let Some(policy) = service.response_headers_policy.as_ref() {
            let (policy, _) = HeadersPolicy::from_httpproxy(policy, false).map_err(|e| {
                invalid(SERVICE_ERROR, "ResponseHeadersPolicyInvalid", format!("service.responseHeadersPolicy: {}", e))
            })?;
            cluster.response_headers = (!policy.is_empty()).then_some(policy);
        }
        Ok(cluster)
    }
}

/// TLS settings resolved for a root proxy.
#[derive(Debug, Default)]
struct SecureSettings {
    passthrough: bool,
    secret: Option<TlsSecret>,
    min_version: TlsVersion,
    max_version: TlsVersion,
    fallback_certificate: Option<TlsSecret>,
    downstream_validation: Option<DownstreamValidation>,
    tcp_proxy: Option<TcpProxy>,
}

fn validate_fqdn(fqdn: &str) -> Result<(), Invalid> {
    if fqdn.is_empty() {
        return Err(invalid(
            VIRTUAL_HOST_ERROR,
            "FQDNNotSpecified",
            "Spec.VirtualHost.Fqdn must be specified",
        ));
    }
    let wildcard_ok = fqdn
        .strip_prefix("*.")
        .map(|rest| !rest.is_empty() && !rest.contains('*'))
        .unwrap_or(false);
    if fqdn.contains('*') && !wildcard_ok {
        return Err(invalid(
            VIRTUAL_HOST_ERROR,
            "WildCardNotAllowed",
            format!("Spec.VirtualHost.Fqdn \"{}\" cannot use wildcards", fqdn),
        ));
    }
    Ok(())
}

fn redirect_action(policy: &projectcontour::HTTPRequestRedirectPolicy) -> Result<Redirect, Invalid> {
    if policy.path.is_some() && policy.prefix.is_some() {
        return Err(invalid(
            ROUTE_ERROR,
            "RedirectNotValid",
            "cannot specify both redirect path and redirect prefix",
        ));
    }
    let status_code = match policy.status_code {
        None => 302,
        Some(code @ (301 | 302)) => code as u32,
        Some(other) => {
            return Err(invalid(
                ROUTE_ERROR,
                "RedirectNotValid",
                format!("invalid redirect status code {}", other),
            ))
        }
    };
    Ok(Redirect {
        https_redirect: false,
        scheme: policy.scheme.clone(),
        hostname: policy.hostname.clone(),
        port: policy.port.and_then(|p| u32::try_from(p).ok()),
        path: policy.path.clone(),
        prefix: policy.prefix.clone(),
        status_code,
    })
}

/// Reason and message for an invalid condition list.
struct ConditionProblem {
    reason: &'static str,
    message: String,
}

fn problem(reason: &'static str, message: impl Into<String>) -> ConditionProblem {
    ConditionProblem { reason, message: message.into() }
}

/// Check one level of match conditions (a route's or an include's).
fn validate_match_conditions(conditions: &[MatchCondition]) -> Result<(), ConditionProblem> {
    let prefixes: Vec<&str> = conditions.iter().filter_map(|c| c.prefix.as_deref()).collect();
    if prefixes.len() > 1 {
        return Err(problem("PathMatchConditionsNotValid", "more than one prefix is not allowed in a condition block"));
    }
    if let Some(prefix) = prefixes.first() {
        if !prefix.starts_with('/') {
            return Err(problem("PathMatchConditionsNotValid", "prefix conditions must start with /"));
        }
    }

    let mut exact: BTreeMap<&str, &str> = BTreeMap::new();
    for header in conditions.iter().filter_map(|c| c.header.as_ref()) {
        let operators = [
            header.present,
            header.not_present,
            header.contains.is_some(),
            header.not_contains.is_some(),
            header.exact.is_some(),
            header.not_exact.is_some(),
            header.regex.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count();
        if header.name.is_empty() || operators != 1 {
            return Err(problem(
                "HeaderMatchConditionsNotValid",
                format!("header condition \"{}\" must specify exactly one match type", header.name),
            ));
        }
        if let Some(regex) = header.regex.as_deref() {
            regex::Regex::new(regex).map_err(|e| {
                problem("HeaderMatchConditionsNotValid", format!("invalid header regex \"{}\": {}", regex, e))
            })?;
        }
        let name = header.name.as_str();
        if let Some(value) = header.exact.as_deref() {
            if exact.insert(name, value).map(|prev| prev != value).unwrap_or(false) {
                return Err(problem(
                    "HeaderMatchConditionsNotValid",
                    format!("cannot specify duplicate header 'exact match' conditions in the same route for header \"{}\"", name),
                ));
            }
        }
    }
    for header in conditions.iter().filter_map(|c| c.header.as_ref()) {
        if let (Some(value), Some(exact)) = (header.not_exact.as_deref(), exact.get(header.name.as_str())) {
            if value == *exact {
                return Err(problem(
                    "HeaderMatchConditionsNotValid",
                    format!("header \"{}\" cannot both be exact and notexact the same value", header.name),
                ));
            }
        }
    }

    for query in conditions.iter().filter_map(|c| c.query_parameter.as_ref()) {
        let operators = [
            query.exact.is_some(),
            query.prefix.is_some(),
            query.suffix.is_some(),
            query.regex.is_some(),
            query.contains.is_some(),
            query.present,
        ]
        .into_iter()
        .filter(|set| *set)
        .count();
        if query.name.is_empty() || operators != 1 {
            return Err(problem(
                "QueryParameterMatchConditionsNotValid",
                format!("query parameter condition \"{}\" must specify exactly one match type", query.name),
            ));
        }
        if let Some(regex) = query.regex.as_deref() {
            regex::Regex::new(regex).map_err(|e| {
                problem("QueryParameterMatchConditionsNotValid", format!("invalid query regex \"{}\": {}", regex, e))
            })?;
        }
    }
    Ok(())
}

/// Join include and route prefixes: `/foo` + `/bar` is `/foo/bar`, and a
/// trailing slash on the last prefix is kept.
fn join_prefixes(prefixes: &[&str]) -> String {
    let mut joined = String::new();
    for prefix in prefixes {
        let trimmed = prefix.trim_matches('/');
        if !trimmed.is_empty() {
            joined.push('/');
            joined.push_str(trimmed);
        }
    }
    if joined.is_empty() {
        return "/".to_string();
    }
    if prefixes.last().map(|p| p.ends_with('/')).unwrap_or(false) {
        joined.push('/');
    }
    joined
}

/// Route conditions for a chain of match conditions.
fn merge_conditions(conditions: &[MatchCondition]) -> RouteConditions {
    let prefixes: Vec<&str> = conditions.iter().filter_map(|c| c.prefix.as_deref()).collect();
    let path = PathMatch::string_prefix(join_prefixes(&prefixes));

    let headers = conditions
        .iter()
        .filter_map(|c| c.header.as_ref())
        .filter_map(|h| {
            let name = h.name.as_str();
            let matcher = if h.present {
                HeaderMatch::new(name, HeaderMatchKind::Present, "")
            } else if h.not_present {
                HeaderMatch::new(name, HeaderMatchKind::Present, "").inverted()
            } else if let Some(v) = h.contains.as_deref() {
                HeaderMatch::new(name, HeaderMatchKind::Contains, v)
            } else if let Some(v) = h.not_contains.as_deref() {
                HeaderMatch::new(name, HeaderMatchKind::Contains, v).inverted()
            } else if let Some(v) = h.exact.as_deref() {
                HeaderMatch::new(name, HeaderMatchKind::Exact, v)
            } else if let Some(v) = h.not_exact.as_deref() {
                HeaderMatch::new(name, HeaderMatchKind::Exact, v).inverted()
            } else {
                HeaderMatch::new(name, HeaderMatchKind::Regex, h.regex.as_deref()?)
            };
            Some(matcher)
        })
        .collect();

    let query_params = conditions
        .iter()
        .filter_map(|c| c.query_parameter.as_ref())
        .filter_map(|q| {
            let (kind, value) = if let Some(v) = q.exact.as_deref() {
                (QueryMatchKind::Exact, v)
            } else if let Some(v) = q.prefix.as_deref() {
                (QueryMatchKind::Prefix, v)
            } else if let Some(v) = q.suffix.as_deref() {
                (QueryMatchKind::Suffix, v)
            } else if let Some(v) = q.regex.as_deref() {
                (QueryMatchKind::Regex, v)
            } else if let Some(v) = q.contains.as_deref() {
                (QueryMatchKind::Contains, v)
            } else if q.present {
                (QueryMatchKind::Present, "")
            } else {
                return None;
            };
            Some(QueryParamMatch {
                name: q.name.clone(),
                kind,
                value: value.to_string(),
                ignore_case: q.ignore_case,
            })
        })
        .collect();

    RouteConditions::new(path, headers, query_params)
}
