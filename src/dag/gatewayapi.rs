//! Gateway API processor.
//!
//! Validates the selected Gateway's listeners and attaches HTTPRoutes,
//! TLSRoutes and TCPRoutes to the Envoy listeners the listener processor
//! created for them. Route conditions are scoped by parent reference.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use tracing::debug;

use super::backend::{service_cluster, uses_tls, ClusterDefaults, PortRef};
use super::builder::Processor;
use super::listener::{plan_gateway_listeners, PlannedListener};
use super::policy::{canonical_header_name, HeadersPolicy, Timeout, TimeoutPolicy};
use super::secret::{lookup_ca_config_map, lookup_ca_secret, tls_secret};
use super::status::{
    Condition, ConditionStatus, StatusAccumulator, CONDITION_ACCEPTED, CONDITION_PROGRAMMED,
    CONDITION_RESOLVED_REFS, REASON_ROUTE_CONFLICT,
};
use super::{
    Cluster, Dag, DirectResponse, HeaderMatch, HeaderMatchKind, ListenerProtocol, PathMatch,
    PathRewrite, PeerValidation, QueryMatchKind, QueryParamMatch, Redirect, Route, RouteAction,
    RouteConditions, TcpProxy, TlsSecret, TlsVersion, VirtualHost, WILDCARD_HOST,
};
use crate::config::Config;
use crate::k8s::gateway::{
    BackendRef, HTTPHeaderFilter, HTTPPathModifier, HTTPRoute, HTTPRouteMatch,
    HTTPRouteRule, ParentReference, GATEWAY_GROUP,
};
use crate::k8s::{age_order, creation_time, Kind, NamespacedName, ObjectKey, ObjectMeta};
use crate::store::ResourceStore;

const HTTP_ROUTE: &str = "HTTPRoute";
const TLS_ROUTE: &str = "TLSRoute";
const TCP_ROUTE: &str = "TCPRoute";

/// A route-level problem: condition reason plus message.
type Problem = (&'static str, String);

/// A validated Gateway listener.
#[derive(Debug, Clone)]
struct ListenerInfo {
    planned: PlannedListener,
    secret: Option<TlsSecret>,
    allowed_kinds: Vec<&'static str>,
    valid: bool,
}

impl ListenerInfo {
    fn name(&self) -> &str {
        &self.planned.gateway_listener.name
    }

    fn hostname(&self) -> Option<&str> {
        self.planned.gateway_listener.hostname.as_deref().filter(|h| !h.is_empty())
    }
}

struct GatewayContext<'a> {
    store: &'a ResourceStore,
    name: &'a NamespacedName,
    listeners: Vec<ListenerInfo>,
    client_certificate: Option<TlsSecret>,
}

#[derive(Debug, Clone)]
pub struct GatewayApiProcessor {
    port_offset: u32,
    controller_name: String,
    min_tls_version: TlsVersion,
    cluster_defaults: ClusterDefaults,
    client_certificate: Option<NamespacedName>,
}

impl GatewayApiProcessor {
    pub fn from_config(config: &Config) -> Self {
        Self {
            port_offset: config.gateway.port_offset,
            controller_name: config.gateway.controller_name.clone(),
            min_tls_version: TlsVersion::parse(&config.tls.minimum_protocol_version)
                .unwrap_or(TlsVersion::V1_2),
            cluster_defaults: ClusterDefaults {
                connect_timeout: config.cluster.connect_timeout(),
                dns_lookup_family: config.cluster.dns_lookup_family.clone(),
            },
            client_certificate: config.tls.envoy_client_certificate(),
        }
    }
}

fn accepted(reason: &str, message: impl Into<String>) -> Condition {
    Condition::new(CONDITION_ACCEPTED, ConditionStatus::True, reason, message)
}

fn rejected(condition_type: &str, reason: &str, message: impl Into<String>) -> Condition {
    Condition::new(condition_type, ConditionStatus::False, reason, message)
}

fn listener_scope(name: &str) -> String {
    format!("listener/{}", name)
}

/// Status scope for one parent reference of a route.
fn parent_scope(parent: &ParentReference, route_namespace: &str) -> String {
    let namespace = parent.namespace.as_deref().unwrap_or(route_namespace);
    match parent.section_name.as_deref() {
        Some(section) => format!("{}/{}/{}", namespace, parent.name, section),
        None => format!("{}/{}", namespace, parent.name),
    }
}

impl Processor for GatewayApiProcessor {
    fn name(&self) -> &'static str {
        "gatewayapi"
    }

    fn run(&self, dag: &mut Dag, store: &ResourceStore, status: &mut StatusAccumulator) {
        for (name, class) in &store.gateway_classes {
            if class.spec.controller_name == self.controller_name {
                let key = ObjectKey::new(Kind::GatewayClass, "", name.clone());
                status.set_condition(&key, "", accepted("Accepted", "Valid GatewayClass"));
            }
        }

        let Some((name, gateway)) = store.selected_gateway() else {
            return;
        };
        let gateway_key = ObjectKey::new(Kind::Gateway, name.namespace.clone(), name.name.clone());
        let client_certificate =
            self.client_certificate.as_ref().and_then(|n| tls_secret(store, n).ok());
        let listeners = plan_gateway_listeners(gateway, self.port_offset)
            .into_iter()
            .map(|planned| self.validate_listener(store, name, &gateway_key, planned, status))
            .collect::<Vec<_>>();

        status.set_condition(&gateway_key, "", accepted("Accepted", "Gateway is accepted"));
        if listeners.iter().all(|l| l.valid) {
            status.set_condition(
                &gateway_key,
                "",
                Condition::new(CONDITION_PROGRAMMED, ConditionStatus::True, "Programmed", "Valid Gateway"),
            );
        } else {
            status.set_condition(
                &gateway_key,
                "",
                rejected(CONDITION_PROGRAMMED, "ListenersNotValid", "Listeners are not valid"),
            );
        }

        let ctx = GatewayContext { store, name, listeners, client_certificate };

        let mut routes: Vec<(&NamespacedName, &HTTPRoute)> = store.httproutes.iter().collect();
        routes.sort_by(|(a_name, a), (b_name, b)| {
            age_order(
                creation_time(&a.metadata),
                &ObjectKey::new(Kind::HTTPRoute, a_name.namespace.clone(), a_name.name.clone()),
                creation_time(&b.metadata),
                &ObjectKey::new(Kind::HTTPRoute, b_name.namespace.clone(), b_name.name.clone()),
            )
        });
        for (name, route) in routes {
            self.process_httproute(dag, &ctx, status, name, route);
        }
        for (name, route) in &store.tlsroutes {
            let key = ObjectKey::new(Kind::TLSRoute, name.namespace.clone(), name.name.clone());
            let backends: Vec<&BackendRef> =
                route.spec.rules.iter().flat_map(|r| r.backend_refs.iter()).collect();
            self.process_l4_route(
                dag,
                &ctx,
                status,
                &key,
                &route.metadata,
                &route.spec.parent_refs,
                &route.spec.hostnames,
                &backends,
                TLS_ROUTE,
            );
        }
        for (name, route) in &store.tcproutes {
            let key = ObjectKey::new(Kind::TCPRoute, name.namespace.clone(), name.name.clone());
            let backends: Vec<&BackendRef> =
                route.spec.rules.iter().flat_map(|r| r.backend_refs.iter()).collect();
            self.process_l4_route(
                dag,
                &ctx,
                status,
                &key,
                &route.metadata,
                &route.spec.parent_refs,
                &[],
                &backends,
                TCP_ROUTE,
            );
        }
    }
}

impl GatewayApiProcessor {
    fn validate_listener(
        &self,
        store: &ResourceStore,
        gateway_name: &NamespacedName,
        gateway_key: &ObjectKey,
        planned: PlannedListener,
        status: &mut StatusAccumulator,
    ) -> ListenerInfo {
        let scope = listener_scope(&planned.gateway_listener.name);
        let mut info = ListenerInfo { planned, secret: None, allowed_kinds: Vec::new(), valid: false };

        if let Some(problem) = info.planned.problem {
            status.set_condition(gateway_key, &scope, rejected(CONDITION_ACCEPTED, problem.reason(), problem.message()));
            status.set_condition(gateway_key, &scope, rejected(CONDITION_PROGRAMMED, "Invalid", problem.message()));
            return info;
        }

        let listener = &info.planned.gateway_listener;
        let supported: &[&'static str] = match listener.protocol.as_str() {
            "HTTP" | "HTTPS" => &[HTTP_ROUTE],
            "TLS" => &[TLS_ROUTE],
            _ => &[TCP_ROUTE],
        };
        let requested = listener.allowed_routes.as_ref().map(|a| a.kinds.as_slice()).unwrap_or_default();
        if requested.is_empty() {
            info.allowed_kinds = supported.to_vec();
        } else {
            for kind in requested {
                let group_ok = kind.group.as_deref().map(|g| g == GATEWAY_GROUP).unwrap_or(true);
                if let Some(k) = supported.iter().find(|s| **s == kind.kind).filter(|_| group_ok) {
                    info.allowed_kinds.push(*k);
                }
            }
            if info.allowed_kinds.len() != requested.len() {
                status.set_condition(
                    gateway_key,
                    &scope,
                    rejected(CONDITION_RESOLVED_REFS, "InvalidRouteKinds", "listener allows unsupported route kinds"),
                );
                if info.allowed_kinds.is_empty() {
                    status.set_condition(
                        gateway_key,
                        &scope,
                        rejected(CONDITION_PROGRAMMED, "Invalid", "no supported route kinds"),
                    );
                    return info;
                }
            }
        }

        let terminates_tls = listener.protocol == "HTTPS" || (listener.protocol == "TLS" && !info.planned.is_passthrough());
        if terminates_tls {
            match self.listener_certificate(store, gateway_name, &info.planned) {
                Ok(secret) => info.secret = Some(secret),
                Err((reason, message)) => {
                    status.set_condition(gateway_key, &scope, rejected(CONDITION_RESOLVED_REFS, reason, &message));
                    status.set_condition(gateway_key, &scope, rejected(CONDITION_PROGRAMMED, "Invalid", message));
                    return info;
                }
            }
        }

        info.valid = true;
        status.set_condition(gateway_key, &scope, accepted("Accepted", "Listener is accepted"));
        if status.condition(gateway_key, &scope, CONDITION_RESOLVED_REFS).is_none() {
            status.set_condition(
                gateway_key,
                &scope,
                Condition::new(CONDITION_RESOLVED_REFS, ConditionStatus::True, "ResolvedRefs", "References resolved"),
            );
        }
        status.set_condition(
            gateway_key,
            &scope,
            Condition::new(CONDITION_PROGRAMMED, ConditionStatus::True, "Programmed", "Valid listener"),
        );
        info
    }

    fn listener_certificate(
        &self,
        store: &ResourceStore,
        gateway_name: &NamespacedName,
        planned: &PlannedListener,
    ) -> Result<TlsSecret, Problem> {
        let reference = planned
            .gateway_listener
            .tls
            .as_ref()
            .and_then(|tls| tls.certificate_refs.first())
            .ok_or_else(|| ("InvalidCertificateRef", "listener requires a certificate reference".to_string()))?;
        let group_ok = reference.group.as_deref().map(str::is_empty).unwrap_or(true);
        if !group_ok || reference.kind.as_deref().unwrap_or("Secret") != "Secret" {
            return Err(("InvalidCertificateRef", "certificate reference must be a core Secret".into()));
        }
        let secret_name = NamespacedName::new(
            reference.namespace.clone().unwrap_or_else(|| gateway_name.namespace.clone()),
            reference.name.clone(),
        );
        if !store.reference_permitted("Gateway", &gateway_name.namespace, "Secret", &secret_name) {
            return Err((
                "RefNotPermitted",
                format!("certificate reference to Secret {} is not permitted by any ReferenceGrant", secret_name),
            ));
        }
        tls_secret(store, &secret_name).map_err(|e| ("InvalidCertificateRef", e.to_string()))
    }

    /// Valid listeners a parent reference attaches a `kind` route to.
    fn attach<'c>(
        &self,
        ctx: &'c GatewayContext<'_>,
        parent: &ParentReference,
        route_namespace: &str,
        kind: &str,
    ) -> Result<Vec<&'c ListenerInfo>, Problem> {
        let candidates: Vec<&ListenerInfo> = ctx
            .listeners
            .iter()
            .filter(|l| parent.section_name.as_deref().map(|s| s == l.name()).unwrap_or(true))
            .filter(|l| parent.port.map(|p| p == l.planned.gateway_listener.port).unwrap_or(true))
            .collect();
        if candidates.is_empty() {
            return Err(("NoMatchingParent", "no listener matches the parent reference".into()));
        }
        let attached: Vec<&ListenerInfo> = candidates
            .into_iter()
            .filter(|l| l.valid && l.allowed_kinds.iter().any(|k| *k == kind))
            .filter(|l| self.namespace_allowed(ctx, l, route_namespace))
            .collect();
        if attached.is_empty() {
            return Err(("NotAllowedByListeners", "no listener allows this route".into()));
        }
        Ok(attached)
    }

    fn namespace_allowed(&self, ctx: &GatewayContext<'_>, listener: &ListenerInfo, route_namespace: &str) -> bool {
        let namespaces = listener
            .planned
            .gateway_listener
            .allowed_routes
            .as_ref()
            .and_then(|a| a.namespaces.as_ref());
        match namespaces.and_then(|n| n.from.as_deref()).unwrap_or("Same") {
            "All" => true,
            "Selector" => {
                let selector = namespaces.and_then(|n| n.selector.as_ref());
                selector
                    .map(|s| selector_matches(s, ctx.store.namespace_labels(route_namespace)))
                    .unwrap_or(false)
            }
            _ => route_namespace == ctx.name.namespace,
        }
    }

    fn refers_to_gateway(&self, ctx: &GatewayContext<'_>, parent: &ParentReference, route_namespace: &str) -> bool {
        parent.group.as_deref().unwrap_or(GATEWAY_GROUP) == GATEWAY_GROUP
            && parent.kind.as_deref().unwrap_or("Gateway") == "Gateway"
            && parent.namespace.as_deref().unwrap_or(route_namespace) == ctx.name.namespace
            && parent.name == ctx.name.name
    }

    fn process_httproute(
        &self,
        dag: &mut Dag,
        ctx: &GatewayContext<'_>,
        status: &mut StatusAccumulator,
        name: &NamespacedName,
        route: &HTTPRoute,
    ) {
        let key = ObjectKey::new(Kind::HTTPRoute, name.namespace.clone(), name.name.clone());
        let created = creation_time(&route.metadata);

        for parent in &route.spec.parent_refs {
            if !self.refers_to_gateway(ctx, parent, &name.namespace) {
                continue;
            }
            status.touch(&key);
            let scope = parent_scope(parent, &name.namespace);
            let listeners = match self.attach(ctx, parent, &name.namespace, HTTP_ROUTE) {
                Ok(listeners) => listeners,
                Err((reason, message)) => {
                    status.set_condition(&key, &scope, rejected(CONDITION_ACCEPTED, reason, message));
                    continue;
                }
            };
            let targets: Vec<(&ListenerInfo, String)> = listeners
                .into_iter()
                .flat_map(|l| {
                    route_hosts(&route.spec.hostnames, l.hostname()).into_iter().map(move |h| (l, h))
                })
                .collect();
            if targets.is_empty() {
                status.set_condition(
                    &key,
                    &scope,
                    rejected(CONDITION_ACCEPTED, "NoMatchingListenerHostname", "no hostnames match the parent listeners"),
                );
                continue;
            }

            let mut unresolved: Option<Problem> = None;
            let mut refused: Option<Problem> = None;
            for rule in &route.spec.rules {
                let routes = match self.rule_routes(ctx, &key, created, rule, &mut unresolved) {
                    Ok(routes) => routes,
                    Err(problem) => {
                        refused.get_or_insert(problem);
                        continue;
                    }
                };
                let conflict = targets.iter().find_map(|(listener, host)| {
                    let vhost = existing_vhost(dag, listener, host)?;
                    routes.iter().find_map(|r| vhost.conflicting_owner(r).cloned())
                });
                if let Some(owner) = conflict {
                    debug!(route = %key, owner = %owner, "HTTPRoute rule conflicts with an older route");
                    refused.get_or_insert((
                        REASON_ROUTE_CONFLICT,
                        format!("a rule conflicts with a route from {}", owner),
                    ));
                    continue;
                }
                for (listener, host) in &targets {
                    if let Some(vhost) = self.target_vhost(dag, listener, host) {
                        for r in &routes {
                            vhost.add_route_reporting(r.clone(), status);
                        }
                    }
                }
            }

            let accepted_condition = match refused {
                Some((reason, message)) => rejected(CONDITION_ACCEPTED, reason, message),
                None => accepted("Accepted", "Accepted HTTPRoute"),
            };
            status.set_condition(&key, &scope, accepted_condition);
            let resolved_condition = match unresolved {
                Some((reason, message)) => rejected(CONDITION_RESOLVED_REFS, reason, message),
                None => Condition::new(CONDITION_RESOLVED_REFS, ConditionStatus::True, "ResolvedRefs", "References resolved"),
            };
            status.set_condition(&key, &scope, resolved_condition);
        }
    }

    fn target_vhost<'d>(&self, dag: &'d mut Dag, listener: &ListenerInfo, host: &str) -> Option<&'d mut VirtualHost> {
        let envoy_name = &listener.planned.envoy_name;
        match listener.planned.protocol {
            ListenerProtocol::Http => dag.virtual_host(envoy_name, host),
            ListenerProtocol::Https => {
                let svhost = dag.secure_virtual_host(envoy_name, host)?;
                svhost.secret = listener.secret.clone();
                svhost.min_tls_version = svhost.min_tls_version.max(self.min_tls_version);
                Some(&mut svhost.virtual_host)
            }
            ListenerProtocol::Tcp => None,
        }
    }

    /// Routes for one HTTPRoute rule. Backend problems are recorded in
    /// `unresolved`; an `Err` means the rule cannot be accepted.
    fn rule_routes(
        &self,
        ctx: &GatewayContext<'_>,
        key: &ObjectKey,
        created: Option<chrono::DateTime<chrono::Utc>>,
        rule: &HTTPRouteRule,
        unresolved: &mut Option<Problem>,
    ) -> Result<Vec<Route>, Problem> {
        let default_match = [HTTPRouteMatch::default()];
        let matches = if rule.matches.is_empty() { &default_match[..] } else { &rule.matches[..] };
        let conditions = matches.iter().map(route_conditions).collect::<Result<Vec<_>, _>>()?;

        let mut request_headers = None;
        let mut response_headers = None;
        let mut redirect = None;
        let mut path_rewrite = None;
        let mut host_rewrite = None;
        let mut mirrors = Vec::new();
        for filter in &rule.filters {
            match filter.filter_type.as_str() {
                "RequestHeaderModifier" => {
                    request_headers = filter.request_header_modifier.as_ref().map(headers_policy);
                }
                "ResponseHeaderModifier" => {
                    response_headers = filter.response_header_modifier.as_ref().map(headers_policy);
                }
                "RequestRedirect" => {
                    let Some(r) = filter.request_redirect.as_ref() else { continue };
                    let mut out = Redirect {
                        scheme: r.scheme.clone(),
                        hostname: r.hostname.clone(),
                        port: r.port.and_then(|p| u32::try_from(p).ok()),
                        status_code: r.status_code.and_then(|c| u32::try_from(c).ok()).unwrap_or(302),
                        ..Default::default()
                    };
                    match r.path.as_ref().map(path_modifier).transpose()? {
                        Some(PathRewrite::FullPath(path)) => out.path = Some(path),
                        Some(PathRewrite::Prefix(prefix)) => out.prefix = Some(prefix),
                        None => {}
                    }
                    redirect = Some(out);
                }
                "URLRewrite" => {
                    let Some(r) = filter.url_rewrite.as_ref() else { continue };
                    host_rewrite = r.hostname.clone();
                    path_rewrite = r.path.as_ref().map(path_modifier).transpose()?;
                }
                "RequestMirror" => {
                    let Some(m) = filter.request_mirror.as_ref() else { continue };
                    match self.backend_cluster(ctx, &key.namespace, HTTP_ROUTE, &m.backend_ref) {
                        Ok(cluster) => mirrors.push(cluster),
                        Err(problem) => {
                            unresolved.get_or_insert(problem);
                        }
                    }
                }
                other => {
                    return Err(("UnsupportedValue", format!("filter type \"{}\" is not supported", other)));
                }
            }
        }

        let timeout_policy = match rule.timeouts.as_ref().and_then(|t| t.request.as_deref()) {
            Some(request) => TimeoutPolicy {
                response: Timeout::parse(request)
                    .map_err(|e| ("UnsupportedValue", format!("invalid request timeout: {}", e)))?,
                idle_stream: Timeout::Default,
            },
            None => TimeoutPolicy::default(),
        };

        let action = match redirect {
            Some(redirect) => RouteAction::Redirect(redirect),
            None => {
                let mut clusters = Vec::new();
                for backend in &rule.backend_refs {
                    match self.backend_cluster(ctx, &key.namespace, HTTP_ROUTE, backend) {
                        Ok(cluster) if cluster.weight > 0 => clusters.push(cluster),
                        Ok(_) => {}
                        Err(problem) => {
                            unresolved.get_or_insert(problem);
                        }
                    }
                }
                if clusters.is_empty() {
                    RouteAction::DirectResponse(DirectResponse { status_code: 500, body: None })
                } else {
                    RouteAction::Clusters(clusters)
                }
            }
        };

        Ok(conditions
            .into_iter()
            .map(|conditions| {
                let mut route = Route::new(conditions, action.clone(), key.clone(), created);
                route.request_headers = request_headers.clone();
                route.response_headers = response_headers.clone();
                route.path_rewrite = path_rewrite.clone();
                route.host_rewrite = host_rewrite.clone();
                route.mirrors = mirrors.clone();
                route.timeout_policy = timeout_policy;
                route
            })
            .collect())
    }

    fn backend_cluster(
        &self,
        ctx: &GatewayContext<'_>,
        route_namespace: &str,
        from_kind: &str,
        backend: &BackendRef,
    ) -> Result<Cluster, Problem> {
        let core_group = backend.group.as_deref().map(str::is_empty).unwrap_or(true);
        if !core_group || backend.kind.as_deref().unwrap_or("Service") != "Service" {
            return Err(("InvalidKind", format!("backend {} is not a Service", backend.name)));
        }
        let name = NamespacedName::new(
            backend.namespace.clone().unwrap_or_else(|| route_namespace.to_string()),
            backend.name.clone(),
        );
        if !ctx.store.reference_permitted(from_kind, route_namespace, "Service", &name) {
            return Err((
                "RefNotPermitted",
                format!("backend reference to Service {} is not permitted by any ReferenceGrant", name),
            ));
        }
        let port = backend
            .port
            .ok_or_else(|| ("UnsupportedValue", format!("backend {} must specify a port", name)))?;
        let mut cluster = service_cluster(ctx.store, &name, &PortRef::Number(port), &self.cluster_defaults)
            .map_err(|e| ("BackendNotFound", e.to_string()))?;
        cluster.weight = backend.weight.unwrap_or(1);
        self.apply_backend_tls_policy(ctx.store, &name, &mut cluster)?;
        if uses_tls(&cluster.protocol) {
            cluster.client_certificate = ctx.client_certificate.clone();
        }
        Ok(cluster)
    }

    /// Upstream TLS from a BackendTLSPolicy targeting the Service.
    fn apply_backend_tls_policy(
        &self,
        store: &ResourceStore,
        service: &NamespacedName,
        cluster: &mut Cluster,
    ) -> Result<(), Problem> {
        let policy = store
            .backend_tls_policies
            .iter()
            .filter(|(key, _)| key.namespace == service.namespace)
            .map(|(_, policy)| policy)
            .find(|policy| {
                policy.spec.target_refs.iter().any(|t| {
                    t.group.as_deref().map(str::is_empty).unwrap_or(true)
                        && t.kind == "Service"
                        && t.name == service.name
                        && t.section_name
                            .as_deref()
                            .map(|s| s == cluster.upstream.port_name)
                            .unwrap_or(true)
                })
            });
        let Some(policy) = policy else {
            return Ok(());
        };
        let validation = &policy.spec.validation;
        let reference = validation
            .ca_certificate_refs
            .first()
            .ok_or_else(|| ("InvalidCACertificateRef", "BackendTLSPolicy has no CA certificate reference".to_string()))?;
        let ca_name = NamespacedName::new(service.namespace.clone(), reference.name.clone());
        let ca = match reference.kind.as_str() {
            "ConfigMap" => lookup_ca_config_map(store, &ca_name),
            "Secret" => lookup_ca_secret(store, &ca_name, &service.namespace),
            other => {
                return Err(("InvalidCACertificateKind", format!("unsupported CA certificate kind \"{}\"", other)))
            }
        }
        .map_err(|e| ("InvalidCACertificateRef", e.to_string()))?;

        cluster.protocol = "tls".to_string();
        cluster.sni = validation.hostname.clone();
        cluster.upstream_validation = Some(PeerValidation { ca, subject_name: cluster.sni.clone() });
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn process_l4_route(
        &self,
        dag: &mut Dag,
        ctx: &GatewayContext<'_>,
        status: &mut StatusAccumulator,
        key: &ObjectKey,
        meta: &ObjectMeta,
        parents: &[ParentReference],
        hostnames: &[String],
        backends: &[&BackendRef],
        kind: &'static str,
    ) {
        debug!(route = %key, created = ?creation_time(meta), "Processing L4 route");
        for parent in parents {
            if !self.refers_to_gateway(ctx, parent, &key.namespace) {
                continue;
            }
            status.touch(key);
            let scope = parent_scope(parent, &key.namespace);
            let listeners = match self.attach(ctx, parent, &key.namespace, kind) {
                Ok(listeners) => listeners,
                Err((reason, message)) => {
                    status.set_condition(key, &scope, rejected(CONDITION_ACCEPTED, reason, message));
                    continue;
                }
            };

            let mut unresolved = None;
            let clusters: Vec<Cluster> = backends
                .iter()
                .filter_map(|b| match self.backend_cluster(ctx, &key.namespace, kind, b) {
                    Ok(cluster) => Some(cluster),
                    Err(problem) => {
                        unresolved.get_or_insert(problem);
                        None
                    }
                })
                .collect();

            let mut refused: Option<Problem> = None;
            if clusters.is_empty() {
                refused = Some(("BackendNotFound", "no valid backends".to_string()));
            } else {
                let proxy = TcpProxy { clusters, source: key.clone() };
                for listener in listeners {
                    if kind == TCP_ROUTE {
                        let Some(l) = dag.listener_mut(&listener.planned.envoy_name) else { continue };
                        match &l.tcp_proxy {
                            Some(existing) if existing.source != *key => {
                                refused.get_or_insert((REASON_ROUTE_CONFLICT, format!("listener already forwards to {}", existing.source)));
                            }
                            _ => l.tcp_proxy = Some(proxy.clone()),
                        }
                        continue;
                    }
                    let hosts = route_hosts(hostnames, listener.hostname());
                    if hosts.is_empty() || hosts.iter().any(|h| h == WILDCARD_HOST) {
                        refused.get_or_insert(("NoMatchingListenerHostname", "TLSRoute requires a hostname matching the listener".into()));
                        continue;
                    }
                    for host in hosts {
                        let Some(svhost) = dag.secure_virtual_host(&listener.planned.envoy_name, &host) else { continue };
                        match &svhost.tcp_proxy {
                            Some(existing) if existing.source != *key => {
                                refused.get_or_insert((REASON_ROUTE_CONFLICT, format!("hostname {} already forwards to {}", host, existing.source)));
                            }
                            _ => {
                                svhost.tcp_proxy = Some(proxy.clone());
                                svhost.secret = listener.secret.clone();
                                if svhost.secret.is_some() {
                                    svhost.min_tls_version = svhost.min_tls_version.max(self.min_tls_version);
                                }
                            }
                        }
                    }
                }
            }

            let accepted_condition = match refused {
                Some((reason, message)) => rejected(CONDITION_ACCEPTED, reason, message),
                None => accepted("Accepted", format!("Accepted {}", kind)),
            };
            status.set_condition(key, &scope, accepted_condition);
            let resolved_condition = match unresolved {
                Some((reason, message)) => rejected(CONDITION_RESOLVED_REFS, reason, message),
                None => Condition::new(CONDITION_RESOLVED_REFS, ConditionStatus::True, "ResolvedRefs", "References resolved"),
            };
            status.set_condition(key, &scope, resolved_condition);
        }
    }
}

fn existing_vhost<'d>(dag: &'d Dag, listener: &ListenerInfo, host: &str) -> Option<&'d VirtualHost> {
    let l = dag.listeners.get(&listener.planned.envoy_name)?;
    match listener.planned.protocol {
        ListenerProtocol::Https => l.secure_virtual_hosts.get(host).map(|s| &s.virtual_host),
        _ => l.virtual_hosts.get(host),
    }
}

/// Hostnames a route serves on a listener: the intersection of the
/// route's hostnames with the listener's hostname.
pub fn route_hosts(route_hostnames: &[String], listener_hostname: Option<&str>) -> Vec<String> {
    if route_hostnames.is_empty() {
        return vec![listener_hostname.unwrap_or(WILDCARD_HOST).to_string()];
    }
    let mut hosts: Vec<String> = route_hostnames
        .iter()
        .filter_map(|h| intersect_hostnames(h, listener_hostname))
        .collect();
    hosts.sort();
    hosts.dedup();
    hosts
}

fn intersect_hostnames(route: &str, listener: Option<&str>) -> Option<String> {
    let Some(listener) = listener else {
        return Some(route.to_string());
    };
    if route == listener {
        return Some(route.to_string());
    }
    let covers = |wildcard: &str, host: &str| {
        wildcard
            .strip_prefix('*')
            .map(|suffix| host.ends_with(suffix) && host.len() > suffix.len())
            .unwrap_or(false)
    };
    if covers(listener, route) {
        Some(route.to_string())
    } else if covers(route, listener) {
        Some(listener.to_string())
    } else {
        None
    }
}

fn route_conditions(m: &HTTPRouteMatch) -> Result<RouteConditions, Problem> {
    let path = match m.path.as_ref() {
        None => PathMatch::root(),
        Some(p) => {
            let value = p.value.clone().unwrap_or_else(|| "/".to_string());
            match p.match_type.as_deref().unwrap_or("PathPrefix") {
                "PathPrefix" if value == "/" => PathMatch::root(),
                "PathPrefix" => PathMatch::segment_prefix(value.trim_end_matches('/')),
                "Exact" => PathMatch::Exact(value),
                "RegularExpression" => {
                    regex::Regex::new(&value)
                        .map_err(|e| ("UnsupportedValue", format!("invalid path regex: {}", e)))?;
                    PathMatch::Regex(value)
                }
                other => return Err(("UnsupportedValue", format!("path match type \"{}\" is not supported", other))),
            }
        }
    };

    let mut headers = Vec::new();
    for h in &m.headers {
        let kind = match h.match_type.as_deref().unwrap_or("Exact") {
            "Exact" => HeaderMatchKind::Exact,
            "RegularExpression" => {
                regex::Regex::new(&h.value)
                    .map_err(|e| ("UnsupportedValue", format!("invalid header regex: {}", e)))?;
                HeaderMatchKind::Regex
            }
            other => return Err(("UnsupportedValue", format!("header match type \"{}\" is not supported", other))),
        };
        headers.push(HeaderMatch::new(&canonical_header_name(&h.name), kind, &h.value));
    }
    if let Some(method) = m.method.as_deref() {
        headers.push(HeaderMatch::new(":method", HeaderMatchKind::Exact, method));
    }

    let mut query_params = Vec::new();
    for q in &m.query_params {
        let kind = match q.match_type.as_deref().unwrap_or("Exact") {
            "Exact" => QueryMatchKind::Exact,
            "RegularExpression" => QueryMatchKind::Regex,
            other => return Err(("UnsupportedValue", format!("query match type \"{}\" is not supported", other))),
        };
        query_params.push(QueryParamMatch {
            name: q.name.clone(),
            kind,
            value: q.value.clone(),
            ignore_case: false,
        });
    }
    Ok(RouteConditions::new(path, headers, query_params))
}

fn headers_policy(filter: &HTTPHeaderFilter) -> HeadersPolicy {
    let collect = |headers: &[crate::k8s::gateway::HTTPHeader]| -> BTreeMap<String, String> {
        headers.iter().map(|h| (canonical_header_name(&h.name), h.value.clone())).collect()
    };
    HeadersPolicy {
        set: collect(&filter.set),
        add: collect(&filter.add),
        remove: filter.remove.iter().map(|n| canonical_header_name(n)).collect(),
    }
}

fn path_modifier(modifier: &HTTPPathModifier) -> Result<PathRewrite, Problem> {
    match modifier.modifier_type.as_str() {
        "ReplaceFullPath" => Ok(PathRewrite::FullPath(modifier.replace_full_path.clone().unwrap_or_default())),
        "ReplacePrefixMatch" => Ok(PathRewrite::Prefix(modifier.replace_prefix_match.clone().unwrap_or_default())),
        other => Err(("UnsupportedValue", format!("path modifier \"{}\" is not supported", other))),
    }
}

fn selector_matches(
    selector: &LabelSelector,
    labels: Option<&std::collections::BTreeMap<String, String>>,
) -> bool {
    let empty = BTreeMap::new();
    let labels = labels.unwrap_or(&empty);
    let labels_ok = selector
        .match_labels
        .iter()
        .flatten()
        .all(|(k, v)| labels.get(k) == Some(v));
    let expressions_ok = selector.match_expressions.iter().flatten().all(|e| {
        let values = e.values.as_deref().unwrap_or_default();
        match e.operator.as_str() {
            "In" => labels.get(&e.key).map(|v| values.contains(v)).unwrap_or(false),
            "NotIn" => labels.get(&e.key).map(|v| !values.contains(v)).unwrap_or(true),
            "Exists" => labels.contains_key(&e.key),
            "DoesNotExist" => !labels.contains_key(&e.key),
            _ => false,
        }
    });
    labels_ok && expressions_ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::backend::test_support::service;
    use crate::dag::listener::ListenerProcessor;
    use crate::dag::secret::test_support::tls_secret_object;
    use crate::dag::StatusUpdate;
    use crate::k8s::gateway::{
        AllowedRoutes, Gateway, GatewayClass, GatewayClassSpec, GatewaySpec, GatewayTLSConfig, HTTPPathMatch,
        HTTPRouteSpec, Listener, RouteNamespaces, SecretObjectReference, TCPRoute, TCPRouteSpec,
        L4RouteRule,
    };
    use crate::k8s::KubernetesObject;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn meta(ns: &str, name: &str, created: &str) -> ObjectMeta {
        ObjectMeta {
            namespace: Some(ns.into()),
            name: Some(name.into()),
            creation_timestamp: Some(serde_json::from_value::<Time>(serde_json::json!(created)).unwrap()),
            ..Default::default()
        }
    }

    fn gateway(listeners: Vec<Listener>) -> Vec<KubernetesObject> {
        vec![
            GatewayClass {
                metadata: ObjectMeta { name: Some("contour".into()), ..Default::default() },
                spec: GatewayClassSpec { controller_name: "projectcontour.io/gateway-controller".into() },
            }
            .into(),
            Gateway {
                metadata: meta("projectcontour", "contour", "2020-01-01T00:00:00Z"),
                spec: GatewaySpec { gateway_class_name: "contour".into(), listeners },
            }
            .into(),
        ]
    }

    fn http_listener() -> Listener {
        Listener {
            name: "http".into(),
            protocol: "HTTP".into(),
            port: 80,
            allowed_routes: Some(AllowedRoutes {
                namespaces: Some(RouteNamespaces { from: Some("All".into()), selector: None }),
                kinds: vec![],
            }),
            ..Default::default()
        }
    }

    fn parent() -> ParentReference {
        ParentReference {
            namespace: Some("projectcontour".into()),
            name: "contour".into(),
            ..Default::default()
        }
    }

    fn backend(name: &str, port: i32) -> BackendRef {
        BackendRef { name: name.into(), port: Some(port), ..Default::default() }
    }

    fn prefix_match(path: &str) -> HTTPRouteMatch {
        HTTPRouteMatch {
            path: Some(HTTPPathMatch { match_type: Some("PathPrefix".into()), value: Some(path.into()) }),
            ..Default::default()
        }
    }

    fn httproute(name: &str, created: &str, path: &str, backends: Vec<BackendRef>) -> HTTPRoute {
        HTTPRoute {
            metadata: meta("default", name, created),
            spec: HTTPRouteSpec {
                parent_refs: vec![parent()],
                hostnames: vec!["test.example.com".into()],
                rules: vec![HTTPRouteRule {
                    matches: vec![prefix_match(path)],
                    backend_refs: backends,
                    ..Default::default()
                }],
            },
        }
    }

    fn build(objects: Vec<KubernetesObject>) -> (Dag, Vec<StatusUpdate>) {
        let mut store = ResourceStore::new(crate::store::StoreSettings::from(&Config::default()));
        store.insert(service("default", "kuard", &[("http", 8080, 8080)]).into());
        for object in objects {
            store.insert(object);
        }
        let config = Config::default();
        let mut dag = Dag::default();
        let mut status = StatusAccumulator::new();
        ListenerProcessor::from_config(&config).run(&mut dag, &store, &mut status);
        GatewayApiProcessor::from_config(&config).run(&mut dag, &store, &mut status);
        dag.remove_empty_virtual_hosts();
        (dag, status.into_updates())
    }

    fn find<'a>(updates: &'a [StatusUpdate], kind: Kind, name: &str) -> &'a StatusUpdate {
        updates.iter().find(|u| u.key.kind == kind && u.key.name == name).unwrap()
    }

    #[test]
    fn hostname_intersection() {
        assert_eq!(route_hosts(&[], None), vec!["*"]);
        assert_eq!(route_hosts(&[], Some("a.com")), vec!["a.com"]);
        assert_eq!(route_hosts(&["x.a.com".into()], Some("*.a.com")), vec!["x.a.com"]);
        assert_eq!(route_hosts(&["*.a.com".into()], Some("x.a.com")), vec!["x.a.com"]);
        assert!(route_hosts(&["b.com".into()], Some("a.com")).is_empty());
        assert!(route_hosts(&["a.com".into()], Some("*.a.com")).is_empty());
    }

    #[test]
    fn httproute_attaches_to_http_listener() {
        let mut objects = gateway(vec![http_listener()]);
        objects.push(httproute("basic", "2021-01-01T00:00:00Z", "/blog", vec![backend("kuard", 8080)]).into());
        let (dag, updates) = build(objects);

        let vhost = &dag.listeners["http-80"].virtual_hosts["test.example.com"];
        let route = vhost.routes.values().next().unwrap();
        assert_eq!(route.conditions.path, PathMatch::segment_prefix("/blog"));
        assert_eq!(route.clusters()[0].weight, 1);

        let status = find(&updates, Kind::HTTPRoute, "basic");
        let scope = "projectcontour/contour";
        assert_eq!(status.condition(scope, CONDITION_ACCEPTED).unwrap().status, ConditionStatus::True);
        assert_eq!(status.condition(scope, CONDITION_RESOLVED_REFS).unwrap().status, ConditionStatus::True);
        let gw = find(&updates, Kind::Gateway, "contour");
        assert!(gw.is_valid());
        assert_eq!(
            gw.condition("listener/http", CONDITION_PROGRAMMED).unwrap().status,
            ConditionStatus::True
        );
    }

    #[test]
    fn missing_backends_answer_500() {
        let mut objects = gateway(vec![http_listener()]);
        objects.push(httproute("broken", "2021-01-01T00:00:00Z", "/", vec![backend("missing", 80)]).into());
        let (dag, updates) = build(objects);
        let route = dag.listeners["http-80"].virtual_hosts["test.example.com"].routes.values().next().unwrap();
        assert_eq!(route.action, RouteAction::DirectResponse(DirectResponse { status_code: 500, body: None }));
        let status = find(&updates, Kind::HTTPRoute, "broken");
        assert_eq!(
            status.condition("projectcontour/contour", CONDITION_RESOLVED_REFS).unwrap().reason,
            "BackendNotFound"
        );
    }

    #[test]
    fn newer_conflicting_rule_is_dropped() {
        let mut objects = gateway(vec![http_listener()]);
        objects.push(httproute("older", "2021-01-01T00:00:00Z", "/blog", vec![backend("kuard", 8080)]).into());
        objects.push(httproute("newer", "2022-01-01T00:00:00Z", "/blog", vec![backend("kuard", 8080)]).into());
        let (dag, updates) = build(objects);
        let vhost = &dag.listeners["http-80"].virtual_hosts["test.example.com"];
        assert_eq!(vhost.routes.len(), 1);
        assert_eq!(vhost.routes.values().next().unwrap().source.name, "older");

        let newer = find(&updates, Kind::HTTPRoute, "newer");
        let accepted = newer.condition("projectcontour/contour", CONDITION_ACCEPTED).unwrap();
        assert_eq!(accepted.status, ConditionStatus::False);
        assert_eq!(accepted.reason, REASON_ROUTE_CONFLICT);
        assert!(find(&updates, Kind::HTTPRoute, "older").is_valid());
    }

    #[test]
    fn same_namespace_is_the_default() {
        let mut listener = http_listener();
        listener.allowed_routes = None;
        let mut objects = gateway(vec![listener]);
        objects.push(httproute("other-ns", "2021-01-01T00:00:00Z", "/", vec![backend("kuard", 8080)]).into());
        let (_, updates) = build(objects);
        let status = find(&updates, Kind::HTTPRoute, "other-ns");
        assert_eq!(
            status.condition("projectcontour/contour", CONDITION_ACCEPTED).unwrap().reason,
            "NotAllowedByListeners"
        );
    }

    #[test]
    fn https_listener_needs_certificate() {
        let mut https = http_listener();
        https.name = "https".into();
        https.protocol = "HTTPS".into();
        https.port = 443;
        https.tls = Some(GatewayTLSConfig {
            mode: None,
            certificate_refs: vec![SecretObjectReference { name: "cert".into(), ..Default::default() }],
        });
        let mut objects = gateway(vec![https]);
        objects.push(httproute("secure", "2021-01-01T00:00:00Z", "/", vec![backend("kuard", 8080)]).into());

        let (_, updates) = build(objects.clone());
        let gw = find(&updates, Kind::Gateway, "contour");
        assert_eq!(
            gw.condition("listener/https", CONDITION_RESOLVED_REFS).unwrap().reason,
            "InvalidCertificateRef"
        );

        objects.push(tls_secret_object("projectcontour", "cert").into());
        let (dag, _) = build(objects);
        let svhost = &dag.listeners["https-443"].secure_virtual_hosts["test.example.com"];
        assert!(svhost.secret.is_some());
        assert_eq!(svhost.virtual_host.routes.len(), 1);
    }

    #[test]
    fn tcproute_forwards_listener() {
        let mut tcp = http_listener();
        tcp.name = "tcp".into();
        tcp.protocol = "TCP".into();
        tcp.port = 5432;
        let mut objects = gateway(vec![tcp]);
        objects.push(
            TCPRoute {
                metadata: meta("default", "db", "2021-01-01T00:00:00Z"),
                spec: TCPRouteSpec {
                    parent_refs: vec![parent()],
                    rules: vec![L4RouteRule { backend_refs: vec![backend("kuard", 8080)] }],
                },
            }
            .into(),
        );
        let (dag, updates) = build(objects);
        let listener = &dag.listeners["tcp-5432"];
        assert_eq!(listener.port, 5432);
        assert_eq!(listener.tcp_proxy.as_ref().unwrap().clusters.len(), 1);
        assert!(find(&updates, Kind::TCPRoute, "db").is_valid());
    }

    #[test]
    fn method_and_header_matches() {
        let m = HTTPRouteMatch {
            method: Some("GET".into()),
            headers: vec![crate::k8s::gateway::HTTPHeaderMatch {
                match_type: None,
                name: "x-version".into(),
                value: "2".into(),
            }],
            ..Default::default()
        };
        let conditions = route_conditions(&m).unwrap();
        assert_eq!(conditions.path, PathMatch::root());
        assert_eq!(
            conditions.headers,
            vec![
                HeaderMatch::new(":method", HeaderMatchKind::Exact, "GET"),
                HeaderMatch::new("X-Version", HeaderMatchKind::Exact, "2"),
            ]
        );
    }
}
