//! Ingress processor.

use tracing::debug;

use super::backend::{service_cluster, uses_tls, BackendError, ClusterDefaults, PortRef};
use super::builder::Processor;
use super::policy::{RetryPolicy, Timeout, TimeoutPolicy};
use super::secret::{lookup_tls_secret, tls_secret};
use super::status::StatusAccumulator;
use super::{
    Cluster, Dag, PathMatch, Route, RouteAction, RouteConditions, TlsSecret, TlsVersion,
    WILDCARD_HOST,
};
use crate::config::Config;
use crate::k8s::{
    annotation, age_order, creation_time, Ingress, Kind, NamespacedName, ObjectKey,
};
use crate::store::ResourceStore;

pub const TLS_ERROR: &str = "TLSError";
pub const SERVICE_ERROR: &str = "ServiceError";
pub const PATH_ERROR: &str = "PathError";

/// Characters that make an ImplementationSpecific path a regex.
const REGEX_META: &[char] = &['^', '+', '*', '[', ']', '%'];

/// Translates Ingress objects into virtual hosts and routes.
#[derive(Debug, Clone)]
pub struct IngressProcessor {
    min_tls_version: TlsVersion,
    cluster_defaults: ClusterDefaults,
    client_certificate: Option<NamespacedName>,
}

impl IngressProcessor {
    pub fn from_config(config: &Config) -> Self {
        Self {
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

/// Path match for an Ingress path and its `pathType`.
pub fn path_match(path: Option<&str>, path_type: &str) -> Result<PathMatch, String> {
    let path = path.filter(|p| !p.is_empty()).unwrap_or("/");
    match path_type {
        "Exact" => Ok(PathMatch::Exact(path.to_string())),
        "Prefix" => Ok(PathMatch::segment_prefix(path)),
        _ if path.contains(REGEX_META) => match regex::Regex::new(path) {
            Ok(_) => Ok(PathMatch::Regex(path.to_string())),
            Err(e) => Err(format!("path \"{}\" is not a valid regular expression: {}", path, e)),
        },
        _ => Ok(PathMatch::string_prefix(path)),
    }
}

struct IngressContext<'a> {
    ingress: &'a Ingress,
    key: ObjectKey,
    namespace: String,
    client_certificate: Option<TlsSecret>,
}

impl Processor for IngressProcessor {
    fn name(&self) -> &'static str {
        "ingress"
    }

    fn run(&self, dag: &mut Dag, store: &ResourceStore, status: &mut StatusAccumulator) {
        let Some(http) = dag.http_listener_name() else {
            return;
        };
        let https = dag.https_listener_name();
        let client_certificate =
            self.client_certificate.as_ref().and_then(|name| tls_secret(store, name).ok());

        let mut ingresses: Vec<(ObjectKey, &Ingress)> = store
            .ingresses
            .values()
            .map(|i| (ObjectKey::from_meta(Kind::Ingress, &i.metadata), i))
            .collect();
        ingresses.sort_by(|(a_key, a), (b_key, b)| {
            age_order(creation_time(&a.metadata), a_key, creation_time(&b.metadata), b_key)
        });

        for (key, ingress) in ingresses {
            status.touch(&key);
            let ctx = IngressContext {
                ingress,
                namespace: key.namespace.clone(),
                key,
                client_certificate: client_certificate.clone(),
            };
            self.process(dag, store, status, &ctx, &http, https.as_deref());
        }
    }
}

impl IngressProcessor {
    fn process(
        &self,
        dag: &mut Dag,
        store: &ResourceStore,
        status: &mut StatusAccumulator,
        ctx: &IngressContext<'_>,
        http: &str,
        https: Option<&str>,
    ) {
        let Some(spec) = ctx.ingress.spec.as_ref() else {
            return;
        };
        let meta = &ctx.ingress.metadata;
        let secure_hosts = match https {
            Some(https) => self.secure_hosts(dag, store, status, ctx, https),
            None => Vec::new(),
        };

        if let Some(service) = spec.default_backend.as_ref().and_then(|b| b.service.as_ref()) {
            if let Some(route) =
                self.route(store, status, ctx, PathMatch::root(), &service.name, service.port.as_ref())
            {
                let outcome = dag
                    .virtual_host(http, WILDCARD_HOST)
                    .map(|vhost| vhost.add_route_reporting(route, status));
                debug!(ingress = %ctx.key, added = ?outcome, "Added default backend route");
            }
        }

        let allow_http = annotation::http_allowed(meta);
        let force_ssl = annotation::force_ssl_redirect(meta);
        for rule in spec.rules.iter().flatten() {
            let host = rule.host.as_deref().filter(|h| !h.is_empty()).unwrap_or(WILDCARD_HOST);
            let Some(rule_http) = rule.http.as_ref() else {
                continue;
            };
            for path in &rule_http.paths {
                let path_match = match path_match(path.path.as_deref(), &path.path_type) {
                    Ok(m) => m,
                    Err(message) => {
                        status.add_error(&ctx.key, PATH_ERROR, "InvalidPath", message);
                        continue;
                    }
                };
                let Some(service) = path.backend.service.as_ref() else {
                    continue;
                };
                let Some(mut route) =
                    self.route(store, status, ctx, path_match, &service.name, service.port.as_ref())
                else {
                    continue;
                };
                let raw_path = path.path.as_deref().unwrap_or("/");
                route.websocket = annotation::websocket_routes(meta).iter().any(|p| p == raw_path);

                if allow_http {
                    let insecure = if force_ssl { route.https_upgrade() } else { route.clone() };
                    if let Some(vhost) = dag.virtual_host(http, host) {
                        vhost.add_route_reporting(insecure, status);
                    }
                }
                if let Some(https) = https.filter(|_| secure_hosts.iter().any(|h| h == host)) {
                    if let Some(svhost) = dag.secure_virtual_host(https, host) {
                        svhost.virtual_host.add_route_reporting(route, status);
                    }
                }
            }
        }
    }

    /// Attach the Ingress TLS certificates to secure virtual hosts and
    /// return the hosts that have one.
    fn secure_hosts(
        &self,
        dag: &mut Dag,
        store: &ResourceStore,
        status: &mut StatusAccumulator,
        ctx: &IngressContext<'_>,
        https: &str,
    ) -> Vec<String> {
        let meta = &ctx.ingress.metadata;
        let min_version = annotation::tls_minimum_version(meta)
            .and_then(TlsVersion::parse)
            .unwrap_or(self.min_tls_version);
        let mut hosts = Vec::new();
        let tls_entries = ctx.ingress.spec.as_ref().and_then(|s| s.tls.as_ref());
        for tls in tls_entries.into_iter().flatten() {
            let Some(secret_name) = tls.secret_name.as_deref() else {
                continue;
            };
            let Some(name) = NamespacedName::from_reference(secret_name, &ctx.namespace) else {
                continue;
            };
            let secret = match lookup_tls_secret(store, &name, &ctx.namespace) {
                Ok(secret) => secret,
                Err(e) => {
                    status.add_error(&ctx.key, TLS_ERROR, e.reason(), e.to_string());
                    continue;
                }
            };
            for host in tls.hosts.iter().flatten().filter(|h| h.as_str() != WILDCARD_HOST) {
                if let Some(svhost) = dag.secure_virtual_host(https, host) {
                    svhost.secret = Some(secret.clone());
                    svhost.min_tls_version = svhost.min_tls_version.max(min_version);
                    hosts.push(host.clone());
                }
            }
        }
        hosts
    }

    fn route(
        &self,
        store: &ResourceStore,
        status: &mut StatusAccumulator,
        ctx: &IngressContext<'_>,
        path: PathMatch,
        service_name: &str,
        port: Option<&k8s_openapi::api::networking::v1::ServiceBackendPort>,
    ) -> Option<Route> {
        let port = match port {
            Some(p) if p.number.is_some() => PortRef::Number(p.number.unwrap_or_default()),
            Some(p) => PortRef::Name(p.name.clone().unwrap_or_default()),
            None => PortRef::Number(0),
        };
        let name = NamespacedName::new(ctx.namespace.clone(), service_name);
        let cluster = match service_cluster(store, &name, &port, &self.cluster_defaults) {
            Ok(cluster) => self.with_client_certificate(cluster, ctx),
            Err(e) => {
                let reason = match e {
                    BackendError::ServiceNotFound(_) => "ServiceUnresolvedReference",
                    BackendError::PortNotFound { .. } => "ServicePortUnresolved",
                };
                status.add_error(&ctx.key, SERVICE_ERROR, reason, e.to_string());
                return None;
            }
        };

        let meta = &ctx.ingress.metadata;
        let mut route = Route::new(
            RouteConditions::path(path),
            RouteAction::Clusters(vec![cluster]),
            ctx.key.clone(),
            creation_time(meta),
        );
        route.timeout_policy = TimeoutPolicy {
            response: Timeout::parse_or_default(annotation::response_timeout(meta)),
            idle_stream: Timeout::Default,
        };
        if let Some(retry_on) = annotation::retry_on(meta) {
            route.retry_policy = Some(RetryPolicy {
                retry_on: retry_on.to_string(),
                num_retries: annotation::num_retries(meta).unwrap_or(1),
                per_try_timeout: Timeout::parse_or_default(annotation::per_try_timeout(meta)),
                retriable_status_codes: Vec::new(),
            });
        }
        Some(route)
    }

    fn with_client_certificate(&self, mut cluster: Cluster, ctx: &IngressContext<'_>) -> Cluster {
        if uses_tls(&cluster.protocol) {
            cluster.client_certificate = ctx.client_certificate.clone();
        }
        cluster
    }
}
