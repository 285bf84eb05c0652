use envoy_types::pb::envoy::config::listener::v3::{FilterChain, Listener};
use envoy_types::pb::envoy::config::route::v3::{
    route, route_action::ClusterSpecifier, Route, RouteConfiguration, VirtualHost,
};
use gangway::dag::StatusUpdate;
use gangway::k8s::manifest::parse_manifest;
use gangway::k8s::{Kind, ObjectKey};
use gangway::xds::Translation;
use gangway::{Config, EventHandler};

pub fn handler() -> EventHandler {
    EventHandler::new(&Config::default())
}

/// Add every object of a YAML manifest, in order.
pub fn apply(handler: &EventHandler, manifest: &str) {
    for object in parse_manifest(manifest).expect("valid manifest") {
        handler.on_add(object);
    }
}

pub fn status(handler: &EventHandler, kind: Kind, namespace: &str, name: &str) -> StatusUpdate {
    let key = ObjectKey::new(kind, namespace, name);
    handler.status(&key).unwrap_or_else(|| panic!("no status for {key}"))
}

pub fn route_config<'a>(translation: &'a Translation, name: &str) -> &'a RouteConfiguration {
    translation
        .route_configs
        .iter()
        .find(|r| r.name == name)
        .unwrap_or_else(|| panic!("no RouteConfiguration {name}"))
}

pub fn virtual_host<'a>(config: &'a RouteConfiguration, name: &str) -> &'a VirtualHost {
    config
        .virtual_hosts
        .iter()
        .find(|v| v.name == name)
        .unwrap_or_else(|| panic!("no virtual host {name} in {}", config.name))
}

pub fn listener<'a>(translation: &'a Translation, name: &str) -> &'a Listener {
    translation
        .listeners
        .iter()
        .find(|l| l.name == name)
        .unwrap_or_else(|| panic!("no Listener {name}"))
}

pub fn server_names(chain: &FilterChain) -> Vec<String> {
    chain.filter_chain_match.as_ref().map(|m| m.server_names.clone()).unwrap_or_default()
}

pub fn cluster_names(translation: &Translation) -> Vec<&str> {
    translation.clusters.iter().map(|c| c.name.as_str()).collect()
}

/// The single upstream cluster a route forwards to.
pub fn route_cluster(route: &Route) -> &str {
    match &route.action {
        Some(route::Action::Route(action)) => match &action.cluster_specifier {
            Some(ClusterSpecifier::Cluster(name)) => name,
            other => panic!("route does not target a single cluster: {other:?}"),
        },
        other => panic!("route does not forward: {other:?}"),
    }
}

pub fn is_redirect(route: &Route) -> bool {
    matches!(route.action, Some(route::Action::Redirect(_)))
}

/// A `kubernetes.io/tls` Secret holding a fresh self-signed certificate.
pub fn tls_secret(namespace: &str, name: &str, host: &str) -> String {
    let certified = rcgen::generate_simple_self_signed(vec![host.to_string()]).unwrap();
    format!(
        "apiVersion: v1\nkind: Secret\nmetadata:\n  name: {name}\n  namespace: {namespace}\n\
         type: kubernetes.io/tls\nstringData:\n  tls.crt: |\n{}\n  tls.key: |\n{}\n",
        indent(&certified.cert.pem(), 4),
        indent(&certified.key_pair.serialize_pem(), 4),
    )
}

pub fn service(namespace: &str, name: &str, port: i32) -> String {
    format!(
        "apiVersion: v1\nkind: Service\nmetadata:\n  name: {name}\n  namespace: {namespace}\n\
         spec:\n  ports:\n  - port: {port}\n    targetPort: 8080\n"
    )
}

fn indent(text: &str, width: usize) -> String {
    let pad = " ".repeat(width);
    text.lines().map(|line| format!("{pad}{line}")).collect::<Vec<_>>().join("\n")
}
