use envoy_types::pb::envoy::config::route::v3::{
    route, route_action::ClusterSpecifier, route_match::PathSpecifier,
};
use gangway::k8s::Kind;
use pretty_assertions::assert_eq;

use super::support::*;

fn backends() -> String {
    [service("default", "kuard", 80), service("teama", "app", 8080), service("default", "canary", 80)]
        .join("---\n")
}

#[test]
fn included_proxies_inherit_the_root_prefix() {
    let h = handler();
    apply(
        &h,
        &[
            backends(),
            r#"
apiVersion: projectcontour.io/v1
kind: HTTPProxy
metadata:
  name: root
  namespace: default
spec:
  virtualhost:
    fqdn: example.com
  includes:
  - name: app
    namespace: teama
    conditions:
    - prefix: /app
  routes:
  - services:
    - name: kuard
      port: 80
"#
            .to_string(),
            r#"
apiVersion: projectcontour.io/v1
kind: HTTPProxy
metadata:
  name: app
  namespace: teama
spec:
  routes:
  - services:
    - name: app
      port: 8080
"#
            .to_string(),
        ]
        .join("---\n"),
    );

    assert!(status(&h, Kind::HTTPProxy, "default", "root").is_valid());
    assert!(status(&h, Kind::HTTPProxy, "teama", "app").is_valid());

    let out = h.translation();
    let vhost = virtual_host(route_config(&out, "ingress_http"), "example.com");
    let routes: Vec<(PathSpecifier, &str)> = vhost
        .routes
        .iter()
        .map(|r| (r.r#match.as_ref().unwrap().path_specifier.clone().unwrap(), route_cluster(r)))
        .collect();
    assert_eq!(
        routes,
        vec![
            (PathSpecifier::Prefix("/app".into()), "teama/app/8080/da39a3ee5e"),
            (PathSpecifier::Prefix("/".into()), "default/kuard/80/da39a3ee5e"),
        ]
    );
}

#[test]
fn orphaned_children_are_reported() {
    let h = handler();
    apply(
        &h,
        &[
            backends(),
            r#"
apiVersion: projectcontour.io/v1
kind: HTTPProxy
metadata:
  name: app
  namespace: teama
spec:
  routes:
  - services:
    - name: app
      port: 8080
"#
            .to_string(),
        ]
        .join("---\n"),
    );
    let app = status(&h, Kind::HTTPProxy, "teama", "app");
    assert_eq!(app.state.to_string(), "orphaned");
    assert!(h.translation().clusters.is_empty());
}

#[test]
fn weighted_services_split_traffic() {
    let h = handler();
    apply(
        &h,
        &[
            backends(),
            r#"
apiVersion: projectcontour.io/v1
kind: HTTPProxy
metadata:
  name: split
  namespace: default
spec:
  virtualhost:
    fqdn: split.example.com
  routes:
  - conditions:
    - prefix: /
    services:
    - name: kuard
      port: 80
      weight: 90
    - name: canary
      port: 80
      weight: 10
"#
            .to_string(),
        ]
        .join("---\n"),
    );

    let out = h.translation();
    assert_eq!(
        cluster_names(&out),
        vec!["default/canary/80/da39a3ee5e", "default/kuard/80/da39a3ee5e"]
    );
    let vhost = virtual_host(route_config(&out, "ingress_http"), "split.example.com");
    let Some(route::Action::Route(action)) = &vhost.routes[0].action else {
        panic!("expected a forwarding route");
    };
    let Some(ClusterSpecifier::WeightedClusters(weighted)) = &action.cluster_specifier else {
        panic!("expected weighted clusters");
    };
    let weights: Vec<(&str, u32)> = weighted
        .clusters
        .iter()
        .map(|c| (c.name.as_str(), c.weight.as_ref().map(|w| w.value).unwrap_or_default()))
        .collect();
    assert_eq!(
        weights,
        vec![("default/canary/80/da39a3ee5e", 10), ("default/kuard/80/da39a3ee5e", 90)]
    );
}

#[test]
fn tls_root_with_delegated_secret() {
    let h = handler();
    apply(
        &h,
        &[
            backends(),
            tls_secret("certs", "wildcard", "secure.example.com"),
            r#"
apiVersion: projectcontour.io/v1
kind: TLSCertificateDelegation
metadata:
  name: delegation
  namespace: certs
spec:
  delegations:
  - secretName: wildcard
    targetNamespaces:
    - default
"#
            .to_string(),
            r#"
apiVersion: projectcontour.io/v1
kind: HTTPProxy
metadata:
  name: secure
  namespace: default
spec:
  virtualhost:
    fqdn: secure.example.com
    tls:
      secretName: certs/wildcard
  routes:
  - services:
    - name: kuard
      port: 80
"#
            .to_string(),
        ]
        .join("---\n"),
    );

    assert!(status(&h, Kind::HTTPProxy, "default", "secure").is_valid());
    let out = h.translation();
    let https = listener(&out, "ingress_https");
    assert_eq!(server_names(&https.filter_chains[0]), vec!["secure.example.com"]);
    let secure = virtual_host(route_config(&out, "https/secure.example.com"), "secure.example.com");
    assert_eq!(route_cluster(&secure.routes[0]), "default/kuard/80/da39a3ee5e");

    let insecure = virtual_host(route_config(&out, "ingress_http"), "secure.example.com");
    assert!(is_redirect(&insecure.routes[0]));
}

#[test]
fn undelegated_secret_invalidates_the_root() {
    let h = handler();
    apply(
        &h,
        &[
            backends(),
            tls_secret("certs", "wildcard", "secure.example.com"),
            r#"
apiVersion: projectcontour.io/v1
kind: HTTPProxy
metadata:
  name: secure
  namespace: default
spec:
  virtualhost:
    fqdn: secure.example.com
    tls:
      secretName: certs/wildcard
  routes:
  - services:
    - name: kuard
      port: 80
"#
            .to_string(),
        ]
        .join("---\n"),
    );

    let secure = status(&h, Kind::HTTPProxy, "default", "secure");
    assert!(secure.has_error("TLSError", "DelegationNotPermitted"));
    let out = h.translation();
    assert!(out.listeners.is_empty());
    assert!(out.secrets.is_empty());
}

#[test]
fn passthrough_forwards_tcp() {
    let h = handler();
    apply(
        &h,
        &[
            backends(),
            r#"
apiVersion: projectcontour.io/v1
kind: HTTPProxy
metadata:
  name: db
  namespace: default
spec:
  virtualhost:
    fqdn: db.example.com
    tls:
      passthrough: true
  tcpproxy:
    services:
    - name: kuard
      port: 80
"#
            .to_string(),
        ]
        .join("---\n"),
    );

    let out = h.translation();
    let https = listener(&out, "ingress_https");
    let chain = &https.filter_chains[0];
    assert_eq!(server_names(chain), vec!["db.example.com"]);
    assert!(chain.transport_socket.is_none());
    assert_eq!(chain.filters[0].name, gangway::xds::listener::TCP_PROXY);
    assert_eq!(cluster_names(&out), vec!["default/kuard/80/da39a3ee5e"]);
}
