use envoy_types::pb::envoy::config::core::v3::{address, socket_address::PortSpecifier};
use envoy_types::pb::envoy::config::route::v3::route_match::PathSpecifier;
use gangway::k8s::Kind;
use pretty_assertions::assert_eq;

use super::support::*;

const GATEWAY: &str = r#"
apiVersion: gateway.networking.k8s.io/v1
kind: GatewayClass
metadata:
  name: contour
spec:
  controllerName: projectcontour.io/gateway-controller
---
apiVersion: gateway.networking.k8s.io/v1
kind: Gateway
metadata:
  name: contour
  namespace: projectcontour
spec:
  gatewayClassName: contour
  listeners:
  - name: http
    protocol: HTTP
    port: 80
    allowedRoutes:
      namespaces:
        from: All
"#;

fn httproute(name: &str, namespace: &str, backend_namespace: Option<&str>) -> String {
    let backend_namespace =
        backend_namespace.map(|ns| format!("\n      namespace: {ns}")).unwrap_or_default();
    format!(
        r#"
apiVersion: gateway.networking.k8s.io/v1
kind: HTTPRoute
metadata:
  name: {name}
  namespace: {namespace}
spec:
  parentRefs:
  - name: contour
    namespace: projectcontour
  hostnames:
  - test.example.com
  rules:
  - matches:
    - path:
        type: PathPrefix
        value: /blog
    backendRefs:
    - name: kuard
      port: 80{backend_namespace}
"#
    )
}

fn port_of(l: &envoy_types::pb::envoy::config::listener::v3::Listener) -> u32 {
    match l.address.as_ref().and_then(|a| a.address.as_ref()) {
        Some(address::Address::SocketAddress(s)) => match s.port_specifier {
            Some(PortSpecifier::PortValue(port)) => port,
            _ => 0,
        },
        _ => 0,
    }
}

#[test]
fn httproute_programs_the_gateway_listener() {
    let h = handler();
    apply(
        &h,
        &[service("default", "kuard", 80), GATEWAY.to_string(), httproute("blog", "default", None)]
            .join("---\n"),
    );

    let route = status(&h, Kind::HTTPRoute, "default", "blog");
    let accepted = route.condition("projectcontour/contour", "Accepted").unwrap();
    assert_eq!(accepted.status.to_string(), "True");
    assert!(status(&h, Kind::Gateway, "projectcontour", "contour").is_valid());

    let out = h.translation();
    let l = listener(&out, "http-80");
    assert_eq!(port_of(l), 10080);
    let vhost = virtual_host(route_config(&out, "http-80"), "test.example.com");
    let path = vhost.routes[0].r#match.as_ref().unwrap().path_specifier.clone();
    assert_eq!(path, Some(PathSpecifier::PathSeparatedPrefix("/blog".into())));
    assert_eq!(route_cluster(&vhost.routes[0]), "default/kuard/80/da39a3ee5e");
    assert!(out.route_configs.iter().all(|r| r.name != "ingress_http"));
}

#[test]
fn cross_namespace_backends_need_a_reference_grant() {
    let h = handler();
    apply(
        &h,
        &[
            service("backends", "kuard", 80),
            GATEWAY.to_string(),
            httproute("blog", "default", Some("backends")),
        ]
        .join("---\n"),
    );
    let route = status(&h, Kind::HTTPRoute, "default", "blog");
    let resolved = route.condition("projectcontour/contour", "ResolvedRefs").unwrap();
    assert_eq!(resolved.reason, "RefNotPermitted");
    assert!(h.translation().clusters.is_empty());

    apply(
        &h,
        r#"
apiVersion: gateway.networking.k8s.io/v1beta1
kind: ReferenceGrant
metadata:
  name: allow-default
  namespace: backends
spec:
  from:
  - group: gateway.networking.k8s.io
    kind: HTTPRoute
    namespace: default
  to:
  - group: ""
    kind: Service
"#,
    );
    let route = status(&h, Kind::HTTPRoute, "default", "blog");
    let resolved = route.condition("projectcontour/contour", "ResolvedRefs").unwrap();
    assert_eq!(resolved.status.to_string(), "True");
    assert_eq!(cluster_names(&h.translation()), vec!["backends/kuard/80/da39a3ee5e"]);
}

#[test]
fn routes_for_unknown_gateways_are_ignored() {
    let h = handler();
    apply(&h, &[service("default", "kuard", 80), httproute("blog", "default", None)].join("---\n"));
    let out = h.translation();
    assert!(out.clusters.is_empty());
    assert!(route_config(&out, "ingress_http").virtual_hosts.is_empty());
}

#[test]
fn listeners_sharing_an_offset_port_are_both_rejected() {
    let h = handler();
    apply(
        &h,
        r#"
apiVersion: gateway.networking.k8s.io/v1
kind: GatewayClass
metadata:
  name: contour
spec:
  controllerName: projectcontour.io/gateway-controller
---
apiVersion: gateway.networking.k8s.io/v1
kind: Gateway
metadata:
  name: contour
  namespace: projectcontour
spec:
  gatewayClassName: contour
  listeners:
  - name: http
    protocol: HTTP
    port: 80
    hostname: a.example.com
  - name: alt
    protocol: HTTP
    port: 10080
    hostname: b.example.com
"#,
    );
    let gateway = status(&h, Kind::Gateway, "projectcontour", "contour");
    for listener in ["listener/http", "listener/alt"] {
        let accepted = gateway.condition(listener, "Accepted").unwrap();
        assert_eq!(accepted.status.to_string(), "False");
        assert_eq!(accepted.reason, "PortUnavailable");
    }
    assert!(h.translation().listeners.is_empty());
}
