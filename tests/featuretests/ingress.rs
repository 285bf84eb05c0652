use envoy_types::pb::envoy::config::route::v3::route_match::PathSpecifier;
use gangway::k8s::Kind;
use gangway::xds::ResourceType;
use pretty_assertions::assert_eq;

use super::support::*;

const KUARD_CLUSTER: &str = "default/kuard/80/da39a3ee5e";

#[test]
fn default_backend_routes_every_host() {
    let h = handler();
    apply(
        &h,
        &[
            service("default", "kuard", 80),
            r#"
apiVersion: networking.k8s.io/v1
kind: Ingress
metadata:
  name: kuard
  namespace: default
spec:
  defaultBackend:
    service:
      name: kuard
      port:
        number: 80
"#
            .to_string(),
        ]
        .join("---\n"),
    );

    assert!(status(&h, Kind::Ingress, "default", "kuard").is_valid());
    let out = h.translation();
    assert_eq!(cluster_names(&out), vec![KUARD_CLUSTER]);

    let vhost = virtual_host(route_config(&out, "ingress_http"), "*");
    assert_eq!(vhost.domains, vec!["*"]);
    assert_eq!(vhost.routes.len(), 1);
    let path = vhost.routes[0].r#match.as_ref().unwrap().path_specifier.clone();
    assert_eq!(path, Some(PathSpecifier::Prefix("/".into())));
    assert_eq!(route_cluster(&vhost.routes[0]), KUARD_CLUSTER);

    let eds = &out.clusters[0];
    assert_eq!(eds.alt_stat_name, "default_kuard_80");
    assert_eq!(listener(&out, "ingress_http").name, "ingress_http");
    assert_eq!(h.cache().resource_names(ResourceType::Listener), vec!["ingress_http"]);
}

#[test]
fn older_ingress_keeps_a_conflicting_path() {
    let h = handler();
    let ingress = |name: &str, created: &str, svc: &str| {
        format!(
            r#"
apiVersion: networking.k8s.io/v1
kind: Ingress
metadata:
  name: {name}
  namespace: default
  creationTimestamp: "{created}"
spec:
  rules:
  - host: example.com
    http:
      paths:
      - path: /blog
        pathType: Prefix
        backend:
          service:
            name: {svc}
            port:
              number: 80
"#
        )
    };
    apply(
        &h,
        &[
            service("default", "kuard", 80),
            service("default", "blog", 80),
            ingress("newer", "2021-06-01T00:00:00Z", "blog"),
            ingress("older", "2020-06-01T00:00:00Z", "kuard"),
        ]
        .join("---\n"),
    );

    let out = h.translation();
    let vhost = virtual_host(route_config(&out, "ingress_http"), "example.com");
    assert_eq!(vhost.domains, vec!["example.com", "example.com:*"]);
    assert_eq!(vhost.routes.len(), 1);
    let path = vhost.routes[0].r#match.as_ref().unwrap().path_specifier.clone();
    assert_eq!(path, Some(PathSpecifier::PathSeparatedPrefix("/blog".into())));
    assert_eq!(route_cluster(&vhost.routes[0]), KUARD_CLUSTER);

    let newer = status(&h, Kind::Ingress, "default", "newer");
    assert!(!newer.is_valid());
    assert!(newer.has_error("RouteError", "RouteConflict"));
    assert!(status(&h, Kind::Ingress, "default", "older").is_valid());
}

#[test]
fn tls_ingress_gets_a_filter_chain_and_redirects_plain_http() {
    let h = handler();
    apply(
        &h,
        &[
            service("default", "kuard", 80),
            tls_secret("default", "kuard-tls", "example.com"),
            r#"
apiVersion: networking.k8s.io/v1
kind: Ingress
metadata:
  name: kuard
  namespace: default
  annotations:
    ingress.kubernetes.io/force-ssl-redirect: "true"
spec:
  tls:
  - hosts:
    - example.com
    secretName: kuard-tls
  rules:
  - host: example.com
    http:
      paths:
      - path: /
        pathType: Prefix
        backend:
          service:
            name: kuard
            port:
              number: 80
"#
            .to_string(),
        ]
        .join("---\n"),
    );

    let out = h.translation();
    let insecure = virtual_host(route_config(&out, "ingress_http"), "example.com");
    assert!(is_redirect(&insecure.routes[0]));

    let secure = virtual_host(route_config(&out, "https/example.com"), "example.com");
    assert_eq!(route_cluster(&secure.routes[0]), KUARD_CLUSTER);

    let https = listener(&out, "ingress_https");
    assert_eq!(https.filter_chains.len(), 1);
    assert_eq!(server_names(&https.filter_chains[0]), vec!["example.com"]);
    assert_eq!(https.listener_filters.len(), 1);

    assert_eq!(out.secrets.len(), 1);
    assert!(out.secrets[0].name.starts_with("default/kuard-tls/"));
}

#[test]
fn deleting_the_ingress_empties_the_route_configuration() {
    let h = handler();
    let manifest = [
        service("default", "kuard", 80),
        r#"
apiVersion: networking.k8s.io/v1
kind: Ingress
metadata:
  name: kuard
spec:
  defaultBackend:
    service:
      name: kuard
      port:
        number: 80
"#
        .to_string(),
    ]
    .join("---\n");
    apply(&h, &manifest);
    assert_eq!(h.cache().resource_names(ResourceType::Cluster), vec![KUARD_CLUSTER]);

    let ingress = gangway::k8s::manifest::parse_manifest(&manifest).unwrap().pop().unwrap();
    assert!(h.on_delete(&ingress));

    let out = h.translation();
    assert!(out.clusters.is_empty());
    assert!(route_config(&out, "ingress_http").virtual_hosts.is_empty());
    assert!(h.cache().resource_names(ResourceType::Cluster).is_empty());
    assert!(h.status(&ingress.key()).is_none());
}
