use gangway::k8s::manifest::parse_manifest;
use gangway::k8s::{Kind, KubernetesObject};
use gangway::xds::ResourceType;
use gangway::EventHandler;
use pretty_assertions::assert_eq;

use super::support::*;

fn object(manifest: &str) -> KubernetesObject {
    parse_manifest(manifest).unwrap().remove(0)
}

fn two_port_service(ports: &[(&str, i32)]) -> String {
    let ports: String = ports
        .iter()
        .map(|(name, port)| format!("  - name: {name}\n    port: {port}\n    targetPort: 8080\n"))
        .collect();
    format!(
        "apiVersion: v1\nkind: Service\nmetadata:\n  name: kuard\n  namespace: default\nspec:\n  ports:\n{ports}"
    )
}

fn ingress_to_port(name: &str, host: &str, port: i32, created: &str) -> String {
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
  - host: {host}
    http:
      paths:
      - path: /blog
        pathType: Prefix
        backend:
          service:
            name: kuard
            port:
              number: {port}
"#
    )
}

fn eds_service_name(h: &EventHandler) -> String {
    h.translation().clusters[0].eds_cluster_config.as_ref().unwrap().service_name.clone()
}

#[test]
fn naming_a_port_changes_only_the_eds_service_name() {
    let h = handler();
    let unnamed = object(&service("default", "kuard", 80));
    h.on_add(unnamed.clone());
    apply(
        &h,
        r#"
apiVersion: networking.k8s.io/v1
kind: Ingress
metadata:
  name: i1
  namespace: default
spec:
  defaultBackend:
    service:
      name: kuard
      port:
        number: 80
"#,
    );
    assert_eq!(cluster_names(&h.translation()), vec!["default/kuard/80/da39a3ee5e"]);
    assert_eq!(eds_service_name(&h), "default/kuard");

    assert!(h.on_update(unnamed, object(&two_port_service(&[("http", 80)]))));
    assert_eq!(cluster_names(&h.translation()), vec!["default/kuard/80/da39a3ee5e"]);
    assert_eq!(eds_service_name(&h), "default/kuard/http");
}

#[test]
fn port_cycles_leave_no_stale_clusters() {
    let h = handler();
    let both = object(&two_port_service(&[("http", 80), ("admin", 9000)]));
    h.on_add(both.clone());
    apply(&h, &ingress_to_port("web", "web.example.com", 80, "2020-01-01T00:00:00Z"));
    apply(&h, &ingress_to_port("admin", "admin.example.com", 9000, "2020-01-01T00:00:00Z"));
    assert_eq!(
        cluster_names(&h.translation()),
        vec!["default/kuard/80/da39a3ee5e", "default/kuard/9000/da39a3ee5e"]
    );

    let web_only = object(&two_port_service(&[("http", 80)]));
    assert!(h.on_update(both, web_only.clone()));
    assert_eq!(cluster_names(&h.translation()), vec!["default/kuard/80/da39a3ee5e"]);
    assert!(!status(&h, Kind::Ingress, "default", "admin").is_valid());

    assert!(h.on_delete(&web_only));
    assert!(h.translation().clusters.is_empty());
    assert!(h.cache().resource_names(ResourceType::Cluster).is_empty());
}

#[test]
fn deleting_the_winner_promotes_the_loser_for_good() {
    let h = handler();
    apply(&h, &[service("default", "kuard", 80), service("default", "blog", 80)].join("---\n"));
    let route = |name: &str, svc: &str, created: &str| {
        ingress_to_port(name, "example.com", 80, created).replace("name: kuard\n", &format!("name: {svc}\n"))
    };
    let older = object(&route("older", "kuard", "2020-01-01T00:00:00Z"));
    h.on_add(older.clone());
    h.on_add(object(&route("newer", "blog", "2021-01-01T00:00:00Z")));

    let winner = |h: &EventHandler| {
        let out = h.translation();
        let vhost = virtual_host(route_config(&out, "ingress_http"), "example.com");
        assert_eq!(vhost.routes.len(), 1);
        route_cluster(&vhost.routes[0]).to_string()
    };
    assert_eq!(winner(&h), "default/kuard/80/da39a3ee5e");

    assert!(h.on_delete(&older));
    assert_eq!(winner(&h), "default/blog/80/da39a3ee5e");
    assert!(status(&h, Kind::Ingress, "default", "newer").is_valid());

    h.on_add(object(&route("older", "kuard", "2022-01-01T00:00:00Z")));
    assert_eq!(winner(&h), "default/blog/80/da39a3ee5e");
    let readded = status(&h, Kind::Ingress, "default", "older");
    assert!(readded.has_error("RouteError", "RouteConflict"));
}

#[test]
fn deleting_unreferenced_objects_keeps_versions() {
    let h = handler();
    apply(&h, &ingress_to_port("web", "web.example.com", 80, "2020-01-01T00:00:00Z"));
    apply(&h, &service("default", "kuard", 80));
    let cache = h.cache();
    let before: Vec<String> = ResourceType::ALL.iter().map(|t| cache.version(*t)).collect();

    let unrelated = object(&service("other", "unused", 80));
    h.on_add(unrelated.clone());
    assert!(!h.on_delete(&unrelated));
    let after: Vec<String> = ResourceType::ALL.iter().map(|t| cache.version(*t)).collect();
    assert_eq!(after, before);
}
