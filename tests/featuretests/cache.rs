use std::time::Duration;

use envoy_types::pb::envoy::config::route::v3::RouteConfiguration;
use gangway::k8s::manifest::parse_manifest;
use gangway::xds::{ResourceType, SnapshotUpdate};
use pretty_assertions::assert_eq;
use prost::Message;

use super::support::*;

const INGRESS: &str = r#"
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
"#;

#[test]
fn irrelevant_objects_do_not_bump_versions() {
    let h = handler();
    apply(&h, &[service("default", "kuard", 80), INGRESS.to_string()].join("---\n"));
    let cache = h.cache();
    let versions: Vec<String> = ResourceType::ALL.iter().map(|t| cache.version(*t)).collect();

    // Not referenced by anything: no rebuild.
    let unrelated = parse_manifest(&service("default", "other", 80)).unwrap().remove(0);
    assert!(!h.on_add(unrelated));

    // Referenced, but the translated output does not change.
    let kuard = parse_manifest(&service("default", "kuard", 80)).unwrap().remove(0);
    let mut relabelled = kuard.clone();
    if let gangway::k8s::KubernetesObject::Service(s) = &mut relabelled {
        s.metadata.labels = Some([("app".to_string(), "kuard".to_string())].into());
    }
    assert!(h.on_update(kuard, relabelled));

    let after: Vec<String> = ResourceType::ALL.iter().map(|t| cache.version(*t)).collect();
    assert_eq!(after, versions);
}

#[test]
fn versions_come_from_one_counter_and_double_as_nonces() {
    let h = handler();
    apply(&h, &[service("default", "kuard", 80), INGRESS.to_string()].join("---\n"));
    let cache = h.cache();

    let mut versions: Vec<u64> = [ResourceType::Cluster, ResourceType::Route, ResourceType::Listener]
        .iter()
        .map(|t| cache.version(*t).parse().unwrap())
        .collect();
    versions.sort_unstable();
    versions.dedup();
    assert_eq!(versions.len(), 3);
    assert_eq!(cache.version(ResourceType::Secret), "0");

    let response = cache.query(ResourceType::Route, &[]);
    assert_eq!(response.nonce, response.version_info);
    assert_eq!(response.resources.len(), 1);
    assert_eq!(response.type_url, ResourceType::Route.type_url());

    let decoded = RouteConfiguration::decode(response.resources[0].value.as_slice()).unwrap();
    assert_eq!(decoded.name, "ingress_http");
    assert_eq!(decoded.virtual_hosts[0].name, "*");
    assert_eq!(decoded.virtual_hosts[0].domains, vec!["*"]);
}

#[tokio::test]
async fn rebuilds_notify_subscribers() {
    let h = handler();
    let mut updates = h.cache().subscribe();
    apply(&h, &[service("default", "kuard", 80), INGRESS.to_string()].join("---\n"));

    let mut seen = Vec::new();
    while let Ok(Ok(update)) =
        tokio::time::timeout(Duration::from_millis(100), updates.recv()).await
    {
        seen.push(update);
    }
    let types: Vec<ResourceType> = seen.iter().map(|u: &SnapshotUpdate| u.resource_type).collect();
    assert!(types.contains(&ResourceType::Cluster));
    assert!(types.contains(&ResourceType::Route));
    assert!(types.contains(&ResourceType::Listener));
    assert!(!types.contains(&ResourceType::Secret));
    assert!(seen.windows(2).all(|w| w[0].version < w[1].version));
}
