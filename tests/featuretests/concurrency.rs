use std::sync::Arc;
use std::thread;

use envoy_types::pb::envoy::config::route::v3::RouteConfiguration;
use gangway::k8s::manifest::parse_manifest;
use gangway::xds::ResourceType;
use prost::Message;

use super::support::*;

fn ingress(index: usize) -> String {
    format!(
        r#"
apiVersion: networking.k8s.io/v1
kind: Ingress
metadata:
  name: app-{index}
  namespace: default
spec:
  rules:
  - host: app-{index}.example.com
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
    )
}

#[test]
fn concurrent_events_are_all_applied() {
    let h = Arc::new(handler());
    apply(&h, &service("default", "kuard", 80));

    let writers: Vec<_> = (0..4)
        .map(|worker| {
            let h = h.clone();
            thread::spawn(move || {
                for i in (worker * 25)..((worker + 1) * 25) {
                    for object in parse_manifest(&ingress(i)).unwrap() {
                        h.on_add(object);
                    }
                }
            })
        })
        .collect();

    let reader = {
        let cache = h.cache();
        thread::spawn(move || {
            let mut last_version = 0u64;
            let mut last_hosts = 0usize;
            for _ in 0..200 {
                let response = cache.query(ResourceType::Route, &[]);
                let version: u64 = response.version_info.parse().unwrap();
                assert!(version >= last_version, "versions went backwards");
                last_version = version;

                let configs: Vec<RouteConfiguration> = response
                    .resources
                    .iter()
                    .map(|any| RouteConfiguration::decode(any.value.as_slice()).unwrap())
                    .collect();
                let Some(http) = configs.iter().find(|c| c.name == "ingress_http") else {
                    continue;
                };
                let names: Vec<&str> = http.virtual_hosts.iter().map(|v| v.name.as_str()).collect();
                assert!(
                    names.windows(2).all(|pair| pair[0] < pair[1]),
                    "virtual hosts unsorted or duplicated: {names:?}"
                );
                assert!(names.len() >= last_hosts, "virtual hosts were lost");
                last_hosts = names.len();
            }
        })
    };

    for writer in writers {
        writer.join().unwrap();
    }
    reader.join().unwrap();

    let response = h.cache().query(ResourceType::Route, &["ingress_http".to_string()]);
    let published = RouteConfiguration::decode(response.resources[0].value.as_slice()).unwrap();
    let mut hosts: Vec<String> = published.virtual_hosts.iter().map(|v| v.name.clone()).collect();
    let mut expected: Vec<String> = (0..100).map(|i| format!("app-{i}.example.com")).collect();
    hosts.sort();
    expected.sort();
    assert_eq!(hosts, expected);

    let out = h.translation();
    assert_eq!(route_config(&out, "ingress_http").virtual_hosts.len(), 100);
    assert_eq!(h.statuses().iter().filter(|s| s.is_valid()).count(), 100);
    assert_eq!(out.clusters.len(), 1);
}
