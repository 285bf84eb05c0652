use gangway::k8s::Kind;
use gangway::xds::cluster::HTTP_PROTOCOL_OPTIONS_KEY;
use pretty_assertions::assert_eq;

use super::support::*;

#[test]
fn extension_service_becomes_an_h2c_cluster() {
    let h = handler();
    apply(
        &h,
        &[
            service("auth", "authz", 9000),
            r#"
apiVersion: projectcontour.io/v1alpha1
kind: ExtensionService
metadata:
  name: authz
  namespace: auth
spec:
  protocol: h2c
  services:
  - name: authz
    port: 9000
"#
            .to_string(),
        ]
        .join("---\n"),
    );

    assert!(status(&h, Kind::ExtensionService, "auth", "authz").is_valid());
    let out = h.translation();
    assert_eq!(cluster_names(&out), vec!["extension/auth/authz"]);
    let cluster = &out.clusters[0];
    assert_eq!(cluster.alt_stat_name, "extension_auth_authz");
    assert_eq!(cluster.eds_cluster_config.as_ref().unwrap().service_name, "extension/auth/authz");
    assert!(cluster.typed_extension_protocol_options.contains_key(HTTP_PROTOCOL_OPTIONS_KEY));
    assert!(cluster.transport_socket.is_none());
}

#[test]
fn unresolved_extension_services_are_invalid() {
    let h = handler();
    apply(
        &h,
        r#"
apiVersion: projectcontour.io/v1alpha1
kind: ExtensionService
metadata:
  name: authz
  namespace: auth
spec:
  services:
  - name: missing
    port: 9000
"#,
    );
    let authz = status(&h, Kind::ExtensionService, "auth", "authz");
    assert!(authz.has_error("ServiceError", "ServiceUnresolvedReference"));
    assert!(h.translation().clusters.is_empty());
}
