//! End-to-end tests: manifests in, Envoy resources out.
//!
//! Each submodule feeds Kubernetes objects through an `EventHandler` and
//! inspects the translated resources and the snapshot cache.

mod featuretests {
    pub mod support;

    mod cache;
    mod concurrency;
    mod extension;
    mod gatewayapi;
    mod httpproxy;
    mod ingress;
    mod lifecycle;
}
