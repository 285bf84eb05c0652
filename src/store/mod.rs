//! # Resource Store
//!
//! Holds the latest copy of every watched object, keyed by namespace and
//! name. Mutations report whether they could change the built output so the
//! event handler can skip rebuilds for objects nothing refers to.

use std::collections::BTreeMap;

use tracing::debug;

use crate::config::Config;
use crate::k8s::gateway::{BackendRef, GATEWAY_GROUP};
use crate::k8s::{
    annotation, creation_time, name_of, BackendTLSPolicy, ConfigMap, ExtensionService, Gateway,
    GatewayClass, HTTPProxy, HTTPRoute, Ingress, Kind, KubernetesObject, Namespace,
    NamespacedName, ObjectKey, ObjectMeta, ReferenceGrant, Secret, Service, TCPRoute,
    TLSCertificateDelegation, TLSRoute,
};

/// Store-level settings that decide what is kept and what is referenced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSettings {
    pub ingress_class_names: Vec<String>,
    pub fallback_certificate: Option<NamespacedName>,
    pub client_certificate: Option<NamespacedName>,
    pub gateway_controller: String,
    pub gateway_ref: Option<NamespacedName>,
}

impl From<&Config> for StoreSettings {
    fn from(config: &Config) -> Self {
        Self {
            ingress_class_names: config.ingress.class_names.clone(),
            fallback_certificate: config.tls.fallback_certificate(),
            client_certificate: config.tls.envoy_client_certificate(),
            gateway_controller: config.gateway.controller_name.clone(),
            gateway_ref: config.gateway.gateway_ref(),
        }
    }
}

/// Latest version of every watched object.
#[derive(Debug, Clone, Default)]
pub struct ResourceStore {
    settings: StoreSettings,
    pub services: BTreeMap<NamespacedName, Service>,
    pub secrets: BTreeMap<NamespacedName, Secret>,
    pub config_maps: BTreeMap<NamespacedName, ConfigMap>,
    pub namespaces: BTreeMap<String, Namespace>,
    pub ingresses: BTreeMap<NamespacedName, Ingress>,
    pub httpproxies: BTreeMap<NamespacedName, HTTPProxy>,
    pub delegations: BTreeMap<NamespacedName, TLSCertificateDelegation>,
    pub extension_services: BTreeMap<NamespacedName, ExtensionService>,
    pub gateway_classes: BTreeMap<String, GatewayClass>,
    pub gateways: BTreeMap<NamespacedName, Gateway>,
    pub httproutes: BTreeMap<NamespacedName, HTTPRoute>,
    pub tlsroutes: BTreeMap<NamespacedName, TLSRoute>,
    pub tcproutes: BTreeMap<NamespacedName, TCPRoute>,
    pub backend_tls_policies: BTreeMap<NamespacedName, BackendTLSPolicy>,
    pub reference_grants: BTreeMap<NamespacedName, ReferenceGrant>,
}

fn nn(meta: &ObjectMeta) -> NamespacedName {
    NamespacedName::new(meta.namespace.clone().unwrap_or_default(), name_of(meta))
}

impl ResourceStore {
    pub fn new(settings: StoreSettings) -> Self {
        Self { settings, ..Default::default() }
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    /// Add or replace an object. Returns true when a rebuild is needed.
    pub fn insert(&mut self, object: KubernetesObject) -> bool {
        let key = object.key();
        let dirty = match object {
            KubernetesObject::Ingress(ingress) => {
                let spec_class =
                    ingress.spec.as_ref().and_then(|s| s.ingress_class_name.as_deref());
                if !self.class_matches(&ingress.metadata, spec_class) {
                    return self.drop_unmatched(&key);
                }
                self.ingresses.insert(nn(&ingress.metadata), ingress);
                true
            }
            KubernetesObject::HTTPProxy(proxy) => {
                if !self.class_matches(&proxy.metadata, proxy.spec.ingress_class_name.as_deref()) {
                    return self.drop_unmatched(&key);
                }
                self.httpproxies.insert(nn(&proxy.metadata), proxy);
                true
            }
            KubernetesObject::Service(service) => {
                self.services.insert(nn(&service.metadata), service);
                self.is_referenced(&key)
            }
            KubernetesObject::Secret(secret) => {
                self.secrets.insert(nn(&secret.metadata), secret);
                self.is_referenced(&key)
            }
            KubernetesObject::ConfigMap(config_map) => {
                self.config_maps.insert(nn(&config_map.metadata), config_map);
                self.is_referenced(&key)
            }
            KubernetesObject::Namespace(namespace) => {
                self.namespaces.insert(name_of(&namespace.metadata), namespace);
                true
            }
            KubernetesObject::TLSCertificateDelegation(d) => {
                self.delegations.insert(nn(&d.metadata), d);
                true
            }
            KubernetesObject::ExtensionService(e) => {
                self.extension_services.insert(nn(&e.metadata), e);
                true
            }
            KubernetesObject::GatewayClass(c) => {
                self.gateway_classes.insert(name_of(&c.metadata), c);
                true
            }
            KubernetesObject::Gateway(g) => {
                self.gateways.insert(nn(&g.metadata), g);
                true
            }
            KubernetesObject::HTTPRoute(r) => {
                self.httproutes.insert(nn(&r.metadata), r);
                true
            }
            KubernetesObject::TLSRoute(r) => {
                self.tlsroutes.insert(nn(&r.metadata), r);
                true
            }
            KubernetesObject::TCPRoute(r) => {
                self.tcproutes.insert(nn(&r.metadata), r);
                true
            }
            KubernetesObject::BackendTLSPolicy(p) => {
                self.backend_tls_policies.insert(nn(&p.metadata), p);
                true
            }
            KubernetesObject::ReferenceGrant(g) => {
                self.reference_grants.insert(nn(&g.metadata), g);
                true
            }
        };
        debug!(object = %key, dirty, "Stored object");
        dirty
    }

    /// Replace `old` with `new`. Identical objects are a no-op.
    pub fn update(&mut self, old: KubernetesObject, new: KubernetesObject) -> bool {
        if old == new {
            return false;
        }
        let renamed = old.key() != new.key();
        let removed = renamed && self.remove(&old);
        let inserted = self.insert(new);
        removed || inserted
    }

    /// Remove an object. Returns true when a rebuild is needed.
    pub fn remove(&mut self, object: &KubernetesObject) -> bool {
        let key = object.key();
        let dirty = self.remove_key(&key);
        debug!(object = %key, dirty, "Removed object");
        dirty
    }

    fn remove_key(&mut self, key: &ObjectKey) -> bool {
        let name = key.namespaced_name();
        match key.kind {
            Kind::Service => {
                let referenced = self.is_referenced(key);
                self.services.remove(&name).is_some() && referenced
            }
            Kind::Secret => {
                let referenced = self.is_referenced(key);
                self.secrets.remove(&name).is_some() && referenced
            }
            Kind::ConfigMap => {
                let referenced = self.is_referenced(key);
                self.config_maps.remove(&name).is_some() && referenced
            }
            Kind::Namespace => self.namespaces.remove(&key.name).is_some(),
            Kind::Ingress => self.ingresses.remove(&name).is_some(),
            Kind::HTTPProxy => self.httpproxies.remove(&name).is_some(),
            Kind::TLSCertificateDelegation => self.delegations.remove(&name).is_some(),
            Kind::ExtensionService => self.extension_services.remove(&name).is_some(),
            Kind::GatewayClass => self.gateway_classes.remove(&key.name).is_some(),
            Kind::Gateway => self.gateways.remove(&name).is_some(),
            Kind::HTTPRoute => self.httproutes.remove(&name).is_some(),
            Kind::TLSRoute => self.tlsroutes.remove(&name).is_some(),
            Kind::TCPRoute => self.tcproutes.remove(&name).is_some(),
            Kind::BackendTLSPolicy => self.backend_tls_policies.remove(&name).is_some(),
            Kind::ReferenceGrant => self.reference_grants.remove(&name).is_some(),
        }
    }

    fn class_matches(&self, meta: &ObjectMeta, spec_class: Option<&str>) -> bool {
        annotation::matches_ingress_class(
            annotation::ingress_class(meta),
            spec_class,
            &self.settings.ingress_class_names,
        )
    }

    /// An object whose class no longer matches evicts any stored copy.
    fn drop_unmatched(&mut self, key: &ObjectKey) -> bool {
        debug!(object = %key, "Ignoring object with non-matching ingress class");
        self.remove_key(key)
    }

    /// Whether a Service, Secret or ConfigMap is referenced by any root object.
    pub fn is_referenced(&self, key: &ObjectKey) -> bool {
        let target = key.namespaced_name();
        match key.kind {
            Kind::Service => self.service_referenced(&target),
            Kind::Secret => self.secret_referenced(&target),
            Kind::ConfigMap => self.config_map_referenced(&target),
            _ => true,
        }
    }

    fn service_referenced(&self, target: &NamespacedName) -> bool {
        let same = |ns: &str, name: &str| ns == target.namespace && name == target.name;

        let ingress = self.ingresses.iter().any(|(key, ingress)| {
            let Some(spec) = ingress.spec.as_ref() else { return false };
            let default = spec
                .default_backend
                .as_ref()
                .and_then(|b| b.service.as_ref())
                .map(|s| same(&key.namespace, &s.name))
                .unwrap_or(false);
            default
                || spec.rules.iter().flatten().filter_map(|r| r.http.as_ref()).any(|http| {
                    http.paths.iter().any(|p| {
                        p.backend
                            .service
                            .as_ref()
                            .map(|s| same(&key.namespace, &s.name))
                            .unwrap_or(false)
                    })
                })
        });
        if ingress {
            return true;
        }

        let proxy = self.httpproxies.iter().any(|(key, proxy)| {
            let routes = proxy
                .spec
                .routes
                .iter()
                .flat_map(|r| r.services.iter())
                .any(|s| same(&key.namespace, &s.name));
            let tcp = proxy
                .spec
                .tcpproxy
                .iter()
                .flat_map(|t| t.services.iter())
                .any(|s| same(&key.namespace, &s.name));
            routes || tcp
        });
        if proxy {
            return true;
        }

        let backend = |ns: &str, r: &BackendRef| {
            r.kind.as_deref().unwrap_or("Service") == "Service"
                && same(r.namespace.as_deref().unwrap_or(ns), &r.name)
        };
        let httproute = self.httproutes.iter().any(|(key, route)| {
            route.spec.rules.iter().any(|rule| {
                rule.backend_refs.iter().any(|r| backend(&key.namespace, r))
                    || rule
                        .filters
                        .iter()
                        .filter_map(|f| f.request_mirror.as_ref())
                        .any(|m| backend(&key.namespace, &m.backend_ref))
            })
        });
        let l4 = self.tlsroutes.iter().any(|(key, route)| {
            route.spec.rules.iter().flat_map(|r| &r.backend_refs).any(|r| backend(&key.namespace, r))
        }) || self.tcproutes.iter().any(|(key, route)| {
            route.spec.rules.iter().flat_map(|r| &r.backend_refs).any(|r| backend(&key.namespace, r))
        });
        if httproute || l4 {
            return true;
        }

        self.extension_services
            .iter()
            .any(|(key, ext)| ext.spec.services.iter().any(|s| same(&key.namespace, &s.name)))
    }

    fn secret_referenced(&self, target: &NamespacedName) -> bool {
        if self.settings.fallback_certificate.as_ref() == Some(target)
            || self.settings.client_certificate.as_ref() == Some(target)
        {
            return true;
        }
        let refers = |reference: &str, ns: &str| {
            NamespacedName::from_reference(reference, ns).as_ref() == Some(target)
        };

        let ingress = self.ingresses.iter().any(|(key, ingress)| {
            ingress
                .spec
                .as_ref()
                .and_then(|s| s.tls.as_ref())
                .map(|tls| {
                    tls.iter()
                        .filter_map(|t| t.secret_name.as_deref())
                        .any(|name| refers(name, &key.namespace))
                })
                .unwrap_or(false)
        });
        if ingress {
            return true;
        }

        let proxy = self.httpproxies.iter().any(|(key, proxy)| {
            let tls = proxy.spec.virtualhost.as_ref().and_then(|v| v.tls.as_ref());
            let vhost = tls
                .map(|tls| {
                    refers(&tls.secret_name, &key.namespace)
                        || tls
                            .client_validation
                            .as_ref()
                            .map(|cv| refers(&cv.ca_secret, &key.namespace))
                            .unwrap_or(false)
                })
                .unwrap_or(false);
            vhost
                || proxy
                    .spec
                    .routes
                    .iter()
                    .flat_map(|r| r.services.iter())
                    .filter_map(|s| s.validation.as_ref())
                    .any(|v| refers(&v.ca_secret, &key.namespace))
        });
        if proxy {
            return true;
        }

        let gateway = self.gateways.iter().any(|(key, gateway)| {
            gateway
                .spec
                .listeners
                .iter()
                .filter_map(|l| l.tls.as_ref())
                .flat_map(|tls| tls.certificate_refs.iter())
                .any(|r| {
                    r.namespace.as_deref().unwrap_or(&key.namespace) == target.namespace
                        && r.name == target.name
                })
        });
        if gateway {
            return true;
        }

        let extension = self.extension_services.iter().any(|(key, ext)| {
            ext.spec.validation.as_ref().map(|v| refers(&v.ca_secret, &key.namespace)).unwrap_or(false)
        });
        extension || self.policy_ca_referenced("Secret", target)
    }

    fn config_map_referenced(&self, target: &NamespacedName) -> bool {
        self.policy_ca_referenced("ConfigMap", target)
    }

    fn policy_ca_referenced(&self, kind: &str, target: &NamespacedName) -> bool {
        self.backend_tls_policies.iter().any(|(key, policy)| {
            key.namespace == target.namespace
                && policy
                    .spec
                    .validation
                    .ca_certificate_refs
                    .iter()
                    .any(|r| r.kind == kind && r.name == target.name)
        })
    }

    pub fn service(&self, name: &NamespacedName) -> Option<&Service> {
        self.services.get(name)
    }

    pub fn secret(&self, name: &NamespacedName) -> Option<&Secret> {
        self.secrets.get(name)
    }

    pub fn config_map(&self, name: &NamespacedName) -> Option<&ConfigMap> {
        self.config_maps.get(name)
    }

    pub fn namespace_labels(&self, namespace: &str) -> Option<&BTreeMap<String, String>> {
        self.namespaces.get(namespace)?.metadata.labels.as_ref()
    }

    /// Whether `secret` may be used by objects in `target_namespace`.
    ///
    /// Same-namespace use is always allowed; cross-namespace use needs a
    /// TLSCertificateDelegation in the secret's namespace naming either the
    /// target namespace or `*`.
    pub fn delegation_permitted(&self, secret: &NamespacedName, target_namespace: &str) -> bool {
        if secret.namespace == target_namespace {
            return true;
        }
        self.delegations
            .iter()
            .filter(|(key, _)| key.namespace == secret.namespace)
            .flat_map(|(_, d)| d.spec.delegations.iter())
            .filter(|d| d.secret_name == secret.name)
            .any(|d| d.target_namespaces.iter().any(|ns| ns == "*" || ns == target_namespace))
    }

    /// Whether a ReferenceGrant lets `from_kind` objects in `from_namespace`
    /// refer to `to_kind` object `to`.
    pub fn reference_permitted(
        &self,
        from_kind: &str,
        from_namespace: &str,
        to_kind: &str,
        to: &NamespacedName,
    ) -> bool {
        if from_namespace == to.namespace {
            return true;
        }
        self.reference_grants.iter().filter(|(key, _)| key.namespace == to.namespace).any(
            |(_, grant)| {
                let from_ok = grant.spec.from.iter().any(|f| {
                    f.group == GATEWAY_GROUP && f.kind == from_kind && f.namespace == from_namespace
                });
                let to_ok = grant.spec.to.iter().any(|t| {
                    t.group.is_empty()
                        && t.kind == to_kind
                        && t.name.as_deref().map(|n| n == to.name).unwrap_or(true)
                });
                from_ok && to_ok
            },
        )
    }

    /// The Gateway this controller programs, if any.
    ///
    /// An explicit gateway reference wins; otherwise the oldest Gateway whose
    /// GatewayClass names the configured controller is selected.
    pub fn selected_gateway(&self) -> Option<(&NamespacedName, &Gateway)> {
        if let Some(reference) = &self.settings.gateway_ref {
            return self.gateways.get_key_value(reference);
        }
        self.gateways
            .iter()
            .filter(|(_, gateway)| self.gateway_class_accepted(&gateway.spec.gateway_class_name))
            .min_by(|(a_key, a), (b_key, b)| {
                creation_time(&a.metadata)
                    .cmp(&creation_time(&b.metadata))
                    .then_with(|| a_key.cmp(b_key))
            })
    }

    /// Whether the named GatewayClass belongs to the configured controller.
    pub fn gateway_class_accepted(&self, class_name: &str) -> bool {
        self.gateway_classes
            .get(class_name)
            .map(|class| class.spec.controller_name == self.settings.gateway_controller)
            .unwrap_or(false)
    }
}
