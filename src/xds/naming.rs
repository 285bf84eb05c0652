//! Deterministic names for translated resources.
//!
//! Names only depend on the Envoy-visible settings of the thing they name, so
//! an unchanged graph re-translates to the same names and the snapshot cache
//! can tell that nothing changed.

use std::time::Duration;

use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::dag::{Cluster, TlsSecret};
use crate::utils::format_duration;

/// Names handed to Envoy are kept below this length.
pub const NAME_LIMIT: usize = 60;

const SHORT_HASH: usize = 6;

/// Connect timeout Envoy is given when nothing overrides it. Only other
/// values take part in the cluster hash.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Join `parts` with `/`, shortening them right to left until the result
/// fits in `limit`.
///
/// Shortened parts keep a prefix followed by `-` and six characters of the
/// sha256 of the full name, so distinct long names stay distinct.
pub fn hashname(limit: usize, parts: &[&str]) -> String {
    hashname_with_separator(limit, "/", parts)
}

/// [`hashname`] with a caller-chosen separator.
pub fn hashname_with_separator(limit: usize, separator: &str, parts: &[&str]) -> String {
    let joined = parts.join(separator);
    if joined.len() < limit {
        return joined;
    }
    let hash = hex::encode(Sha256::digest(joined.as_bytes()));
    let suffix = &hash[..SHORT_HASH];
    let per_part = limit / parts.len().max(1);

    let mut parts: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
    for index in (0..parts.len()).rev() {
        parts[index] = truncate(per_part, &parts[index], suffix);
        let joined = parts.join(separator);
        if joined.len() < limit {
            return joined;
        }
    }
    hash[..limit.min(hash.len())].to_string()
}

fn truncate(limit: usize, value: &str, suffix: &str) -> String {
    if limit >= value.len() {
        return value.to_string();
    }
    if limit > suffix.len() + 1 {
        let keep = floor_char_boundary(value, limit - suffix.len() - 1);
        return format!("{}-{}", &value[..keep], suffix);
    }
    value[..floor_char_boundary(value, limit)].to_string()
}

fn floor_char_boundary(value: &str, index: usize) -> usize {
    (0..=index.min(value.len())).rev().find(|i| value.is_char_boundary(*i)).unwrap_or(0)
}

/// First ten hex characters of the sha1 of `input`.
pub fn short_sha1(input: &[u8]) -> String {
    let mut hex = hex::encode(Sha1::digest(input));
    hex.truncate(10);
    hex
}

/// The settings that make two clusters for the same service port different
/// in Envoy. Weights and health checks are left out: they do not need a
/// separate cluster.
fn cluster_hash_input(cluster: &Cluster) -> String {
    let mut buf = String::new();
    buf.push_str(cluster.lb_strategy.hash_key());
    if let Some(validation) = &cluster.upstream_validation {
        buf.push_str(&validation.ca.name.name);
        buf.push_str(&validation.subject_name);
    }
    buf.push_str(&cluster.protocol);
    buf.push_str(&cluster.sni);
    if !cluster.idle_connection_timeout.is_default() {
        buf.push_str(&cluster.idle_connection_timeout.to_string());
    }
    if cluster.connect_timeout != DEFAULT_CONNECT_TIMEOUT {
        buf.push_str(&format_duration(cluster.connect_timeout));
    }
    if let Some(tls) = &cluster.upstream_tls {
        buf.push_str(tls.min_version.as_str());
        buf.push_str(tls.max_version.as_str());
    }
    let breakers = &cluster.circuit_breakers;
    for threshold in [
        breakers.max_connections,
        breakers.max_pending_requests,
        breakers.max_requests,
        breakers.max_retries,
    ]
    .into_iter()
    .flatten()
    {
        buf.push_str(&threshold.to_string());
    }
    buf
}

/// `<ns>/<name>/<port>/<hash>`, shortened to [`NAME_LIMIT`].
pub fn cluster_name(cluster: &Cluster) -> String {
    let upstream = &cluster.upstream;
    let port = upstream.port.to_string();
    let hash = short_sha1(cluster_hash_input(cluster).as_bytes());
    hashname(NAME_LIMIT, &[&upstream.name.namespace, &upstream.name.name, &port, &hash])
}

/// `<ns>_<name>_<port>`, used for Envoy statistics. Shortened like
/// [`cluster_name`].
pub fn alt_stat_name(cluster: &Cluster) -> String {
    let upstream = &cluster.upstream;
    let port = upstream.port.to_string();
    let parts = [upstream.name.namespace.as_str(), upstream.name.name.as_str(), port.as_str()];
    hashname_with_separator(NAME_LIMIT, "_", &parts)
}

/// SDS name of a TLS certificate: changes whenever the key pair does.
pub fn secret_name(secret: &TlsSecret) -> String {
    let mut material = secret.certificate_chain.clone();
    material.extend_from_slice(&secret.private_key);
    let hash = short_sha1(&material);
    hashname(NAME_LIMIT, &[&secret.name.namespace, &secret.name.name, &hash])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{
        CaBundle, LoadBalancerStrategy, PeerValidation, ServiceUpstream, Timeout,
    };
    use crate::k8s::NamespacedName;
    use pretty_assertions::assert_eq;

    fn kuard() -> Cluster {
        Cluster::new(
            ServiceUpstream {
                name: NamespacedName::new("default", "kuard"),
                port: 80,
                port_name: String::new(),
                external_name: None,
            },
            DEFAULT_CONNECT_TIMEOUT,
        )
    }

    #[test]
    fn short_names_are_joined() {
        assert_eq!(hashname(60, &["default", "kuard", "80"]), "default/kuard/80");
    }

    #[test]
    fn long_names_are_shortened_from_the_right() {
        let name = "kbujbkuhdod66gjdmwmijz8xzgsx1nkfbrloezdjiulquzk4x3p0nnvpzi8r";
        let out = hashname(60, &["default", name, "8080", "da39a3ee5e"]);
        assert!(out.len() < 60, "{out}");
        assert!(out.starts_with("default/kbujbkuh"), "{out}");
        assert!(out.ends_with("/8080/da39a3ee5e"), "{out}");
        // stable across calls
        assert_eq!(out, hashname(60, &["default", name, "8080", "da39a3ee5e"]));
    }

    #[test]
    fn long_stat_names_are_shortened() {
        let mut long = kuard();
        long.upstream.name.name = "kbujbkuhdod66gjdmwmijz8xzgsx1nkfbrloezdjiulquzk4x3p0nnvpzi8r".into();
        long.upstream.port = 8080;
        let alt = alt_stat_name(&long);
        assert!(alt.len() <= NAME_LIMIT, "{alt}");
        assert!(alt.starts_with("default_kbujbkuh"), "{alt}");
        assert!(alt.ends_with("_8080"), "{alt}");

        let mut other = long.clone();
        other.upstream.name.name.push('x');
        assert_ne!(alt_stat_name(&other), alt);
    }

    #[test]
    fn default_cluster_hash_is_empty_input() {
        assert_eq!(cluster_name(&kuard()), "default/kuard/80/da39a3ee5e");
        assert_eq!(alt_stat_name(&kuard()), "default_kuard_80");
    }

    #[test]
    fn port_name_and_weight_do_not_change_identity() {
        let mut named = kuard();
        named.upstream.port_name = "http".into();
        named.weight = 90;
        assert_eq!(cluster_name(&named), "default/kuard/80/da39a3ee5e");
        assert_eq!(named.upstream.eds_service_name(), "default/kuard/http");
    }

    #[test]
    fn distinguishing_settings_change_identity() {
        let mut random = kuard();
        random.lb_strategy = LoadBalancerStrategy::Random;
        assert_eq!(cluster_name(&random), "default/kuard/80/58d888c08a");

        let mut breakers = kuard();
        breakers.circuit_breakers.max_connections = Some(9000);
        assert_ne!(cluster_name(&breakers), cluster_name(&kuard()));

        let mut validated = kuard();
        validated.protocol = "tls".into();
        validated.upstream_validation = Some(PeerValidation {
            ca: CaBundle { name: NamespacedName::new("default", "ca"), ca_certificate: vec![] },
            subject_name: "kuard.default".into(),
        });
        assert_ne!(cluster_name(&validated), cluster_name(&kuard()));

        let mut idle = kuard();
        idle.idle_connection_timeout = Timeout::Duration(Duration::from_secs(60));
        assert_ne!(cluster_name(&idle), cluster_name(&kuard()));
    }

    #[test]
    fn secret_names_follow_key_material() {
        let secret = TlsSecret {
            name: NamespacedName::new("default", "tls"),
            certificate_chain: b"cert".to_vec(),
            private_key: b"key".to_vec(),
        };
        let name = secret_name(&secret);
        assert!(name.starts_with("default/tls/"));
        assert_eq!(name.len(), "default/tls/".len() + 10);

        let rotated = TlsSecret { private_key: b"other".to_vec(), ..secret.clone() };
        assert_ne!(secret_name(&rotated), name);
    }
}
