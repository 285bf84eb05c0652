//! Secret resources for SDS and the TLS helpers shared by clusters and
//! listeners.

use envoy_types::pb::envoy::config::core::v3::{data_source::Specifier, DataSource};
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{
    secret, tls_parameters::TlsProtocol, Secret, TlsCertificate, TlsParameters,
};
use tracing::debug;

use super::naming::secret_name;
use crate::dag::{TlsSecret, TlsVersion};

/// Build the SDS secret for a certificate and key.
pub fn secret(tls: &TlsSecret) -> Secret {
    Secret {
        name: secret_name(tls),
        r#type: Some(secret::Type::TlsCertificate(TlsCertificate {
            certificate_chain: Some(inline_bytes(&tls.certificate_chain)),
            private_key: Some(inline_bytes(&tls.private_key)),
            ..Default::default()
        })),
    }
}

/// Build secrets for every referenced certificate, sorted and deduplicated
/// by name.
pub fn secrets<'a>(secrets: impl IntoIterator<Item = &'a TlsSecret>) -> Vec<Secret> {
    let mut built: Vec<Secret> = secrets.into_iter().map(secret).collect();
    built.sort_by(|a, b| a.name.cmp(&b.name));
    built.dedup_by(|a, b| a.name == b.name);
    debug!(count = built.len(), "Built secret resources");
    built
}

pub(crate) fn inline_bytes(bytes: &[u8]) -> DataSource {
    DataSource { specifier: Some(Specifier::InlineBytes(bytes.to_vec())), ..Default::default() }
}

fn tls_protocol(version: TlsVersion) -> TlsProtocol {
    match version {
        TlsVersion::Auto => TlsProtocol::TlsAuto,
        TlsVersion::V1_2 => TlsProtocol::TlSv12,
        TlsVersion::V1_3 => TlsProtocol::TlSv13,
    }
}

/// Protocol bounds, or `None` when both are left to Envoy.
pub(crate) fn tls_parameters(min: TlsVersion, max: TlsVersion) -> Option<TlsParameters> {
    if min == TlsVersion::Auto && max == TlsVersion::Auto {
        return None;
    }
    Some(TlsParameters {
        tls_minimum_protocol_version: tls_protocol(min) as i32,
        tls_maximum_protocol_version: tls_protocol(max) as i32,
        ..Default::default()
    })
}
