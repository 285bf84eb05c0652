//! Load Kubernetes objects from multi-document YAML manifests.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_yaml::Value;
use tracing::{debug, warn};

use super::{Kind, KubernetesObject};
use crate::{Error, Result};

/// Parse every supported object in a YAML stream.
///
/// Documents of unknown kinds are skipped with a warning. `kind: List`
/// documents are flattened.
pub fn parse_manifest(content: &str) -> Result<Vec<KubernetesObject>> {
    let mut objects = Vec::new();
    for (index, document) in serde_yaml::Deserializer::from_str(content).enumerate() {
        let value = Value::deserialize(document).map_err(|e| {
            Error::manifest_with_source(format!("document {} is not valid YAML", index), e)
        })?;
        collect_value(value, &mut objects)?;
    }
    Ok(objects)
}

/// Load one manifest file, or every `.yaml`/`.yml` file under a directory in
/// lexical order.
pub fn load_path(path: &Path) -> Result<Vec<KubernetesObject>> {
    if path.is_dir() {
        let mut files = Vec::new();
        collect_files(path, &mut files)?;
        files.sort();
        let mut objects = Vec::new();
        for file in files {
            objects.extend(load_file(&file)?);
        }
        Ok(objects)
    } else {
        load_file(path)
    }
}

fn load_file(path: &Path) -> Result<Vec<KubernetesObject>> {
    let content = std::fs::read_to_string(path)?;
    let objects = parse_manifest(&content)
        .map_err(|e| Error::manifest(format!("{}: {}", path.display(), e)))?;
    debug!(path = %path.display(), objects = objects.len(), "Loaded manifest");
    Ok(objects)
}

fn collect_files(dir: &Path, files: &mut Vec<std::path::PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, files)?;
        } else if matches!(path.extension().and_then(|e| e.to_str()), Some("yaml" | "yml")) {
            files.push(path);
        }
    }
    Ok(())
}

fn collect_value(value: Value, objects: &mut Vec<KubernetesObject>) -> Result<()> {
    if value.is_null() {
        return Ok(());
    }
    let kind = value.get("kind").and_then(Value::as_str).unwrap_or_default().to_string();
    if kind == "List" {
        if let Some(Value::Sequence(items)) = value.get("items") {
            for item in items.clone() {
                collect_value(item, objects)?;
            }
        }
        return Ok(());
    }

    let Some(kind) = Kind::from_manifest_kind(&kind) else {
        warn!(kind = %kind, "Skipping manifest document of unsupported kind");
        return Ok(());
    };

    let object = match kind {
        Kind::Service => KubernetesObject::Service(decode(kind, value)?),
        Kind::Secret => KubernetesObject::Secret(decode(kind, value)?),
        Kind::ConfigMap => KubernetesObject::ConfigMap(decode(kind, value)?),
        Kind::Namespace => KubernetesObject::Namespace(decode(kind, value)?),
        Kind::Ingress => KubernetesObject::Ingress(decode(kind, value)?),
        Kind::HTTPProxy => KubernetesObject::HTTPProxy(decode(kind, value)?),
        Kind::TLSCertificateDelegation => {
            KubernetesObject::TLSCertificateDelegation(decode(kind, value)?)
        }
        Kind::ExtensionService => KubernetesObject::ExtensionService(decode(kind, value)?),
        Kind::GatewayClass => KubernetesObject::GatewayClass(decode(kind, value)?),
        Kind::Gateway => KubernetesObject::Gateway(decode(kind, value)?),
        Kind::HTTPRoute => KubernetesObject::HTTPRoute(decode(kind, value)?),
        Kind::TLSRoute => KubernetesObject::TLSRoute(decode(kind, value)?),
        Kind::TCPRoute => KubernetesObject::TCPRoute(decode(kind, value)?),
        Kind::BackendTLSPolicy => KubernetesObject::BackendTLSPolicy(decode(kind, value)?),
        Kind::ReferenceGrant => KubernetesObject::ReferenceGrant(decode(kind, value)?),
    };
    objects.push(default_namespace(object));
    Ok(())
}

fn decode<T: DeserializeOwned>(kind: Kind, value: Value) -> Result<T> {
    serde_yaml::from_value(value)
        .map_err(|e| Error::manifest_with_source(format!("invalid {} document", kind), e))
}

/// Namespaced objects without a namespace land in `default`.
fn default_namespace(mut object: KubernetesObject) -> KubernetesObject {
    let meta = match &mut object {
        KubernetesObject::Namespace(_) | KubernetesObject::GatewayClass(_) => return object,
        KubernetesObject::Service(o) => &mut o.metadata,
        KubernetesObject::Secret(o) => &mut o.metadata,
        KubernetesObject::ConfigMap(o) => &mut o.metadata,
        KubernetesObject::Ingress(o) => &mut o.metadata,
        KubernetesObject::HTTPProxy(o) => &mut o.metadata,
        KubernetesObject::TLSCertificateDelegation(o) => &mut o.metadata,
        KubernetesObject::ExtensionService(o) => &mut o.metadata,
        KubernetesObject::Gateway(o) => &mut o.metadata,
        KubernetesObject::HTTPRoute(o) => &mut o.metadata,
        KubernetesObject::TLSRoute(o) => &mut o.metadata,
        KubernetesObject::TCPRoute(o) => &mut o.metadata,
        KubernetesObject::BackendTLSPolicy(o) => &mut o.metadata,
        KubernetesObject::ReferenceGrant(o) => &mut o.metadata,
    };
    if meta.namespace.as_deref().map(str::is_empty).unwrap_or(true) {
        meta.namespace = Some("default".to_string());
    }
    object
}
