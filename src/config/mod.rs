//! # Configuration Management
//!
//! Configuration is read from an optional YAML file and then overridden by
//! `GANGWAY_*` environment variables. The merged result is validated before
//! anything is built from it.

pub mod settings;

use std::path::Path;

pub use settings::{
    ClusterConfig, Config, GatewayConfig, HttpProxyConfig, IngressConfig, ListenerConfig,
    ObservabilityConfig, ProcessorKind, TlsConfig, XdsConfig,
};

use crate::{Error, Result};

impl Config {
    /// Load configuration from an optional YAML file plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from YAML text. Missing sections take their defaults.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
            .map_err(|e| Error::config(format!("Invalid configuration file: {}", e)))
    }

    fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("Failed to read configuration file {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Apply `GANGWAY_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("GANGWAY_XDS_BIND_ADDRESS") {
            self.xds.bind_address = value;
        }
        if let Some(value) = lookup("GANGWAY_XDS_PORT") {
            self.xds.port = value
                .parse()
                .map_err(|e| Error::config(format!("Invalid xDS port: {}", e)))?;
        }
        if let Some(value) = lookup("GANGWAY_HTTP_PORT") {
            self.listener.http_port = value
                .parse()
                .map_err(|e| Error::config(format!("Invalid HTTP listener port: {}", e)))?;
        }
        if let Some(value) = lookup("GANGWAY_HTTPS_PORT") {
            self.listener.https_port = value
                .parse()
                .map_err(|e| Error::config(format!("Invalid HTTPS listener port: {}", e)))?;
        }
        if let Some(value) = lookup("GANGWAY_INGRESS_CLASS_NAMES") {
            self.ingress.class_names = split_list(&value);
        }
        if let Some(value) = lookup("GANGWAY_GATEWAY_CONTROLLER_NAME") {
            self.gateway.controller_name = value;
        }
        if let Some(value) = lookup("GANGWAY_GATEWAY_REF") {
            self.gateway.gateway_ref = Some(value).filter(|v| !v.trim().is_empty());
        }
        if let Some(value) = lookup("GANGWAY_ROOT_NAMESPACES") {
            self.httpproxy.root_namespaces = split_list(&value);
        }
        if let Some(value) = lookup("GANGWAY_FALLBACK_CERTIFICATE") {
            self.tls.fallback_certificate = Some(value).filter(|v| !v.trim().is_empty());
        }
        if let Some(value) = lookup("GANGWAY_PROCESSORS") {
            self.processors = split_list(&value)
                .iter()
                .map(|name| {
                    ProcessorKind::parse(name)
                        .ok_or_else(|| Error::config(format!("Unknown processor '{}'", name)))
                })
                .collect::<Result<Vec<_>>>()?;
        }
        if let Some(value) = lookup("GANGWAY_LOG_LEVEL") {
            self.observability.log_level = value;
        }
        if let Some(value) = lookup("GANGWAY_JSON_LOGGING") {
            self.observability.json_logging =
                matches!(value.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        if let Some(value) = lookup("GANGWAY_METRICS_PORT") {
            self.observability.metrics_port = value
                .parse()
                .map_err(|e| Error::config(format!("Invalid metrics port: {}", e)))?;
            self.observability.enable_metrics = self.observability.metrics_port != 0;
        }
        Ok(())
    }
}

fn split_list(value: &str) -> Vec<String> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}
