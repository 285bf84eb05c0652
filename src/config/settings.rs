//! # Configuration Settings
//!
//! Defines the configuration structure for the gangway control plane.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::errors::{Error, Result};
use crate::k8s::NamespacedName;
use crate::utils::parse_duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    /// xDS server configuration
    #[validate(nested)]
    pub xds: XdsConfig,

    /// Envoy listener defaults for Ingress and HTTPProxy
    #[validate(nested)]
    pub listener: ListenerConfig,

    /// Ingress class filtering
    pub ingress: IngressConfig,

    /// Gateway API controller settings
    #[validate(nested)]
    pub gateway: GatewayConfig,

    /// Upstream cluster defaults
    #[validate(nested)]
    pub cluster: ClusterConfig,

    /// Downstream and upstream TLS defaults
    pub tls: TlsConfig,

    /// HTTPProxy specific settings
    pub httpproxy: HttpProxyConfig,

    /// Order in which graph processors run
    pub processors: Vec<ProcessorKind>,

    /// Observability configuration
    #[validate(nested)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).map_err(Error::from)?;
        self.validate_custom()
    }

    fn validate_custom(&self) -> Result<()> {
        if self.listener.http_port == self.listener.https_port {
            return Err(Error::validation_field(
                "HTTP and HTTPS listener ports cannot be the same",
                "listener",
            ));
        }

        parse_duration(&self.cluster.connect_timeout).map_err(|err| {
            Error::validation_field(err.to_string(), "cluster.connect_timeout")
        })?;

        for (field, value) in [
            ("tls.fallback_certificate", &self.tls.fallback_certificate),
            ("tls.envoy_client_certificate", &self.tls.envoy_client_certificate),
            ("gateway.gateway_ref", &self.gateway.gateway_ref),
        ] {
            if let Some(value) = value {
                if NamespacedName::parse(value).is_none() {
                    return Err(Error::validation_field(
                        format!("'{value}' must be of the form namespace/name"),
                        field,
                    ));
                }
            }
        }

        if !matches!(self.tls.minimum_protocol_version.as_str(), "1.2" | "1.3") {
            return Err(Error::validation_field(
                "minimum TLS protocol version must be 1.2 or 1.3",
                "tls.minimum_protocol_version",
            ));
        }

        Ok(())
    }

    /// Processors in the order they should run, falling back to the default pipeline.
    pub fn processor_order(&self) -> Vec<ProcessorKind> {
        if self.processors.is_empty() {
            ProcessorKind::default_order().to_vec()
        } else {
            self.processors.clone()
        }
    }
}

/// xDS server configuration for Envoy communication
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(default)]
pub struct XdsConfig {
    /// xDS server bind address
    #[validate(length(min = 1, message = "xDS bind address cannot be empty"))]
    pub bind_address: String,

    /// xDS server port
    #[validate(range(min = 1, max = 65535, message = "xDS port must be between 1 and 65535"))]
    pub port: u16,
}

impl Default for XdsConfig {
    fn default() -> Self {
        Self { bind_address: "0.0.0.0".to_string(), port: 8001 }
    }
}

impl XdsConfig {
    /// Get the xDS server bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Envoy listener addresses used when no Gateway is selected
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    #[validate(length(min = 1, message = "Listener address cannot be empty"))]
    pub address: String,

    #[validate(range(min = 1, max = 65535, message = "HTTP port must be between 1 and 65535"))]
    pub http_port: u32,

    #[validate(range(min = 1, max = 65535, message = "HTTPS port must be between 1 and 65535"))]
    pub https_port: u32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self { address: "0.0.0.0".to_string(), http_port: 8080, https_port: 8443 }
    }
}

/// Ingress class names this controller accepts.
///
/// An empty list accepts objects without a class and objects of class
/// `contour`; a non-empty list accepts only the listed classes.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct IngressConfig {
    pub class_names: Vec<String>,
}

/// Gateway API settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    /// GatewayClass `controllerName` this controller reconciles
    #[validate(length(min = 1, message = "Gateway controller name cannot be empty"))]
    pub controller_name: String,

    /// Explicit `namespace/name` of the Gateway to program, bypassing class selection
    pub gateway_ref: Option<String>,

    /// Offset added to privileged Gateway listener ports
    #[validate(range(max = 60000, message = "Port offset must not exceed 60000"))]
    pub port_offset: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            controller_name: "projectcontour.io/gateway-controller".to_string(),
            gateway_ref: None,
            port_offset: 10000,
        }
    }
}

impl GatewayConfig {
    /// Parsed `gateway_ref`, if configured.
    pub fn gateway_ref(&self) -> Option<NamespacedName> {
        self.gateway_ref.as_deref().and_then(NamespacedName::parse)
    }
}

/// Upstream cluster defaults
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(default)]
pub struct ClusterConfig {
    /// Connect timeout as a Go duration string
    #[validate(length(min = 1, message = "Connect timeout cannot be empty"))]
    pub connect_timeout: String,

    /// DNS lookup family for ExternalName services (`auto`, `v4`, `v6`, `all`)
    #[validate(length(min = 1, message = "DNS lookup family cannot be empty"))]
    pub dns_lookup_family: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self { connect_timeout: "2s".to_string(), dns_lookup_family: "auto".to_string() }
    }
}

impl ClusterConfig {
    /// Connect timeout as a Duration, defaulting to two seconds when unparsable.
    pub fn connect_timeout(&self) -> Duration {
        parse_duration(&self.connect_timeout).unwrap_or(Duration::from_secs(2))
    }
}

/// TLS defaults
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TlsConfig {
    /// Minimum TLS version for downstream connections
    pub minimum_protocol_version: String,

    /// `namespace/name` of the Secret served to clients without SNI
    pub fallback_certificate: Option<String>,

    /// `namespace/name` of the Secret Envoy presents to upstreams
    pub envoy_client_certificate: Option<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            minimum_protocol_version: "1.2".to_string(),
            fallback_certificate: None,
            envoy_client_certificate: None,
        }
    }
}

impl TlsConfig {
    pub fn fallback_certificate(&self) -> Option<NamespacedName> {
        self.fallback_certificate.as_deref().and_then(NamespacedName::parse)
    }

    pub fn envoy_client_certificate(&self) -> Option<NamespacedName> {
        self.envoy_client_certificate.as_deref().and_then(NamespacedName::parse)
    }
}

/// HTTPProxy settings
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct HttpProxyConfig {
    /// Namespaces allowed to hold root HTTPProxies; empty allows all
    pub root_namespaces: Vec<String>,
}

/// Graph processors that can be ordered through configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorKind {
    Listener,
    Ingress,
    HttpProxy,
    ExtensionService,
    GatewayApi,
}

impl ProcessorKind {
    pub fn default_order() -> &'static [ProcessorKind] {
        &[
            ProcessorKind::Listener,
            ProcessorKind::Ingress,
            ProcessorKind::HttpProxy,
            ProcessorKind::ExtensionService,
            ProcessorKind::GatewayApi,
        ]
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "listener" => Some(Self::Listener),
            "ingress" => Some(Self::Ingress),
            "httpproxy" => Some(Self::HttpProxy),
            "extensionservice" => Some(Self::ExtensionService),
            "gatewayapi" => Some(Self::GatewayApi),
            _ => None,
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Enable the Prometheus metrics exporter
    pub enable_metrics: bool,

    /// Metrics exporter port (0 disables the listener)
    pub metrics_port: u16,

    /// Service name used as a global metrics label
    #[validate(length(min = 1, message = "Service name cannot be empty"))]
    pub service_name: String,

    /// Log level filter used when `RUST_LOG` is unset
    #[validate(length(min = 1, message = "Log level cannot be empty"))]
    pub log_level: String,

    /// Enable JSON structured logging
    pub json_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            metrics_port: 8000,
            service_name: "gangway".to_string(),
            log_level: "info".to_string(),
            json_logging: false,
        }
    }
}

impl ObservabilityConfig {
    /// Get metrics bind address (None if disabled)
    pub fn metrics_bind_address(&self) -> Option<String> {
        if self.metrics_port == 0 {
            None
        } else {
            Some(format!("0.0.0.0:{}", self.metrics_port))
        }
    }
}
