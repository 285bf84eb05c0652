//! # Structured Logging
//!
//! Provides the tracing subscriber setup and span macros used across the
//! rebuild pipeline and the xDS server.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;
use crate::errors::{Error, Result};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level when set. Calling this twice
/// returns an error from the second call rather than panicking.
pub fn init_logging(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| Error::config(format!("Invalid log level '{}': {}", config.log_level, e)))?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.json_logging {
        registry.with(fmt::layer().json().with_current_span(true)).try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };

    result.map_err(|e| Error::internal(format!("Failed to install tracing subscriber: {}", e)))
}

/// Create a tracing span for one graph rebuild
#[macro_export]
macro_rules! rebuild_span {
    ($trigger:expr) => {
        tracing::info_span!(
            "dag_rebuild",
            trigger = %$trigger,
            rebuild_id = %uuid::Uuid::new_v4()
        )
    };
    ($trigger:expr, $($field:tt)*) => {
        tracing::info_span!(
            "dag_rebuild",
            trigger = %$trigger,
            rebuild_id = %uuid::Uuid::new_v4(),
            $($field)*
        )
    };
}

/// Create a tracing span for xDS operations
#[macro_export]
macro_rules! xds_span {
    ($operation:expr, $node_id:expr) => {
        tracing::info_span!(
            "xds_operation",
            operation = %$operation,
            node_id = %$node_id,
            operation_id = %uuid::Uuid::new_v4()
        )
    };
    ($operation:expr, $node_id:expr, $($field:tt)*) => {
        tracing::info_span!(
            "xds_operation",
            operation = %$operation,
            node_id = %$node_id,
            operation_id = %uuid::Uuid::new_v4(),
            $($field)*
        )
    };
}

/// Log configuration at startup
pub fn log_config_info(config: &crate::config::Config) {
    tracing::info!(
        xds_address = %config.xds.bind_address(),
        http_port = config.listener.http_port,
        https_port = config.listener.https_port,
        ingress_classes = ?config.ingress.class_names,
        gateway_controller = %config.gateway.controller_name,
        gateway_ref = ?config.gateway.gateway_ref,
        processors = ?config.processor_order(),
        metrics_enabled = %config.observability.enable_metrics,
        "gangway control plane configuration"
    );
}
