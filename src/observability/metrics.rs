//! # Metrics Collection
//!
//! Prometheus metrics for the rebuild pipeline, the snapshot cache and the
//! xDS server. Recording is a no-op until [`init_metrics`] installs the
//! exporter, so library users and tests can call the helpers freely.

use std::net::SocketAddr;

use ::tracing::{info, warn};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::config::ObservabilityConfig;
use crate::errors::{Error, Result};

/// Metrics recorder that tracks control plane metrics
#[derive(Debug, Clone, Default)]
pub struct MetricsRecorder;

impl MetricsRecorder {
    /// Create a new metrics recorder instance
    pub fn new() -> Self {
        Self
    }

    /// Record a store mutation and whether it triggered a rebuild
    pub fn record_event(&self, operation: &str, kind: &str, triggered_rebuild: bool) {
        let outcome = if triggered_rebuild { "rebuild" } else { "skipped" };
        let labels = [
            ("operation", operation.to_string()),
            ("kind", kind.to_string()),
            ("outcome", outcome.to_string()),
        ];
        counter!("gangway_events_total", &labels).increment(1);
    }

    /// Record a completed graph rebuild
    pub fn record_rebuild(&self, duration_seconds: f64, invalid_objects: usize) {
        counter!("gangway_rebuilds_total").increment(1);
        histogram!("gangway_rebuild_duration_seconds").record(duration_seconds);
        gauge!("gangway_invalid_objects").set(invalid_objects as f64);
    }

    /// Record a snapshot generation published for a resource type
    pub fn record_snapshot(&self, type_url: &str, version: u64, resource_count: usize) {
        let labels = [("type_url", type_url.to_string())];
        gauge!("gangway_snapshot_version", &labels).set(version as f64);
        gauge!("gangway_snapshot_resources", &labels).set(resource_count as f64);
        counter!("gangway_snapshot_updates_total", &labels).increment(1);
    }

    /// Record an xDS stream connection event
    pub fn record_xds_connection(&self, connected: bool) {
        if connected {
            gauge!("gangway_xds_streams").increment(1.0);
        } else {
            gauge!("gangway_xds_streams").decrement(1.0);
        }
    }

    /// Record an xDS request/response outcome
    pub fn record_xds_request(&self, type_url: &str, ack: bool) {
        let status = if ack { "ack" } else { "nack" };
        let labels = [("type_url", type_url.to_string()), ("status", status.to_string())];
        counter!("gangway_xds_requests_total", &labels).increment(1);
    }

    fn describe(&self) {
        describe_counter!(
            "gangway_events_total",
            Unit::Count,
            "Kubernetes object events processed by the resource store"
        );
        describe_counter!("gangway_rebuilds_total", Unit::Count, "Completed graph rebuilds");
        describe_histogram!(
            "gangway_rebuild_duration_seconds",
            Unit::Seconds,
            "Time spent building and translating the graph"
        );
        describe_gauge!(
            "gangway_invalid_objects",
            Unit::Count,
            "Objects reported invalid by the last rebuild"
        );
        describe_gauge!(
            "gangway_snapshot_version",
            Unit::Count,
            "Current snapshot version per xDS resource type"
        );
        describe_gauge!(
            "gangway_snapshot_resources",
            Unit::Count,
            "Resources in the current snapshot per xDS resource type"
        );
        describe_counter!(
            "gangway_snapshot_updates_total",
            Unit::Count,
            "Snapshot generations published per xDS resource type"
        );
        describe_gauge!("gangway_xds_streams", Unit::Count, "Open ADS streams");
        describe_counter!(
            "gangway_xds_requests_total",
            Unit::Count,
            "Discovery requests received, by ACK/NACK"
        );
    }
}

/// Initialize metrics collection and the Prometheus exporter
pub fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    if !config.enable_metrics {
        return Ok(());
    }

    let metrics_addr = match config.metrics_bind_address() {
        Some(addr) => addr,
        None => {
            warn!("Metrics disabled: no bind address configured");
            return Ok(());
        }
    };

    let socket_addr: SocketAddr = metrics_addr.parse().map_err(|e| {
        Error::config(format!("Invalid metrics bind address '{}': {}", metrics_addr, e))
    })?;

    PrometheusBuilder::new()
        .with_http_listener(socket_addr)
        .add_global_label("service", &config.service_name)
        .install()
        .map_err(|e| Error::config(format!("Failed to initialize metrics exporter: {}", e)))?;

    MetricsRecorder::new().describe();

    info!(
        metrics_addr = %metrics_addr,
        service_name = %config.service_name,
        "Metrics collection initialized"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_exporter_is_noop() {
        let recorder = MetricsRecorder::new();
        recorder.record_event("add", "Service", false);
        recorder.record_rebuild(0.01, 2);
        recorder.record_snapshot("type.googleapis.com/envoy.config.cluster.v3.Cluster", 3, 1);
        recorder.record_xds_connection(true);
        recorder.record_xds_request("type.googleapis.com/envoy.config.cluster.v3.Cluster", true);
    }

    #[test]
    fn test_disabled_metrics_skip_exporter() {
        let config = ObservabilityConfig { enable_metrics: false, ..Default::default() };
        assert!(init_metrics(&config).is_ok());
    }
}
