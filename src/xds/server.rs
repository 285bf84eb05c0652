//! gRPC aggregated discovery service.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use envoy_types::pb::envoy::service::discovery::v3::{
    aggregated_discovery_service_server::{
        AggregatedDiscoveryService, AggregatedDiscoveryServiceServer,
    },
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};
use tokio::sync::watch;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::info;

use super::stream::run_stream_loop;
use super::SnapshotCache;
use crate::errors::{Error, Result};
use crate::observability::MetricsRecorder;

/// ADS over the snapshot cache. Clones share the cache and the shutdown
/// signal.
#[derive(Debug, Clone)]
pub struct DiscoveryServer {
    cache: Arc<SnapshotCache>,
    metrics: MetricsRecorder,
    shutdown: Arc<watch::Sender<bool>>,
}

impl DiscoveryServer {
    pub fn new(cache: Arc<SnapshotCache>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self { cache, metrics: MetricsRecorder::new(), shutdown: Arc::new(shutdown) }
    }

    /// End every open stream.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn into_service(self) -> AggregatedDiscoveryServiceServer<Self> {
        AggregatedDiscoveryServiceServer::new(self)
    }
}

#[tonic::async_trait]
impl AggregatedDiscoveryService for DiscoveryServer {
    type StreamAggregatedResourcesStream = ReceiverStream<std::result::Result<DiscoveryResponse, Status>>;
    type DeltaAggregatedResourcesStream =
        Pin<Box<dyn Stream<Item = std::result::Result<DeltaDiscoveryResponse, Status>> + Send>>;

    async fn stream_aggregated_resources(
        &self,
        request: Request<tonic::Streaming<DiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        info!(remote_addr = ?request.remote_addr(), "New ADS stream connection established");
        Ok(Response::new(run_stream_loop(
            self.cache.clone(),
            request.into_inner(),
            self.metrics.clone(),
            self.shutdown.subscribe(),
        )))
    }

    async fn delta_aggregated_resources(
        &self,
        _request: Request<tonic::Streaming<DeltaDiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
        Err(Status::unimplemented("delta xDS is not supported, use state-of-the-world ADS"))
    }
}

/// Serve ADS on `bind_address` until `shutdown_signal` resolves.
pub async fn serve<F>(bind_address: &str, cache: Arc<SnapshotCache>, shutdown_signal: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr: SocketAddr = bind_address
        .parse()
        .map_err(|e| Error::config(format!("Invalid xDS address '{}': {}", bind_address, e)))?;

    let server = DiscoveryServer::new(cache);
    let streams = server.clone();
    let signal = async move {
        shutdown_signal.await;
        info!("Shutdown requested, closing ADS streams");
        streams.shutdown();
    };

    info!(address = %addr, "Starting xDS server");
    Server::builder()
        .add_service(server.into_service())
        .serve_with_shutdown(addr, signal)
        .await
        .map_err(|e| {
            let message = e.to_string();
            if message.contains("Address already in use") || message.contains("bind") {
                Error::transport(format!(
                    "xDS server failed to bind to {}: port {} is already in use",
                    addr,
                    addr.port()
                ))
            } else {
                Error::transport(format!("xDS server failed: {}", e))
            }
        })
}
