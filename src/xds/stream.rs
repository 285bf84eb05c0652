//! State-of-the-world ADS stream loop.
//!
//! One task per stream multiplexes Envoy's requests with snapshot cache
//! notifications:
//!
//! - a request for a type gets the current resources of that type;
//! - a request echoing the latest nonce with unchanged resource names is an
//!   ACK (or a NACK, which is logged) and gets no response;
//! - a new generation of a subscribed type is pushed unprompted.

use std::collections::HashMap;
use std::sync::Arc;

use envoy_types::pb::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::Status;
use tracing::{debug, info, warn};

use super::{ResourceType, SnapshotCache};
use crate::observability::MetricsRecorder;

const RESPONSE_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
struct LastSent {
    version: String,
    nonce: String,
}

#[derive(Debug, Default)]
struct Subscription {
    names: Vec<String>,
    last_sent: Option<LastSent>,
}

#[derive(Debug, Default)]
struct StreamState {
    node_id: String,
    subscriptions: HashMap<ResourceType, Subscription>,
}

impl StreamState {
    fn handle_request(
        &mut self,
        cache: &SnapshotCache,
        metrics: &MetricsRecorder,
        request: DiscoveryRequest,
    ) -> Option<DiscoveryResponse> {
        if self.node_id.is_empty() {
            if let Some(node) = &request.node {
                self.node_id = node.id.clone();
            }
        }
        let span = crate::xds_span!("discovery_request", self.node_id, type_url = %request.type_url);
        let _enter = span.enter();

        let Some(resource_type) = ResourceType::from_type_url(&request.type_url) else {
            debug!(type_url = %request.type_url, "Ignoring request for unsupported resource type");
            return None;
        };
        let current_version = cache.version(resource_type);
        let subscription = self.subscriptions.entry(resource_type).or_default();
        let names_changed = subscription.names != request.resource_names;
        subscription.names = request.resource_names;

        if !request.response_nonce.is_empty() {
            match &request.error_detail {
                Some(error) => {
                    metrics.record_xds_request(&request.type_url, false);
                    warn!(
                        type_url = %request.type_url,
                        nonce = %request.response_nonce,
                        error_code = error.code,
                        error_message = %error.message,
                        "[NACK] Envoy rejected previous response"
                    );
                }
                None => metrics.record_xds_request(&request.type_url, true),
            }
        }

        if let Some(last) = &subscription.last_sent {
            if !request.response_nonce.is_empty() && request.response_nonce != last.nonce {
                debug!(nonce = %request.response_nonce, latest = %last.nonce, "Ignoring stale nonce");
                return None;
            }
            // Rejected generations are not resent; the next one will be pushed.
            if request.response_nonce == last.nonce
                && !names_changed
                && last.version == current_version
            {
                debug!(
                    type_url = %request.type_url,
                    version = %request.version_info,
                    nonce = %request.response_nonce,
                    "[ACK] Skipping duplicate discovery request"
                );
                return None;
            }
        }
        Some(Self::respond(cache, resource_type, subscription))
    }

    /// Response for a new generation, if the stream subscribed to the type and
    /// has not seen it yet.
    fn push(&mut self, cache: &SnapshotCache, resource_type: ResourceType) -> Option<DiscoveryResponse> {
        let subscription = self.subscriptions.get_mut(&resource_type)?;
        let current = cache.version(resource_type);
        if subscription.last_sent.as_ref().is_some_and(|last| last.version == current) {
            return None;
        }
        Some(Self::respond(cache, resource_type, subscription))
    }

    fn respond(
        cache: &SnapshotCache,
        resource_type: ResourceType,
        subscription: &mut Subscription,
    ) -> DiscoveryResponse {
        let response = cache.query(resource_type, &subscription.names);
        subscription.last_sent =
            Some(LastSent { version: response.version_info.clone(), nonce: response.nonce.clone() });
        debug!(
            type_url = %response.type_url,
            version = %response.version_info,
            resource_count = response.resources.len(),
            "Sending discovery response"
        );
        response
    }
}

/// Run the ADS loop for one stream; responses come out of the returned
/// stream. The loop ends when the client goes away or `shutdown` flips.
pub(crate) fn run_stream_loop<S>(
    cache: Arc<SnapshotCache>,
    mut in_stream: S,
    metrics: MetricsRecorder,
    mut shutdown: watch::Receiver<bool>,
) -> ReceiverStream<Result<DiscoveryResponse, Status>>
where
    S: Stream<Item = Result<DiscoveryRequest, Status>> + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);
    let mut update_rx = cache.subscribe();

    tokio::spawn(async move {
        metrics.record_xds_connection(true);
        let mut state = StreamState::default();
        loop {
            let responses: Vec<DiscoveryResponse> = tokio::select! {
                request = in_stream.next() => match request {
                    Some(Ok(request)) => {
                        state.handle_request(&cache, &metrics, request).into_iter().collect()
                    }
                    Some(Err(status)) => {
                        warn!(node_id = %state.node_id, error = %status, "Error receiving discovery request");
                        break;
                    }
                    None => {
                        info!(node_id = %state.node_id, "ADS stream ended by client");
                        break;
                    }
                },
                update = update_rx.recv() => match update {
                    Ok(update) => state.push(&cache, update.resource_type).into_iter().collect(),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(node_id = %state.node_id, skipped, "Missed snapshot notifications, resyncing");
                        ResourceType::ALL
                            .into_iter()
                            .filter_map(|t| state.push(&cache, t))
                            .collect()
                    }
                    Err(RecvError::Closed) => {
                        warn!(node_id = %state.node_id, "Snapshot notification channel closed");
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    info!(node_id = %state.node_id, "Shutting down ADS stream");
                    break;
                }
            };
            for response in responses {
                if tx.send(Ok(response)).await.is_err() {
                    debug!(node_id = %state.node_id, "Discovery response receiver dropped");
                    metrics.record_xds_connection(false);
                    return;
                }
            }
        }
        metrics.record_xds_connection(false);
    });

    ReceiverStream::new(rx)
}
