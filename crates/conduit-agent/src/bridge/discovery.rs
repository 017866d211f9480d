//! One-shot capability discovery with bounded retry.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use conduit_core::{ControlMessage, FrameWriter, RequestCorrelator};

use crate::telemetry::TelemetryRecorder;

pub const DISCOVER_METHOD: &str = "rpc.discover";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Deadline for each `rpc.discover` call.
    pub attempt_timeout: Duration,
}

impl Default for DiscoveryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

/// Ask the endpoint for its schema and announce it on the control plane.
///
/// Retries until one call succeeds or the endpoint disconnects. Cancelled by
/// aborting the task.
pub async fn discover(
    endpoint: Arc<RequestCorrelator>,
    control: Arc<FrameWriter>,
    telemetry: Arc<TelemetryRecorder>,
    policy: DiscoveryPolicy,
) {
    let mut delay = policy.initial_backoff;
    loop {
        match endpoint
            .call_method(DISCOVER_METHOD, json!([]), policy.attempt_timeout)
            .await
        {
            Ok(schema) => {
                telemetry.record_discover_success();
                match control.send(ControlMessage::encode_discover(&schema)).await {
                    Ok(()) => info!("Published endpoint schema"),
                    Err(e) => warn!(error = %e, "Failed to publish endpoint schema"),
                }
                return;
            }
            Err(e) if e.is_disconnect() => {
                debug!(error = %e, "Discovery stopped, endpoint disconnected");
                return;
            }
            Err(e) => {
                telemetry.record_discover_failure(&e);
                warn!(
                    error = %e,
                    retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Discovery failed"
                );
                sleep(delay).await;
                delay = delay.saturating_mul(2).min(policy.max_backoff);
            }
        }
    }
}
