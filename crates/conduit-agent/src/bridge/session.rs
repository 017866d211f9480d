//! A live bridge between the control plane and the management endpoint.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info};

use conduit_core::frame::{self, FrameKind, Inbound};
use conduit_core::{CloseReason, FrameSource, FrameWriter, RequestCorrelator, Transport};

use super::discovery::{self, DiscoveryPolicy};
use crate::dial::DialTarget;
use crate::error::BridgeError;
use crate::telemetry::{Direction, TelemetryRecorder};

/// Prefix of ids the agent generates for its own calls to the endpoint.
pub const AGENT_ID_PREFIX: &str = "agent:";

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub write_timeout: Duration,
    pub discovery: DiscoveryPolicy,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(10),
            discovery: DiscoveryPolicy::default(),
        }
    }
}

/// Pipes frames both ways until either side fails or shutdown is requested.
///
/// Control frames go to the endpoint untouched. Endpoint frames answering one
/// of the agent's own calls are consumed; everything else goes to the control
/// plane untouched.
pub struct BridgeSession {
    control: Arc<FrameWriter>,
    control_source: Box<dyn FrameSource>,
    endpoint: Arc<RequestCorrelator>,
    endpoint_source: Box<dyn FrameSource>,
    telemetry: Arc<TelemetryRecorder>,
    discovery: DiscoveryPolicy,
}

impl BridgeSession {
    pub fn new(
        control: Transport,
        endpoint: Transport,
        settings: &BridgeSettings,
        telemetry: Arc<TelemetryRecorder>,
    ) -> Self {
        let endpoint_writer = Arc::new(FrameWriter::new(endpoint.sink, settings.write_timeout));
        Self {
            control: Arc::new(FrameWriter::new(control.sink, settings.write_timeout)),
            control_source: control.source,
            endpoint: Arc::new(RequestCorrelator::with_id_prefix(
                endpoint_writer,
                AGENT_ID_PREFIX,
            )),
            endpoint_source: endpoint.source,
            telemetry,
            discovery: settings.discovery.clone(),
        }
    }

    /// Run until a pipe fails (`Err`) or `shutdown` flips (`Ok`).
    ///
    /// Either way every pending agent call fails, both transports are closed
    /// and discovery is cancelled before this returns.
    pub async fn run(self, shutdown: &mut watch::Receiver<bool>) -> Result<(), BridgeError> {
        let Self {
            control,
            control_source,
            endpoint,
            endpoint_source,
            telemetry,
            discovery: policy,
        } = self;

        telemetry.record_bridge_established();
        info!("Bridge established");

        let mut pipes = JoinSet::new();
        pipes.spawn(pump_control(
            control_source,
            Arc::clone(endpoint.writer()),
            Arc::clone(&telemetry),
        ));
        pipes.spawn(pump_endpoint(
            endpoint_source,
            Arc::clone(&endpoint),
            Arc::clone(&control),
            Arc::clone(&telemetry),
        ));
        let discovery_task = tokio::spawn(discovery::discover(
            Arc::clone(&endpoint),
            Arc::clone(&control),
            telemetry,
            policy,
        ));

        let result = tokio::select! {
            Some(joined) = pipes.join_next() => Err(match joined {
                Ok(e) => e,
                Err(e) => BridgeError::Task(e.to_string()),
            }),
            _ = shutdown.wait_for(|stop| *stop) => Ok(()),
        };

        discovery_task.abort();
        pipes.abort_all();
        let failed = endpoint.fail_all();
        let reason = match &result {
            Ok(()) | Err(BridgeError::Closed(_)) => CloseReason::Normal,
            Err(BridgeError::Read { .. } | BridgeError::Task(_)) => CloseReason::ReadError,
            Err(BridgeError::Write { .. }) => CloseReason::SendFailed,
        };
        tokio::join!(control.close(reason), endpoint.writer().close(reason));
        match &result {
            Ok(()) => info!(failed_calls = failed, "Bridge stopped"),
            Err(e) => info!(error = %e, failed_calls = failed, "Bridge ended"),
        }
        result
    }
}

async fn next_frame(
    source: &mut Box<dyn FrameSource>,
    side: DialTarget,
) -> Result<String, BridgeError> {
    match source.next_text().await {
        Ok(Some(text)) => Ok(text),
        Ok(None) => Err(BridgeError::Closed(side)),
        Err(source) => Err(BridgeError::Read { side, source }),
    }
}

async fn pump_control(
    mut source: Box<dyn FrameSource>,
    endpoint: Arc<FrameWriter>,
    telemetry: Arc<TelemetryRecorder>,
) -> BridgeError {
    loop {
        let text = match next_frame(&mut source, DialTarget::Control).await {
            Ok(text) => text,
            Err(e) => return e,
        };
        if let Err(source) = endpoint.send(text).await {
            return BridgeError::Write {
                side: DialTarget::Endpoint,
                source,
            };
        }
        telemetry.record_forwarded(Direction::ControlToEndpoint);
    }
}

async fn pump_endpoint(
    mut source: Box<dyn FrameSource>,
    correlator: Arc<RequestCorrelator>,
    control: Arc<FrameWriter>,
    telemetry: Arc<TelemetryRecorder>,
) -> BridgeError {
    loop {
        let text = match next_frame(&mut source, DialTarget::Endpoint).await {
            Ok(text) => text,
            Err(e) => return e,
        };
        if let Some(key) = own_response_key(&correlator, &text) {
            correlator.resolve(&key, text);
            continue;
        }
        if let Err(source) = control.send(text).await {
            return BridgeError::Write {
                side: DialTarget::Control,
                source,
            };
        }
        telemetry.record_forwarded(Direction::EndpointToControl);
    }
}

/// Correlation key of `text` when it answers a call the agent is waiting on.
fn own_response_key(correlator: &RequestCorrelator, text: &str) -> Option<String> {
    let frame = match frame::decode(text) {
        Ok(Inbound::Frame(frame)) => frame,
        Ok(Inbound::Control(_)) => return None,
        Err(e) => {
            debug!(error = %e, "Forwarding undecodable endpoint frame");
            return None;
        }
    };
    if !matches!(frame.kind(), Ok(FrameKind::Response)) {
        return None;
    }
    frame
        .correlation_key()
        .filter(|key| correlator.is_pending(key))
}
