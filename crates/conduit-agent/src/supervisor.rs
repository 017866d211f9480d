//! Dial, bridge, back off, repeat.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use conduit_core::{CloseReason, Transport};

use crate::backoff::BackoffState;
use crate::bridge::{BridgeSession, BridgeSettings};
use crate::config::ReconnectPolicy;
use crate::dial::{DialTarget, Dialer};
use crate::error::SessionError;
use crate::telemetry::TelemetryRecorder;

/// How a session ended without failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stopped {
    /// Shutdown arrived while a dial was in progress.
    WhileDialing,
    /// Shutdown arrived while the bridge was up.
    WhileBridging,
}

/// Keeps one bridge alive, reconnecting with backoff until shutdown.
pub struct ReconnectSupervisor {
    dialer: Arc<dyn Dialer>,
    policy: ReconnectPolicy,
    bridge: BridgeSettings,
    telemetry: Arc<TelemetryRecorder>,
}

impl ReconnectSupervisor {
    pub fn new(
        dialer: Arc<dyn Dialer>,
        policy: ReconnectPolicy,
        bridge: BridgeSettings,
        telemetry: Arc<TelemetryRecorder>,
    ) -> Self {
        Self {
            dialer,
            policy: policy.normalized(),
            bridge,
            telemetry,
        }
    }

    /// Run sessions until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = BackoffState::new(&self.policy);

        loop {
            if *shutdown.borrow() {
                info!("Agent shutting down");
                return;
            }

            self.telemetry.record_session_start();
            let started = Instant::now();
            match self.run_session(&mut shutdown).await {
                Ok(Stopped::WhileBridging) => {
                    self.telemetry.record_session_success(started.elapsed());
                    info!("Agent shutting down");
                    return;
                }
                Ok(Stopped::WhileDialing) => {
                    info!("Agent shutting down during dial");
                    return;
                }
                Err(e) => {
                    self.telemetry.record_session_failure(started.elapsed(), &e);

                    if e.bridged_for() > self.policy.stable_after {
                        backoff.reset();
                    }

                    let delay = backoff.delay_with_jitter();
                    warn!(
                        error = %e,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Session failed, reconnecting"
                    );

                    tokio::select! {
                        () = sleep(delay) => {}
                        _ = shutdown.wait_for(|stop| *stop) => {
                            info!("Agent shutting down during reconnect wait");
                            return;
                        }
                    }

                    backoff.advance();
                }
            }
        }
    }

    /// Dial the control plane, then the endpoint, then bridge them.
    async fn run_session(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Stopped, SessionError> {
        let Some(control) = self.dial(DialTarget::Control, shutdown).await? else {
            return Ok(Stopped::WhileDialing);
        };
        let endpoint = match self.dial(DialTarget::Endpoint, shutdown).await {
            Ok(Some(endpoint)) => endpoint,
            Ok(None) => {
                close_quietly(control).await;
                return Ok(Stopped::WhileDialing);
            }
            Err(e) => {
                close_quietly(control).await;
                return Err(e);
            }
        };

        let bridged_at = Instant::now();
        BridgeSession::new(control, endpoint, &self.bridge, Arc::clone(&self.telemetry))
            .run(shutdown)
            .await
            .map(|()| Stopped::WhileBridging)
            .map_err(|source| SessionError::Bridge {
                bridged_for: bridged_at.elapsed(),
                source,
            })
    }

    /// `Ok(None)` when shutdown interrupted the dial.
    async fn dial(
        &self,
        target: DialTarget,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<Transport>, SessionError> {
        let started = Instant::now();
        let result = tokio::select! {
            result = self.dialer.dial(target) => result,
            _ = shutdown.wait_for(|stop| *stop) => return Ok(None),
        };
        match result {
            Ok(transport) => {
                let latency = started.elapsed();
                self.telemetry.record_dial_success(target, latency);
                debug!(%target, latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX), "Dialed");
                Ok(Some(transport))
            }
            Err(source) => {
                self.telemetry.record_dial_failure(target, &source);
                Err(SessionError::Dial { target, source })
            }
        }
    }
}

async fn close_quietly(transport: Transport) {
    let mut sink = transport.sink;
    if timeout(Duration::from_secs(5), sink.close(CloseReason::Normal))
        .await
        .is_err()
    {
        debug!("Close handshake timed out");
    }
}
