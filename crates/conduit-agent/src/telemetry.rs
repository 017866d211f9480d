//! Cumulative agent counters and periodic snapshot logging.
//!
//! Counters only ever grow; `last_error` and `last_session_duration` are
//! overwritten. A reporter task logs one structured snapshot per interval and
//! a final one on shutdown.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::dial::DialTarget;

/// Direction of a relayed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ControlToEndpoint,
    EndpointToControl,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DialStats {
    pub success_total: u64,
    pub failure_total: u64,
    pub last_latency_ms: Option<u64>,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TelemetrySnapshot {
    pub sessions_total: u64,
    pub session_successes_total: u64,
    pub session_failures_total: u64,
    pub bridges_established_total: u64,
    pub dial: BTreeMap<&'static str, DialStats>,
    pub discover_success_total: u64,
    pub discover_failures_total: u64,
    pub frames_control_to_endpoint: u64,
    pub frames_endpoint_to_control: u64,
    pub last_error: Option<String>,
    pub last_session_duration_ms: Option<u64>,
}

/// Thread-safe recorder shared by the supervisor, sessions and discovery.
#[derive(Debug, Default)]
pub struct TelemetryRecorder {
    counters: Mutex<TelemetrySnapshot>,
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl TelemetryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self) -> MutexGuard<'_, TelemetrySnapshot> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_session_start(&self) {
        self.counters().sessions_total += 1;
    }

    pub fn record_session_success(&self, duration: Duration) {
        let mut c = self.counters();
        c.session_successes_total += 1;
        c.last_session_duration_ms = Some(millis(duration));
    }

    pub fn record_session_failure(&self, duration: Duration, error: &dyn std::fmt::Display) {
        let mut c = self.counters();
        c.session_failures_total += 1;
        c.last_session_duration_ms = Some(millis(duration));
        c.last_error = Some(error.to_string());
    }

    pub fn record_dial_success(&self, target: DialTarget, latency: Duration) {
        let mut c = self.counters();
        let stats = c.dial.entry(target.as_str()).or_default();
        stats.success_total += 1;
        stats.last_latency_ms = Some(millis(latency));
    }

    pub fn record_dial_failure(&self, target: DialTarget, error: &dyn std::fmt::Display) {
        let mut c = self.counters();
        c.dial.entry(target.as_str()).or_default().failure_total += 1;
        c.last_error = Some(format!("{target}: {error}"));
    }

    pub fn record_bridge_established(&self) {
        self.counters().bridges_established_total += 1;
    }

    pub fn record_discover_success(&self) {
        self.counters().discover_success_total += 1;
    }

    pub fn record_discover_failure(&self, error: &dyn std::fmt::Display) {
        let mut c = self.counters();
        c.discover_failures_total += 1;
        c.last_error = Some(format!("discover: {error}"));
    }

    pub fn record_forwarded(&self, direction: Direction) {
        let mut c = self.counters();
        match direction {
            Direction::ControlToEndpoint => c.frames_control_to_endpoint += 1,
            Direction::EndpointToControl => c.frames_endpoint_to_control += 1,
        }
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.counters().clone()
    }

    /// Log the current snapshot as one event.
    pub fn log_snapshot(&self, last: bool) {
        let snap = self.snapshot();
        let dial = serde_json::to_string(&snap.dial).unwrap_or_default();
        info!(
            sessions_total = snap.sessions_total,
            session_successes_total = snap.session_successes_total,
            session_failures_total = snap.session_failures_total,
            bridges_established_total = snap.bridges_established_total,
            discover_success_total = snap.discover_success_total,
            discover_failures_total = snap.discover_failures_total,
            frames_control_to_endpoint = snap.frames_control_to_endpoint,
            frames_endpoint_to_control = snap.frames_endpoint_to_control,
            dial = %dial,
            last_error = snap.last_error.as_deref().unwrap_or(""),
            last_session_duration_ms = snap.last_session_duration_ms,
            final_snapshot = last,
            "Agent telemetry"
        );
    }

    /// Log a snapshot every `interval` until `shutdown` flips, then log a final one.
    pub fn spawn_reporter(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let recorder = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick is immediate
            loop {
                tokio::select! {
                    _ = ticker.tick() => recorder.log_snapshot(false),
                    _ = shutdown.wait_for(|stop| *stop) => break,
                }
            }
            recorder.log_snapshot(true);
        })
    }
}
