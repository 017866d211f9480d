//! Request/response correlation over a duplex transport.
//!
//! Each outgoing call registers a single-delivery slot keyed by the
//! correlation key of its id. The owner's read loop hands every response to
//! [`RequestCorrelator::resolve`]; the first delivery for a key wins and later
//! ones are dropped. [`RequestCorrelator::fail_all`] is called on teardown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::debug;

use crate::error::CallError;
use crate::frame::{self, Frame, PROTOCOL_VERSION};
use crate::transport::FrameWriter;

struct Slot {
    seq: u64,
    tx: oneshot::Sender<String>,
}

#[derive(Default)]
struct PendingTable {
    closed: bool,
    slots: HashMap<String, Slot>,
}

/// Matches outgoing calls to their responses.
pub struct RequestCorrelator {
    writer: Arc<FrameWriter>,
    pending: Mutex<PendingTable>,
    next_seq: AtomicU64,
    id_prefix: String,
}

/// Removes a caller's slot when its call ends, however it ends.
struct SlotGuard<'a> {
    correlator: &'a RequestCorrelator,
    key: String,
    seq: u64,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut table = self.correlator.table();
        if table.slots.get(&self.key).is_some_and(|s| s.seq == self.seq) {
            table.slots.remove(&self.key);
        }
    }
}

impl RequestCorrelator {
    pub fn new(writer: Arc<FrameWriter>) -> Self {
        Self::with_id_prefix(writer, "")
    }

    /// Generated ids are `prefix` followed by a UUID, keeping them apart from
    /// ids chosen by other parties on the same connection.
    pub fn with_id_prefix(writer: Arc<FrameWriter>, prefix: impl Into<String>) -> Self {
        Self {
            writer,
            pending: Mutex::new(PendingTable::default()),
            next_seq: AtomicU64::new(0),
            id_prefix: prefix.into(),
        }
    }

    fn table(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Writer this correlator sends through.
    pub fn writer(&self) -> &Arc<FrameWriter> {
        &self.writer
    }

    /// Issue `frame` and wait up to `deadline` for its response.
    ///
    /// A caller-supplied id is used verbatim; otherwise a unique one is
    /// generated. Returns the raw text of the matching response.
    pub async fn issue(&self, mut request: Frame, deadline: Duration) -> Result<String, CallError> {
        if request.protocol_version.is_empty() {
            request.protocol_version = PROTOCOL_VERSION.to_string();
        }
        let id = request.id.get_or_insert_with(|| {
            Value::String(format!("{}{}", self.id_prefix, uuid::Uuid::new_v4()))
        });
        let key = frame::correlation_key(id);
        let payload = serde_json::to_string(&request).map_err(CallError::Encode)?;

        let (guard, rx) = self.register(key)?;

        self.writer.send(payload).await.map_err(CallError::Send)?;

        match timeout(deadline, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(CallError::Disconnected),
            Err(_) => {
                debug!(id = %guard.key, "Call timed out");
                Err(CallError::Timeout(deadline))
            }
        }
    }

    /// Issue a request for `method` and decode its result.
    ///
    /// A response carrying an `error` member becomes [`CallError::Remote`].
    pub async fn call_method(
        &self,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value, CallError> {
        let request = Frame {
            method: Some(method.to_string()),
            params: Some(params),
            ..Default::default()
        };
        let raw = self.issue(request, deadline).await?;
        let response: Frame = serde_json::from_str(&raw)
            .map_err(|e| CallError::InvalidResponse(e.into()))?;
        if let Some(error) = response.error {
            return Err(CallError::Remote {
                code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .map_or_else(|| error.to_string(), str::to_string),
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    fn register(&self, key: String) -> Result<(SlotGuard<'_>, oneshot::Receiver<String>), CallError> {
        let mut table = self.table();
        if table.closed {
            return Err(CallError::Disconnected);
        }
        if table.slots.contains_key(&key) {
            return Err(CallError::DuplicateId(key));
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        table.slots.insert(key.clone(), Slot { seq, tx });
        Ok((
            SlotGuard {
                correlator: self,
                key,
                seq,
            },
            rx,
        ))
    }

    /// Deliver `payload` to the call waiting on `key`.
    ///
    /// Returns `false` when no call is waiting (late or duplicate response).
    pub fn resolve(&self, key: &str, payload: String) -> bool {
        let slot = self.table().slots.remove(key);
        slot.is_some_and(|slot| slot.tx.send(payload).is_ok())
    }

    /// Whether a call is waiting on `key`.
    pub fn is_pending(&self, key: &str) -> bool {
        self.table().slots.contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.table().slots.len()
    }

    /// Fail every outstanding call with [`CallError::Disconnected`] and reject
    /// calls issued afterwards. Returns the number of calls failed.
    pub fn fail_all(&self) -> usize {
        let mut table = self.table();
        table.closed = true;
        let failed = table.slots.len();
        table.slots.clear();
        failed
    }
}
