//! Registry of agent and viewer connections, keyed by server id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

use conduit_core::{CloseReason, FrameSink, Transport};

use super::management::ManagementConnection;
use super::viewer::ViewerConnection;
use crate::directory::ServerDirectory;

/// Timing knobs for connections owned by the hub.
#[derive(Debug, Clone, Copy)]
pub struct HubSettings {
    /// Deadline for a single write to an agent or viewer.
    pub write_timeout: Duration,
    /// Deadline for delivering one notification to one viewer.
    pub broadcast_timeout: Duration,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(10),
            broadcast_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Default)]
struct HubState {
    agents: HashMap<String, Arc<ManagementConnection>>,
    viewers: HashMap<String, HashMap<u64, Arc<ViewerConnection>>>,
}

struct HubInner {
    state: RwLock<HubState>,
    /// Per-server lock held across a registry change and its directory update.
    turns: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    directory: Arc<dyn ServerDirectory>,
    settings: HubSettings,
    next_viewer_id: AtomicU64,
}

/// Thread-safe hub of live connections.
///
/// Holds at most one current management connection per server id and any
/// number of viewers per server id. Cloning is cheap; every clone refers to
/// the same registry. The registry lock only covers map updates. Socket
/// closes and directory writes happen after it is released, under a
/// per-server turn, so directory updates for one server keep the order of
/// its registry changes.
#[derive(Clone)]
pub struct ConnectionHub {
    inner: Arc<HubInner>,
}

impl ConnectionHub {
    pub fn new(directory: Arc<dyn ServerDirectory>, settings: HubSettings) -> Self {
        Self {
            inner: Arc::new(HubInner {
                state: RwLock::new(HubState::default()),
                turns: Mutex::new(HashMap::new()),
                directory,
                settings,
                next_viewer_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn directory(&self) -> &Arc<dyn ServerDirectory> {
        &self.inner.directory
    }

    async fn server_turn(&self, server_id: &str) -> OwnedMutexGuard<()> {
        let turn = self
            .inner
            .turns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(server_id.to_string())
            .or_default()
            .clone();
        turn.lock_owned().await
    }

    /// Install a management connection for `server_id` and start its read loop.
    ///
    /// An existing connection for the same id is closed as superseded before
    /// the new one becomes current.
    pub async fn register_management(
        &self,
        server_id: &str,
        transport: Transport,
    ) -> Arc<ManagementConnection> {
        let Transport { sink, source } = transport;
        let conn = Arc::new(ManagementConnection::new(
            server_id.to_string(),
            sink,
            self.inner.settings.write_timeout,
        ));

        let turn = self.server_turn(server_id).await;
        let previous = self
            .inner
            .state
            .write()
            .await
            .agents
            .insert(server_id.to_string(), Arc::clone(&conn));
        if let Some(previous) = previous {
            info!(server_id = %server_id, "Superseding existing management connection");
            previous.close(CloseReason::Superseded).await;
        }
        if let Err(e) = self.inner.directory.mark_connected(server_id).await {
            warn!(server_id = %server_id, error = %e, "Failed to mark server connected");
        }
        drop(turn);
        info!(server_id = %server_id, "Management connection registered");

        tokio::spawn(Arc::clone(&conn).read_loop(source, self.clone()));
        conn
    }

    /// Current management connection for `server_id`; `None` means the agent
    /// is offline.
    pub async fn lookup_management(&self, server_id: &str) -> Option<Arc<ManagementConnection>> {
        self.inner.state.read().await.agents.get(server_id).cloned()
    }

    pub async fn is_connected(&self, server_id: &str) -> bool {
        self.inner.state.read().await.agents.contains_key(server_id)
    }

    /// Ids of servers with a live agent.
    pub async fn connected_servers(&self) -> Vec<String> {
        self.inner.state.read().await.agents.keys().cloned().collect()
    }

    /// Called by a connection's read loop once it has ended.
    ///
    /// Only deregisters `conn` if it is still current for its server id; a
    /// superseded connection leaves its successor untouched.
    pub(crate) async fn management_closed(&self, conn: &Arc<ManagementConnection>) {
        let server_id = conn.server_id();
        let _turn = self.server_turn(server_id).await;
        {
            let mut state = self.inner.state.write().await;
            let is_current = state
                .agents
                .get(server_id)
                .is_some_and(|current| Arc::ptr_eq(current, conn));
            if !is_current {
                debug!(server_id = %server_id, "Closed connection was already superseded");
                return;
            }
            state.agents.remove(server_id);
        }
        info!(server_id = %server_id, "Management connection unregistered");

        if let Err(e) = self.inner.directory.mark_disconnected(server_id).await {
            warn!(server_id = %server_id, error = %e, "Failed to mark server disconnected");
        }
    }

    /// Add a viewer for `server_id`.
    pub async fn register_viewer(
        &self,
        server_id: &str,
        sink: Box<dyn FrameSink>,
    ) -> Arc<ViewerConnection> {
        let id = self.inner.next_viewer_id.fetch_add(1, Ordering::Relaxed);
        let viewer = Arc::new(ViewerConnection::new(
            id,
            server_id.to_string(),
            sink,
            self.inner.settings.write_timeout,
        ));
        self.inner
            .state
            .write()
            .await
            .viewers
            .entry(server_id.to_string())
            .or_default()
            .insert(id, Arc::clone(&viewer));
        debug!(server_id = %server_id, viewer_id = id, "Viewer registered");
        viewer
    }

    /// Remove a viewer. Returns `false` if it was not registered.
    pub async fn remove_viewer(&self, server_id: &str, viewer_id: u64) -> bool {
        let mut state = self.inner.state.write().await;
        let Some(set) = state.viewers.get_mut(server_id) else {
            return false;
        };
        let removed = set.remove(&viewer_id).is_some();
        if set.is_empty() {
            state.viewers.remove(server_id);
        }
        if removed {
            debug!(server_id = %server_id, viewer_id, "Viewer removed");
        }
        removed
    }

    pub async fn viewer_count(&self, server_id: &str) -> usize {
        self.inner
            .state
            .read()
            .await
            .viewers
            .get(server_id)
            .map_or(0, HashMap::len)
    }

    /// Register a viewer and keep it until its socket closes or a send to it
    /// fails, then remove it. Inbound viewer messages are ignored.
    pub async fn run_viewer(&self, server_id: &str, transport: Transport) {
        let Transport { sink, mut source } = transport;
        let viewer = self.register_viewer(server_id, sink).await;
        loop {
            tokio::select! {
                next = source.next_text() => match next {
                    Ok(Some(_)) => {}
                    Ok(None) => break,
                    Err(e) => {
                        debug!(server_id = %server_id, error = %e, "Viewer read failed");
                        break;
                    }
                },
                () = viewer.closed() => break,
            }
        }
        viewer.close(CloseReason::Normal).await;
        self.remove_viewer(server_id, viewer.id()).await;
    }

    /// Deliver `payload` to every viewer of `server_id`.
    ///
    /// The viewer set is copied out under the lock and sends happen after it
    /// is released. Each viewer gets its own deadline; a viewer whose send
    /// fails is closed and removed without affecting the others. Returns the
    /// number of viewers that received the payload.
    pub async fn broadcast(&self, server_id: &str, payload: &str) -> usize {
        let viewers: Vec<Arc<ViewerConnection>> = {
            let state = self.inner.state.read().await;
            state
                .viewers
                .get(server_id)
                .map(|set| set.values().cloned().collect())
                .unwrap_or_default()
        };
        if viewers.is_empty() {
            return 0;
        }

        let deadline = self.inner.settings.broadcast_timeout;
        let results = join_all(viewers.iter().map(|viewer| async move {
            (viewer, viewer.send(payload.to_string(), deadline).await)
        }))
        .await;

        let mut delivered = 0;
        for (viewer, result) in results {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(
                        server_id = %server_id,
                        viewer_id = viewer.id(),
                        error = %e,
                        "Failed to send to viewer"
                    );
                    viewer.close(CloseReason::SendFailed).await;
                    self.remove_viewer(server_id, viewer.id()).await;
                }
            }
        }
        delivered
    }

    /// Close every connection; used on process shutdown.
    pub async fn shutdown(&self) {
        let (agents, viewers) = {
            let state = self.inner.state.read().await;
            let agents: Vec<_> = state.agents.values().cloned().collect();
            let viewers: Vec<_> = state
                .viewers
                .values()
                .flat_map(|set| set.values().cloned())
                .collect();
            (agents, viewers)
        };
        info!(
            agents = agents.len(),
            viewers = viewers.len(),
            "Closing all connections"
        );
        for agent in agents {
            agent.close(CloseReason::Normal).await;
        }
        for viewer in viewers {
            viewer.close(CloseReason::Normal).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::test_helpers::{DirectoryEvent, RecordingDirectory, wait_until};
    use conduit_core::transport::memory;
    use conduit_core::{CallError, Frame};
    use serde_json::json;

    fn hub_with(directory: Arc<RecordingDirectory>) -> ConnectionHub {
        ConnectionHub::new(
            directory,
            HubSettings {
                write_timeout: Duration::from_secs(1),
                broadcast_timeout: Duration::from_millis(100),
            },
        )
    }

    #[tokio::test]
    async fn register_and_lookup_management() {
        let directory = Arc::new(RecordingDirectory::default());
        let hub = hub_with(Arc::clone(&directory));
        let (transport, _agent) = memory::pair();

        let conn = hub.register_management("s1", transport).await;

        let found = hub.lookup_management("s1").await.unwrap();
        assert!(Arc::ptr_eq(&found, &conn));
        assert!(hub.lookup_management("s2").await.is_none());
        assert_eq!(hub.connected_servers().await, vec!["s1".to_string()]);
        assert_eq!(
            directory.events(),
            vec![DirectoryEvent::Connected("s1".into())]
        );
    }

    #[tokio::test]
    async fn supersession_closes_previous_first() {
        let directory = Arc::new(RecordingDirectory::default());
        let hub = hub_with(Arc::clone(&directory));
        let (first_transport, mut first_agent) = memory::pair();
        let (second_transport, _second_agent) = memory::pair();

        let first = hub.register_management("s1", first_transport).await;
        let second = hub.register_management("s1", second_transport).await;

        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert!(first_agent.recv().await.is_none());
        assert_eq!(first_agent.close_reason(), Some(CloseReason::Superseded));

        let current = hub.lookup_management("s1").await.unwrap();
        assert!(Arc::ptr_eq(&current, &second));

        // The superseded read loop must not deregister or mark the successor offline.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(hub.is_connected("s1").await);
        assert_eq!(
            directory.events(),
            vec![
                DirectoryEvent::Connected("s1".into()),
                DirectoryEvent::Connected("s1".into()),
            ]
        );
    }

    #[tokio::test]
    async fn supersession_does_not_block_other_servers() {
        let directory = Arc::new(RecordingDirectory::default());
        let hub = ConnectionHub::new(
            Arc::clone(&directory) as Arc<dyn ServerDirectory>,
            HubSettings {
                write_timeout: Duration::from_secs(2),
                broadcast_timeout: Duration::from_millis(100),
            },
        );
        let (other_transport, _other_agent) = memory::pair();
        let (stalled_transport, _stalled_agent) = memory::stalled_pair();
        let (fresh_transport, _fresh_agent) = memory::pair();
        hub.register_management("s2", other_transport).await;
        let old = hub.register_management("s1", stalled_transport).await;

        // Park a write on the old connection so closing it has to wait.
        let c = Arc::clone(&old);
        let _call = tokio::spawn(async move {
            c.call(Frame::request(1, "players.list", json!([])), Duration::from_secs(5))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let h = hub.clone();
        let register = tokio::spawn(async move { h.register_management("s1", fresh_transport).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let other = tokio::time::timeout(Duration::from_millis(200), hub.lookup_management("s2"))
            .await
            .unwrap();
        assert!(other.is_some());
        let current = tokio::time::timeout(Duration::from_millis(200), hub.lookup_management("s1"))
            .await
            .unwrap()
            .unwrap();
        assert!(!Arc::ptr_eq(&current, &old));

        let fresh = tokio::time::timeout(Duration::from_secs(5), register)
            .await
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&current, &fresh));
        assert!(old.is_closed());
        assert_eq!(
            directory.events(),
            vec![
                DirectoryEvent::Connected("s2".into()),
                DirectoryEvent::Connected("s1".into()),
                DirectoryEvent::Connected("s1".into()),
            ]
        );
    }

    #[tokio::test]
    async fn agent_disconnect_deregisters_and_marks_offline() {
        let directory = Arc::new(RecordingDirectory::default());
        let hub = hub_with(Arc::clone(&directory));
        let (transport, agent) = memory::pair();
        let conn = hub.register_management("s1", transport).await;

        agent.inject_error("connection reset");
        conn.closed().await;

        let h = hub.clone();
        wait_until(|| {
            let h = h.clone();
            async move { !h.is_connected("s1").await }
        })
        .await;
        let d = Arc::clone(&directory);
        wait_until(|| {
            let d = Arc::clone(&d);
            async move { d.events().len() == 2 }
        })
        .await;
        assert_eq!(
            directory.events(),
            vec![
                DirectoryEvent::Connected("s1".into()),
                DirectoryEvent::Disconnected("s1".into()),
            ]
        );
    }

    #[tokio::test]
    async fn directory_failures_are_not_fatal() {
        let directory = Arc::new(RecordingDirectory::failing());
        let hub = hub_with(Arc::clone(&directory));
        let (transport, _agent) = memory::pair();

        hub.register_management("s1", transport).await;
        assert!(hub.is_connected("s1").await);
    }

    #[tokio::test]
    async fn pending_calls_fail_when_agent_drops() {
        let hub = hub_with(Arc::new(RecordingDirectory::default()));
        let (transport, mut agent) = memory::pair();
        let conn = hub.register_management("s1", transport).await;

        let c = Arc::clone(&conn);
        let call = tokio::spawn(async move {
            c.call(Frame::request(1, "players.list", json!([])), Duration::from_secs(5))
                .await
        });
        assert!(agent.recv().await.is_some());
        drop(agent);

        assert!(matches!(call.await.unwrap(), Err(CallError::Disconnected)));
        assert_eq!(conn.pending_calls(), 0);
    }

    #[tokio::test]
    async fn viewer_add_remove_is_idempotent() {
        let hub = hub_with(Arc::new(RecordingDirectory::default()));
        let (t1, _p1) = memory::pair();
        let (t2, _p2) = memory::pair();

        let v1 = hub.register_viewer("s1", t1.sink).await;
        let v2 = hub.register_viewer("s1", t2.sink).await;
        assert_ne!(v1.id(), v2.id());
        assert_eq!(hub.viewer_count("s1").await, 2);

        assert!(hub.remove_viewer("s1", v1.id()).await);
        assert!(!hub.remove_viewer("s1", v1.id()).await);
        assert_eq!(hub.viewer_count("s1").await, 1);

        assert!(hub.remove_viewer("s1", v2.id()).await);
        assert_eq!(hub.viewer_count("s1").await, 0);
        assert!(hub.inner.state.read().await.viewers.is_empty());
    }

    #[tokio::test]
    async fn broadcast_isolates_failing_viewer() {
        let hub = hub_with(Arc::new(RecordingDirectory::default()));
        let mut healthy = Vec::new();
        for _ in 0..3 {
            let (transport, peer) = memory::pair();
            hub.register_viewer("s1", transport.sink).await;
            healthy.push(peer);
        }
        let (broken_transport, broken_peer) = memory::pair();
        let broken = hub.register_viewer("s1", broken_transport.sink).await;
        drop(broken_peer);

        let payload = r#"{"jsonrpc":"2.0","method":"players.joined","params":{"name":"steve"}}"#;
        assert_eq!(hub.broadcast("s1", payload).await, 3);

        for peer in &mut healthy {
            assert_eq!(peer.recv().await.as_deref(), Some(payload));
        }
        assert!(broken.is_closed());
        assert_eq!(hub.viewer_count("s1").await, 3);
    }

    #[tokio::test]
    async fn broadcast_drops_stalled_viewer_after_deadline() {
        let hub = hub_with(Arc::new(RecordingDirectory::default()));
        let (ok_transport, mut ok_peer) = memory::pair();
        let (stalled_transport, _stalled_peer) = memory::stalled_pair();
        hub.register_viewer("s1", ok_transport.sink).await;
        hub.register_viewer("s1", stalled_transport.sink).await;

        assert_eq!(hub.broadcast("s1", "{}").await, 1);
        assert_eq!(ok_peer.recv().await.as_deref(), Some("{}"));
        assert_eq!(hub.viewer_count("s1").await, 1);
    }

    #[tokio::test]
    async fn broadcast_without_viewers_is_a_noop() {
        let hub = hub_with(Arc::new(RecordingDirectory::default()));
        assert_eq!(hub.broadcast("nobody", "{}").await, 0);
    }

    #[tokio::test]
    async fn run_viewer_removes_on_socket_close() {
        let hub = hub_with(Arc::new(RecordingDirectory::default()));
        let (transport, peer) = memory::pair();
        let h = hub.clone();
        let task = tokio::spawn(async move { h.run_viewer("s1", transport).await });

        let h = hub.clone();
        wait_until(|| {
            let h = h.clone();
            async move { h.viewer_count("s1").await == 1 }
        })
        .await;

        drop(peer);
        task.await.unwrap();
        assert_eq!(hub.viewer_count("s1").await, 0);
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let hub = hub_with(Arc::new(RecordingDirectory::default()));
        let (agent_transport, mut agent) = memory::pair();
        let (viewer_transport, mut viewer_peer) = memory::pair();
        let conn = hub.register_management("s1", agent_transport).await;
        let viewer = hub.register_viewer("s1", viewer_transport.sink).await;

        hub.shutdown().await;

        assert!(conn.is_closed());
        assert!(viewer.is_closed());
        assert!(agent.recv().await.is_none());
        assert!(viewer_peer.recv().await.is_none());
    }
}
