use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use switchboard_proto::records::Connectivity;
use switchboard_proto::wire::ControllerMessage;

use crate::storage::{SharedStore, Store};

/// One live, admitted connection to an agent. The registry is the only
/// owner of these; other components route through [`Registry::send`].
struct AgentSession {
    tx: mpsc::UnboundedSender<ControllerMessage>,
    last_liveness: Arc<RwLock<Instant>>,
    shutdown: Arc<Notify>,
}

/// Single mutual-exclusion domain for live agent sessions: at most one
/// session per agent id, superseded handles are closed on admission.
#[derive(Default)]
pub struct Registry {
    sessions: DashMap<String, AgentSession>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a freshly registered connection, closing and replacing any
    /// existing session for the same agent id.
    pub fn admit(
        &self,
        agent_id: &str,
        tx: mpsc::UnboundedSender<ControllerMessage>,
        shutdown: Arc<Notify>,
    ) {
        let session = AgentSession {
            tx,
            last_liveness: Arc::new(RwLock::new(Instant::now())),
            shutdown,
        };
        if let Some(previous) = self.sessions.insert(agent_id.to_string(), session) {
            info!(agent = %agent_id, "superseding existing session");
            previous.shutdown.notify_one();
        }
    }

    /// Refresh the liveness stamp. No-op if the session is gone.
    pub async fn touch(&self, agent_id: &str) {
        // Clone the stamp out of the guard; never hold a dashmap guard
        // across an await.
        let stamp = self
            .sessions
            .get(agent_id)
            .map(|session| session.last_liveness.clone());
        if let Some(stamp) = stamp {
            *stamp.write().await = Instant::now();
        }
    }

    /// Queue a message on the session's outbound channel. Returns false when
    /// no live session exists or the connection is already tearing down.
    pub fn send(&self, agent_id: &str, message: ControllerMessage) -> bool {
        match self.sessions.get(agent_id) {
            Some(session) => session.tx.send(message).is_ok(),
            None => false,
        }
    }

    /// Close and remove the session. Idempotent.
    pub fn evict(&self, agent_id: &str) {
        if let Some((_, session)) = self.sessions.remove(agent_id) {
            session.shutdown.notify_one();
        }
    }

    /// Evict only if the registered session still routes to `tx`. Prevents a
    /// superseded connection's teardown from removing its replacement.
    pub fn evict_if_same(
        &self,
        agent_id: &str,
        tx: &mpsc::UnboundedSender<ControllerMessage>,
    ) -> bool {
        let matches = self
            .sessions
            .get(agent_id)
            .map(|session| session.tx.same_channel(tx))
            .unwrap_or(false);
        if matches {
            self.evict(agent_id);
        }
        matches
    }

    pub fn is_connected(&self, agent_id: &str) -> bool {
        self.sessions.contains_key(agent_id)
    }

    /// Any one live session, first found. Deliberately load-unaware; this is
    /// the seam a real scheduler would replace.
    pub fn first_connected(&self) -> Option<String> {
        self.sessions.iter().next().map(|entry| entry.key().clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Periodic staleness sweep: sessions silent for longer than
    /// `stale_after` are closed, removed, and their durable record flipped to
    /// disconnected. This is the only path besides explicit close that marks
    /// an agent disconnected.
    pub async fn run_liveness_sweep(
        self: Arc<Self>,
        store: SharedStore,
        interval: Duration,
        stale_after: Duration,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;

            // Collect stamps first so no dashmap guard is held across await.
            let mut checks = Vec::new();
            for entry in self.sessions.iter() {
                checks.push((
                    entry.key().clone(),
                    entry.last_liveness.clone(),
                    entry.tx.clone(),
                ));
            }

            for (agent_id, stamp, tx) in checks {
                let last = *stamp.read().await;
                if last.elapsed() <= stale_after {
                    continue;
                }
                if !self.evict_if_same(&agent_id, &tx) {
                    // Superseded between collect and check; leave the
                    // replacement alone.
                    continue;
                }
                info!(agent = %agent_id, "evicting stale session (liveness timeout)");
                if let Err(e) = store
                    .set_agent_connectivity(&agent_id, Connectivity::Disconnected)
                    .await
                {
                    warn!(agent = %agent_id, "failed to mark agent disconnected: {e}");
                }
            }
            debug!(sessions = self.session_count(), "liveness sweep complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemStore, Store};
    use switchboard_proto::records::AgentRecord;

    fn channel() -> (
        mpsc::UnboundedSender<ControllerMessage>,
        mpsc::UnboundedReceiver<ControllerMessage>,
        Arc<Notify>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, rx, Arc::new(Notify::new()))
    }

    #[tokio::test]
    async fn admit_supersedes_previous_session() {
        let registry = Registry::new();
        let (tx1, mut rx1, shutdown1) = channel();
        let (tx2, mut rx2, shutdown2) = channel();

        registry.admit("a1", tx1, shutdown1.clone());
        registry.admit("a1", tx2.clone(), shutdown2);

        assert_eq!(registry.session_count(), 1);
        // The first handle was told to close.
        tokio::time::timeout(Duration::from_millis(100), shutdown1.notified())
            .await
            .expect("superseded session should be notified");

        // Commands reach only the second connection.
        assert!(registry.send("a1", ControllerMessage::Stop { job_id: "j1".into() }));
        assert!(rx2.recv().await.is_some());
        assert!(rx1.try_recv().is_err());

        // Teardown of the stale connection must not evict the replacement.
        let (old_tx, _old_rx, _) = channel();
        assert!(!registry.evict_if_same("a1", &old_tx));
        assert!(registry.is_connected("a1"));
        assert!(registry.evict_if_same("a1", &tx2));
        assert!(!registry.is_connected("a1"));
    }

    #[tokio::test]
    async fn touch_is_noop_for_unknown_agent() {
        let registry = Registry::new();
        registry.touch("ghost").await;
        assert!(!registry.is_connected("ghost"));
    }

    #[tokio::test]
    async fn evict_is_idempotent() {
        let registry = Registry::new();
        let (tx, _rx, shutdown) = channel();
        registry.admit("a1", tx, shutdown);
        registry.evict("a1");
        registry.evict("a1");
        assert!(!registry.is_connected("a1"));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_sessions_are_evicted_and_marked_disconnected() {
        let registry = Arc::new(Registry::new());
        let store = MemStore::shared();
        store
            .upsert_agent(AgentRecord::provision("a1", None, "tok"))
            .await
            .unwrap();

        let (tx, _rx, shutdown) = channel();
        registry.admit("a1", tx, shutdown);

        tokio::spawn(registry.clone().run_liveness_sweep(
            store.clone(),
            Duration::from_secs(30),
            Duration::from_secs(60),
        ));

        // One missed heartbeat must not evict.
        tokio::time::sleep(Duration::from_secs(45)).await;
        assert!(registry.is_connected("a1"));

        // Past the threshold the next sweep evicts.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!registry.is_connected("a1"));
        let record = store.get_agent("a1").await.unwrap().unwrap();
        assert_eq!(record.connectivity, Connectivity::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn touched_session_survives_sweep() {
        let registry = Arc::new(Registry::new());
        let store = MemStore::shared();

        let (tx, _rx, shutdown) = channel();
        registry.admit("a1", tx, shutdown);

        tokio::spawn(registry.clone().run_liveness_sweep(
            store,
            Duration::from_secs(30),
            Duration::from_secs(60),
        ));

        for _ in 0..6 {
            tokio::time::sleep(Duration::from_secs(30)).await;
            registry.touch("a1").await;
        }
        assert!(registry.is_connected("a1"));
    }
}
