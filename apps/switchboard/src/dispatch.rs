use anyhow::{bail, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

use switchboard_proto::records::Connectivity;
use switchboard_proto::wire::ControllerMessage;

use crate::registry::Registry;
use crate::storage::{SharedStore, Store};

/// Outcome of a dispatch decision. `NoAgent` is not an error: the job stays
/// pending and an agent may connect moments later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchResult {
    Sent { agent_id: String },
    NoAgent,
}

/// Routes a command to one live session and records the intended target.
/// Delivery is fire-and-forget; there is no application-level ack and no
/// automatic redispatch.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    store: SharedStore,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, store: SharedStore) -> Self {
        Self { registry, store }
    }

    pub async fn dispatch(&self, command: ControllerMessage) -> Result<DispatchResult> {
        let Some(job_id) = command.job_id().map(str::to_string) else {
            bail!("not a dispatchable command: {command:?}");
        };
        let dispatched_status = command.dispatched_status();

        // A stop must reach the agent actually executing the job; any other
        // session would discard it. Fresh work goes to any live session.
        let target = match &command {
            ControllerMessage::Stop { job_id } => self.executing_agent(job_id).await?,
            _ => self.registry.first_connected(),
        };
        let Some(agent_id) = target else {
            debug!(job = %job_id, "no live session for this command");
            return Ok(DispatchResult::NoAgent);
        };

        if !self.registry.send(&agent_id, command) {
            // Connection lost mid-send: dispatch failure, job stays pending.
            warn!(agent = %agent_id, job = %job_id, "send failed; evicting session");
            self.registry.evict(&agent_id);
            if let Err(e) = self
                .store
                .set_agent_connectivity(&agent_id, Connectivity::Disconnected)
                .await
            {
                warn!(agent = %agent_id, "failed to mark agent disconnected: {e}");
            }
            return Ok(DispatchResult::NoAgent);
        }

        if let Some(status) = dispatched_status {
            self.store.update_job_status(&job_id, status, None).await?;
            self.store
                .set_agent_current_job(&agent_id, Some(job_id.clone()))
                .await?;
        }

        info!(agent = %agent_id, job = %job_id, "command dispatched");
        Ok(DispatchResult::Sent { agent_id })
    }

    /// The live session whose agent record points at this job, if any.
    async fn executing_agent(&self, job_id: &str) -> Result<Option<String>> {
        let agents = self.store.list_agents().await?;
        Ok(agents
            .into_iter()
            .find(|agent| {
                agent.current_job_id.as_deref() == Some(job_id)
                    && self.registry.is_connected(&agent.id)
            })
            .map(|agent| agent.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemStore, Store};
    use std::time::Duration;
    use switchboard_proto::records::{AgentRecord, JobRecord, JobStatus};
    use switchboard_proto::wire::{Browser, RunMode};
    use tokio::sync::{mpsc, Notify};

    async fn setup() -> (Arc<Registry>, SharedStore, Dispatcher, JobRecord) {
        let registry = Arc::new(Registry::new());
        let store = MemStore::shared();
        let job = JobRecord::record("login flow", "https://example.com", Browser::Chromium);
        store.insert_job(job.clone()).await.unwrap();
        store
            .upsert_agent(AgentRecord::provision("a1", None, "tok"))
            .await
            .unwrap();
        let dispatcher = Dispatcher::new(registry.clone(), store.clone());
        (registry, store, dispatcher, job)
    }

    #[tokio::test]
    async fn dispatch_record_reaches_live_session() {
        let (registry, store, dispatcher, job) = setup().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.admit("a1", tx, Arc::new(Notify::new()));

        let result = dispatcher
            .dispatch(ControllerMessage::Record {
                job_id: job.id.clone(),
                target: "https://example.com".into(),
                browser: Browser::Chromium,
            })
            .await
            .unwrap();

        assert_eq!(result, DispatchResult::Sent { agent_id: "a1".into() });
        let sent = tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(sent, ControllerMessage::Record { .. }));

        let job = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Recording);
        let agent = store.get_agent("a1").await.unwrap().unwrap();
        assert_eq!(agent.current_job_id.as_deref(), Some(job.id.as_str()));
    }

    #[tokio::test]
    async fn no_live_session_leaves_job_pending() {
        let (_registry, store, dispatcher, job) = setup().await;

        let result = dispatcher
            .dispatch(ControllerMessage::Run {
                job_id: job.id.clone(),
                mode: RunMode::Headless,
            })
            .await
            .unwrap();

        assert_eq!(result, DispatchResult::NoAgent);
        let job = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn send_failure_evicts_session_and_leaves_job_pending() {
        let (registry, store, dispatcher, job) = setup().await;
        let (tx, rx) = mpsc::unbounded_channel();
        registry.admit("a1", tx, Arc::new(Notify::new()));
        // Receiver gone: the connection is tearing down.
        drop(rx);

        let result = dispatcher
            .dispatch(ControllerMessage::Run {
                job_id: job.id.clone(),
                mode: RunMode::Headless,
            })
            .await
            .unwrap();

        assert_eq!(result, DispatchResult::NoAgent);
        assert!(!registry.is_connected("a1"));
        let job = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        let agent = store.get_agent("a1").await.unwrap().unwrap();
        assert_eq!(agent.connectivity, Connectivity::Disconnected);
    }

    #[tokio::test]
    async fn stop_does_not_change_job_status() {
        let (registry, store, dispatcher, job) = setup().await;
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.admit("a1", tx, Arc::new(Notify::new()));

        store
            .update_job_status(&job.id, JobStatus::Running, None)
            .await
            .unwrap();
        store
            .set_agent_current_job("a1", Some(job.id.clone()))
            .await
            .unwrap();
        let result = dispatcher
            .dispatch(ControllerMessage::Stop { job_id: job.id.clone() })
            .await
            .unwrap();

        assert_eq!(result, DispatchResult::Sent { agent_id: "a1".into() });
        let job = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn stop_routes_to_the_executing_agent() {
        let (registry, store, dispatcher, job) = setup().await;
        store
            .upsert_agent(AgentRecord::provision("a2", None, "tok"))
            .await
            .unwrap();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        registry.admit("a1", tx1, Arc::new(Notify::new()));
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        registry.admit("a2", tx2, Arc::new(Notify::new()));
        store
            .set_agent_current_job("a2", Some(job.id.clone()))
            .await
            .unwrap();

        let result = dispatcher
            .dispatch(ControllerMessage::Stop { job_id: job.id.clone() })
            .await
            .unwrap();

        assert_eq!(result, DispatchResult::Sent { agent_id: "a2".into() });
        assert!(matches!(rx2.try_recv(), Ok(ControllerMessage::Stop { .. })));
        assert!(rx1.try_recv().is_err(), "idle session must not see the stop");
    }

    #[tokio::test]
    async fn stop_with_no_executing_agent_reaches_nobody() {
        let (registry, _store, dispatcher, job) = setup().await;
        // Connected but idle: its record does not point at the job.
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.admit("a1", tx, Arc::new(Notify::new()));

        let result = dispatcher
            .dispatch(ControllerMessage::Stop { job_id: job.id.clone() })
            .await
            .unwrap();

        assert_eq!(result, DispatchResult::NoAgent);
        assert!(rx.try_recv().is_err());
    }
}
