use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Notify};
use tracing::{debug, info, warn};

use switchboard_proto::records::{AgentRecord, Connectivity, JobStatus};
use switchboard_proto::token::hash_token;
use switchboard_proto::wire::{AgentActivity, AgentMessage, ControllerMessage, JobEvent};

use crate::events::EventBus;
use crate::storage::{SharedStore, Store, StoreError};
use crate::AppState;

/// WebSocket upgrade for agent connections.
pub async fn agent_ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_agent_socket(socket, state))
}

/// One task per agent connection. A hang on this socket never stalls other
/// agents: outbound traffic goes through an unbounded channel drained by a
/// dedicated forward task, and all shared state lives behind the registry.
async fn handle_agent_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<ControllerMessage>();
    let shutdown = Arc::new(Notify::new());

    // Forward task: drains the outbound queue; a shutdown notification from
    // the registry (supersession or eviction) closes the socket.
    let forward_shutdown = shutdown.clone();
    let forward = tokio::spawn(async move {
        loop {
            tokio::select! {
                queued = rx.recv() => match queued {
                    Some(message) => {
                        if let Ok(json) = serde_json::to_string(&message) {
                            if sender.send(Message::Text(json)).await.is_err() {
                                break;
                            }
                        }
                    }
                    None => break,
                },
                _ = forward_shutdown.notified() => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    // Agent id is bound to the connection by the first successful register.
    let mut agent_id: Option<String> = None;

    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!("websocket error: {e}");
                break;
            }
        };
        if !handle_frame(frame, &mut agent_id, &tx, &shutdown, &state).await {
            break;
        }
    }

    if let Some(id) = agent_id {
        // Only tear down registry state if this connection still owns it; a
        // superseding registration must not be evicted by the old socket.
        if state.registry.evict_if_same(&id, &tx) {
            if let Err(e) = state
                .store
                .set_agent_connectivity(&id, Connectivity::Disconnected)
                .await
            {
                warn!(agent = %id, "failed to mark agent disconnected: {e}");
            }
            info!(agent = %id, "agent disconnected");
        }
    }
    forward.abort();
}

/// One inbound frame. Returns false when the connection should close.
async fn handle_frame(
    frame: Message,
    conn_agent_id: &mut Option<String>,
    tx: &mpsc::UnboundedSender<ControllerMessage>,
    shutdown: &Arc<Notify>,
    state: &AppState,
) -> bool {
    // Any inbound traffic counts as liveness, not only heartbeats.
    if let Some(id) = conn_agent_id {
        state.registry.touch(id).await;
    }

    match frame {
        Message::Text(text) => match serde_json::from_str::<AgentMessage>(&text) {
            Ok(message) => {
                if let Err(e) =
                    handle_agent_message(message, conn_agent_id, tx, shutdown, state).await
                {
                    warn!("failed to handle agent message: {e}");
                    let _ = tx.send(ControllerMessage::Error {
                        message: format!("failed to process message: {e}"),
                    });
                }
            }
            Err(e) => {
                // A single bad frame does not cost the connection.
                warn!("invalid agent message: {e}");
                let _ = tx.send(ControllerMessage::Error {
                    message: format!("invalid message format: {e}"),
                });
            }
        },
        Message::Close(_) => return false,
        _ => {}
    }
    true
}

async fn handle_agent_message(
    message: AgentMessage,
    conn_agent_id: &mut Option<String>,
    tx: &mpsc::UnboundedSender<ControllerMessage>,
    shutdown: &Arc<Notify>,
    state: &AppState,
) -> Result<(), StoreError> {
    match message {
        AgentMessage::Register { agent_id, token, name } => {
            let record = match state.store.get_agent(&agent_id).await? {
                None => {
                    info!(agent = %agent_id, "provisioning new agent");
                    AgentRecord::provision(&agent_id, name, &token)
                }
                Some(mut record) => {
                    let token_hash = hash_token(&token);
                    if record.token_hash != token_hash {
                        // Accepted as rotation; the token is a correlation
                        // key, not a trust boundary. Known weak point.
                        warn!(agent = %agent_id, "agent re-registered with a new token");
                        record.token_hash = token_hash;
                    }
                    if let Some(name) = name {
                        record.name = name;
                    }
                    record.connectivity = Connectivity::Connected;
                    record.last_seen = Utc::now();
                    record
                }
            };
            state.store.upsert_agent(record).await?;
            state.registry.admit(&agent_id, tx.clone(), shutdown.clone());
            let _ = tx.send(ControllerMessage::Registered);
            info!(agent = %agent_id, "agent registered");
            *conn_agent_id = Some(agent_id);
        }
        AgentMessage::Heartbeat { agent_id } => {
            if conn_agent_id.as_deref() != Some(agent_id.as_str()) {
                debug!(agent = %agent_id, "heartbeat from unregistered connection");
                return Ok(());
            }
            state.store.touch_agent(&agent_id).await?;
        }
        AgentMessage::Status { agent_id, status, job_id, message } => {
            if conn_agent_id.as_deref() != Some(agent_id.as_str()) {
                warn!(agent = %agent_id, "status report from unregistered connection");
                return Ok(());
            }
            relay_status(&state.store, &state.events, &agent_id, status, job_id, message).await?;
        }
    }
    Ok(())
}

/// Apply a status report: map the agent-reported activity onto the job's
/// persisted lifecycle, keep the agent's current-job pointer in sync, and fan
/// the update out to observers. Reports for one job arrive in order (the
/// transport per agent is ordered and a job has one active agent at a time).
pub async fn relay_status(
    store: &SharedStore,
    events: &EventBus,
    agent_id: &str,
    activity: AgentActivity,
    job_id: Option<String>,
    message: Option<String>,
) -> Result<(), StoreError> {
    let known_job = match &job_id {
        Some(job_id) => {
            let job = store.get_job(job_id).await?;
            if job.is_none() {
                warn!(job = %job_id, "status report for unknown job");
            }
            job
        }
        None => None,
    };

    let mut update = None;
    if let (Some(job_id), Some(job)) = (&job_id, &known_job) {
        let next = match activity {
            AgentActivity::Recording => JobStatus::Recording,
            AgentActivity::Running => JobStatus::Running,
            // First completion makes the job ready; replayed reports never
            // overwrite a terminal state.
            AgentActivity::Idle if job.status.is_terminal() => job.status,
            AgentActivity::Idle => JobStatus::Ready,
        };
        if next != job.status || message.is_some() {
            store.update_job_status(job_id, next, message.clone()).await?;
        }
        update = Some((job_id.clone(), next));
    }

    // Pointer sync before fan-out, so an observer reacting to the event sees
    // a consistent agent record. A busy report only ever points the record at
    // a job that exists.
    match activity {
        AgentActivity::Idle => store.set_agent_current_job(agent_id, None).await?,
        _ => {
            if known_job.is_some() {
                store.set_agent_current_job(agent_id, job_id.clone()).await?;
            }
        }
    }

    if let Some((job_id, status)) = update {
        events.publish(JobEvent::JobUpdate {
            job_id,
            status,
            message,
        });
    }
    Ok(())
}

/// WebSocket upgrade for dashboard observers; forwards the event stream.
pub async fn ui_ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let rx = state.events.subscribe();
    ws.on_upgrade(move |socket| handle_ui_socket(socket, rx))
}

async fn handle_ui_socket(socket: WebSocket, mut rx: broadcast::Receiver<JobEvent>) {
    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => {
                    if let Ok(json) = serde_json::to_string(&event) {
                        if sender.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "ui observer lagging; events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            frame = receiver.next() => match frame {
                None | Some(Ok(Message::Close(_))) | Some(Err(_)) => break,
                _ => {}
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Dispatcher;
    use crate::registry::Registry;
    use crate::storage::{MemStore, Store};
    use std::time::Duration;
    use switchboard_proto::records::JobRecord;
    use switchboard_proto::wire::Browser;

    fn app_state() -> AppState {
        let store = MemStore::shared();
        let registry = Arc::new(Registry::new());
        AppState {
            dispatcher: Dispatcher::new(registry.clone(), store.clone()),
            events: EventBus::new(16),
            store,
            registry,
            artifact_dir: std::env::temp_dir(),
        }
    }

    async fn setup() -> (SharedStore, EventBus, broadcast::Receiver<JobEvent>, JobRecord) {
        let store = MemStore::shared();
        let events = EventBus::new(16);
        let rx = events.subscribe();
        let job = JobRecord::record("checkout", "https://x", Browser::Chromium);
        store.insert_job(job.clone()).await.unwrap();
        store
            .upsert_agent(AgentRecord::provision("a1", None, "tok"))
            .await
            .unwrap();
        (store, events, rx, job)
    }

    #[tokio::test]
    async fn recording_then_idle_makes_job_ready() {
        let (store, events, mut rx, job) = setup().await;

        relay_status(
            &store,
            &events,
            "a1",
            AgentActivity::Recording,
            Some(job.id.clone()),
            None,
        )
        .await
        .unwrap();
        assert_eq!(
            store.get_job(&job.id).await.unwrap().unwrap().status,
            JobStatus::Recording
        );
        assert_eq!(
            store
                .get_agent("a1")
                .await
                .unwrap()
                .unwrap()
                .current_job_id
                .as_deref(),
            Some(job.id.as_str())
        );

        relay_status(
            &store,
            &events,
            "a1",
            AgentActivity::Idle,
            Some(job.id.clone()),
            Some("recording completed".into()),
        )
        .await
        .unwrap();
        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Ready);
        assert_eq!(stored.message.as_deref(), Some("recording completed"));
        assert!(store
            .get_agent("a1")
            .await
            .unwrap()
            .unwrap()
            .current_job_id
            .is_none());

        let statuses: Vec<JobStatus> = [rx.recv().await.unwrap(), rx.recv().await.unwrap()]
            .into_iter()
            .map(|event| match event {
                JobEvent::JobUpdate { status, .. } => status,
            })
            .collect();
        assert_eq!(statuses, vec![JobStatus::Recording, JobStatus::Ready]);
    }

    #[tokio::test]
    async fn replayed_idle_report_is_idempotent() {
        let (store, events, mut rx, job) = setup().await;

        for _ in 0..2 {
            relay_status(
                &store,
                &events,
                "a1",
                AgentActivity::Idle,
                Some(job.id.clone()),
                None,
            )
            .await
            .unwrap();
            assert_eq!(
                store.get_job(&job.id).await.unwrap().unwrap().status,
                JobStatus::Ready
            );
        }
        // Observers see a second notification, nothing more.
        assert!(rx.recv().await.is_ok());
        assert!(rx.recv().await.is_ok());
    }

    #[tokio::test]
    async fn idle_report_preserves_terminal_state() {
        let (store, events, _rx, job) = setup().await;
        store
            .update_job_status(&job.id, JobStatus::Failed, Some("boom".into()))
            .await
            .unwrap();

        relay_status(
            &store,
            &events,
            "a1",
            AgentActivity::Idle,
            Some(job.id.clone()),
            None,
        )
        .await
        .unwrap();

        assert_eq!(
            store.get_job(&job.id).await.unwrap().unwrap().status,
            JobStatus::Failed
        );
    }

    #[tokio::test]
    async fn unknown_job_produces_no_event() {
        let (store, events, mut rx, _job) = setup().await;

        relay_status(
            &store,
            &events,
            "a1",
            AgentActivity::Running,
            Some("nonexistent".into()),
            None,
        )
        .await
        .unwrap();

        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn any_inbound_frame_refreshes_liveness() {
        let state = app_state();
        let (tx, _rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(Notify::new());
        let mut bound = None;

        let register = serde_json::to_string(&AgentMessage::Register {
            agent_id: "a1".into(),
            token: "tok".into(),
            name: None,
        })
        .unwrap();
        assert!(handle_frame(Message::Text(register), &mut bound, &tx, &shutdown, &state).await);
        assert_eq!(bound.as_deref(), Some("a1"));

        tokio::spawn(state.registry.clone().run_liveness_sweep(
            state.store.clone(),
            Duration::from_secs(30),
            Duration::from_secs(60),
        ));

        // Status reports and even malformed frames carry the session past
        // the staleness threshold; no heartbeat is ever sent.
        for round in 0..6 {
            tokio::time::sleep(Duration::from_secs(30)).await;
            let frame = if round % 2 == 0 {
                serde_json::to_string(&AgentMessage::Status {
                    agent_id: "a1".into(),
                    status: AgentActivity::Idle,
                    job_id: None,
                    message: None,
                })
                .unwrap()
            } else {
                "{not json".to_string()
            };
            assert!(handle_frame(Message::Text(frame), &mut bound, &tx, &shutdown, &state).await);
        }
        assert!(state.registry.is_connected("a1"));
    }

    #[tokio::test]
    async fn busy_report_for_unknown_job_does_not_move_pointer() {
        let (store, events, _rx, job) = setup().await;
        store
            .set_agent_current_job("a1", Some(job.id.clone()))
            .await
            .unwrap();

        relay_status(
            &store,
            &events,
            "a1",
            AgentActivity::Running,
            Some("ghost".into()),
            None,
        )
        .await
        .unwrap();

        assert_eq!(
            store
                .get_agent("a1")
                .await
                .unwrap()
                .unwrap()
                .current_job_id
                .as_deref(),
            Some(job.id.as_str())
        );
    }

    #[tokio::test]
    async fn busy_report_without_job_keeps_current_pointer() {
        let (store, events, _rx, job) = setup().await;
        store
            .set_agent_current_job("a1", Some(job.id.clone()))
            .await
            .unwrap();

        relay_status(&store, &events, "a1", AgentActivity::Recording, None, None)
            .await
            .unwrap();

        assert_eq!(
            store
                .get_agent("a1")
                .await
                .unwrap()
                .unwrap()
                .current_job_id
                .as_deref(),
            Some(job.id.as_str())
        );
    }
}
