use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use switchboard_proto::wire::{AgentActivity, AgentMessage, Browser, ControllerMessage, RunMode};

use crate::artifacts::ArtifactClient;
use crate::config::Identity;
use crate::executor::JobExecutor;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Long-running agent loop: maintains one controller connection at a time
/// and reconnects with a fixed delay whenever it drops.
pub struct AgentRuntime {
    identity: Identity,
    ws_url: String,
    executor: Arc<dyn JobExecutor>,
    artifacts: ArtifactClient,
    work_dir: PathBuf,
}

impl AgentRuntime {
    pub fn new(
        identity: Identity,
        ws_url: String,
        executor: Arc<dyn JobExecutor>,
        artifacts: ArtifactClient,
        work_dir: PathBuf,
    ) -> Self {
        Self {
            identity,
            ws_url,
            executor,
            artifacts,
            work_dir,
        }
    }

    pub async fn run(&self) -> Result<()> {
        loop {
            match self.run_session().await {
                Ok(()) => info!("controller closed the connection"),
                Err(e) => warn!("session ended: {e:#}"),
            }
            info!("reconnecting in {}s", RECONNECT_DELAY.as_secs());
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    /// One connection lifetime. In-flight work is abandoned when the
    /// connection drops; the controller's sweep will re-dispatch.
    async fn run_session(&self) -> Result<()> {
        info!("connecting to {}", self.ws_url);
        let (socket, _) = connect_async(&self.ws_url)
            .await
            .context("websocket connect failed")?;
        let (mut sink, mut stream) = socket.split();
        info!(agent = %self.identity.agent_id, "connected");

        let register = AgentMessage::Register {
            agent_id: self.identity.agent_id.clone(),
            token: self.identity.token.clone(),
            name: Some(self.identity.name.clone()),
        };
        sink.send(WsMessage::Text(serde_json::to_string(&register)?))
            .await
            .context("failed to send registration")?;

        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let mut session = SessionState::new(
            &self.identity.agent_id,
            self.executor.clone(),
            self.artifacts.clone(),
            self.work_dir.clone(),
            out_tx,
            done_tx,
        );

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await; // consume the immediate first tick

        let result = loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => session.handle_frame(&text),
                    Some(Ok(WsMessage::Close(_))) => break Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(e).context("websocket read failed"),
                    None => break Err(anyhow::anyhow!("connection dropped")),
                },
                Some(outbound) = out_rx.recv() => {
                    match serde_json::to_string(&outbound) {
                        Ok(json) => {
                            if let Err(e) = sink.send(WsMessage::Text(json)).await {
                                break Err(e).context("websocket write failed");
                            }
                        }
                        Err(e) => break Err(e).context("failed to encode outbound message"),
                    }
                }
                Some(done) = done_rx.recv() => session.finish_job(done),
                _ = heartbeat.tick() => {
                    session.send(AgentMessage::Heartbeat {
                        agent_id: self.identity.agent_id.clone(),
                    });
                }
            }
        };

        session.abandon();
        result
    }
}

struct ExecDone {
    job_id: String,
    message: String,
}

struct ActiveJob {
    job_id: String,
    activity: AgentActivity,
    handle: JoinHandle<()>,
}

/// Per-connection state. At most one job executes at a time; commands that
/// arrive while busy are rejected with an explanatory status report.
struct SessionState {
    agent_id: String,
    executor: Arc<dyn JobExecutor>,
    artifacts: ArtifactClient,
    work_dir: PathBuf,
    out_tx: UnboundedSender<AgentMessage>,
    done_tx: UnboundedSender<ExecDone>,
    active: Option<ActiveJob>,
}

impl SessionState {
    fn new(
        agent_id: &str,
        executor: Arc<dyn JobExecutor>,
        artifacts: ArtifactClient,
        work_dir: PathBuf,
        out_tx: UnboundedSender<AgentMessage>,
        done_tx: UnboundedSender<ExecDone>,
    ) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            executor,
            artifacts,
            work_dir,
            out_tx,
            done_tx,
            active: None,
        }
    }

    fn handle_frame(&mut self, text: &str) {
        match serde_json::from_str::<ControllerMessage>(text) {
            Ok(message) => self.handle_message(message),
            Err(e) => warn!("ignoring unparseable frame: {e}"),
        }
    }

    fn handle_message(&mut self, message: ControllerMessage) {
        match message {
            ControllerMessage::Registered => {
                info!(agent = %self.agent_id, "registered with controller");
            }
            ControllerMessage::Error { message } => {
                warn!("controller reported an error: {message}");
            }
            ControllerMessage::Record {
                job_id,
                target,
                browser,
            } => self.start_record(job_id, target, browser),
            ControllerMessage::Run { job_id, mode } => self.start_run(job_id, mode),
            ControllerMessage::Stop { job_id } => self.stop_job(&job_id),
        }
    }

    fn start_record(&mut self, job_id: String, target: String, browser: Browser) {
        if !self.admit(&job_id) {
            return;
        }
        self.send_status(AgentActivity::Recording, Some(job_id.clone()), Some("starting".into()));

        let executor = self.executor.clone();
        let artifacts = self.artifacts.clone();
        let done = self.done_tx.clone();
        let id = job_id.clone();
        let handle = tokio::spawn(async move {
            let message = match executor.record(&id, &target, browser).await {
                Ok(outcome) => match outcome.artifact {
                    Some(path) => match artifacts.upload(&id, &path).await {
                        Ok(()) => outcome.message,
                        Err(e) => format!("recording finished but upload failed: {e:#}"),
                    },
                    None => outcome.message,
                },
                Err(e) => format!("recording failed: {e:#}"),
            };
            let _ = done.send(ExecDone { job_id: id, message });
        });
        self.active = Some(ActiveJob {
            job_id,
            activity: AgentActivity::Recording,
            handle,
        });
    }

    fn start_run(&mut self, job_id: String, mode: RunMode) {
        if !self.admit(&job_id) {
            return;
        }
        self.send_status(AgentActivity::Running, Some(job_id.clone()), Some("starting".into()));

        let executor = self.executor.clone();
        let artifacts = self.artifacts.clone();
        let done = self.done_tx.clone();
        let dest = self.work_dir.join("downloads").join(&job_id);
        let id = job_id.clone();
        let handle = tokio::spawn(async move {
            let message = match artifacts.download(&id, &dest).await {
                Ok(script) => match executor.run(&id, &script, mode).await {
                    Ok(outcome) => outcome.message,
                    Err(e) => format!("run failed: {e:#}"),
                },
                Err(e) => format!("could not fetch script: {e:#}"),
            };
            let _ = done.send(ExecDone { job_id: id, message });
        });
        self.active = Some(ActiveJob {
            job_id,
            activity: AgentActivity::Running,
            handle,
        });
    }

    /// Returns false and reports the rejection when another job is already
    /// in flight. The rejection carries no job id so the controller never
    /// mistakes it for progress on the rejected job.
    fn admit(&mut self, job_id: &str) -> bool {
        match &self.active {
            Some(active) => {
                warn!(current = %active.job_id, rejected = %job_id, "busy; rejecting command");
                self.send_status(
                    active.activity,
                    None,
                    Some(format!(
                        "busy with job {}; rejected command for job {job_id}",
                        active.job_id
                    )),
                );
                false
            }
            None => true,
        }
    }

    fn stop_job(&mut self, job_id: &str) {
        match self.active.take() {
            Some(active) if active.job_id == job_id => {
                info!(job = %job_id, "stopping in-flight job");
                active.handle.abort();
                self.send_status(
                    AgentActivity::Idle,
                    Some(job_id.to_string()),
                    Some("stopped".into()),
                );
            }
            Some(active) => {
                debug!(job = %job_id, current = %active.job_id, "stop does not match in-flight job");
                self.active = Some(active);
            }
            None => debug!(job = %job_id, "stop received while idle"),
        }
    }

    fn finish_job(&mut self, done: ExecDone) {
        match &self.active {
            Some(active) if active.job_id == done.job_id => {
                self.active = None;
                self.send_status(AgentActivity::Idle, Some(done.job_id), Some(done.message));
            }
            _ => debug!(job = %done.job_id, "completion for a job no longer tracked"),
        }
    }

    /// Called when the connection goes away. The controller's liveness
    /// sweep handles the job on its side.
    fn abandon(&mut self) {
        if let Some(active) = self.active.take() {
            warn!(job = %active.job_id, "abandoning in-flight job");
            active.handle.abort();
        }
    }

    fn send_status(&self, status: AgentActivity, job_id: Option<String>, message: Option<String>) {
        self.send(AgentMessage::Status {
            agent_id: self.agent_id.clone(),
            status,
            job_id,
            message,
        });
    }

    fn send(&self, message: AgentMessage) {
        if self.out_tx.send(message).is_err() {
            debug!("outbound channel closed");
        }
    }
}
