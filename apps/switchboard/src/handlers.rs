use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, warn};

use chrono::{DateTime, Utc};
use switchboard_proto::records::{AgentRecord, Connectivity, JobRecord, JobStatus};
use switchboard_proto::wire::{Browser, ControllerMessage, RunMode};

use crate::dispatch::DispatchResult;
use crate::storage::{Store, StoreError};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateRecordJobRequest {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub browser: Browser,
}

#[derive(Debug, Deserialize, Default)]
pub struct RunJobRequest {
    #[serde(default)]
    pub mode: RunMode,
}

#[derive(Debug, Serialize)]
pub struct DispatchResponse {
    pub job_id: String,
    pub dispatched: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// Agent view without the token hash.
#[derive(Debug, Serialize)]
pub struct AgentSummary {
    pub id: String,
    pub name: String,
    pub connectivity: Connectivity,
    pub last_seen: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_job_id: Option<String>,
}

impl From<AgentRecord> for AgentSummary {
    fn from(record: AgentRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            connectivity: record.connectivity,
            last_seen: record.last_seen,
            current_job_id: record.current_job_id,
        }
    }
}

fn storage_failure(e: StoreError) -> Response {
    error!("storage failure: {e}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "storage failure"})),
    )
        .into_response()
}

fn not_found(what: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": format!("{what} not found")})),
    )
        .into_response()
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": message}))).into_response()
}

pub async fn health_check() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

/// Create a recording job and dispatch it to any live agent. No live agent is
/// not an error: the job is created pending.
pub async fn create_record_job(
    State(state): State<AppState>,
    Json(request): Json<CreateRecordJobRequest>,
) -> Response {
    if request.name.trim().is_empty() || request.url.trim().is_empty() {
        return bad_request("name and url are required");
    }

    let job = JobRecord::record(&request.name, &request.url, request.browser);
    let job_id = job.id.clone();
    if let Err(e) = state.store.insert_job(job).await {
        return storage_failure(e);
    }

    let command = ControllerMessage::Record {
        job_id: job_id.clone(),
        target: request.url.trim().to_string(),
        browser: request.browser,
    };
    match state.dispatcher.dispatch(command).await {
        Ok(_) => {}
        Err(e) => {
            error!(job = %job_id, "dispatch failed: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "dispatch failed"})),
            )
                .into_response();
        }
    }

    match state.store.get_job(&job_id).await {
        Ok(Some(job)) => (StatusCode::CREATED, Json(job)).into_response(),
        Ok(None) => not_found("job"),
        Err(e) => storage_failure(e),
    }
}

/// Replay a recorded job on any live agent.
pub async fn run_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<RunJobRequest>>,
) -> Response {
    let Json(request) = body.unwrap_or_default();
    let job = match state.store.get_job(&id).await {
        Ok(Some(job)) => job,
        Ok(None) => return not_found("job"),
        Err(e) => return storage_failure(e),
    };
    if job.artifact.is_none() {
        return bad_request("job has no recorded artifact yet");
    }

    let command = ControllerMessage::Run {
        job_id: id.clone(),
        mode: request.mode,
    };
    match state.dispatcher.dispatch(command).await {
        Ok(DispatchResult::Sent { agent_id }) => Json(DispatchResponse {
            job_id: id,
            dispatched: true,
            agent_id: Some(agent_id),
        })
        .into_response(),
        Ok(DispatchResult::NoAgent) => Json(DispatchResponse {
            job_id: id,
            dispatched: false,
            agent_id: None,
        })
        .into_response(),
        Err(e) => {
            error!(job = %id, "dispatch failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "dispatch failed"})),
            )
                .into_response()
        }
    }
}

/// Ask the executing agent to terminate the job's in-flight run. Advisory:
/// the next status report from the agent is the only ground truth.
pub async fn stop_job(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.store.get_job(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found("job"),
        Err(e) => return storage_failure(e),
    }
    match state
        .dispatcher
        .dispatch(ControllerMessage::Stop { job_id: id.clone() })
        .await
    {
        Ok(DispatchResult::Sent { agent_id }) => Json(DispatchResponse {
            job_id: id,
            dispatched: true,
            agent_id: Some(agent_id),
        })
        .into_response(),
        Ok(DispatchResult::NoAgent) => Json(DispatchResponse {
            job_id: id,
            dispatched: false,
            agent_id: None,
        })
        .into_response(),
        Err(e) => {
            error!(job = %id, "dispatch failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "dispatch failed"})),
            )
                .into_response()
        }
    }
}

pub async fn list_jobs(State(state): State<AppState>) -> Response {
    match state.store.list_jobs().await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(e) => storage_failure(e),
    }
}

pub async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.store.get_job(&id).await {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => not_found("job"),
        Err(e) => storage_failure(e),
    }
}

pub async fn delete_job(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let job = match state.store.get_job(&id).await {
        Ok(Some(job)) => job,
        Ok(None) => return not_found("job"),
        Err(e) => return storage_failure(e),
    };
    if let Some(artifact) = &job.artifact {
        if let Err(e) = tokio::fs::remove_file(artifact).await {
            warn!(job = %id, "failed to remove artifact file: {e}");
        }
    }
    match state.store.delete_job(&id).await {
        Ok(()) => Json(json!({"message": "job deleted"})).into_response(),
        Err(e) => storage_failure(e),
    }
}

/// Opaque artifact upload from the recording agent; marks the job ready.
pub async fn upload_artifact(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    if body.is_empty() {
        return bad_request("empty artifact");
    }
    match state.store.get_job(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found("job"),
        Err(e) => return storage_failure(e),
    }

    let dir = state.artifact_dir.join("artifacts");
    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
        error!("failed to create artifact dir: {e}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "artifact storage failure"})),
        )
            .into_response();
    }
    let path = dir.join(format!("{id}.spec.ts"));
    if let Err(e) = tokio::fs::write(&path, &body).await {
        error!("failed to write artifact: {e}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "artifact storage failure"})),
        )
            .into_response();
    }

    let path = path.to_string_lossy().to_string();
    if let Err(e) = state.store.set_job_artifact(&id, &path).await {
        return storage_failure(e);
    }
    if let Err(e) = state
        .store
        .update_job_status(&id, JobStatus::Ready, None)
        .await
    {
        return storage_failure(e);
    }
    Json(json!({"message": "artifact uploaded", "job_id": id})).into_response()
}

pub async fn download_artifact(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let job = match state.store.get_job(&id).await {
        Ok(Some(job)) => job,
        Ok(None) => return not_found("job"),
        Err(e) => return storage_failure(e),
    };
    let Some(artifact) = job.artifact else {
        return not_found("artifact");
    };
    match tokio::fs::read(&artifact).await {
        Ok(bytes) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            bytes,
        )
            .into_response(),
        Err(e) => {
            warn!(job = %id, "artifact file unreadable: {e}");
            not_found("artifact")
        }
    }
}

pub async fn list_agents(State(state): State<AppState>) -> Response {
    match state.store.list_agents().await {
        Ok(mut agents) => {
            agents.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
            let summaries: Vec<AgentSummary> = agents.into_iter().map(Into::into).collect();
            Json(summaries).into_response()
        }
        Err(e) => storage_failure(e),
    }
}

pub async fn get_agent(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.store.get_agent(&id).await {
        Ok(Some(agent)) => Json(AgentSummary::from(agent)).into_response(),
        Ok(None) => not_found("agent"),
        Err(e) => storage_failure(e),
    }
}
