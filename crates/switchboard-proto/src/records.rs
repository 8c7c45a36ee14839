use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::token::hash_token;
use crate::wire::{Browser, RunMode};

/// Whether an agent currently holds a live session with the controller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Connected,
    Disconnected,
}

/// Durable record for one agent, keyed by its stable id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub name: String,
    /// Registration token, hashed at rest. A correlation key, not a trust
    /// boundary: re-registration with a new token rotates it.
    pub token_hash: String,
    pub connectivity: Connectivity,
    pub last_seen: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_job_id: Option<String>,
}

impl AgentRecord {
    /// Auto-provision a record for a first-time registration.
    pub fn provision(id: &str, name: Option<String>, token: &str) -> Self {
        let name = name.unwrap_or_else(|| {
            let short = id.get(..8).unwrap_or(id);
            format!("agent-{short}")
        });
        Self {
            id: id.to_string(),
            name,
            token_hash: hash_token(token),
            connectivity: Connectivity::Connected,
            last_seen: Utc::now(),
            current_job_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Record,
    Run,
}

/// Persisted lifecycle of a job. `Recording` and `Running` are the
/// dispatched states; `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Recording,
    Running,
    Ready,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Durable record for one unit of work, independent of any particular agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub name: String,
    pub kind: JobKind,
    /// Target URL for record jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub browser: Browser,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<RunMode>,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Reference to the recorded artifact, opaque to the core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// A freshly created recording job, not yet dispatched.
    pub fn record(name: &str, target: &str, browser: Browser) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.trim().to_string(),
            kind: JobKind::Record,
            target: Some(target.trim().to_string()),
            browser,
            mode: None,
            status: JobStatus::Pending,
            message: None,
            artifact: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provision_derives_name_from_id() {
        let record = AgentRecord::provision("0a1b2c3d-ffff-0000-aaaa-bbbbccccdddd", None, "tok");
        assert_eq!(record.name, "agent-0a1b2c3d");
        assert_eq!(record.connectivity, Connectivity::Connected);
        assert_ne!(record.token_hash, "tok");
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Ready.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
    }
}
