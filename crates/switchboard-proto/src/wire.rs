use serde::{Deserialize, Serialize};

/// Browser engines an agent can drive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Browser {
    Chromium,
    Firefox,
    Webkit,
}

impl Browser {
    pub fn as_str(&self) -> &'static str {
        match self {
            Browser::Chromium => "chromium",
            Browser::Firefox => "firefox",
            Browser::Webkit => "webkit",
        }
    }
}

impl Default for Browser {
    fn default() -> Self {
        Browser::Chromium
    }
}

/// How a replay job drives the browser.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Headless,
    Visible,
}

impl Default for RunMode {
    fn default() -> Self {
        RunMode::Headless
    }
}

/// What an agent is currently doing, as it reports it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentActivity {
    Idle,
    Recording,
    Running,
}

/// Messages sent from an agent to the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    /// Registration handshake, sent once per connection.
    Register {
        agent_id: String,
        token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// Periodic liveness probe.
    Heartbeat { agent_id: String },
    /// Activity report, optionally tied to a job.
    Status {
        agent_id: String,
        status: AgentActivity,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

/// Messages sent from the controller to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControllerMessage {
    /// Registration acknowledgment.
    #[serde(rename = "registered")]
    Registered,
    /// Start a recording session against a target URL.
    #[serde(rename = "command:record")]
    Record {
        job_id: String,
        target: String,
        browser: Browser,
    },
    /// Replay a previously recorded script.
    #[serde(rename = "command:run")]
    Run { job_id: String, mode: RunMode },
    /// Terminate the in-flight execution for a job.
    #[serde(rename = "command:stop")]
    Stop { job_id: String },
    /// Protocol-level error reply; the connection stays open.
    #[serde(rename = "error")]
    Error { message: String },
}

impl ControllerMessage {
    /// Job targeted by this message, when it is a dispatchable command.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            ControllerMessage::Record { job_id, .. }
            | ControllerMessage::Run { job_id, .. }
            | ControllerMessage::Stop { job_id } => Some(job_id),
            _ => None,
        }
    }

    /// Job status a successful send of this command implies.
    pub fn dispatched_status(&self) -> Option<crate::records::JobStatus> {
        match self {
            ControllerMessage::Record { .. } => Some(crate::records::JobStatus::Recording),
            ControllerMessage::Run { .. } => Some(crate::records::JobStatus::Running),
            _ => None,
        }
    }
}

/// Events fanned out to dashboard observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JobEvent {
    #[serde(rename = "job:update")]
    JobUpdate {
        job_id: String,
        status: crate::records::JobStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}
