use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

/// Stable identity of this agent, persisted as a small JSON file so the
/// agent keeps its id and token across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub agent_id: String,
    pub token: String,
    pub name: String,
}

#[derive(Debug, Default, Deserialize)]
struct PartialIdentity {
    agent_id: Option<String>,
    token: Option<String>,
    name: Option<String>,
}

impl Identity {
    /// Load the identity file, filling in and persisting any missing fields.
    /// A first run auto-provisions a fresh id and token.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        let partial = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            match serde_json::from_str::<PartialIdentity>(&raw) {
                Ok(partial) => partial,
                Err(e) => {
                    warn!("ignoring malformed identity file {}: {e}", path.display());
                    PartialIdentity::default()
                }
            }
        } else {
            PartialIdentity::default()
        };

        let mut dirty = false;
        let agent_id = partial.agent_id.unwrap_or_else(|| {
            dirty = true;
            let id = Uuid::new_v4().to_string();
            info!("generated new agent id: {id}");
            id
        });
        let token = partial.token.unwrap_or_else(|| {
            dirty = true;
            switchboard_proto::token::generate_token()
        });
        let name = partial.name.unwrap_or_else(|| {
            dirty = true;
            let short = agent_id.get(..8).unwrap_or(&agent_id);
            format!("agent-{short}")
        });

        let identity = Self { agent_id, token, name };
        if dirty {
            identity.save(path)?;
        }
        Ok(identity)
    }

    fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_run_provisions_and_persists_identity() {
        let dir = std::env::temp_dir().join(format!("sb-agent-test-{}", Uuid::new_v4()));
        let path = dir.join("agent-config.json");

        let first = Identity::load_or_create(&path).unwrap();
        assert!(path.exists());
        assert!(first.name.starts_with("agent-"));

        let second = Identity::load_or_create(&path).unwrap();
        assert_eq!(first.agent_id, second.agent_id);
        assert_eq!(first.token, second.token);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn partial_file_keeps_existing_fields() {
        let dir = std::env::temp_dir().join(format!("sb-agent-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("agent-config.json");
        std::fs::write(&path, r#"{"agent_id":"fixed-id"}"#).unwrap();

        let identity = Identity::load_or_create(&path).unwrap();
        assert_eq!(identity.agent_id, "fixed-id");
        assert!(!identity.token.is_empty());

        std::fs::remove_dir_all(&dir).ok();
    }
}
