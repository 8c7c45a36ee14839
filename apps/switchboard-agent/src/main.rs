mod artifacts;
mod config;
mod executor;
mod runtime;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::artifacts::ArtifactClient;
use crate::config::Identity;
use crate::executor::PlaywrightExecutor;
use crate::runtime::AgentRuntime;

#[derive(Debug, Parser)]
#[command(name = "switchboard-agent", about = "Remote browser automation agent")]
struct Cli {
    /// Controller base URL (HTTP surface, used for artifact transfer)
    #[arg(long, env = "SWITCHBOARD_URL", default_value = "http://localhost:8080")]
    controller_url: String,

    /// Websocket URL; derived from the controller URL when omitted
    #[arg(long, env = "SWITCHBOARD_WS_URL")]
    ws_url: Option<String>,

    /// Identity file, created on first run
    #[arg(long, env = "SWITCHBOARD_AGENT_CONFIG", default_value = "agent-config.json")]
    config: PathBuf,

    /// Directory for recordings and downloaded scripts
    #[arg(long, env = "SWITCHBOARD_AGENT_WORKSPACE", default_value = ".")]
    workspace: PathBuf,
}

fn ws_url_from_http(base: &str) -> String {
    let base = base.trim_end_matches('/');
    let switched = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{switched}/ws")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let identity = Identity::load_or_create(&cli.config)?;
    info!(agent = %identity.agent_id, name = %identity.name, "agent identity loaded");

    let ws_url = cli
        .ws_url
        .unwrap_or_else(|| ws_url_from_http(&cli.controller_url));
    let artifacts = ArtifactClient::new(&cli.controller_url, &identity.token);
    let executor = Arc::new(PlaywrightExecutor::new(cli.workspace.clone()));
    let runtime = AgentRuntime::new(identity, ws_url, executor, artifacts, cli.workspace);

    tokio::select! {
        result = runtime.run() => {
            if let Err(e) = result {
                error!("agent loop failed: {e:#}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::ws_url_from_http;

    #[test]
    fn derives_ws_url_from_http_base() {
        assert_eq!(ws_url_from_http("http://localhost:8080"), "ws://localhost:8080/ws");
        assert_eq!(ws_url_from_http("https://switchboard.example/"), "wss://switchboard.example/ws");
    }
}
