mod cli;
mod config;
mod dispatch;
mod events;
mod handlers;
mod registry;
mod storage;
mod websocket;

use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::{
    cli::Cli,
    dispatch::Dispatcher,
    events::EventBus,
    handlers::{
        create_record_job, delete_job, download_artifact, get_agent, get_job, health_check,
        list_agents, list_jobs, run_job, stop_job, upload_artifact,
    },
    registry::Registry,
    storage::{RedisStore, SharedStore},
    websocket::{agent_ws_handler, ui_ws_handler},
};

/// Shared handles for every request and connection handler.
#[derive(Clone)]
pub struct AppState {
    pub store: SharedStore,
    pub registry: Arc<Registry>,
    pub events: EventBus,
    pub dispatcher: Dispatcher,
    pub artifact_dir: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Cli::parse().into_config();
    info!("starting switchboard controller on port {}", config.port);
    info!("redis url: {}", config.redis_url);
    info!(
        "liveness: sweep every {}s, evict after {}s of silence",
        config.sweep_interval_seconds, config.liveness_timeout_seconds
    );

    let store: SharedStore = match RedisStore::connect(&config.redis_url).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("failed to connect to redis: {e}");
            std::process::exit(1);
        }
    };

    let registry = Arc::new(Registry::new());
    let events = EventBus::default();
    let dispatcher = Dispatcher::new(registry.clone(), store.clone());

    tokio::spawn(registry.clone().run_liveness_sweep(
        store.clone(),
        Duration::from_secs(config.sweep_interval_seconds),
        Duration::from_secs(config.liveness_timeout_seconds),
    ));

    let state = AppState {
        store,
        registry,
        events,
        dispatcher,
        artifact_dir: PathBuf::from(&config.artifact_dir),
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/jobs", get(list_jobs))
        .route("/jobs/record", post(create_record_job))
        .route("/jobs/:id", get(get_job).delete(delete_job))
        .route("/jobs/:id/run", post(run_job))
        .route("/jobs/:id/stop", post(stop_job))
        .route(
            "/jobs/:id/artifact",
            post(upload_artifact).get(download_artifact),
        )
        .route("/agents", get(list_agents))
        .route("/agents/:id", get(get_agent))
        .route("/ws", get(agent_ws_handler))
        .route("/ws/ui", get(ui_ws_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };
    info!("switchboard listening on {addr}");

    if let Err(e) = axum::serve(listener, app).await {
        error!("server error: {e}");
        std::process::exit(1);
    }
}
