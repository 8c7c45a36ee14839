use std::env;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub redis_url: String,
    pub artifact_dir: String,
    /// Liveness sweep period, seconds.
    pub sweep_interval_seconds: u64,
    /// Sessions silent for longer than this are evicted. Must stay above the
    /// agents' 30s heartbeat interval so one missed beat is not fatal.
    pub liveness_timeout_seconds: u64,
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self {
            port: env::var("SWITCHBOARD_PORT")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(8080),
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            artifact_dir: env::var("SWITCHBOARD_DATA_DIR").unwrap_or_else(|_| "data".to_string()),
            sweep_interval_seconds: env::var("SWITCHBOARD_SWEEP_INTERVAL")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(30),
            liveness_timeout_seconds: env::var("SWITCHBOARD_LIVENESS_TIMEOUT")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(60),
        };
        if config.liveness_timeout_seconds <= config.sweep_interval_seconds {
            warn!(
                "liveness timeout {}s must exceed the sweep interval {}s; using {}s",
                config.liveness_timeout_seconds,
                config.sweep_interval_seconds,
                config.sweep_interval_seconds * 2
            );
            config.liveness_timeout_seconds = config.sweep_interval_seconds * 2;
        }
        config
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            redis_url: "redis://localhost:6379".to_string(),
            artifact_dir: "data".to_string(),
            sweep_interval_seconds: 30,
            liveness_timeout_seconds: 60,
        }
    }
}
