use clap::Parser;

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "switchboard")]
#[command(about = "Switchboard controller: routes browser-automation jobs to remote agents")]
pub struct Cli {
    /// Port to listen on (overrides SWITCHBOARD_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Redis connection URL (overrides REDIS_URL)
    #[arg(long)]
    pub redis_url: Option<String>,

    /// Directory for job artifacts (overrides SWITCHBOARD_DATA_DIR)
    #[arg(long)]
    pub data_dir: Option<String>,
}

impl Cli {
    /// Env-derived config with CLI flags layered on top.
    pub fn into_config(self) -> Config {
        let mut config = Config::from_env();
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(redis_url) = self.redis_url {
            config.redis_url = redis_url;
        }
        if let Some(data_dir) = self.data_dir {
            config.artifact_dir = data_dir;
        }
        config
    }
}
