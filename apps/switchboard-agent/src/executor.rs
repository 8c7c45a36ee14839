use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{info, warn};

use switchboard_proto::wire::{Browser, RunMode};

/// Terminal result of one job execution.
#[derive(Debug)]
pub struct JobOutcome {
    pub message: String,
    /// Recorded script file, present for record jobs.
    pub artifact: Option<PathBuf>,
}

/// Executes jobs on behalf of the runtime. The runtime only consumes the
/// terminal outcome; how execution happens is this trait's business.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn record(&self, job_id: &str, target: &str, browser: Browser) -> Result<JobOutcome>;
    async fn run(&self, job_id: &str, script: &Path, mode: RunMode) -> Result<JobOutcome>;
}

/// Shells out to the Playwright CLI. Child processes are spawned with
/// kill-on-drop so aborting the surrounding task terminates them.
pub struct PlaywrightExecutor {
    workspace: PathBuf,
}

impl PlaywrightExecutor {
    pub fn new(workspace: PathBuf) -> Self {
        Self { workspace }
    }

    fn job_dir(&self, job_id: &str) -> PathBuf {
        self.workspace.join("jobs").join(job_id)
    }
}

#[async_trait]
impl JobExecutor for PlaywrightExecutor {
    async fn record(&self, job_id: &str, target: &str, browser: Browser) -> Result<JobOutcome> {
        let dir = self.job_dir(job_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let script = dir.join("recording.spec.ts");

        info!(job = %job_id, %target, browser = browser.as_str(), "starting recording");
        let output = Command::new("npx")
            .args(["playwright", "codegen", target, "--target=typescript"])
            .arg("--output")
            .arg(&script)
            .arg(format!("--browser={}", browser.as_str()))
            .kill_on_drop(true)
            .output()
            .await
            .context("failed to launch playwright codegen")?;

        // Codegen only writes the file when the user interacted with the
        // page, and its exit code is unreliable either way. Fall back to a
        // minimal script so the job always yields an artifact.
        let recorded = tokio::fs::metadata(&script)
            .await
            .map(|meta| meta.len() > 0)
            .unwrap_or(false);
        if recorded {
            Ok(JobOutcome {
                message: "recording completed".into(),
                artifact: Some(script),
            })
        } else {
            if !output.status.success() {
                warn!(job = %job_id, status = ?output.status.code(), "codegen exited without a recording");
            }
            tokio::fs::write(&script, minimal_script(job_id, target))
                .await
                .with_context(|| format!("failed to write {}", script.display()))?;
            Ok(JobOutcome {
                message: "recording completed (no actions captured; minimal script created)".into(),
                artifact: Some(script),
            })
        }
    }

    async fn run(&self, job_id: &str, script: &Path, mode: RunMode) -> Result<JobOutcome> {
        info!(job = %job_id, script = %script.display(), ?mode, "running script");
        let mut command = Command::new("npx");
        command.args(["playwright", "test"]).arg(script);
        if mode == RunMode::Visible {
            command.arg("--headed");
        }
        let output = command
            .kill_on_drop(true)
            .output()
            .await
            .context("failed to launch playwright test")?;

        if output.status.success() {
            Ok(JobOutcome {
                message: "run completed".into(),
                artifact: None,
            })
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr.chars().rev().take(500).collect::<Vec<_>>().into_iter().rev().collect();
            bail!(
                "playwright test exited with {:?}: {}",
                output.status.code(),
                tail.trim()
            );
        }
    }
}

/// Placeholder script produced when codegen captured no actions, mirroring
/// what a human would start from.
fn minimal_script(job_id: &str, target: &str) -> String {
    format!(
        "import {{ test, expect }} from '@playwright/test';\n\
         \n\
         test('{job_id}', async ({{ page }}) => {{\n\
         \x20 await page.goto('{target}');\n\
         }});\n"
    )
}
