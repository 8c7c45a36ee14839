use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tracing::info;

/// Uploads and downloads job artifacts over the controller's HTTP surface.
/// The artifact is an opaque byte stream keyed by job id.
#[derive(Clone)]
pub struct ArtifactClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl ArtifactClient {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    pub async fn upload(&self, job_id: &str, path: &Path) -> Result<()> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read artifact {}", path.display()))?;
        let url = format!("{}/jobs/{}/artifact", self.base_url, job_id);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await
            .context("artifact upload request failed")?;
        if !response.status().is_success() {
            bail!("artifact upload rejected: {}", response.status());
        }
        info!(job = %job_id, "artifact uploaded");
        Ok(())
    }

    pub async fn download(&self, job_id: &str, dest_dir: &Path) -> Result<PathBuf> {
        let url = format!("{}/jobs/{}/artifact", self.base_url, job_id);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .context("artifact download request failed")?;
        if !response.status().is_success() {
            bail!("artifact download rejected: {}", response.status());
        }
        let bytes = response.bytes().await.context("artifact body unreadable")?;

        tokio::fs::create_dir_all(dest_dir)
            .await
            .with_context(|| format!("failed to create {}", dest_dir.display()))?;
        let path = dest_dir.join(format!("{job_id}.spec.ts"));
        tokio::fs::write(&path, &bytes)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(job = %job_id, "artifact downloaded to {}", path.display());
        Ok(path)
    }
}
