use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::JobError;
use crate::remote::{describe_status, is_auth_failure, RemoteClient};
use crate::{ArtifactRef, JobHandle};

/// Finds and fetches the artifact a dispatched job eventually uploads.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// `Ok(None)` means the remote job has not produced its artifact yet.
    async fn locate(&self, handle: &JobHandle) -> Result<Option<ArtifactRef>, JobError>;

    async fn download(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, JobError>;
}

/// Picks the artifact whose name contains `handle`; the newest one wins if several do.
pub fn select_artifact(artifacts: Vec<ArtifactRef>, handle: &JobHandle) -> Option<ArtifactRef> {
    artifacts
        .into_iter()
        .filter(|artifact| artifact.matches(handle))
        .max_by_key(|artifact| artifact.created_at)
}

#[derive(Deserialize)]
struct ListedArtifact {
    id: u64,
    name: String,
    created_at: DateTime<Utc>,
    archive_download_url: String,
}

impl RemoteClient {
    pub async fn list_artifacts(&self) -> Result<Vec<ArtifactRef>, JobError> {
        let mut url = self
            .repo_url("actions/artifacts")
            .map_err(|e| JobError::Locator(format!("invalid listing url: {e}")))?;
        url.query_pairs_mut().append_pair("per_page", "100");

        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(|e| JobError::Locator(e.to_string()))?;

        let status = response.status();
        if is_auth_failure(status) {
            return Err(self.session_rejected("artifact listing", status));
        }
        if !status.is_success() {
            return Err(JobError::Locator(format!(
                "artifact listing: {}",
                describe_status(status)
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| JobError::Locator(format!("artifact listing body: {e}")))?;

        let listed = match body.get("artifacts").and_then(Value::as_array) {
            Some(items) => items.clone(),
            None => Vec::new(),
        };

        let mut artifacts = Vec::with_capacity(listed.len());
        for item in listed {
            let raw: ListedArtifact = match serde_json::from_value(item) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("skipping malformed artifact entry: {e}");
                    continue;
                }
            };
            let download_url = match self.proxied_download_url(&raw.archive_download_url) {
                Ok(url) => url,
                Err(e) => {
                    warn!(artifact = %raw.name, "skipping artifact with bad download url: {e}");
                    continue;
                }
            };
            artifacts.push(ArtifactRef {
                id: raw.id,
                name: raw.name,
                created_at: raw.created_at,
                download_url,
            });
        }

        Ok(artifacts)
    }
}

#[async_trait]
impl ArtifactSource for RemoteClient {
    async fn locate(&self, handle: &JobHandle) -> Result<Option<ArtifactRef>, JobError> {
        let artifacts = self.list_artifacts().await?;
        let listed = artifacts.len();
        let found = select_artifact(artifacts, handle);
        debug!(handle = %handle, listed, found = found.is_some(), "artifact lookup");
        Ok(found)
    }

    async fn download(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, JobError> {
        let response = self
            .authorize(self.client.get(artifact.download_url.clone()))
            .send()
            .await
            .map_err(|e| JobError::Locator(format!("artifact download: {e}")))?;

        let status = response.status();
        if is_auth_failure(status) {
            return Err(self.session_rejected("artifact download", status));
        }
        if !status.is_success() {
            return Err(JobError::Locator(format!(
                "artifact download: {}",
                describe_status(status)
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| JobError::Locator(format!("artifact download body: {e}")))?;
        Ok(bytes.to_vec())
    }
}
