use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use crate::error::JobError;
use crate::remote::{describe_status, is_auth_failure, RemoteClient};
use crate::{JobHandle, Tool};

/// Starts a remote run of `tool` against `target`.
///
/// Implementations make exactly one request and never retry; the returned
/// handle is what the eventual artifact name will contain.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    async fn dispatch(&self, tool: Tool, target: &str) -> Result<JobHandle, JobError>;
}

#[async_trait]
impl JobDispatcher for RemoteClient {
    async fn dispatch(&self, tool: Tool, target: &str) -> Result<JobHandle, JobError> {
        // The handle exists before the request so failures can still name it.
        let handle = JobHandle::generate();
        let fail = |reason: String| JobError::Dispatch {
            handle: handle.clone(),
            reason,
        };

        let url = self
            .repo_url(&format!("actions/workflows/{}/dispatches", self.config.workflow))
            .map_err(|e| fail(format!("invalid dispatch url: {e}")))?;

        let payload = json!({
            "ref": self.config.git_ref,
            "inputs": {
                "tool_command": tool.as_str(),
                "target_host": target,
                "dispatch_id": handle.as_str(),
            }
        });

        let response = self
            .authorize(self.client.post(url))
            .json(&payload)
            .send()
            .await
            .map_err(|e| fail(e.to_string()))?;

        let status = response.status();
        if is_auth_failure(status) {
            return Err(self.session_rejected("dispatch", status));
        }
        if !status.is_success() {
            warn!(%tool, host = %target, "dispatch rejected: {}", describe_status(status));
            return Err(fail(describe_status(status)));
        }

        info!(%tool, host = %target, handle = %handle, "workflow dispatched");
        Ok(handle)
    }
}
