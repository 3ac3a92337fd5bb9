use std::time::Duration;

use backoff::{future::retry, ExponentialBackoff};
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::error::JobError;
use crate::remote::{describe_status, RemoteClient};

#[derive(Debug, Default, Deserialize)]
struct AuthResponse {
    #[serde(default)]
    success: bool,
    token: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub token: Option<String>,
    pub message: Option<String>,
}

impl RemoteClient {
    /// Logs in against the proxy and keeps the returned bearer token for later calls.
    pub async fn login(&self) -> Result<Session, JobError> {
        let url = self
            .auth_url("login")
            .map_err(|e| JobError::Auth(format!("invalid login url: {e}")))?;

        let response = self
            .client
            .post(url)
            .send()
            .await
            .map_err(|e| JobError::Auth(format!("network error during login: {e}")))?;

        let status = response.status();
        let body: AuthResponse = response.json().await.unwrap_or_default();

        if status.as_u16() != 200 || !body.success {
            let reason = body
                .message
                .unwrap_or_else(|| format!("authentication failed ({})", describe_status(status)));
            return Err(JobError::Auth(reason));
        }

        self.set_token(body.token.clone());
        Ok(Session {
            token: body.token,
            message: body.message,
        })
    }

    /// Asks the proxy whether the current credentials are still accepted.
    pub async fn verify(&self) -> bool {
        let url = match self.auth_url("verify") {
            Ok(url) => url,
            Err(_) => return false,
        };

        let response = match self.authorize(self.client.post(url)).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("auth verification failed: {e}");
                return false;
            }
        };

        if response.status().as_u16() != 200 {
            return false;
        }
        response
            .json::<AuthResponse>()
            .await
            .map(|body| body.success)
            .unwrap_or(false)
    }

    /// Retries `login` with exponential backoff until it succeeds or `max_elapsed` passes.
    pub async fn login_with_retry(&self, max_elapsed: Duration) -> Result<Session, JobError> {
        let policy = ExponentialBackoff {
            max_elapsed_time: Some(max_elapsed),
            ..ExponentialBackoff::default()
        };

        let session = retry(policy, || async {
            self.login().await.map_err(|e| {
                warn!("login attempt failed: {e}");
                backoff::Error::transient(e)
            })
        })
        .await?;

        info!("authenticated against {}", self.config.api_base_url);
        Ok(session)
    }

    /// Reuses the current session when it verifies, otherwise logs in again.
    pub async fn ensure_session(&self, max_elapsed: Duration) -> Result<(), JobError> {
        if self.verify().await {
            return Ok(());
        }
        self.login_with_retry(max_elapsed).await.map(|_| ())
    }

    /// Keeps the proxy session alive for a long-running process.
    ///
    /// Logs in straight away, then again every time a call is rejected with
    /// 401. A login that exhausts `max_elapsed` is logged and retried on the
    /// next rejection. Never returns.
    pub async fn maintain_session(&self, max_elapsed: Duration) {
        loop {
            if let Err(e) = self.login_with_retry(max_elapsed).await {
                error!("could not authenticate against the proxy: {e}");
            }
            self.session_expired.notified().await;
            info!("session expired, logging in again");
        }
    }
}
