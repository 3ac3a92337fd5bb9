use std::sync::RwLock;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::{Client, RequestBuilder, StatusCode};
use tokio::sync::Notify;
use tracing::warn;
use url::Url;

use crate::config::ClientConfig;
use crate::error::JobError;

const GITHUB_API_ORIGIN: &str = "https://api.github.com";
const GITHUB_ACCEPT: &str = "application/vnd.github.v3+json";

/// HTTP client for the authenticating proxy that fronts the CI provider.
///
/// Dispatch, artifact listing, artifact download and the login calls all
/// share one connection pool, cookie store and bearer token.
pub struct RemoteClient {
    pub(crate) client: Client,
    pub(crate) config: ClientConfig,
    token: RwLock<Option<String>>,
    pub(crate) session_expired: Notify,
}

impl RemoteClient {
    pub fn new(config: ClientConfig) -> Result<Self, reqwest::Error> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(GITHUB_ACCEPT));

        let client = Client::builder()
            .timeout(config.request_timeout)
            .default_headers(headers)
            .cookie_store(true)
            .build()?;

        Ok(Self {
            client,
            config,
            token: RwLock::new(None),
            session_expired: Notify::new(),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn set_token(&self, token: Option<String>) {
        let mut guard = self.token.write().unwrap_or_else(|e| e.into_inner());
        *guard = token;
    }

    pub fn token(&self) -> Option<String> {
        self.token.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Drops the rejected token and wakes [`RemoteClient::maintain_session`].
    pub(crate) fn session_rejected(&self, context: &str, status: StatusCode) -> JobError {
        warn!("{context} rejected the session: {}", describe_status(status));
        self.set_token(None);
        self.session_expired.notify_one();
        JobError::Auth(format!("{context}: {}", describe_status(status)))
    }

    /// Adds the bearer token, when one is held, to an outgoing request.
    pub(crate) fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    pub(crate) fn repo_url(&self, suffix: &str) -> Result<Url, url::ParseError> {
        self.config.github_api_root.join(&format!(
            "repos/{}/{}/{}",
            self.config.owner, self.config.repo, suffix
        ))
    }

    pub(crate) fn auth_url(&self, endpoint: &str) -> Result<Url, url::ParseError> {
        self.config.api_base_url.join(&format!("auth/{endpoint}"))
    }

    /// Points provider download links at the proxy instead of the provider itself.
    pub(crate) fn proxied_download_url(&self, raw: &str) -> Result<Url, url::ParseError> {
        match raw.strip_prefix(GITHUB_API_ORIGIN) {
            Some(rest) => self
                .config
                .github_api_root
                .join(rest.trim_start_matches('/')),
            None => Url::parse(raw),
        }
    }
}

/// Unauthorized answers are reported separately so callers can stop instead of retrying.
pub(crate) fn is_auth_failure(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED
}

pub(crate) fn describe_status(status: StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => format!("HTTP {} {}", status.as_u16(), reason),
        None => format!("HTTP {}", status.as_u16()),
    }
}
