use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::controller::PollPolicy;
use crate::Tool;

pub const DEFAULT_API_BASE_URL: &str = "https://github-utils-api.onrender.com";
const DEFAULT_OWNER: &str = "0xReyes";
const DEFAULT_REPO: &str = "ip-tools";
const DEFAULT_WORKFLOW: &str = "backend-api-trigger.yml";
const DEFAULT_REF: &str = "main";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
const DEFAULT_MAX_WAIT_SECS: u64 = 600;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{var} is not a valid URL: {source}")]
    InvalidUrl {
        var: &'static str,
        #[source]
        source: url::ParseError,
    },

    #[error("{var} must be a whole number of seconds, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("{var} lists an unknown tool: {value}")]
    InvalidTool { var: &'static str, value: String },

    #[error("{var} enables no tools")]
    NoTools { var: &'static str },
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_base_url: Url,
    pub github_api_root: Url,
    pub owner: String,
    pub repo: String,
    pub workflow: String,
    pub git_ref: String,
    pub poll_interval: Duration,
    /// `None` keeps polling until the artifact shows up.
    pub max_wait: Option<Duration>,
    pub request_timeout: Duration,
    pub tools: Vec<Tool>,
    pub cache_file: Option<PathBuf>,
}

impl ClientConfig {
    /// Configuration pointing every remote call at `base`, defaults elsewhere.
    pub fn with_base_url(base: Url) -> Self {
        let github_api_root = api_root_for(&base);
        Self {
            api_base_url: base,
            github_api_root,
            owner: DEFAULT_OWNER.to_string(),
            repo: DEFAULT_REPO.to_string(),
            workflow: DEFAULT_WORKFLOW.to_string(),
            git_ref: DEFAULT_REF.to_string(),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            max_wait: Some(Duration::from_secs(DEFAULT_MAX_WAIT_SECS)),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            tools: Tool::ALL.to_vec(),
            cache_file: None,
        }
    }

    /// Reads `NETDIAG_*` variables. Call `dotenv().ok()` first to pick up a `.env`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base = parse_url(
            "NETDIAG_API_BASE_URL",
            lookup("NETDIAG_API_BASE_URL").as_deref().unwrap_or(DEFAULT_API_BASE_URL),
        )?;
        let mut config = Self::with_base_url(base);

        if let Some(root) = lookup("NETDIAG_GITHUB_API_ROOT") {
            config.github_api_root = parse_url("NETDIAG_GITHUB_API_ROOT", &with_trailing_slash(&root))?;
        }
        if let Some(owner) = lookup("NETDIAG_OWNER") {
            config.owner = owner;
        }
        if let Some(repo) = lookup("NETDIAG_REPO") {
            config.repo = repo;
        }
        if let Some(workflow) = lookup("NETDIAG_WORKFLOW") {
            config.workflow = workflow;
        }
        if let Some(git_ref) = lookup("NETDIAG_REF") {
            config.git_ref = git_ref;
        }
        if let Some(value) = lookup("NETDIAG_POLL_INTERVAL_SECS") {
            config.poll_interval = Duration::from_secs(parse_secs("NETDIAG_POLL_INTERVAL_SECS", &value)?);
        }
        if let Some(value) = lookup("NETDIAG_MAX_WAIT_SECS") {
            config.max_wait = match parse_secs("NETDIAG_MAX_WAIT_SECS", &value)? {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            };
        }
        if let Some(value) = lookup("NETDIAG_REQUEST_TIMEOUT_SECS") {
            config.request_timeout = Duration::from_secs(parse_secs("NETDIAG_REQUEST_TIMEOUT_SECS", &value)?);
        }
        if let Some(value) = lookup("NETDIAG_TOOLS") {
            config.tools = parse_tools("NETDIAG_TOOLS", &value)?;
        }
        config.cache_file = lookup("NETDIAG_CACHE_FILE")
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);

        Ok(config)
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: self.poll_interval,
            max_wait: self.max_wait,
        }
    }

    pub fn is_enabled(&self, tool: Tool) -> bool {
        self.tools.contains(&tool)
    }
}

fn api_root_for(base: &Url) -> Url {
    let mut root = base.clone();
    let path = format!("{}/api.github.com/", base.path().trim_end_matches('/'));
    root.set_path(&path);
    root
}

fn with_trailing_slash(raw: &str) -> String {
    if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    }
}

fn parse_url(var: &'static str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|source| ConfigError::InvalidUrl { var, source })
}

fn parse_secs(var: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidNumber {
        var,
        value: raw.to_string(),
    })
}

fn parse_tools(var: &'static str, raw: &str) -> Result<Vec<Tool>, ConfigError> {
    let mut tools = Vec::new();
    for item in raw.split(',').map(str::trim).filter(|item| !item.is_empty()) {
        let tool = item.parse::<Tool>().map_err(|_| ConfigError::InvalidTool {
            var,
            value: item.to_string(),
        })?;
        if !tools.contains(&tool) {
            tools.push(tool);
        }
    }
    if tools.is_empty() {
        return Err(ConfigError::NoTools { var });
    }
    Ok(tools)
}
