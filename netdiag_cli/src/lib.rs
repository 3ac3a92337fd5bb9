pub mod archive;
pub mod auth;
pub mod cache;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod locator;
pub mod remote;
pub mod utils;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

/// Diagnostic commands the remote workflow knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Tool {
    Ping,
    Traceroute,
    Whois,
    Dig,
    Nslookup,
}

impl Tool {
    pub const ALL: [Tool; 5] = [
        Tool::Ping,
        Tool::Traceroute,
        Tool::Whois,
        Tool::Dig,
        Tool::Nslookup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tool::Ping => "ping",
            Tool::Traceroute => "traceroute",
            Tool::Whois => "whois",
            Tool::Dig => "dig",
            Tool::Nslookup => "nslookup",
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown tool: {0}")]
pub struct UnknownTool(pub String);

impl FromStr for Tool {
    type Err = UnknownTool;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        Tool::ALL
            .into_iter()
            .find(|tool| tool.as_str() == lowered)
            .ok_or_else(|| UnknownTool(s.to_string()))
    }
}

/// Correlation id sent along with a dispatch; the remote workflow embeds it
/// in the artifact name and in the name of the output file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHandle(String);

impl JobHandle {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the archive entry holding the command output.
    pub fn artifact_entry(&self) -> String {
        format!("{}.txt", self.0)
    }
}

impl From<&str> for JobHandle {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub tool: Tool,
    pub target: String,
}

impl CacheKey {
    pub fn new(tool: Tool, target: impl Into<String>) -> Self {
        Self {
            tool,
            target: target.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.tool, self.target)
    }
}

/// One entry of the remote artifact listing. Fetched fresh on every poll.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ArtifactRef {
    pub id: u64,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub download_url: Url,
}

impl ArtifactRef {
    pub fn matches(&self, handle: &JobHandle) -> bool {
        self.name.contains(handle.as_str())
    }
}
