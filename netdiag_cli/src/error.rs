use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::archive::DecodeError;
use crate::JobHandle;

/// Failure kinds a job can end in. All of them are terminal for the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Dispatch,
    Locator,
    Decode,
    Timeout,
    Auth,
}

#[derive(Error, Debug)]
pub enum JobError {
    #[error("failed to dispatch job {handle}: {reason}")]
    Dispatch { handle: JobHandle, reason: String },

    #[error("artifact lookup failed: {0}")]
    Locator(String),

    #[error("artifact could not be decoded: {0}")]
    Decode(#[from] DecodeError),

    #[error("no artifact appeared after waiting {}s", waited.as_secs())]
    Timeout { waited: Duration },

    #[error("authorization rejected: {0}")]
    Auth(String),
}

impl JobError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JobError::Dispatch { .. } => ErrorKind::Dispatch,
            JobError::Locator(_) => ErrorKind::Locator,
            JobError::Decode(_) => ErrorKind::Decode,
            JobError::Timeout { .. } => ErrorKind::Timeout,
            JobError::Auth(_) => ErrorKind::Auth,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("target must not be empty")]
    EmptyTarget,
}
