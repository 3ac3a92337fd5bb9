//! Lifecycle of a single diagnostic job: dispatch, poll for the artifact,
//! decode it and publish the result.
//!
//! A controller owns at most one live job. Every job run carries the epoch it
//! was started under; anything that bumps the epoch (a new submit, a tool
//! switch, a reset) aborts the running task, and any write the stale task
//! still manages to attempt is dropped because its epoch no longer matches.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::archive::{self, DecodeError};
use crate::cache::ResultCache;
use crate::dispatcher::JobDispatcher;
use crate::error::{ErrorKind, JobError, SubmitError};
use crate::locator::ArtifactSource;
use crate::{CacheKey, JobHandle, Tool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Fixed delay before every artifact lookup.
    pub interval: Duration,
    /// Total wait after a successful dispatch before giving up. `None` waits forever.
    pub max_wait: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_wait: Some(Duration::from_secs(600)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Idle,
    Dispatching,
    AwaitingArtifact { handle: JobHandle, polls: u32 },
    Decoding { handle: JobHandle },
    Completed { output: String, cached: bool },
    Failed { kind: ErrorKind, detail: String },
}

impl JobStatus {
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            JobStatus::Dispatching | JobStatus::AwaitingArtifact { .. } | JobStatus::Decoding { .. }
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed { .. } | JobStatus::Failed { .. })
    }
}

/// What the presentation layer sees.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub epoch: u64,
    pub active_tool: Tool,
    pub target: Option<String>,
    pub status: JobStatus,
}

impl Job {
    fn idle(active_tool: Tool) -> Self {
        Self {
            epoch: 0,
            active_tool,
            target: None,
            status: JobStatus::Idle,
        }
    }

    pub fn key(&self) -> Option<CacheKey> {
        self.target
            .as_ref()
            .map(|target| CacheKey::new(self.active_tool, target.clone()))
    }

    pub fn output(&self) -> Option<&str> {
        match &self.status {
            JobStatus::Completed { output, .. } => Some(output),
            _ => None,
        }
    }

    pub fn error_detail(&self) -> Option<&str> {
        match &self.status {
            JobStatus::Failed { detail, .. } => Some(detail),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Submission {
    Started { epoch: u64 },
    CacheHit,
    /// The same tool and target are already in flight; nothing was done.
    AlreadyRunning,
}

pub struct JobController {
    dispatcher: Arc<dyn JobDispatcher>,
    artifacts: Arc<dyn ArtifactSource>,
    cache: Arc<dyn ResultCache>,
    policy: PollPolicy,
    state: Arc<watch::Sender<Job>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl JobController {
    pub fn new(
        dispatcher: Arc<dyn JobDispatcher>,
        artifacts: Arc<dyn ArtifactSource>,
        cache: Arc<dyn ResultCache>,
        policy: PollPolicy,
    ) -> Self {
        let (state, _) = watch::channel(Job::idle(Tool::Ping));
        Self {
            dispatcher,
            artifacts,
            cache,
            policy,
            state: Arc::new(state),
            task: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    pub fn snapshot(&self) -> Job {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Job> {
        self.state.subscribe()
    }

    /// Waits until the current job is no longer live and returns it.
    pub async fn settled(&self) -> Job {
        let mut rx = self.state.subscribe();
        let settled = rx.wait_for(|job| !job.status.is_live()).await.map(|job| Job::clone(&job));
        match settled {
            Ok(job) => job,
            Err(_) => self.snapshot(),
        }
    }

    /// Starts a job for `(tool, target)` unless a cached result or an
    /// identical live job makes that unnecessary.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, tool: Tool, target: &str) -> Result<Submission, SubmitError> {
        let target = target.trim();
        if target.is_empty() {
            return Err(SubmitError::EmptyTarget);
        }
        let key = CacheKey::new(tool, target);

        let mut task = self.lock_task();
        let current = self.snapshot();
        if current.status.is_live() && current.key().as_ref() == Some(&key) {
            debug!(key = %key, "job already in flight");
            return Ok(Submission::AlreadyRunning);
        }

        if let Some(previous) = task.take() {
            previous.abort();
        }
        let epoch = current.epoch + 1;

        if let Some(output) = self.cache.get(&key) {
            info!(key = %key, "result served from cache");
            self.state.send_replace(Job {
                epoch,
                active_tool: tool,
                target: Some(target.to_string()),
                status: JobStatus::Completed {
                    output,
                    cached: true,
                },
            });
            return Ok(Submission::CacheHit);
        }

        self.state.send_replace(Job {
            epoch,
            active_tool: tool,
            target: Some(target.to_string()),
            status: JobStatus::Dispatching,
        });

        let run = JobRun {
            epoch,
            key,
            dispatcher: self.dispatcher.clone(),
            artifacts: self.artifacts.clone(),
            cache: self.cache.clone(),
            policy: self.policy,
            state: self.state.clone(),
        };
        *task = Some(tokio::spawn(run.drive()));

        Ok(Submission::Started { epoch })
    }

    /// Selects another tool. Any job in flight is discarded and the
    /// controller goes back to idle. Returns `false` if `tool` was already active.
    pub fn switch_tool(&self, tool: Tool) -> bool {
        if self.snapshot().active_tool == tool {
            return false;
        }
        self.clear(Some(tool));
        true
    }

    pub fn reset(&self) {
        self.clear(None);
    }

    fn clear(&self, tool: Option<Tool>) {
        let mut task = self.lock_task();
        if let Some(previous) = task.take() {
            previous.abort();
        }
        self.state.send_modify(|job| {
            job.epoch += 1;
            if let Some(tool) = tool {
                job.active_tool = tool;
            }
            job.target = None;
            job.status = JobStatus::Idle;
        });
    }

    fn lock_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for JobController {
    fn drop(&mut self) {
        let task = self.task.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = task.take() {
            task.abort();
        }
    }
}

enum Halt {
    Superseded,
    Failed(JobError),
}

impl From<JobError> for Halt {
    fn from(err: JobError) -> Self {
        Halt::Failed(err)
    }
}

/// Everything one spawned job needs; tied to the epoch it was started under.
struct JobRun {
    epoch: u64,
    key: CacheKey,
    dispatcher: Arc<dyn JobDispatcher>,
    artifacts: Arc<dyn ArtifactSource>,
    cache: Arc<dyn ResultCache>,
    policy: PollPolicy,
    state: Arc<watch::Sender<Job>>,
}

impl JobRun {
    async fn drive(self) {
        match self.execute().await {
            Ok(output) => {
                let completed = JobStatus::Completed {
                    output: output.clone(),
                    cached: false,
                };
                // Only a run that actually published its result may cache it.
                if !self.apply(completed) {
                    debug!(key = %self.key, epoch = self.epoch, "result dropped, job superseded");
                    return;
                }
                info!(key = %self.key, bytes = output.len(), "job completed");
                if let Err(e) = self.cache.put(self.key.clone(), output) {
                    warn!(key = %self.key, "result not cached: {e}");
                }
            }
            Err(Halt::Failed(err)) => {
                warn!(key = %self.key, kind = ?err.kind(), "job failed: {err}");
                self.apply(JobStatus::Failed {
                    kind: err.kind(),
                    detail: err.to_string(),
                });
            }
            Err(Halt::Superseded) => {
                debug!(key = %self.key, epoch = self.epoch, "job superseded");
            }
        }
    }

    async fn execute(&self) -> Result<String, Halt> {
        let handle = self
            .dispatcher
            .dispatch(self.key.tool, &self.key.target)
            .await?;
        self.advance(JobStatus::AwaitingArtifact {
            handle: handle.clone(),
            polls: 0,
        })?;

        let started = Instant::now();
        let mut polls = 0u32;
        let artifact = loop {
            sleep(self.policy.interval).await;
            if !self.is_current() {
                return Err(Halt::Superseded);
            }

            polls += 1;
            if let Some(artifact) = self.artifacts.locate(&handle).await? {
                break artifact;
            }
            debug!(handle = %handle, polls, "artifact not ready");

            if let Some(max_wait) = self.policy.max_wait {
                let waited = started.elapsed();
                if waited >= max_wait {
                    return Err(JobError::Timeout { waited }.into());
                }
            }
            self.advance(JobStatus::AwaitingArtifact {
                handle: handle.clone(),
                polls,
            })?;
        };

        self.advance(JobStatus::Decoding {
            handle: handle.clone(),
        })?;
        let bytes = self.artifacts.download(&artifact).await?;

        let output = tokio::task::spawn_blocking(move || {
            archive::decode(&bytes).and_then(|files| archive::extract_output(files, &handle))
        })
        .await
        .map_err(|e| JobError::from(DecodeError::Interrupted(e.to_string())))?
        .map_err(JobError::from)?;

        Ok(output)
    }

    fn is_current(&self) -> bool {
        self.state.borrow().epoch == self.epoch
    }

    /// Publishes `status` if this run still owns the controller.
    fn apply(&self, status: JobStatus) -> bool {
        self.state.send_if_modified(|job| {
            if job.epoch != self.epoch {
                return false;
            }
            job.status = status;
            true
        })
    }

    fn advance(&self, status: JobStatus) -> Result<(), Halt> {
        if self.apply(status) {
            Ok(())
        } else {
            Err(Halt::Superseded)
        }
    }
}
