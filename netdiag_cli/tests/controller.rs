use std::collections::VecDeque;
use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use netdiag_cli::cache::{CacheError, MemoryCache, ResultCache};
use netdiag_cli::controller::{Job, JobController, JobStatus, PollPolicy, Submission};
use netdiag_cli::dispatcher::JobDispatcher;
use netdiag_cli::error::{ErrorKind, JobError, SubmitError};
use netdiag_cli::locator::ArtifactSource;
use netdiag_cli::{ArtifactRef, CacheKey, JobHandle, Tool};
use tokio::sync::watch;
use url::Url;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

const INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone, Copy)]
enum DispatchOutcome {
    Ack,
    Rejected,
    Unauthorized,
}

struct FakeDispatcher {
    calls: AtomicUsize,
    outcome: DispatchOutcome,
}

impl FakeDispatcher {
    fn new(outcome: DispatchOutcome) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            outcome,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobDispatcher for FakeDispatcher {
    async fn dispatch(&self, _tool: Tool, _target: &str) -> Result<JobHandle, JobError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = JobHandle::from(format!("h{n}").as_str());
        match self.outcome {
            DispatchOutcome::Ack => Ok(handle),
            DispatchOutcome::Rejected => Err(JobError::Dispatch {
                handle,
                reason: "HTTP 422 Unprocessable Entity".into(),
            }),
            DispatchOutcome::Unauthorized => Err(JobError::Auth("dispatch: HTTP 401".into())),
        }
    }
}

#[derive(Clone, Copy)]
enum Poll {
    NotFound,
    Found,
    Broken,
}

/// Answers lookups from a script; once the script runs out every lookup is `NotFound`.
struct FakeArtifacts {
    script: Mutex<VecDeque<Poll>>,
    archive: Mutex<Vec<u8>>,
    locates: AtomicUsize,
    downloads: AtomicUsize,
}

impl FakeArtifacts {
    fn new(script: &[Poll], archive: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.iter().copied().collect()),
            archive: Mutex::new(archive),
            locates: AtomicUsize::new(0),
            downloads: AtomicUsize::new(0),
        })
    }

    fn locates(&self) -> usize {
        self.locates.load(Ordering::SeqCst)
    }

    fn push(&self, step: Poll) {
        self.script.lock().unwrap().push_back(step);
    }
}

#[async_trait]
impl ArtifactSource for FakeArtifacts {
    async fn locate(&self, handle: &JobHandle) -> Result<Option<ArtifactRef>, JobError> {
        self.locates.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().unwrap().pop_front().unwrap_or(Poll::NotFound);
        match step {
            Poll::NotFound => Ok(None),
            Poll::Broken => Err(JobError::Locator("artifact listing: HTTP 502 Bad Gateway".into())),
            Poll::Found => Ok(Some(ArtifactRef {
                id: 1,
                name: format!("result-{handle}.zip"),
                created_at: Utc::now(),
                download_url: Url::parse("http://proxy.local/artifacts/1/zip").unwrap(),
            })),
        }
    }

    async fn download(&self, _artifact: &ArtifactRef) -> Result<Vec<u8>, JobError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(self.archive.lock().unwrap().clone())
    }
}

fn zip_of(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, content) in entries {
        writer.start_file(*name, SimpleFileOptions::default()).unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

struct Harness {
    controller: JobController,
    dispatcher: Arc<FakeDispatcher>,
    artifacts: Arc<FakeArtifacts>,
    cache: Arc<MemoryCache>,
}

fn harness(outcome: DispatchOutcome, artifacts: Arc<FakeArtifacts>, max_wait: Option<Duration>) -> Harness {
    let dispatcher = FakeDispatcher::new(outcome);
    let cache = Arc::new(MemoryCache::new());
    let controller = JobController::new(
        dispatcher.clone(),
        artifacts.clone(),
        cache.clone(),
        PollPolicy {
            interval: INTERVAL,
            max_wait,
        },
    );
    Harness {
        controller,
        dispatcher,
        artifacts,
        cache,
    }
}

async fn wait_until(controller: &JobController, predicate: impl Fn(&Job) -> bool) -> Job {
    let mut rx = controller.subscribe();
    let job = rx.wait_for(|job| predicate(job)).await.unwrap();
    Job::clone(&job)
}

#[tokio::test(start_paused = true)]
async fn ping_completes_after_third_poll_and_is_cached() {
    let output = "PING 8.8.8.8 ...\n";
    let artifacts = FakeArtifacts::new(
        &[Poll::NotFound, Poll::NotFound, Poll::Found],
        zip_of(&[("h1.txt", output)]),
    );
    let h = harness(DispatchOutcome::Ack, artifacts, None);

    let submission = h.controller.submit(Tool::Ping, "8.8.8.8").unwrap();
    assert_eq!(submission, Submission::Started { epoch: 1 });

    let job = h.controller.settled().await;
    assert_eq!(
        job.status,
        JobStatus::Completed {
            output: output.to_string(),
            cached: false
        }
    );
    assert_eq!(job.target.as_deref(), Some("8.8.8.8"));
    assert_eq!(h.dispatcher.calls(), 1);
    assert_eq!(h.artifacts.locates(), 3);
    assert_eq!(
        h.cache.get(&CacheKey::new(Tool::Ping, "8.8.8.8")).as_deref(),
        Some(output)
    );
}

#[tokio::test(start_paused = true)]
async fn repeated_submit_while_live_dispatches_once() {
    let artifacts = FakeArtifacts::new(&[Poll::Found], zip_of(&[("h1.txt", "ok")]));
    let h = harness(DispatchOutcome::Ack, artifacts, None);

    assert!(matches!(h.controller.submit(Tool::Dig, "example.com"), Ok(Submission::Started { .. })));
    for _ in 0..5 {
        assert_eq!(
            h.controller.submit(Tool::Dig, " example.com "),
            Ok(Submission::AlreadyRunning)
        );
    }

    let job = h.controller.settled().await;
    assert_eq!(job.output(), Some("ok"));
    assert_eq!(h.dispatcher.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn cached_result_skips_dispatch() {
    let artifacts = FakeArtifacts::new(&[Poll::Found], zip_of(&[("h1.txt", "whois data\n")]));
    let h = harness(DispatchOutcome::Ack, artifacts, None);

    h.controller.submit(Tool::Whois, "example.com").unwrap();
    let first = h.controller.settled().await;
    assert_eq!(first.output(), Some("whois data\n"));

    assert_eq!(
        h.controller.submit(Tool::Whois, "example.com"),
        Ok(Submission::CacheHit)
    );
    let second = h.controller.snapshot();
    assert_eq!(
        second.status,
        JobStatus::Completed {
            output: "whois data\n".into(),
            cached: true
        }
    );
    assert_eq!(h.dispatcher.calls(), 1);
    assert_eq!(h.cache.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn switching_tools_discards_the_live_job() {
    let artifacts = FakeArtifacts::new(&[Poll::Found], zip_of(&[("h1.txt", "stale")]));
    let h = harness(DispatchOutcome::Ack, artifacts, None);

    h.controller.submit(Tool::Ping, "10.0.0.1").unwrap();
    wait_until(&h.controller, |job| {
        matches!(job.status, JobStatus::AwaitingArtifact { .. })
    })
    .await;

    assert!(h.controller.switch_tool(Tool::Traceroute));
    assert!(h.controller.switch_tool(Tool::Ping));

    tokio::time::sleep(INTERVAL * 10).await;

    let job = h.controller.snapshot();
    assert_eq!(job.status, JobStatus::Idle);
    assert_eq!(job.active_tool, Tool::Ping);
    assert!(job.target.is_none());
    assert_eq!(h.artifacts.locates(), 0);
    assert!(h.cache.is_empty());
}

#[tokio::test(start_paused = true)]
async fn switching_to_the_active_tool_keeps_state() {
    let artifacts = FakeArtifacts::new(&[], Vec::new());
    let h = harness(DispatchOutcome::Ack, artifacts, None);

    assert!(!h.controller.switch_tool(Tool::Ping));
    assert_eq!(h.controller.snapshot().epoch, 0);
}

#[tokio::test(start_paused = true)]
async fn not_found_keeps_polling_one_lookup_per_interval() {
    let artifacts = FakeArtifacts::new(&[], Vec::new());
    let h = harness(DispatchOutcome::Ack, artifacts, None);

    h.controller.submit(Tool::Ping, "192.0.2.1").unwrap();
    tokio::time::sleep(INTERVAL * 3 + Duration::from_secs(5)).await;

    assert_eq!(h.artifacts.locates(), 3);
    assert_eq!(
        h.controller.snapshot().status,
        JobStatus::AwaitingArtifact {
            handle: JobHandle::from("h1"),
            polls: 3
        }
    );
}

#[tokio::test(start_paused = true)]
async fn rejected_dispatch_fails_without_polling() {
    let artifacts = FakeArtifacts::new(&[Poll::Found], Vec::new());
    let h = harness(DispatchOutcome::Rejected, artifacts, None);

    h.controller.submit(Tool::Ping, "8.8.8.8").unwrap();
    let job = h.controller.settled().await;
    tokio::time::sleep(INTERVAL * 4).await;

    match job.status {
        JobStatus::Failed { kind, detail } => {
            assert_eq!(kind, ErrorKind::Dispatch);
            assert!(detail.contains("422"));
        }
        other => panic!("unexpected status {other:?}"),
    }
    assert_eq!(h.artifacts.locates(), 0);
}

#[tokio::test(start_paused = true)]
async fn unauthorized_dispatch_is_an_auth_failure() {
    let artifacts = FakeArtifacts::new(&[], Vec::new());
    let h = harness(DispatchOutcome::Unauthorized, artifacts, None);

    h.controller.submit(Tool::Ping, "8.8.8.8").unwrap();
    let job = h.controller.settled().await;
    assert!(matches!(job.status, JobStatus::Failed { kind: ErrorKind::Auth, .. }));
}

#[tokio::test(start_paused = true)]
async fn waiting_past_max_wait_times_out() {
    let artifacts = FakeArtifacts::new(&[], Vec::new());
    let h = harness(DispatchOutcome::Ack, artifacts, Some(INTERVAL * 3));

    h.controller.submit(Tool::Traceroute, "192.0.2.7").unwrap();
    let job = h.controller.settled().await;

    assert!(matches!(job.status, JobStatus::Failed { kind: ErrorKind::Timeout, .. }));
    assert_eq!(h.artifacts.locates(), 3);
}

#[tokio::test(start_paused = true)]
async fn listing_failure_is_terminal() {
    let artifacts = FakeArtifacts::new(&[Poll::NotFound, Poll::Broken], Vec::new());
    let h = harness(DispatchOutcome::Ack, artifacts, None);

    h.controller.submit(Tool::Dig, "example.org").unwrap();
    let job = h.controller.settled().await;

    assert!(matches!(job.status, JobStatus::Failed { kind: ErrorKind::Locator, .. }));
    assert_eq!(h.artifacts.locates(), 2);
}

#[tokio::test(start_paused = true)]
async fn corrupt_artifact_fails_and_is_not_cached() {
    let artifacts = FakeArtifacts::new(&[Poll::Found], b"not a zip at all".to_vec());
    let h = harness(DispatchOutcome::Ack, artifacts, None);

    h.controller.submit(Tool::Ping, "8.8.4.4").unwrap();
    let job = h.controller.settled().await;

    assert!(matches!(job.status, JobStatus::Failed { kind: ErrorKind::Decode, .. }));
    assert!(job.error_detail().is_some());
    assert!(h.cache.is_empty());
}

#[tokio::test(start_paused = true)]
async fn archive_without_handle_entry_is_a_decode_failure() {
    let artifacts = FakeArtifacts::new(&[Poll::Found], zip_of(&[("someone-else.txt", "x")]));
    let h = harness(DispatchOutcome::Ack, artifacts, None);

    h.controller.submit(Tool::Ping, "8.8.4.4").unwrap();
    let job = h.controller.settled().await;

    match job.status {
        JobStatus::Failed { kind, detail } => {
            assert_eq!(kind, ErrorKind::Decode);
            assert!(detail.contains("h1.txt"));
        }
        other => panic!("unexpected status {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn failed_job_accepts_a_fresh_submit() {
    let artifacts = FakeArtifacts::new(&[Poll::Broken], zip_of(&[("h2.txt", "second try")]));
    let h = harness(DispatchOutcome::Ack, artifacts, None);

    h.controller.submit(Tool::Ping, "1.1.1.1").unwrap();
    assert!(matches!(h.controller.settled().await.status, JobStatus::Failed { .. }));

    h.artifacts.push(Poll::Found);
    assert_eq!(
        h.controller.submit(Tool::Ping, "1.1.1.1"),
        Ok(Submission::Started { epoch: 2 })
    );
    let job = h.controller.settled().await;
    assert_eq!(job.output(), Some("second try"));
    assert_eq!(h.dispatcher.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn new_target_supersedes_the_live_job() {
    let artifacts = FakeArtifacts::new(&[], zip_of(&[("h2.txt", "b output")]));
    let h = harness(DispatchOutcome::Ack, artifacts, None);

    h.controller.submit(Tool::Ping, "a.example").unwrap();
    wait_until(&h.controller, |job| {
        matches!(job.status, JobStatus::AwaitingArtifact { .. })
    })
    .await;

    h.artifacts.push(Poll::Found);
    assert_eq!(
        h.controller.submit(Tool::Ping, "b.example"),
        Ok(Submission::Started { epoch: 2 })
    );
    let job = h.controller.settled().await;

    assert_eq!(job.target.as_deref(), Some("b.example"));
    assert_eq!(job.output(), Some("b output"));
    assert!(h.cache.get(&CacheKey::new(Tool::Ping, "a.example")).is_none());
    assert_eq!(h.dispatcher.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn reset_returns_to_idle() {
    let artifacts = FakeArtifacts::new(&[], Vec::new());
    let h = harness(DispatchOutcome::Ack, artifacts, None);

    h.controller.submit(Tool::Whois, "example.net").unwrap();
    h.controller.reset();
    tokio::time::sleep(INTERVAL * 2).await;

    let job = h.controller.snapshot();
    assert_eq!(job.status, JobStatus::Idle);
    assert_eq!(job.active_tool, Tool::Whois);
    assert_eq!(h.artifacts.locates(), 0);
}

#[tokio::test(start_paused = true)]
async fn empty_target_is_rejected_without_state_change() {
    let artifacts = FakeArtifacts::new(&[], Vec::new());
    let h = harness(DispatchOutcome::Ack, artifacts, None);

    assert_eq!(h.controller.submit(Tool::Ping, "   "), Err(SubmitError::EmptyTarget));
    assert_eq!(h.controller.snapshot().status, JobStatus::Idle);
    assert_eq!(h.dispatcher.calls(), 0);
}

/// Records what the controller was publishing at the moment each result was cached.
#[derive(Default)]
struct ObservingCache {
    inner: MemoryCache,
    jobs: OnceLock<watch::Receiver<Job>>,
    seen_at_put: Mutex<Vec<JobStatus>>,
}

impl ResultCache for ObservingCache {
    fn get(&self, key: &CacheKey) -> Option<String> {
        self.inner.get(key)
    }

    fn put(&self, key: CacheKey, output: String) -> Result<(), CacheError> {
        if let Some(jobs) = self.jobs.get() {
            self.seen_at_put.lock().unwrap().push(jobs.borrow().status.clone());
        }
        self.inner.put(key, output)
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

#[tokio::test(start_paused = true)]
async fn result_is_cached_only_after_it_is_published() {
    let artifacts = FakeArtifacts::new(&[Poll::Found], zip_of(&[("h1.txt", "dig output\n")]));
    let cache = Arc::new(ObservingCache::default());
    let controller = JobController::new(
        FakeDispatcher::new(DispatchOutcome::Ack),
        artifacts,
        cache.clone(),
        PollPolicy {
            interval: INTERVAL,
            max_wait: None,
        },
    );
    assert!(cache.jobs.set(controller.subscribe()).is_ok());

    controller.submit(Tool::Dig, "example.org").unwrap();
    controller.settled().await;

    let seen = cache.seen_at_put.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![JobStatus::Completed {
            output: "dig output\n".into(),
            cached: false
        }]
    );
}
