use dashmap::DashMap;
use netdiag_cli::cache::ResultCache;
use netdiag_cli::controller::{JobController, PollPolicy};
use netdiag_cli::dispatcher::JobDispatcher;
use netdiag_cli::locator::ArtifactSource;
use netdiag_cli::Tool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::info;
use uuid::Uuid;

// One browser session: its controller and when it was last asked for.
pub struct Session {
    pub controller: Arc<JobController>,
    pub last_seen: Instant,
}

// Application state: session_id → that browser session's controller.
// Every controller shares the same cache.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<DashMap<Uuid, Session>>,
    pub dispatcher: Arc<dyn JobDispatcher>,
    pub artifacts: Arc<dyn ArtifactSource>,
    pub cache: Arc<dyn ResultCache>,
    pub policy: PollPolicy,
    pub tools: Arc<Vec<Tool>>,
}

impl AppState {
    pub fn new(
        dispatcher: Arc<dyn JobDispatcher>,
        artifacts: Arc<dyn ArtifactSource>,
        cache: Arc<dyn ResultCache>,
        policy: PollPolicy,
        tools: Vec<Tool>,
    ) -> Self {
        AppState {
            sessions: Arc::new(DashMap::new()),
            dispatcher,
            artifacts,
            cache,
            policy,
            tools: Arc::new(tools),
        }
    }

    pub fn open_session(&self) -> Uuid {
        let session_id = Uuid::new_v4();
        let controller = JobController::new(
            self.dispatcher.clone(),
            self.artifacts.clone(),
            self.cache.clone(),
            self.policy,
        );
        self.sessions.insert(
            session_id,
            Session {
                controller: Arc::new(controller),
                last_seen: Instant::now(),
            },
        );
        session_id
    }

    /// Looks a session up and marks it as seen.
    pub fn session(&self, session_id: &Uuid) -> Option<Arc<JobController>> {
        self.sessions.get_mut(session_id).map(|mut entry| {
            entry.last_seen = Instant::now();
            entry.controller.clone()
        })
    }

    pub fn is_enabled(&self, tool: Tool) -> bool {
        self.tools.contains(&tool)
    }

    /// Drops every session not seen for `idle_ttl`; their pending jobs are aborted.
    pub fn evict_idle(&self, idle_ttl: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| session.last_seen.elapsed() < idle_ttl);
        before.saturating_sub(self.sessions.len())
    }

    /// Runs `evict_idle` every `every` until the returned task is aborted.
    pub fn spawn_session_sweeper(&self, idle_ttl: Duration, every: Duration) -> JoinHandle<()> {
        let state = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = state.evict_idle(idle_ttl);
                if evicted > 0 {
                    info!(evicted, remaining = state.sessions.len(), "idle sessions closed");
                }
            }
        })
    }
}
