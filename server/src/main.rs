mod handlers;
mod routes;
mod state;

use std::env;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::{header, HeaderValue, Method},
    Router,
};
use netdiag_cli::cache::{FileCache, MemoryCache, ResultCache};
use netdiag_cli::config::ClientConfig;
use netdiag_cli::remote::RemoteClient;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;

use routes::diagnostics::diagnostics_routes;
use state::AppState;

const DEFAULT_CLIENT_URL: &str = "http://localhost:3000";
const DEFAULT_BIND: &str = "127.0.0.1:8080";
const DEFAULT_SESSION_IDLE_SECS: u64 = 30 * 60;
const SESSION_SWEEP_EVERY: Duration = Duration::from_secs(60);

fn app(state: AppState, client_url: HeaderValue) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(client_url)
        .allow_methods([Method::POST, Method::GET, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
        .allow_credentials(true);

    Router::new()
        .nest("/api", diagnostics_routes(state))
        .layer(cors)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let client_url = env::var("CLIENT_URL").unwrap_or_else(|_| DEFAULT_CLIENT_URL.to_string());
    let bind = env::var("NETDIAG_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string());
    let session_idle = match env::var("NETDIAG_SESSION_IDLE_SECS") {
        Ok(raw) => Duration::from_secs(raw.trim().parse()?),
        Err(_) => Duration::from_secs(DEFAULT_SESSION_IDLE_SECS),
    };

    let config = ClientConfig::from_env()?;
    let cache: Arc<dyn ResultCache> = match &config.cache_file {
        Some(path) => Arc::new(FileCache::open(path)?),
        None => Arc::new(MemoryCache::new()),
    };
    let policy = config.poll_policy();
    let tools = config.tools.clone();
    let remote = Arc::new(RemoteClient::new(config)?);

    // Jobs dispatched while no session is held fail with an auth error.
    let keeper = remote.clone();
    tokio::spawn(async move { keeper.maintain_session(Duration::from_secs(300)).await });

    let state = AppState::new(remote.clone(), remote, cache, policy, tools);
    state.spawn_session_sweeper(session_idle, SESSION_SWEEP_EVERY);
    let app = app(state, client_url.parse::<HeaderValue>()?);

    let listener = TcpListener::bind(&bind).await?;
    info!("listening on {bind}");
    axum::serve(listener, app).await?;
    Ok(())
}
