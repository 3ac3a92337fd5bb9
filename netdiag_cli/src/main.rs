use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dotenv::dotenv;
use futures::stream::{self, StreamExt};
use netdiag_cli::cache::{FileCache, MemoryCache, ResultCache};
use netdiag_cli::config::ClientConfig;
use netdiag_cli::controller::{Job, JobController, JobStatus};
use netdiag_cli::remote::RemoteClient;
use netdiag_cli::{utils, CacheKey, Tool};
use serde_json::json;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Diagnostic to run
    #[arg(short, long, value_enum, default_value_t = Tool::Ping)]
    tool: Tool,

    /// Hosts or IP addresses to diagnose
    #[arg(required = true)]
    targets: Vec<String>,

    /// Number of targets processed at once
    #[arg(short, long, default_value_t = 2)]
    concurrent: usize,

    /// Seconds between artifact lookups (overrides NETDIAG_POLL_INTERVAL_SECS)
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Seconds to wait for an artifact, 0 for no limit (overrides NETDIAG_MAX_WAIT_SECS)
    #[arg(long)]
    max_wait: Option<u64>,

    /// Persist results in this JSON file (overrides NETDIAG_CACHE_FILE)
    #[arg(long)]
    cache_file: Option<PathBuf>,

    /// Write each output to <dir>/<tool>-<target>.txt
    #[arg(long)]
    save_dir: Option<PathBuf>,

    /// Write a JSON summary of every job to this file
    #[arg(long)]
    json: Option<PathBuf>,

    /// Do not log in against the proxy before dispatching
    #[arg(long)]
    skip_login: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = ClientConfig::from_env()?;
    if let Some(secs) = args.poll_interval {
        config.poll_interval = Duration::from_secs(secs);
    }
    if let Some(secs) = args.max_wait {
        config.max_wait = (secs > 0).then(|| Duration::from_secs(secs));
    }
    if args.cache_file.is_some() {
        config.cache_file = args.cache_file.clone();
    }
    if !config.is_enabled(args.tool) {
        return Err(format!("{} is not enabled (NETDIAG_TOOLS)", args.tool).into());
    }

    let cache: Arc<dyn ResultCache> = match &config.cache_file {
        Some(path) => Arc::new(FileCache::open(path)?),
        None => Arc::new(MemoryCache::new()),
    };
    let policy = config.poll_policy();
    let remote = Arc::new(RemoteClient::new(config)?);

    if !args.skip_login {
        remote.ensure_session(Duration::from_secs(60)).await?;
    }

    let jobs = stream::iter(args.targets.clone())
        .map(|target| {
            let remote = remote.clone();
            let cache = cache.clone();
            let tool = args.tool;
            async move {
                // One controller per target keeps single-flight scoped to that target.
                let controller = JobController::new(remote.clone(), remote, cache, policy);
                if let Err(e) = controller.submit(tool, &target) {
                    error!(host = %target, "{e}");
                    return (target, None);
                }
                info!(%tool, host = %target, "waiting for result");
                (target, Some(controller.settled().await))
            }
        })
        .buffer_unordered(args.concurrent.max(1))
        .collect::<Vec<_>>()
        .await;

    let mut summary = Vec::new();
    let mut failures = 0;
    for (target, job) in jobs {
        let key = CacheKey::new(args.tool, target.clone());
        match job.as_ref().map(|job| &job.status) {
            Some(JobStatus::Completed { output, cached }) => {
                println!("=== {} {}{}", args.tool, target, if *cached { " (cached)" } else { "" });
                println!("{output}");
                if let Some(dir) = &args.save_dir {
                    utils::save_output(dir, &key, output)?;
                }
            }
            Some(JobStatus::Failed { kind, detail }) => {
                failures += 1;
                eprintln!("=== {} {} failed ({kind:?}): {detail}", args.tool, target);
            }
            _ => {
                failures += 1;
                eprintln!("=== {} {} produced no result", args.tool, target);
            }
        }
        summary.push(summary_entry(&key, job.as_ref()));
    }

    if let Some(path) = &args.json {
        utils::save_json(&json!({ "results": summary }), path)?;
    }

    if failures > 0 {
        return Err(format!("{failures} diagnostic(s) failed").into());
    }
    Ok(())
}

fn summary_entry(key: &CacheKey, job: Option<&Job>) -> serde_json::Value {
    json!({
        "tool": key.tool,
        "target": key.target,
        "status": job.map(|job| &job.status),
    })
}
