use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use rand::Rng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use courier_core::domain::{CorrelationId, RemoteResponse, RequestDescriptor, TaskId, TaskResult};
use courier_core::ports::{RemoteError, RemoteExecutor};
use courier_core::{
    CourierConfig, CourierError, ConcurrentTaskRunner, FailurePolicy, KeyedCache,
};

#[derive(Parser)]
#[command(name = "courier", about = "Drive the courier runner and cache against a simulated remote")]
struct Cli {
    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run N simulated calls with bounded concurrency and print the results
    Run {
        #[arg(long, default_value_t = 8)]
        tasks: u32,

        /// Defaults to runner.default_max_concurrency
        #[arg(long)]
        concurrency: Option<usize>,

        /// Every M-th task answers 503
        #[arg(long)]
        fail_every: Option<u32>,

        /// Per-call deadline
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Report failures per task instead of failing the run
        #[arg(long)]
        collect: bool,

        /// Upper bound of the simulated latency
        #[arg(long, default_value_t = 50)]
        latency_ms: u64,
    },

    /// Show memoization, lock exclusion and expiry on a small cache
    CacheDemo {
        #[arg(long, default_value_t = 200)]
        ttl_ms: u64,
    },
}

/// Remote that sleeps for a random latency and fails on schedule.
struct SimulatedExecutor {
    latency: Duration,
    fail_every: Option<u32>,
}

#[async_trait]
impl RemoteExecutor for SimulatedExecutor {
    async fn invoke(
        &self,
        request: &RequestDescriptor,
        correlation_id: CorrelationId,
        cancel: &CancellationToken,
    ) -> Result<RemoteResponse, RemoteError> {
        let max_ms = latency_bound_ms(self.latency);
        let latency = Duration::from_millis(rand::thread_rng().gen_range(max_ms / 2..=max_ms));

        tokio::select! {
            _ = cancel.cancelled() => return Err(RemoteError::Canceled),
            _ = tokio::time::sleep(latency) => {}
        }

        let task: u32 = request
            .headers
            .get("x-task-id")
            .and_then(|id| id.parse().ok())
            .unwrap_or_default();
        if let Some(every) = self.fail_every
            && every > 0
            && task % every == 0
        {
            return Err(RemoteError::status(503, format!("{} is overloaded", request.target)));
        }

        Ok(RemoteResponse::ok().with_body(serde_json::json!({
            "task": task,
            "correlation_id": correlation_id.to_string(),
        })))
    }
}

/// Whole milliseconds, saturating, and never below 1.
fn latency_bound_ms(latency: Duration) -> u64 {
    u64::try_from(latency.as_millis())
        .unwrap_or(u64::MAX)
        .max(1)
}

fn request_for(id: TaskId) -> RequestDescriptor {
    RequestDescriptor::get(format!("https://remote.invalid/items/{}", id.get()))
        .with_header("x-task-id", id.get().to_string())
}

#[derive(Serialize)]
struct RunReport {
    succeeded: usize,
    failed: usize,
    results: Vec<TaskResult>,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<CourierConfig, CourierError> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| CourierError::Other(format!("{}: {e}", path.display())))?;
            CourierConfig::from_json_str(&raw)
        }
        None => Ok(CourierConfig::default()),
    }
}

async fn run(
    mut config: CourierConfig,
    tasks: u32,
    concurrency: Option<usize>,
    fail_every: Option<u32>,
    timeout_ms: Option<u64>,
    collect: bool,
    latency_ms: u64,
) -> Result<(), CourierError> {
    if timeout_ms.is_some() {
        config.runner.task_timeout_ms = timeout_ms;
    }
    if collect {
        config.runner.failure_policy = FailurePolicy::Collect;
    }
    let concurrency = concurrency.unwrap_or(config.runner.default_max_concurrency);

    let executor = SimulatedExecutor {
        latency: Duration::from_millis(latency_ms),
        fail_every,
    };
    let runner = ConcurrentTaskRunner::new(executor, request_for).with_config(config.runner);

    let results = runner.run(tasks, concurrency, &CancellationToken::new()).await?;
    let failed = results.iter().filter(|r| r.error.is_some()).count();
    let report = RunReport {
        succeeded: results.len() - failed,
        failed,
        results,
    };
    print_json(&report)
}

async fn cache_demo(config: CourierConfig, ttl_ms: u64) -> Result<(), CourierError> {
    let cache: Arc<KeyedCache<String>> = Arc::new(KeyedCache::in_memory(config.cache));
    let eviction = cache.spawn_eviction();
    let ttl = Duration::from_millis(ttl_ms);
    let computed = AtomicU32::new(0);

    let compute = || {
        computed.fetch_add(1, Ordering::SeqCst);
        Ok::<_, CourierError>("expensive value".to_string())
    };
    let first = cache.get("greeting", compute, ttl)?;
    let second = cache.get("greeting", compute, ttl)?;
    info!(computations = computed.load(Ordering::SeqCst), "memoized read");

    let mut nested_acquired = None;
    let acquired = cache.perform_action_with_lock("nightly-job", Duration::from_secs(5), || {
        nested_acquired = Some(cache.perform_action_with_lock(
            "nightly-job",
            Duration::from_secs(5),
            || Ok::<_, CourierError>(()),
        )?);
        Ok::<_, CourierError>(())
    })?;

    tokio::time::sleep(ttl + Duration::from_millis(10)).await;
    let expired = !cache.is_set("greeting")?;
    let after_expiry = cache.get("greeting", compute, ttl)?;

    cache.dispose();
    if eviction.await.is_err() {
        warn!("eviction task ended abnormally");
    }

    print_json(&serde_json::json!({
        "first": first,
        "second": second,
        "after_expiry": after_expiry,
        "computations": computed.load(Ordering::SeqCst),
        "lock_acquired": acquired,
        "nested_lock_acquired": nested_acquired,
        "expired_after_ttl": expired,
        "keys": cache.get_keys(),
    }))
}

fn print_json(value: &impl Serialize) -> Result<(), CourierError> {
    let json = serde_json::to_string_pretty(value).map_err(|e| CourierError::Other(e.to_string()))?;
    println!("{json}");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let outcome = match load_config(cli.config.as_ref()) {
        Ok(config) => match cli.command {
            Command::Run {
                tasks,
                concurrency,
                fail_every,
                timeout_ms,
                collect,
                latency_ms,
            } => {
                run(config, tasks, concurrency, fail_every, timeout_ms, collect, latency_ms).await
            }
            Command::CacheDemo { ttl_ms } => cache_demo(config, ttl_ms).await,
        },
        Err(err) => Err(err),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            // Classified failures print their payload; the rest just the message.
            match err.record() {
                Some(record) => {
                    if let Ok(json) = serde_json::to_string_pretty(&record.to_payload()) {
                        println!("{json}");
                    }
                }
                None => eprintln!("error: {err}"),
            }
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_bound_saturates_instead_of_truncating() {
        assert_eq!(latency_bound_ms(Duration::MAX), u64::MAX);
        assert_eq!(latency_bound_ms(Duration::from_millis(50)), 50);
        assert_eq!(latency_bound_ms(Duration::ZERO), 1);
    }
}
