use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::oneshot;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use opsched::config::SchedulerConfig;
use opsched::worker::{
    ExecutorRegistry, RetryPolicy, Scheduler, TaskRequest, spawn_event_logger,
    spawn_retry_supervisor, spawn_stats_reporter,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let config = SchedulerConfig::from_env().context("invalid OPSCHED_* configuration")?;

    eprintln!("⏱  opsched v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Workers: {}", config.worker_count);
    match config.queue_capacity {
        Some(capacity) => eprintln!("   Queue: {} ({})", capacity, config.backpressure),
        None => eprintln!("   Queue: unbounded"),
    }
    eprintln!("   Reading JSON task requests from stdin. EOF drains and exits.\n");

    let registry = Arc::new(ExecutorRegistry::with_builtins());
    let retry = RetryPolicy::from_config(&config);
    let stats_interval = config.stats_interval;
    let scheduler = Arc::new(Scheduler::new(config, registry)?);

    // ── Background tasks ────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let event_logger = spawn_event_logger(scheduler.subscribe(), shutdown_rx);

    let stats_handle = spawn_stats_reporter(Arc::clone(&scheduler), stats_interval);
    let retry_handle = retry.map(|policy| {
        tracing::info!(
            max_attempts = policy.max_attempts,
            backoff_ms = policy.backoff.as_millis() as u64,
            "Retry enabled"
        );
        spawn_retry_supervisor(Arc::clone(&scheduler), policy)
    });

    scheduler.start().await?;

    // ── Input loop ──────────────────────────────────────────────────────
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let request: TaskRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(line = line_no, error = %e, "Skipping malformed task request");
                continue;
            }
        };

        match scheduler.submit(request).await {
            Ok(id) => println!("{}", serde_json::json!({ "submitted": id, "line": line_no })),
            Err(e) => tracing::warn!(line = line_no, error = %e, "Task rejected"),
        }
    }

    // ── Shutdown ────────────────────────────────────────────────────────
    let drained = scheduler.stop().await;
    if let Some(handle) = retry_handle {
        handle.abort();
    }
    stats_handle.abort();
    let _ = shutdown_tx.send(());
    match event_logger.await {
        Ok(logged) => tracing::debug!(logged, "Event logger flushed"),
        Err(e) => tracing::warn!(error = %e, "Event logger ended abnormally"),
    }

    let stats = scheduler.stats().await;
    println!("{}", serde_json::to_string_pretty(&stats)?);

    drained?;
    Ok(())
}

/// Console logging, plus a daily rolling file when `OPSCHED_LOG_DIR` is set.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(filter());

    let (file, guard) = match std::env::var("OPSCHED_LOG_DIR") {
        Ok(dir) if !dir.is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "opsched.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter());
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry().with(console).with(file).init();
    guard
}
