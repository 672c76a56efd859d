use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use agent_scheduler::agent::{AgentProfile, CliAgentRunner, DirectoryAgentResolver};
use agent_scheduler::config::AppConfig;
use agent_scheduler::schedule::Scheduler;
use agent_scheduler::store::{JsonExecutionStore, JsonScheduleStore};
use agent_scheduler::worker::Executor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let server_start = Utc::now();
    let config = AppConfig::from_env().context("Invalid configuration")?;

    // Initialize tracing; keep the file writer guard alive until exit.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (file_layer, _log_guard) = match config.log_dir {
        Some(ref dir) => {
            let appender = tracing_appender::rolling::daily(dir, "agent-scheduler.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false),
                ),
                Some(guard),
            )
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    eprintln!("⏱  Agent Scheduler v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Data dir: {}", config.store.data_dir.display());
    eprintln!("   Max concurrent: {}", config.executor.max_concurrent);
    eprintln!("   Agent CLI: {}", config.runner.program);

    // ── Storage ──────────────────────────────────────────────────────────
    tokio::fs::create_dir_all(config.store.history_dir())
        .await
        .with_context(|| {
            format!(
                "Failed to create data directory {}",
                config.store.data_dir.display()
            )
        })?;
    let schedules = Arc::new(JsonScheduleStore::from_config(&config.store));
    let executions = Arc::new(
        JsonExecutionStore::from_config(&config.store).with_limit(config.scheduler.history_limit),
    );

    // ── Agents ───────────────────────────────────────────────────────────
    let resolver = Arc::new(
        DirectoryAgentResolver::new(config.store.agents_dir())
            .with_fallback(AgentProfile::named("default")),
    );
    let runner = Arc::new(CliAgentRunner::new(config.runner.clone()));

    // ── Executor + Scheduler ─────────────────────────────────────────────
    let executor = Executor::new(config.executor.clone(), resolver, runner);
    let scheduler = Scheduler::new(
        config.scheduler.clone(),
        executor.clone(),
        schedules,
        executions,
    );

    executor.start().await;

    let recovered = scheduler
        .recover_orphans(server_start)
        .await
        .context("Orphan sweep failed")?;
    if !recovered.is_empty() {
        eprintln!(
            "   Recovered {} schedule(s) and {} execution(s) interrupted by restart",
            recovered.schedules_reset.len(),
            recovered.executions_finalized
        );
    }

    scheduler
        .start()
        .await
        .context("Failed to start scheduler")?;

    let active = scheduler
        .list_schedules()
        .await?
        .iter()
        .filter(|s| s.enabled)
        .count();
    eprintln!("   Schedules: {} enabled\n", active);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    tracing::info!("Shutdown requested");
    scheduler.stop().await;

    let stats = executor.get_stats().await;
    tracing::info!(
        completed = stats.completed,
        failed = stats.failed,
        canceled = stats.canceled,
        "Shutdown complete"
    );
    Ok(())
}
