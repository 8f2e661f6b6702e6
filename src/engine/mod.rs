pub mod admission;
pub mod api;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod queue;
pub mod rules;
pub mod sandbox;
pub mod worker;
pub mod workspace;

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::Router;

use crate::engine::{
    admission::AdmissionController,
    api::routes,
    config::EngineConfig,
    metrics::MetricsRegistry,
    orchestrator::JobOrchestrator,
    queue::Scheduler,
    rules::RuleSet,
    sandbox::{IsolationAdapter, SandboxFactory},
    worker::spawn_worker_pool,
    workspace::WorkspaceManager,
};

pub async fn run() -> anyhow::Result<()> {
    let config = EngineConfig::from_env();
    init_tracing(&config);

    let rules = RuleSet::load_file(&config.rules_path).with_context(|| {
        format!("failed to load rules from {}", config.rules_path.display())
    })?;
    tracing::info!(
        path = %config.rules_path.display(),
        languages = rules.iter().count(),
        "rule set loaded"
    );
    let rules = Arc::new(rules);

    let workspaces = WorkspaceManager::new(config.workspace.clone());
    let purged = workspaces
        .init()
        .await
        .context("workspace base directory init failed")?;
    if purged > 0 {
        tracing::warn!(purged, base = %workspaces.base_dir().display(), "purged stale workspaces");
    }

    let engine = SandboxFactory::from_config(&config).context("sandbox backend init failed")?;
    let adapter = IsolationAdapter::new(engine, config.kill_grace);
    tracing::info!(engine = adapter.engine_name(), "isolation engine ready");

    let metrics = Arc::new(MetricsRegistry::new());
    let orchestrator = Arc::new(JobOrchestrator::new(
        workspaces,
        Arc::new(adapter),
        metrics.clone(),
    ));
    let scheduler = Scheduler::new(config.max_queue_depth);
    spawn_worker_pool(
        config.max_concurrent_jobs.max(1),
        scheduler.receiver(),
        orchestrator,
        metrics.clone(),
    );

    let admission = AdmissionController::new(
        rules,
        scheduler,
        metrics.clone(),
        config.workspace.clone(),
        config.max_stdin_bytes,
    );
    admission.spawn_sweeper(config.unclaimed_result_ttl);

    let app: Router = routes(&config, admission, metrics);
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    let local = listener
        .local_addr()
        .unwrap_or(SocketAddr::from(([0, 0, 0, 0], 0)));
    tracing::info!(
        bind = %local,
        workers = config.max_concurrent_jobs.max(1),
        queue_depth = config.max_queue_depth,
        "runjail ready"
    );
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing(config: &EngineConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .init();
}
