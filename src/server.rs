/// Server setup and initialization
///
/// Wires together the database, workflow registry, runtime components and HTTP routes,
/// reconciles state left over from a previous run and starts the loop scheduler.

use crate::{
    api::{create_api_routes, AppState},
    config::Config,
    runtime::{
        actions::ActionRunner, http::HttpExecutor, sandbox::ScriptSandbox, ExecutionEngine,
        LoopScheduler, NodeExecutor,
    },
    store::{database, ApprovalStore, ExecutionStore, LoopStore},
    workflow::{registry::WorkflowRegistry, storage::WorkflowStorage},
};
use anyhow::{Context, Result};
use axum::{routing::get, Router};
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Build the runtime on an open pool: registry, scheduler, executor and engine
///
/// The registry is loaded from storage; the scheduler is not started.
pub async fn build_engine(config: &Config, pool: SqlitePool) -> Result<(ExecutionEngine, Arc<LoopScheduler>)> {
    tracing::info!("📊 Initializing workflow registry");
    let registry = Arc::new(WorkflowRegistry::new(WorkflowStorage::new(pool.clone())));
    registry
        .init_from_storage()
        .await
        .context("Failed to load workflows from storage")?;

    let http = HttpExecutor::new(&config.http).context("Failed to build HTTP client")?;
    let sandbox = ScriptSandbox::new(&config.sandbox);

    tracing::info!("⏰ Initializing loop scheduler");
    let scheduler = Arc::new(LoopScheduler::new(
        LoopStore::new(pool.clone()),
        http.clone(),
        sandbox.clone(),
        config.scheduler.clone(),
    ));

    tracing::info!("⚙️ Initializing node executor");
    let actions = ActionRunner::new(http.clone(), config.email.clone(), config.llm.clone());
    let executor = Arc::new(NodeExecutor::new(sandbox, http, actions, Arc::clone(&scheduler)));

    tracing::info!("🚀 Initializing execution engine");
    let engine = ExecutionEngine::new(
        registry,
        executor,
        Arc::clone(&scheduler),
        ExecutionStore::new(pool.clone()),
        ApprovalStore::new(pool),
    );
    Ok((engine, scheduler))
}

/// Create the main Axum application with all routes
///
/// Opens `{data_dir}/engine.db`, imports workflow definitions, recovers executions and
/// loops from a previous run and starts the scheduler, which stops when `shutdown` fires.
pub async fn create_app(config: Config, shutdown: CancellationToken) -> Result<Router> {
    tracing::info!("📁 Ensuring data directory exists: {}", config.database.data_dir);
    std::fs::create_dir_all(&config.database.data_dir)
        .with_context(|| format!("Failed to create data directory {}", config.database.data_dir))?;

    let pool = database::connect(Path::new(&config.database.data_dir).join("engine.db")).await?;

    if let Some(dir) = &config.database.workflows_dir {
        let imported = WorkflowStorage::new(pool.clone())
            .import_dir(dir)
            .await
            .with_context(|| format!("Failed to import workflows from {dir}"))?;
        tracing::info!("📥 Imported {} workflow definition(s) from {}", imported, dir);
    }

    let (engine, scheduler) = build_engine(&config, pool).await?;

    let resumed = engine
        .recover_on_startup()
        .await
        .context("Failed to recover state from previous run")?;
    tracing::info!("♻️ Startup recovery resumed {} execution(s)", resumed);

    scheduler.start(shutdown);

    tracing::info!("📡 Creating HTTP router with all endpoints");
    let app = Router::new()
        .route("/healthz", get(health_check))
        .merge(create_api_routes().with_state(AppState { engine }));

    tracing::info!("✅ Application initialized successfully");
    Ok(app)
}

/// Start the HTTP server with the given configuration
///
/// Runs until Ctrl-C, then stops the scheduler and drains open connections.
pub async fn start_server(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting dagloop server...");

    let shutdown = CancellationToken::new();
    let app = create_app(config.clone(), shutdown.clone()).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {bind_addr}"))?;
    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("❌ Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("🛑 Shutdown requested");
            shutdown.cancel();
        })
        .await?;

    Ok(())
}

async fn health_check() -> &'static str {
    "ok"
}
