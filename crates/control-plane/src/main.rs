// Server binary
//
// Wires configuration, persistence, adapters and the durable runtime into
// one process. `FOREMAN_DEV_MODE=1` swaps PostgreSQL, GitHub and Kubernetes
// for the in-memory implementations so the whole loop runs on a laptop.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use foreman_control_plane::{app, AppState};
use foreman_core::{config::APP_VERSION, Config, EventBus};
use foreman_durable::{
    ActivityRegistry, Executor, ExecutorConfig, InMemoryWorkflowStore, PostgresWorkflowStore,
    QueueConfig, Runtime, RuntimeConfig, WorkflowRegistry, WorkflowStore,
};
use foreman_forge::{GithubForge, InMemoryForge};
use foreman_sandbox::{InMemorySandbox, KubernetesSandbox};
use foreman_storage::{InMemoryStorage, PostgresStorage};
use foreman_worker::main_thread::{MAIN_THREAD_QUEUE, WORKER_QUEUE};
use foreman_worker::Adapters;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    let dev_mode = std::env::var("FOREMAN_DEV_MODE").map(|v| v == "1").unwrap_or(false);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        app_version = APP_VERSION,
        dev_mode,
        "starting orchestrator"
    );

    if dev_mode {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let adapters = Adapters {
            storage: Arc::new(InMemoryStorage::new()),
            forge: Arc::new(InMemoryForge::new()),
            sandbox: Arc::new(InMemorySandbox::new()),
            bus: Arc::new(EventBus::new()),
        };
        serve(config, store, adapters).await
    } else {
        let database_url = config.database_url();
        let pool = sqlx::PgPool::connect(&database_url)
            .await
            .context("failed to connect to PostgreSQL")?;

        let store = PostgresWorkflowStore::new(pool.clone());
        store
            .ensure_schema()
            .await
            .context("failed to create durable engine schema")?;

        let storage = PostgresStorage::new(pool);
        storage
            .ensure_schema()
            .await
            .context("failed to create entity schema")?;

        let sandbox = KubernetesSandbox::new(&config.home_namespace, &config.sandbox_image)
            .await
            .context("failed to connect to Kubernetes")?;

        let adapters = Adapters {
            storage: Arc::new(storage),
            forge: Arc::new(GithubForge::new(config.forge_token.clone())),
            sandbox: Arc::new(sandbox),
            bus: Arc::new(EventBus::new()),
        };
        serve(config, Arc::new(store), adapters).await
    }
}

async fn serve<S: WorkflowStore>(
    config: Config,
    store: Arc<S>,
    adapters: Adapters,
) -> Result<()> {
    // Workflow and activity registration
    let mut workflows = WorkflowRegistry::new();
    foreman_worker::register_workflows(&mut workflows);

    let mut activities = ActivityRegistry::new();
    foreman_worker::register_activities(&mut activities, &adapters, &config);

    let executor = Arc::new(Executor::new(
        store,
        Arc::new(workflows),
        ExecutorConfig::new(APP_VERSION),
    ));

    let runtime = Arc::new(Runtime::new(
        executor.clone(),
        Arc::new(activities),
        RuntimeConfig {
            queues: vec![
                QueueConfig::global(WORKER_QUEUE, config.worker_concurrency),
                QueueConfig::partitioned(MAIN_THREAD_QUEUE, 1),
            ],
            ..Default::default()
        },
    ));

    // Resume workflows recorded under this binary's version
    let recovered = runtime.recover().await?;
    info!(recovered, "recovery complete");

    let shutdown = CancellationToken::new();
    let pump = {
        let runtime = runtime.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { runtime.run(shutdown).await })
    };

    let state = AppState {
        engine: executor,
        storage: adapters.storage.clone(),
        forge: adapters.forge.clone(),
        sandbox: adapters.sandbox.clone(),
        bus: adapters.bus.clone(),
        config: Arc::new(config.clone()),
    };

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "listening");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            server_shutdown.cancel();
        })
        .await
        .context("server error")?;

    shutdown.cancel();
    let _ = pump.await;
    info!("orchestrator stopped");
    Ok(())
}
