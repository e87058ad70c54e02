//! NeuroChron API server.
//!
//! Hosts the HTTP API and the worker pool in one process.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use neurochron_api::{AppState, routes};
use neurochron_config::{DEFAULT_CONFIG_PATH, LogFormat, SystemConfig};
use neurochron_core::{JobStore, StageRunner};
use neurochron_db::{InMemoryJobStore, PgJobStore, create_pool, run_migrations};
use neurochron_executor::{
    CommandConverter, CommandPredictor, DockerPreprocessor, build_notifier,
};
use neurochron_scheduler::{
    ConvertRunner, Dispatcher, NotifyRunner, Orchestrator, PredictRunner, PreprocessRunner,
    RetryPolicy, RunnerSet, WorkerConfig, WorkerPool,
};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "neurochron-server")]
#[command(about = "NeuroChron brain-age pipeline server", long_about = None)]
#[command(version)]
struct Args {
    /// Path to the system configuration file
    #[arg(short, long, env = "NEUROCHRON_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = SystemConfig::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;

    init_tracing(config.server.log_format);

    let store = connect_store(&config).await?;
    let orchestrator = Arc::new(build_orchestrator(&config, store.clone())?);
    let dispatcher = Arc::new(Dispatcher::new(store));

    let pool = WorkerPool::start(
        WorkerConfig::from_config(&config.dispatcher),
        dispatcher.clone(),
        orchestrator,
    );

    // Build router
    let app = routes::router(AppState::new(dispatcher))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let addr: SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", config.server.bind))?;
    info!("Starting server on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    pool.shutdown().await?;
    info!("Server stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn connect_store(config: &SystemConfig) -> anyhow::Result<Arc<dyn JobStore>> {
    let store: Arc<dyn JobStore> = match &config.database.url {
        Some(url) => {
            info!("Connecting to database...");
            let pool = create_pool(url, config.database.max_connections)
                .await
                .context("failed to connect to database")?;
            run_migrations(&pool)
                .await
                .context("failed to run migrations")?;
            info!("Database connected");
            Arc::new(PgJobStore::new(pool))
        }
        None => {
            warn!("No database configured; jobs will not survive a restart");
            Arc::new(InMemoryJobStore::new())
        }
    };
    Ok(store)
}

fn build_orchestrator(
    config: &SystemConfig,
    store: Arc<dyn JobStore>,
) -> anyhow::Result<Orchestrator> {
    let preprocessor = DockerPreprocessor::new(&config.preprocessor)
        .context("failed to connect to Docker")?;
    let notifier = build_notifier(&config.notifier);
    info!(backend = notifier.name(), "Notifier configured");

    let runners: Vec<Arc<dyn StageRunner>> = vec![
        Arc::new(ConvertRunner::new(
            Arc::new(CommandConverter::new(&config.converter)),
            config.storage.work_dir.clone(),
        )),
        Arc::new(PreprocessRunner::new(
            Arc::new(preprocessor),
            config.preprocessor.license.clone(),
            config.preprocessor.timeout,
        )),
        Arc::new(PredictRunner::new(Arc::new(CommandPredictor::new(
            &config.predictor,
        )))),
        Arc::new(NotifyRunner::new(notifier.clone())),
    ];

    Ok(Orchestrator::new(
        store,
        RunnerSet::new(runners)?,
        notifier,
        RetryPolicy::new(config.retry.clone(), config.preprocessor.timeout_retries),
    ))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    info!("Shutdown signal received");
}
