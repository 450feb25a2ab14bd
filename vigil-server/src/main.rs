//! # Vigil Server
//!
//! Runs security-scanner subprocesses as jobs and exposes them over HTTP.
//!
//! - **Jobs**: start, cancel, inspect, list and delete scan jobs
//! - **Live progress**: per-job Server-Sent Events stream of snapshots
//! - **Statistics**: per-job and cross-job pass/fail breakdowns
//! - **Artifacts**: verified result logs kept in a local or S3 object store

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, bail};
use clap::{Args as ClapArgs, Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vigil_core::{PostgresJobRepository, build_object_storage};
use vigil_server::{
    infra::{
        config::{Config, ConfigLoad, ConfigLoader},
        startup::{self, ProdStartupHooks, StartupHooks},
    },
    routes,
};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "vigil-server")]
#[command(about = "Scan-job orchestrator with live progress streaming")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct ServeArgs {
    /// Path to the TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to a dotenv file loaded before reading the environment
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Server port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Server host (overrides config)
    #[arg(long)]
    host: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP server (default)
    Serve,
    /// Delete stored artifacts that no job row references, then exit
    Sweep,
    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_runtime_config(&cli.serve)?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run_server(config).await,
        Command::Sweep => run_sweep(config).await,
        Command::Migrate => run_migrate(config).await,
    }
}

fn load_runtime_config(args: &ServeArgs) -> anyhow::Result<Arc<Config>> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = args.config.clone() {
        loader = loader.with_config_path(path);
    }
    if let Some(path) = args.env_file.clone() {
        loader = loader.with_env_file(path);
    }
    let ConfigLoad {
        mut config,
        warnings,
    } = loader.load().context("failed to load configuration")?;

    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host.clone() {
        config.server.host = host;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(
                |_| "info,vigil_core=info,tower_http=warn".into(),
            ),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = config.metadata.config_path.as_ref() {
        info!(path = %path.display(), "configuration file loaded");
    }

    for warning in &warnings.items {
        match &warning.hint {
            Some(hint) => {
                warn!(message = %warning.message, hint = %hint, "configuration warning")
            }
            None => {
                warn!(message = %warning.message, "configuration warning")
            }
        }
    }

    Ok(Arc::new(config))
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| {
            format!(
                "invalid listen address {}:{}",
                config.server.host, config.server.port
            )
        })?;

    let state = startup::build_state(Arc::clone(&config)).await?;
    let shutdown = CancellationToken::new();
    ProdStartupHooks::new(shutdown.clone())
        .run(&state)
        .await
        .context("startup hooks failed")?;

    let handle = axum_server::Handle::new();
    let grace = config.server.shutdown_grace;
    {
        let handle = handle.clone();
        let registry = state.registry.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.cancel();
            // Jobs first, so open progress streams see their final snapshot.
            registry.shutdown(grace).await;
            handle.graceful_shutdown(Some(grace));
        });
    }

    info!(
        "Starting Vigil server on {}:{} (max {} concurrent jobs)",
        config.server.host, config.server.port, config.runner.max_concurrent_jobs
    );
    let router = routes::create_app(state);
    axum_server::bind(addr)
        .handle(handle)
        .serve(router.into_make_service())
        .await
        .context("server error")?;

    info!("Server shutdown complete");
    Ok(())
}

async fn run_sweep(config: Arc<Config>) -> anyhow::Result<()> {
    if config.database.url.is_none() {
        bail!("sweep needs DATABASE_URL; without job rows every stored artifact looks orphaned");
    }
    let repo = startup::build_repository(&config).await?;
    let storage = build_object_storage(&config.storage)
        .context("failed to initialise artifact storage")?;
    let registry = startup::build_registry(&config, repo, storage);
    let report = registry
        .sweep_orphans()
        .await
        .context("orphan sweep failed")?;
    info!(
        scanned = report.keys_scanned,
        orphaned_jobs = report.jobs_orphaned,
        deleted = report.keys_deleted,
        failures = report.failures,
        "orphan sweep finished"
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_migrate(config: Arc<Config>) -> anyhow::Result<()> {
    let Some(url) = config.database.url.as_deref() else {
        bail!("migrate needs DATABASE_URL");
    };
    let repo = PostgresJobRepository::connect(
        url,
        config.database.max_connections,
        config.database.acquire_timeout,
    )
    .await
    .context("failed to connect to PostgreSQL for migration")?;
    repo.initialize_schema()
        .await
        .context("database migration failed")?;
    info!("Database migrations applied successfully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}
