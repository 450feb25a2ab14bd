use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vigil_core::{
    ArtifactBlobStore, ArtifactCache, InMemoryJobRepository, JobRegistry,
    JobRepository, JobRunner, ObjectStorage, PostgresJobRepository,
    build_object_storage,
};

use crate::infra::{app_state::AppState, config::Config};

/// Open the metadata store the configuration asks for.
pub async fn build_repository(config: &Config) -> Result<Arc<dyn JobRepository>> {
    match config.database.url.as_deref() {
        Some(url) => {
            let repo = PostgresJobRepository::connect(
                url,
                config.database.max_connections,
                config.database.acquire_timeout,
            )
            .await
            .context("failed to connect to PostgreSQL")?;
            repo.initialize_schema()
                .await
                .context("database migration failed")?;
            info!("metadata store: postgres");
            Ok(Arc::new(repo))
        }
        None => {
            info!("metadata store: in-memory");
            Ok(Arc::new(InMemoryJobRepository::new()))
        }
    }
}

/// Wire the registry over an already-built metadata store and object store.
pub fn build_registry(
    config: &Config,
    repo: Arc<dyn JobRepository>,
    storage: Arc<dyn ObjectStorage>,
) -> JobRegistry {
    let mut cache = ArtifactCache::new(Arc::clone(&storage));
    if let Some(root) = config.cache.root.as_ref() {
        cache = cache.with_disk_cache(ArtifactBlobStore::new(root));
    }
    let runner = JobRunner::new(
        config.runner_config(),
        config.scanner_command(),
        config.stream_parser(),
    );
    JobRegistry::new(
        config.registry_config(),
        runner,
        repo,
        storage,
        Arc::new(cache),
    )
}

pub async fn build_state(config: Arc<Config>) -> Result<AppState> {
    let repo = build_repository(&config).await?;
    let storage = build_object_storage(&config.storage)
        .context("failed to initialise artifact storage")?;
    let registry = build_registry(&config, repo, storage);
    Ok(AppState::new(config, registry))
}

#[async_trait]
pub trait StartupHooks: Send + Sync {
    async fn run(&self, state: &AppState) -> Result<()>;
}

/// Restart recovery plus the periodic orphan sweep.
#[derive(Debug, Default)]
pub struct ProdStartupHooks {
    shutdown: CancellationToken,
}

impl ProdStartupHooks {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self { shutdown }
    }
}

#[async_trait]
impl StartupHooks for ProdStartupHooks {
    async fn run(&self, state: &AppState) -> Result<()> {
        let recovered = state
            .registry
            .recover_unfinished()
            .await
            .context("failed to recover unfinished jobs")?;
        if recovered > 0 {
            warn!(recovered, "marked jobs from a previous run as errored");
        }

        let Some(period) = state.config().sweep.interval else {
            info!("orphan sweep disabled");
            return Ok(());
        };

        let registry = state.registry.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(
                tokio::time::MissedTickBehavior::Delay,
            );
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
                match registry.sweep_orphans().await {
                    Ok(report) if report.keys_deleted > 0 || report.failures > 0 => {
                        info!(
                            jobs = report.jobs_orphaned,
                            deleted = report.keys_deleted,
                            failures = report.failures,
                            "orphan sweep finished"
                        );
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "orphan sweep failed"),
                }
            }
        });

        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct NoopStartupHooks;

#[async_trait]
impl StartupHooks for NoopStartupHooks {
    async fn run(&self, _state: &AppState) -> Result<()> {
        Ok(())
    }
}
