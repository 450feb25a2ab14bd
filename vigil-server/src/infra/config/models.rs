use std::{collections::BTreeMap, path::PathBuf, sync::Arc, time::Duration};

use vigil_core::{
    GatewayConfig, RegistryConfig, RetryPolicy, RunnerConfig, ScannerCommand,
    StorageConfig, StreamParser,
};

/// Fully resolved server configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub runner: RunnerSettings,
    pub orchestrator: OrchestratorSettings,
    pub gateway: GatewaySettings,
    pub cache: CacheConfig,
    pub sweep: SweepConfig,
    pub cors: CorsConfig,
    pub metadata: ConfigMetadata,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// How long running jobs get to wind down on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// `None` selects the in-memory metadata store.
    pub url: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub executable: PathBuf,
    pub base_args: Vec<String>,
    pub scratch_dir: PathBuf,
    pub max_concurrent_jobs: usize,
    pub spawn_timeout: Duration,
    pub cancel_grace: Duration,
    pub drain_timeout: Duration,
    pub diagnostic_lines: usize,
    pub host_alias: Option<String>,
    pub fatal_signatures: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        let defaults = RunnerConfig::default();
        Self {
            executable: PathBuf::from("python"),
            base_args: vec!["-m".to_string(), "garak".to_string()],
            scratch_dir: PathBuf::from("data/scratch"),
            max_concurrent_jobs: defaults.max_concurrent_jobs,
            spawn_timeout: defaults.spawn_timeout,
            cancel_grace: defaults.cancel_grace,
            drain_timeout: defaults.drain_timeout,
            diagnostic_lines: defaults.diagnostic_lines,
            host_alias: None,
            fatal_signatures: Vec::new(),
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub snapshot_interval: Duration,
    pub event_history: usize,
    pub event_channel_capacity: usize,
    pub store_retries: u32,
    pub upload_retries: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        let defaults = RegistryConfig::default();
        let retry = RetryPolicy::default();
        Self {
            snapshot_interval: defaults.snapshot_interval,
            event_history: defaults.event_history,
            event_channel_capacity: defaults.event_channel_capacity,
            store_retries: retry.max_retries,
            upload_retries: retry.max_retries,
            retry_base: retry.base_delay,
            retry_max: retry.max_delay,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub poll_interval: Duration,
    pub retry_hint: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        let defaults = GatewayConfig::default();
        Self {
            poll_interval: defaults.poll_interval,
            retry_hint: defaults.retry_hint,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheConfig {
    /// On-disk artifact cache; memory only when unset.
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// `None` disables the periodic orphan sweep.
    pub interval: Option<Duration>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Some(Duration::from_secs(15 * 60)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CorsConfig {
    /// Empty allows any origin.
    pub allowed_origins: Vec<String>,
}

/// Where the configuration came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}

impl Config {
    pub fn runner_config(&self) -> RunnerConfig {
        let runner = &self.runner;
        RunnerConfig {
            max_concurrent_jobs: runner.max_concurrent_jobs,
            spawn_timeout: runner.spawn_timeout,
            cancel_grace: runner.cancel_grace,
            drain_timeout: runner.drain_timeout,
            diagnostic_lines: runner.diagnostic_lines,
            scratch_dir: runner.scratch_dir.clone(),
            host_alias: runner.host_alias.clone(),
            env: runner.env.clone(),
            ..RunnerConfig::default()
        }
    }

    pub fn scanner_command(&self) -> Arc<ScannerCommand> {
        Arc::new(
            ScannerCommand::new(self.runner.executable.clone())
                .with_base_args(self.runner.base_args.iter().cloned()),
        )
    }

    pub fn stream_parser(&self) -> StreamParser {
        StreamParser::default()
            .with_extra_signatures(self.runner.fatal_signatures.iter().cloned())
    }

    pub fn registry_config(&self) -> RegistryConfig {
        let orchestrator = &self.orchestrator;
        let retry = RetryPolicy::default()
            .with_delays(orchestrator.retry_base, orchestrator.retry_max);
        RegistryConfig {
            snapshot_interval: orchestrator.snapshot_interval,
            event_history: orchestrator.event_history,
            event_channel_capacity: orchestrator.event_channel_capacity,
            store_retry: retry.with_max_retries(orchestrator.store_retries),
            finalize_retry: retry.with_max_retries(orchestrator.upload_retries),
        }
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            poll_interval: self.gateway.poll_interval,
            retry_hint: self.gateway.retry_hint,
            ..GatewayConfig::default()
        }
    }
}
