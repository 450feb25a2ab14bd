use once_cell::sync::Lazy;
use std::{fs, path::PathBuf, time::Duration};
use thiserror::Error;

use vigil_core::{S3StorageConfig, StorageConfig};

use super::{
    models::{
        CacheConfig, Config, ConfigMetadata, CorsConfig, DatabaseConfig,
        GatewaySettings, OrchestratorSettings, RunnerSettings, ServerConfig,
        SweepConfig,
    },
    sources::{EnvConfig, FileConfig, FileStorageConfig},
    validation::{self, ConfigGuardRailError, ConfigWarnings},
};

static DEFAULT_CONFIG_LOCATIONS: Lazy<Vec<PathBuf>> = Lazy::new(|| {
    vec![PathBuf::from("vigil.toml"), PathBuf::from("config/vigil.toml")]
});

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

/// Resolves [`Config`] from, in order of precedence: environment variables
/// (optionally seeded from a dotenv file), a TOML file, built-in defaults.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(
                |err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                },
            )?,
            None => {
                dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                })?
            }
        };

        let env_config = EnvConfig::gather();
        let (file_config, config_path) = self.load_file_config(&env_config)?;

        let (config, warnings) = compose_config(
            file_config,
            env_config,
            ConfigMetadata {
                config_path,
                env_file_loaded,
            },
        )?;

        Ok(ConfigLoad { config, warnings })
    }

    fn load_file_config(
        &self,
        env_config: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let mut source = ConfigPathSource::default();

        if let Some(explicit) = &self.options.config_path {
            source.explicit = Some(explicit.clone());
        } else if let Some(from_env) = &env_config.config_path {
            source.env = Some(from_env.clone());
        } else {
            source.default = DEFAULT_CONFIG_LOCATIONS
                .iter()
                .find(|candidate| candidate.exists())
                .cloned();
        }

        let Some((path, provenance)) = source.resolved_path() else {
            return Ok((None, None));
        };

        if !path.exists() {
            if provenance.is_explicit() {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            return Ok((None, None));
        }

        let contents =
            fs::read_to_string(&path).map_err(|err| ConfigLoadError::Io {
                path: path.clone(),
                source: err,
            })?;
        let file_config: FileConfig =
            toml::from_str(&contents).map_err(|err| ConfigLoadError::Parse {
                path: path.clone(),
                source: err,
            })?;

        Ok((Some(file_config), Some(path)))
    }
}

/// Merges file and environment values over defaults. Environment wins.
pub(crate) fn compose_config(
    file_config: Option<FileConfig>,
    env: EnvConfig,
    metadata: ConfigMetadata,
) -> Result<(Config, ConfigWarnings), ConfigLoadError> {
    let mut warnings = ConfigWarnings::default();

    if metadata.config_path.is_none() {
        warnings.push_with_hint(
            "No vigil.toml detected; using environment variables and defaults",
            "Pass --config or set VIGIL_CONFIG to point at a configuration file",
        );
    }

    let FileConfig {
        server: file_server,
        database: file_database,
        storage: file_storage,
        runner: file_runner,
        orchestrator: file_orchestrator,
        gateway: file_gateway,
        cache: file_cache,
        sweep: file_sweep,
        cors: file_cors,
    } = file_config.unwrap_or_default();

    let server_defaults = ServerConfig::default();
    let server = ServerConfig {
        host: env
            .server_host
            .clone()
            .or(file_server.host)
            .unwrap_or(server_defaults.host),
        port: env
            .server_port
            .or(file_server.port)
            .unwrap_or(server_defaults.port),
        shutdown_grace: duration_or(
            "server.shutdown_grace",
            file_server.shutdown_grace,
            server_defaults.shutdown_grace,
        )?,
    };

    let database_defaults = DatabaseConfig::default();
    let database = DatabaseConfig {
        url: env.database_url.clone().or_else(|| {
            file_database.url.filter(|url| !url.trim().is_empty())
        }),
        max_connections: env
            .database_max_connections
            .or(file_database.max_connections)
            .unwrap_or(database_defaults.max_connections),
        acquire_timeout: duration_or(
            "database.acquire_timeout",
            file_database.acquire_timeout,
            database_defaults.acquire_timeout,
        )?,
    };

    let storage = resolve_storage(&env, file_storage)?;

    let runner_defaults = RunnerSettings::default();
    let mut fatal_signatures = file_runner.fatal_signatures;
    if let Some(extra) = env.fatal_signatures.clone() {
        fatal_signatures.extend(extra);
    }
    let runner = RunnerSettings {
        executable: env
            .scanner_executable
            .clone()
            .or(file_runner.executable)
            .unwrap_or(runner_defaults.executable),
        base_args: env
            .scanner_base_args
            .clone()
            .or(file_runner.base_args)
            .unwrap_or(runner_defaults.base_args),
        scratch_dir: env
            .scratch_dir
            .clone()
            .or(file_runner.scratch_dir)
            .unwrap_or(runner_defaults.scratch_dir),
        max_concurrent_jobs: env
            .max_concurrent_jobs
            .or(file_runner.max_concurrent_jobs)
            .unwrap_or(runner_defaults.max_concurrent_jobs),
        spawn_timeout: duration_or(
            "runner.spawn_timeout",
            file_runner.spawn_timeout,
            runner_defaults.spawn_timeout,
        )?,
        cancel_grace: duration_or(
            "runner.cancel_grace",
            file_runner.cancel_grace,
            runner_defaults.cancel_grace,
        )?,
        drain_timeout: duration_or(
            "runner.drain_timeout",
            file_runner.drain_timeout,
            runner_defaults.drain_timeout,
        )?,
        diagnostic_lines: file_runner
            .diagnostic_lines
            .unwrap_or(runner_defaults.diagnostic_lines),
        host_alias: env.host_alias.clone().or(file_runner.host_alias),
        fatal_signatures,
        env: file_runner.env,
    };

    let orchestrator_defaults = OrchestratorSettings::default();
    let orchestrator = OrchestratorSettings {
        snapshot_interval: duration_or(
            "orchestrator.snapshot_interval",
            file_orchestrator.snapshot_interval,
            orchestrator_defaults.snapshot_interval,
        )?,
        event_history: file_orchestrator
            .event_history
            .unwrap_or(orchestrator_defaults.event_history),
        event_channel_capacity: file_orchestrator
            .event_channel_capacity
            .unwrap_or(orchestrator_defaults.event_channel_capacity),
        store_retries: file_orchestrator
            .store_retries
            .unwrap_or(orchestrator_defaults.store_retries),
        upload_retries: file_orchestrator
            .upload_retries
            .unwrap_or(orchestrator_defaults.upload_retries),
        retry_base: duration_or(
            "orchestrator.retry_base",
            file_orchestrator.retry_base,
            orchestrator_defaults.retry_base,
        )?,
        retry_max: duration_or(
            "orchestrator.retry_max",
            file_orchestrator.retry_max,
            orchestrator_defaults.retry_max,
        )?,
    };
    if orchestrator.retry_base > orchestrator.retry_max {
        return Err(ConfigLoadError::Invalid {
            field: "orchestrator.retry_base",
            reason: "must not exceed orchestrator.retry_max".to_string(),
        });
    }

    let gateway_defaults = GatewaySettings::default();
    let gateway = GatewaySettings {
        poll_interval: duration_or(
            "gateway.poll_interval",
            file_gateway.poll_interval,
            gateway_defaults.poll_interval,
        )?,
        retry_hint: duration_or(
            "gateway.retry_hint",
            file_gateway.retry_hint,
            gateway_defaults.retry_hint,
        )?,
    };

    let cache = CacheConfig {
        root: env.cache_root.clone().or(file_cache.root),
    };

    let sweep_interval = match env.sweep_interval.clone().or(file_sweep.interval)
    {
        Some(raw) => parse_duration("sweep.interval", &raw)?,
        None => SweepConfig::default().interval.unwrap_or(Duration::ZERO),
    };
    let sweep = SweepConfig {
        interval: (!sweep_interval.is_zero()).then_some(sweep_interval),
    };

    let cors = CorsConfig {
        allowed_origins: env
            .cors_allowed_origins
            .clone()
            .or(file_cors.allowed_origins)
            .unwrap_or_default(),
    };

    let config = Config {
        server,
        database,
        storage,
        runner,
        orchestrator,
        gateway,
        cache,
        sweep,
        cors,
        metadata,
    };

    warnings.extend(validation::apply_guard_rails(&config)?);

    Ok((config, warnings))
}

fn resolve_storage(
    env: &EnvConfig,
    file: FileStorageConfig,
) -> Result<StorageConfig, ConfigLoadError> {
    let backend = env
        .storage_backend
        .clone()
        .or(file.backend)
        .unwrap_or_else(|| "local".to_string());

    match backend.trim().to_ascii_lowercase().as_str() {
        "local" => {
            let root = env.storage_root.clone().or(file.root);
            Ok(match root {
                Some(root) => StorageConfig::Local { root },
                None => StorageConfig::default(),
            })
        }
        "memory" => Ok(StorageConfig::Memory),
        "s3" => {
            let bucket = env.s3_bucket.clone().or(file.bucket).ok_or_else(|| {
                ConfigLoadError::Invalid {
                    field: "storage.bucket",
                    reason: "required when storage.backend is s3".to_string(),
                }
            })?;
            let mut s3 = S3StorageConfig::new(bucket);
            s3.region = env.s3_region.clone().or(file.region);
            s3.endpoint = env.s3_endpoint.clone().or(file.endpoint);
            s3.access_key_id = env.s3_access_key_id.clone().or(file.access_key_id);
            s3.secret_access_key =
                env.s3_secret_access_key.clone().or(file.secret_access_key);
            s3.allow_http =
                env.s3_allow_http.or(file.allow_http).unwrap_or(false);
            s3.prefix = file.prefix;
            if let Some(raw) = file.request_timeout {
                s3.request_timeout =
                    parse_duration("storage.request_timeout", &raw)?;
            }
            Ok(StorageConfig::S3(s3))
        }
        other => Err(ConfigLoadError::Invalid {
            field: "storage.backend",
            reason: format!("unknown backend '{other}' (expected local, s3 or memory)"),
        }),
    }
}

fn duration_or(
    field: &'static str,
    raw: Option<String>,
    default: Duration,
) -> Result<Duration, ConfigLoadError> {
    match raw {
        Some(raw) => parse_duration(field, &raw),
        None => Ok(default),
    }
}

fn parse_duration(
    field: &'static str,
    raw: &str,
) -> Result<Duration, ConfigLoadError> {
    humantime::parse_duration(raw.trim()).map_err(|source| {
        ConfigLoadError::InvalidDuration {
            field,
            value: raw.to_string(),
            source,
        }
    })
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid duration '{value}' for {field}")]
    InvalidDuration {
        field: &'static str,
        value: String,
        #[source]
        source: humantime::DurationError,
    },
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error(transparent)]
    GuardRail(#[from] ConfigGuardRailError),
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

#[derive(Debug, Default)]
struct ConfigPathSource {
    explicit: Option<PathBuf>,
    env: Option<PathBuf>,
    default: Option<PathBuf>,
}

impl ConfigPathSource {
    fn resolved_path(&self) -> Option<(PathBuf, ConfigPathProvenance)> {
        if let Some(path) = &self.explicit {
            return Some((path.clone(), ConfigPathProvenance::Explicit));
        }
        if let Some(path) = &self.env {
            return Some((path.clone(), ConfigPathProvenance::Env));
        }
        if let Some(path) = &self.default {
            return Some((path.clone(), ConfigPathProvenance::Default));
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigPathProvenance {
    Explicit,
    Env,
    Default,
}

impl ConfigPathProvenance {
    fn is_explicit(self) -> bool {
        matches!(
            self,
            ConfigPathProvenance::Explicit | ConfigPathProvenance::Env
        )
    }
}
