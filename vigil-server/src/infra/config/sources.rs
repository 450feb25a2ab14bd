use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::PathBuf};

/// Raw configuration as defined in a TOML file.
///
/// Durations are human-readable strings (`"5s"`, `"250ms"`).
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub server: FileServerConfig,
    #[serde(default)]
    pub database: FileDatabaseConfig,
    #[serde(default)]
    pub storage: FileStorageConfig,
    #[serde(default)]
    pub runner: FileRunnerConfig,
    #[serde(default)]
    pub orchestrator: FileOrchestratorConfig,
    #[serde(default)]
    pub gateway: FileGatewayConfig,
    #[serde(default)]
    pub cache: FileCacheConfig,
    #[serde(default)]
    pub sweep: FileSweepConfig,
    #[serde(default)]
    pub cors: FileCorsConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileServerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown_grace: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileDatabaseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acquire_timeout: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileStorageConfig {
    /// `local`, `s3` or `memory`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_key_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_access_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_http: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileRunnerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executable: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_args: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scratch_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_jobs: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spawn_timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_grace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drain_timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic_lines: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_alias: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fatal_signatures: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileOrchestratorConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_history: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_channel_capacity: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_base: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_max: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileGatewayConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_hint: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileCacheConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileSweepConfig {
    /// `"0s"` disables the periodic sweep.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileCorsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_origins: Option<Vec<String>>,
}

/// Environment-derived configuration values.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub server_host: Option<String>,
    pub server_port: Option<u16>,
    pub database_url: Option<String>,
    pub database_max_connections: Option<u32>,
    pub storage_backend: Option<String>,
    pub storage_root: Option<PathBuf>,
    pub s3_bucket: Option<String>,
    pub s3_region: Option<String>,
    pub s3_endpoint: Option<String>,
    pub s3_access_key_id: Option<String>,
    pub s3_secret_access_key: Option<String>,
    pub s3_allow_http: Option<bool>,
    pub scanner_executable: Option<PathBuf>,
    pub scanner_base_args: Option<Vec<String>>,
    pub scratch_dir: Option<PathBuf>,
    pub max_concurrent_jobs: Option<usize>,
    pub host_alias: Option<String>,
    pub fatal_signatures: Option<Vec<String>>,
    pub cache_root: Option<PathBuf>,
    pub sweep_interval: Option<String>,
    pub cors_allowed_origins: Option<Vec<String>>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self {
            config_path: std::env::var("VIGIL_CONFIG").ok().map(PathBuf::from),
            server_host: std::env::var("SERVER_HOST").ok(),
            server_port: std::env::var("SERVER_PORT")
                .ok()
                .and_then(|s| s.parse().ok()),
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            database_max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok()),
            storage_backend: std::env::var("STORAGE_BACKEND").ok(),
            storage_root: std::env::var("STORAGE_ROOT").ok().map(PathBuf::from),
            s3_bucket: std::env::var("S3_BUCKET").ok(),
            s3_region: std::env::var("S3_REGION")
                .ok()
                .or_else(|| std::env::var("AWS_REGION").ok()),
            s3_endpoint: std::env::var("S3_ENDPOINT").ok(),
            s3_access_key_id: std::env::var("AWS_ACCESS_KEY_ID").ok(),
            s3_secret_access_key: std::env::var("AWS_SECRET_ACCESS_KEY").ok(),
            s3_allow_http: parse_bool_var("S3_ALLOW_HTTP"),
            scanner_executable: std::env::var("SCANNER_EXECUTABLE")
                .ok()
                .map(PathBuf::from),
            scanner_base_args: std::env::var("SCANNER_BASE_ARGS")
                .ok()
                .map(|raw| raw.split_whitespace().map(str::to_string).collect()),
            scratch_dir: std::env::var("SCRATCH_DIR").ok().map(PathBuf::from),
            max_concurrent_jobs: std::env::var("MAX_CONCURRENT_JOBS")
                .ok()
                .and_then(|s| s.parse().ok()),
            host_alias: std::env::var("SCANNER_HOST_ALIAS").ok(),
            fatal_signatures: parse_csv_var("SCANNER_FATAL_SIGNATURES"),
            cache_root: std::env::var("CACHE_DIR").ok().map(PathBuf::from),
            sweep_interval: std::env::var("SWEEP_INTERVAL").ok(),
            cors_allowed_origins: parse_csv_var("CORS_ALLOWED_ORIGINS"),
        }
    }
}

fn parse_csv_var(name: &str) -> Option<Vec<String>> {
    std::env::var(name).ok().map(|raw| split_csv(&raw))
}

pub(crate) fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .filter_map(|part| {
            let trimmed = part.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
        .collect()
}

fn parse_bool_var(name: &str) -> Option<bool> {
    std::env::var(name).ok().and_then(|raw| {
        match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        }
    })
}
