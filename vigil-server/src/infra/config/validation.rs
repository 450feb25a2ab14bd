use thiserror::Error;

use super::models::Config;
use vigil_core::StorageConfig;

/// Non-fatal configuration findings surfaced at startup.
#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

impl ConfigWarnings {
    pub fn push(&mut self, message: impl Into<String>) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint(
        &mut self,
        message: impl Into<String>,
        hint: impl Into<String>,
    ) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }
}

#[derive(Debug, Error)]
pub enum ConfigGuardRailError {
    #[error("runner.max_concurrent_jobs must be at least 1")]
    ZeroConcurrency,
    #[error("orchestrator.{field} must be at least 1")]
    ZeroCapacity { field: &'static str },
    #[error("storage bucket must not be empty")]
    EmptyBucket,
    #[error("runner executable must not be empty")]
    EmptyExecutable,
}

/// Rejects settings the orchestrator cannot run with and collects
/// warnings for ones that are merely questionable.
pub fn apply_guard_rails(
    config: &Config,
) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();

    if config.runner.max_concurrent_jobs == 0 {
        return Err(ConfigGuardRailError::ZeroConcurrency);
    }
    if config.runner.executable.as_os_str().is_empty() {
        return Err(ConfigGuardRailError::EmptyExecutable);
    }
    if config.orchestrator.event_history == 0 {
        return Err(ConfigGuardRailError::ZeroCapacity {
            field: "event_history",
        });
    }
    if config.orchestrator.event_channel_capacity == 0 {
        return Err(ConfigGuardRailError::ZeroCapacity {
            field: "event_channel_capacity",
        });
    }

    match &config.storage {
        StorageConfig::S3(s3) => {
            if s3.bucket.trim().is_empty() {
                return Err(ConfigGuardRailError::EmptyBucket);
            }
            if s3.access_key_id.is_none() {
                warnings.push_with_hint(
                    "S3 storage configured without explicit credentials",
                    "Credentials will be resolved from the ambient AWS environment",
                );
            }
            if s3.allow_http {
                warnings.push("S3 storage allows plain HTTP connections");
            }
        }
        StorageConfig::Memory => {
            warnings.push_with_hint(
                "In-memory artifact storage selected; reports are lost on restart",
                "Set STORAGE_BACKEND=local or s3 for durable artifacts",
            );
        }
        StorageConfig::Local { .. } => {}
    }

    if config.database.url.is_none() {
        warnings.push_with_hint(
            "DATABASE_URL not set; job metadata is kept in memory",
            "Set DATABASE_URL to a Postgres instance to keep job history across restarts",
        );
        if !matches!(config.storage, StorageConfig::Memory)
            && config.sweep.interval.is_some()
        {
            warnings.push_with_hint(
                "Orphan sweep enabled with an in-memory metadata store",
                "Artifacts from previous runs have no metadata rows and will be removed",
            );
        }
    }

    if config.runner.drain_timeout < config.orchestrator.snapshot_interval {
        warnings.push(
            "runner.drain_timeout is shorter than orchestrator.snapshot_interval",
        );
    }

    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::S3StorageConfig;

    #[test]
    fn zero_concurrency_is_fatal() {
        let mut config = Config::default();
        config.runner.max_concurrent_jobs = 0;
        assert!(matches!(
            apply_guard_rails(&config),
            Err(ConfigGuardRailError::ZeroConcurrency)
        ));
    }

    #[test]
    fn empty_bucket_is_fatal() {
        let mut config = Config::default();
        config.storage = StorageConfig::S3(S3StorageConfig::new(" "));
        assert!(matches!(
            apply_guard_rails(&config),
            Err(ConfigGuardRailError::EmptyBucket)
        ));
    }

    #[test]
    fn in_memory_metadata_is_only_a_warning() {
        let mut config = Config::default();
        config.sweep.interval = None;
        let warnings = apply_guard_rails(&config).unwrap();
        assert_eq!(warnings.items.len(), 1);
        assert!(warnings.items[0].message.contains("DATABASE_URL"));
        assert!(warnings.items[0].hint.is_some());
    }
}
