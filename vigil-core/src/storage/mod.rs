//! Artifact storage behind one interface.
//!
//! Backends are chosen once at startup through [`build_object_storage`];
//! call sites only ever see `Arc<dyn ObjectStorage>`. No backend offers
//! rename: moving an object means put-then-delete, so callers that need
//! an atomic rename must do it before the data reaches the store.

mod backend;

use std::{fmt, path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use vigil_model::JobId;

pub use backend::ObjectStoreBackend;

use crate::error::Result;

pub const JOBS_PREFIX: &str = "jobs/";

pub type ByteStream = BoxStream<'static, Result<Bytes>>;

#[async_trait]
pub trait ObjectStorage: Send + Sync + fmt::Debug {
    /// Write `data` under `key`, replacing any existing object.
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Remove `key`. Removing a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Every key under `prefix`, in no particular order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn stream(&self, key: &str) -> Result<ByteStream>;

    fn backend_name(&self) -> &'static str;
}

/// Key prefix owning every artifact of a job.
pub fn job_prefix(job_id: JobId) -> String {
    format!("{JOBS_PREFIX}{job_id}/")
}

pub fn artifact_key(job_id: JobId, artifact_name: &str) -> String {
    format!("{}{artifact_name}", job_prefix(job_id))
}

/// Job id owning `key`, if the key follows the job layout.
pub fn job_id_from_key(key: &str) -> Option<JobId> {
    let rest = key.strip_prefix(JOBS_PREFIX)?;
    let (id, name) = rest.split_once('/')?;
    if name.is_empty() {
        return None;
    }
    id.parse().ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3StorageConfig {
    pub bucket: String,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub allow_http: bool,
    /// Optional key prefix inside the bucket.
    pub prefix: Option<String>,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl S3StorageConfig {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            region: None,
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
            allow_http: false,
            prefix: None,
            request_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    Local { root: PathBuf },
    S3(S3StorageConfig),
    /// Process-local store; contents vanish on exit.
    Memory,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Local {
            root: PathBuf::from("data/artifacts"),
        }
    }
}

pub fn build_object_storage(
    config: &StorageConfig,
) -> Result<Arc<dyn ObjectStorage>> {
    let backend = match config {
        StorageConfig::Local { root } => ObjectStoreBackend::local(root)?,
        StorageConfig::S3(s3) => ObjectStoreBackend::s3(s3)?,
        StorageConfig::Memory => ObjectStoreBackend::in_memory(),
    };
    Ok(Arc::new(backend))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_round_trip_to_job_ids() {
        let id = JobId::generate();
        let key = artifact_key(id, "report.jsonl");
        assert!(key.starts_with(&job_prefix(id)));
        assert_eq!(job_id_from_key(&key), Some(id));
        assert_eq!(job_id_from_key("jobs/not-a-uuid/report.jsonl"), None);
        assert_eq!(job_id_from_key(&job_prefix(id)), None);
        assert_eq!(job_id_from_key("other/file"), None);
    }
}
