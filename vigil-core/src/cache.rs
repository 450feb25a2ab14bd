//! Parsed artifacts of terminal jobs.
//!
//! Terminal artifacts are write-once, so an entry is valid forever once
//! fetched. Non-terminal jobs are never served from here: the in-memory
//! job state is always fresher than anything in the store.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use dashmap::DashMap;
use tracing::{debug, warn};
use vigil_model::{JobId, JobRecord, JobStatistics};

use crate::{
    error::{Result, VigilError},
    report::parse_report,
    storage::ObjectStorage,
};

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub job_id: JobId,
    pub key: String,
    pub statistics: Arc<JobStatistics>,
    pub byte_len: usize,
}

/// The result log among a job's artifact keys, if any.
pub fn result_log_key(keys: &[String]) -> Option<&str> {
    keys.iter()
        .find(|key| key.ends_with("report.jsonl"))
        .or_else(|| keys.iter().find(|key| key.ends_with(".jsonl")))
        .map(String::as_str)
}

/// Thin wrapper over `cacache` keyed by storage key.
#[derive(Clone)]
pub struct ArtifactBlobStore {
    root: PathBuf,
}

impl fmt::Debug for ArtifactBlobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ArtifactBlobStore").field(&self.root).finish()
    }
}

impl ArtifactBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match cacache::read(self.root.as_path(), key).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(cacache::Error::EntryNotFound(_, _)) => Ok(None),
            Err(cacache::Error::IntegrityError(err)) => Err(VigilError::internal(
                format!("cache entry failed integrity check: {key} ({err})"),
            )),
            Err(cacache::Error::SizeMismatch(wanted, actual)) => {
                Err(VigilError::internal(format!(
                    "cache entry size mismatch: key={key}, wanted={wanted}, actual={actual}"
                )))
            }
            Err(cacache::Error::IoError(_, msg)) => Err(VigilError::internal(
                format!("cacache read I/O error: {msg}"),
            )),
            Err(cacache::Error::SerdeError(_, msg)) => Err(VigilError::internal(
                format!("cacache read serde error: {msg}"),
            )),
        }
    }

    pub async fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        cacache::write(self.root.as_path(), key, bytes)
            .await
            .map(|_| ())
            .map_err(|e| VigilError::internal(format!("cacache write failed: {e}")))
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        cacache::index::RemoveOpts::new()
            .remove_fully(true)
            .remove(self.root.as_path(), key)
            .await
            .map_err(|e| VigilError::internal(format!("cacache remove failed: {e}")))
    }
}

pub struct ArtifactCache {
    entries: DashMap<JobId, Arc<CacheEntry>>,
    disk: Option<ArtifactBlobStore>,
    storage: Arc<dyn ObjectStorage>,
}

impl fmt::Debug for ArtifactCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtifactCache")
            .field("entries", &self.entries.len())
            .field("disk", &self.disk)
            .field("storage", &self.storage.backend_name())
            .finish()
    }
}

impl ArtifactCache {
    pub fn new(storage: Arc<dyn ObjectStorage>) -> Self {
        Self {
            entries: DashMap::new(),
            disk: None,
            storage,
        }
    }

    pub fn with_disk_cache(mut self, disk: ArtifactBlobStore) -> Self {
        self.disk = Some(disk);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn peek(&self, job_id: JobId) -> Option<Arc<CacheEntry>> {
        self.entries.get(&job_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Parsed result log of a terminal job, fetched at most once.
    pub async fn load(&self, record: &JobRecord) -> Result<Arc<CacheEntry>> {
        if !record.is_terminal() {
            return Err(VigilError::conflict(format!(
                "job {} is {}; artifacts are only cached for terminal jobs",
                record.id, record.status
            )));
        }
        if let Some(hit) = self.peek(record.id) {
            return Ok(hit);
        }
        let key = result_log_key(&record.artifact_keys).ok_or_else(|| {
            VigilError::conflict(format!("job {} has no result log", record.id))
        })?;

        let bytes = match self.read_disk(key).await {
            Some(bytes) => bytes,
            None => {
                let fetched = self.storage.get(key).await?;
                self.write_disk(key, &fetched).await;
                fetched.to_vec()
            }
        };

        Ok(self.insert(record.id, key, &bytes))
    }

    /// Populate from bytes already in hand, e.g. right after finalization.
    pub async fn seed(
        &self,
        job_id: JobId,
        key: &str,
        bytes: &[u8],
    ) -> Arc<CacheEntry> {
        self.write_disk(key, bytes).await;
        self.insert(job_id, key, bytes)
    }

    /// Drop the in-memory entry only.
    pub fn evict(&self, job_id: JobId) -> Option<Arc<CacheEntry>> {
        self.entries.remove(&job_id).map(|(_, entry)| entry)
    }

    /// Drop every trace of a job, including on-disk blobs for `keys`.
    pub async fn purge(&self, job_id: JobId, keys: &[String]) {
        self.evict(job_id);
        let Some(disk) = &self.disk else {
            return;
        };
        for key in keys {
            if let Err(err) = disk.remove(key).await {
                warn!(job_id = %job_id, key = %key, error = %err, "failed to purge cached artifact");
            }
        }
    }

    fn insert(&self, job_id: JobId, key: &str, bytes: &[u8]) -> Arc<CacheEntry> {
        let entry = Arc::new(CacheEntry {
            job_id,
            key: key.to_string(),
            statistics: Arc::new(parse_report(bytes)),
            byte_len: bytes.len(),
        });
        // First writer wins so concurrent loads observe a single entry.
        let stored = self.entries.entry(job_id).or_insert(entry);
        Arc::clone(stored.value())
    }

    async fn read_disk(&self, key: &str) -> Option<Vec<u8>> {
        let disk = self.disk.as_ref()?;
        match disk.read(key).await {
            Ok(Some(bytes)) => {
                debug!(key, "artifact served from disk cache");
                Some(bytes)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(key, error = %err, "ignoring unreadable disk cache entry");
                None
            }
        }
    }

    async fn write_disk(&self, key: &str, bytes: &[u8]) {
        if let Some(disk) = &self.disk
            && let Err(err) = disk.write(key, bytes).await
        {
            warn!(key, error = %err, "failed to write disk cache entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::Utc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use vigil_model::{JobSpec, JobStatus, TargetDescriptor};

    use super::*;
    use crate::storage::{ByteStream, ObjectStoreBackend, artifact_key};

    const LOG: &[u8] = br#"{"entry_type": "eval", "probe": "dan.Dan_11_0", "detector": "mitigation.MitigationBypass", "passed": 4, "total": 5}
"#;

    /// Store that can be switched off mid-test.
    #[derive(Debug)]
    struct Flaky {
        inner: ObjectStoreBackend,
        down: AtomicBool,
        gets: AtomicUsize,
    }

    impl Flaky {
        fn check(&self) -> Result<()> {
            if self.down.load(Ordering::SeqCst) {
                Err(VigilError::TransientIo("store unreachable".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl ObjectStorage for Flaky {
        async fn put(&self, key: &str, data: Bytes) -> Result<()> {
            self.check()?;
            self.inner.put(key, data).await
        }
        async fn get(&self, key: &str) -> Result<Bytes> {
            self.check()?;
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.inner.get(key).await
        }
        async fn delete(&self, key: &str) -> Result<()> {
            self.check()?;
            self.inner.delete(key).await
        }
        async fn list(&self, prefix: &str) -> Result<Vec<String>> {
            self.check()?;
            self.inner.list(prefix).await
        }
        async fn stream(&self, key: &str) -> Result<ByteStream> {
            self.check()?;
            self.inner.stream(key).await
        }
        fn backend_name(&self) -> &'static str {
            "flaky"
        }
    }

    fn terminal_record(status: JobStatus) -> JobRecord {
        let spec = JobSpec::new(TargetDescriptor::new("t", "n"), vec!["dan".into()]);
        let mut record = JobRecord::pending(JobId::generate(), &spec, Utc::now());
        record.status = status;
        record.artifact_keys = vec![
            artifact_key(record.id, "report.html"),
            artifact_key(record.id, "report.jsonl"),
        ];
        record
    }

    #[tokio::test]
    async fn terminal_entries_survive_store_outage() {
        let store = Arc::new(Flaky {
            inner: ObjectStoreBackend::in_memory(),
            down: AtomicBool::new(false),
            gets: AtomicUsize::new(0),
        });
        let record = terminal_record(JobStatus::Completed);
        store
            .put(&record.artifact_keys[1], Bytes::from_static(LOG))
            .await
            .unwrap();

        let cache = ArtifactCache::new(store.clone());
        let first = cache.load(&record).await.unwrap();
        store.down.store(true, Ordering::SeqCst);
        let second = cache.load(&record).await.unwrap();

        assert_eq!(
            serde_json::to_vec(&*first.statistics).unwrap(),
            serde_json::to_vec(&*second.statistics).unwrap()
        );
        assert_eq!(store.gets.load(Ordering::SeqCst), 1);
        assert_eq!(first.key, record.artifact_keys[1]);
    }

    #[tokio::test]
    async fn disk_cache_outlives_memory() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Flaky {
            inner: ObjectStoreBackend::in_memory(),
            down: AtomicBool::new(true),
            gets: AtomicUsize::new(0),
        });
        let record = terminal_record(JobStatus::Failed);
        let cache = ArtifactCache::new(store.clone())
            .with_disk_cache(ArtifactBlobStore::new(dir.path()));

        cache.seed(record.id, &record.artifact_keys[1], LOG).await;
        cache.evict(record.id);
        let entry = cache.load(&record).await.unwrap();
        assert_eq!(entry.statistics.eval_entries, 1);

        cache.purge(record.id, &record.artifact_keys).await;
        assert!(cache.is_empty());
        assert!(matches!(
            cache.load(&record).await,
            Err(VigilError::TransientIo(_))
        ));
    }

    #[tokio::test]
    async fn refuses_non_terminal_jobs() {
        let cache = ArtifactCache::new(Arc::new(ObjectStoreBackend::in_memory()));
        let record = terminal_record(JobStatus::Running);
        assert!(matches!(
            cache.load(&record).await,
            Err(VigilError::Conflict(_))
        ));
    }

    #[test]
    fn prefers_the_result_log() {
        let keys = vec!["jobs/x/report.html".to_string(), "jobs/x/hitlog.jsonl".to_string(), "jobs/x/report.jsonl".to_string()];
        assert_eq!(result_log_key(&keys), Some("jobs/x/report.jsonl"));
        assert_eq!(result_log_key(&keys[..1]), None);
    }
}
