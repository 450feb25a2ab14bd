//! The job registry: authoritative view over every job.
//!
//! Non-terminal jobs live in the active set and are owned by one actor task
//! each; that actor is the only writer of the job's state. Terminal jobs are
//! served from the metadata store. Nothing reads the store back for a job
//! that is still active.

mod active;
mod actor;
mod sweep;

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, instrument, warn};
use vigil_model::{
    AggregateStatistics, EventFrame, JobId, JobPage, JobQuery, JobRecord,
    JobSnapshot, JobSpec, JobStatistics, JobStatisticsSummary, JobStatus,
};

pub use active::{LiveJob, apply_progress};
pub use sweep::SweepReport;

use self::active::ActiveJob;
use crate::{
    cache::{ArtifactCache, result_log_key},
    database::JobRepository,
    error::{Result, VigilError},
    finalizer::ReportFinalizer,
    retry::RetryPolicy,
    runner::JobRunner,
    storage::{ByteStream, ObjectStorage, artifact_key, job_prefix},
};

pub const RESTART_MESSAGE: &str = "orchestrator restarted while job was active";
pub const UNFINALIZED_MESSAGE: &str =
    "orchestrator restarted before the job's artifacts were recorded";

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Cadence of progress snapshots written to the metadata store.
    pub snapshot_interval: Duration,
    /// Frames kept per active job for replay.
    pub event_history: usize,
    pub event_channel_capacity: usize,
    /// Metadata store writes.
    pub store_retry: RetryPolicy,
    /// Artifact uploads and read-back verification.
    pub finalize_retry: RetryPolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: Duration::from_secs(2),
            event_history: 512,
            event_channel_capacity: 256,
            store_retry: RetryPolicy::default(),
            finalize_retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Termination was requested; the job will end `cancelled`.
    Cancelling,
    /// Nothing to do; the job already ended with this status.
    AlreadyTerminal(JobStatus),
}

#[derive(Clone)]
pub struct JobRegistry {
    inner: Arc<RegistryInner>,
}

pub(crate) struct RegistryInner {
    config: RegistryConfig,
    runner: JobRunner,
    repo: Arc<dyn JobRepository>,
    storage: Arc<dyn ObjectStorage>,
    finalizer: ReportFinalizer,
    cache: Arc<ArtifactCache>,
    active: RwLock<HashMap<JobId, Arc<ActiveJob>>>,
    /// Terminal jobs whose result log is gone from the object store.
    missing_logs: Mutex<HashSet<JobId>>,
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("config", &self.inner.config)
            .field("runner", &self.inner.runner)
            .field("repo", &self.inner.repo)
            .field("storage", &self.inner.storage.backend_name())
            .field("active_jobs", &self.inner.active.read().len())
            .finish_non_exhaustive()
    }
}

impl JobRegistry {
    pub fn new(
        config: RegistryConfig,
        runner: JobRunner,
        repo: Arc<dyn JobRepository>,
        storage: Arc<dyn ObjectStorage>,
        cache: Arc<ArtifactCache>,
    ) -> Self {
        let finalizer = ReportFinalizer::new(
            Arc::clone(&storage),
            config.finalize_retry,
            runner.config().scratch_dir.clone(),
        );
        Self {
            inner: Arc::new(RegistryInner {
                config,
                runner,
                repo,
                storage,
                finalizer,
                cache,
                active: RwLock::new(HashMap::new()),
                missing_logs: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    pub fn runner(&self) -> &JobRunner {
        &self.inner.runner
    }

    pub fn repository(&self) -> Arc<dyn JobRepository> {
        Arc::clone(&self.inner.repo)
    }

    pub fn storage(&self) -> Arc<dyn ObjectStorage> {
        Arc::clone(&self.inner.storage)
    }

    pub fn cache(&self) -> Arc<ArtifactCache> {
        Arc::clone(&self.inner.cache)
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.read().len()
    }

    pub fn is_active(&self, id: JobId) -> bool {
        self.inner.active.read().contains_key(&id)
    }

    fn active(&self, id: JobId) -> Option<Arc<ActiveJob>> {
        self.inner.active.read().get(&id).cloned()
    }

    /// Accept a job and launch it in the background.
    ///
    /// Returns the `pending` record. Fails with `Capacity` at the
    /// concurrency ceiling and with `Conflict` if the id is taken.
    #[instrument(skip(self, spec), fields(job_id = %id))]
    pub async fn start(&self, id: JobId, spec: JobSpec) -> Result<JobRecord> {
        if spec.units.is_empty() {
            return Err(VigilError::InvalidRequest(
                "at least one unit must be requested".into(),
            ));
        }
        if self.is_active(id) {
            return Err(VigilError::conflict(format!("job {id} is already active")));
        }
        let permit = self.inner.runner.reserve()?;

        let record = JobRecord::pending(id, &spec, Utc::now());
        let job = Arc::new(ActiveJob::new(
            record.clone(),
            self.inner.config.event_channel_capacity,
            self.inner.config.event_history,
        ));
        {
            let mut active = self.inner.active.write();
            if active.contains_key(&id) {
                return Err(VigilError::conflict(format!(
                    "job {id} is already active"
                )));
            }
            active.insert(id, Arc::clone(&job));
        }

        let inserted = self
            .inner
            .config
            .store_retry
            .run("insert job", || self.inner.repo.insert(&record))
            .await;
        if let Err(err) = inserted {
            self.inner.active.write().remove(&id);
            return Err(err);
        }

        let events =
            self.inner.runner.launch(permit, id, spec, Arc::clone(&job.gate));
        tokio::spawn(actor::drive(Arc::clone(&self.inner), job, events));
        info!(target = %record.target.kind, units = record.total_units, "job accepted");
        Ok(record)
    }

    /// Request termination of a running job.
    #[instrument(skip(self), fields(job_id = %id))]
    pub async fn cancel(&self, id: JobId) -> Result<CancelOutcome> {
        if let Some(job) = self.active(id) {
            let live = job.live();
            return match live.record.status {
                JobStatus::Running if !live.finalizing => {
                    if job.gate.request_cancel() {
                        info!("cancellation requested");
                        Ok(CancelOutcome::Cancelling)
                    } else {
                        Err(VigilError::conflict(format!(
                            "job {id} already exited and is being finalized"
                        )))
                    }
                }
                JobStatus::Running => Err(VigilError::conflict(format!(
                    "job {id} already exited and is being finalized"
                ))),
                JobStatus::Pending => Err(VigilError::conflict(format!(
                    "job {id} has not started running yet"
                ))),
                status => Ok(CancelOutcome::AlreadyTerminal(status)),
            };
        }

        match self.inner.repo.get(id).await? {
            Some(record) if record.is_terminal() => {
                debug!(status = %record.status, "cancel of terminal job ignored");
                Ok(CancelOutcome::AlreadyTerminal(record.status))
            }
            Some(record) => Err(VigilError::conflict(format!(
                "job {id} is {} but not owned by this orchestrator",
                record.status
            ))),
            None => Err(VigilError::not_found(format!("job {id}"))),
        }
    }

    /// Current record: the active set first, then the metadata store.
    pub async fn get_status(&self, id: JobId) -> Result<JobRecord> {
        if let Some(job) = self.active(id) {
            return Ok(job.live().record);
        }
        self.inner
            .repo
            .get(id)
            .await?
            .ok_or_else(|| VigilError::not_found(format!("job {id}")))
    }

    pub async fn snapshot(&self, id: JobId) -> Result<JobSnapshot> {
        if let Some(job) = self.active(id) {
            return Ok(job.live().snapshot());
        }
        let record = self.get_status(id).await?;
        Ok(JobSnapshot::from_record(&record, 0))
    }

    /// Stored rows, with active jobs overlaid by their in-memory state.
    pub async fn list(&self, query: &JobQuery) -> Result<JobPage> {
        let mut page = self.inner.repo.list(query).await?;
        let active = self.inner.active.read();
        for record in &mut page.jobs {
            if let Some(job) = active.get(&record.id) {
                *record = job.live().record;
            }
        }
        Ok(page)
    }

    /// Live view of an active job. `None` once the job left the active set.
    pub fn watch(&self, id: JobId) -> Option<watch::Receiver<LiveJob>> {
        self.active(id).map(|job| job.state.subscribe())
    }

    /// Buffered frames and a receiver for later ones, taken atomically.
    pub fn subscribe(
        &self,
        id: JobId,
    ) -> Option<(Vec<EventFrame>, broadcast::Receiver<EventFrame>)> {
        self.active(id).map(|job| job.subscribe())
    }

    /// Buffered frames newer than `since`. Empty for jobs that are no
    /// longer active.
    pub async fn events_since(&self, id: JobId, since: u64) -> Result<Vec<EventFrame>> {
        if let Some(job) = self.active(id) {
            return Ok(job.history_since(since));
        }
        match self.inner.repo.get(id).await? {
            Some(_) => Ok(Vec::new()),
            None => Err(VigilError::not_found(format!("job {id}"))),
        }
    }

    /// Wait until the job is terminal and return its final record.
    pub async fn wait_for_terminal(&self, id: JobId) -> Result<JobRecord> {
        if let Some(mut rx) = self.watch(id) {
            loop {
                if rx.borrow_and_update().record.is_terminal() {
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }
        let record = self.get_status(id).await?;
        if record.is_terminal() {
            Ok(record)
        } else {
            Err(VigilError::conflict(format!(
                "job {id} is {} and not owned by this orchestrator",
                record.status
            )))
        }
    }

    /// Materialized statistics of a terminal job, computed at most once.
    #[instrument(skip(self), fields(job_id = %id))]
    pub async fn statistics(&self, id: JobId) -> Result<JobStatistics> {
        let record = self.get_status(id).await?;
        if !record.is_terminal() {
            return Err(VigilError::conflict(format!(
                "job {id} is {}; statistics are available once it ends",
                record.status
            )));
        }
        self.materialize(&record).await
    }

    async fn materialize(&self, record: &JobRecord) -> Result<JobStatistics> {
        if let Some(stats) = &record.statistics {
            return Ok(stats.clone());
        }
        let entry = self.inner.cache.load(record).await?;
        let stats = (*entry.statistics).clone();
        if self.inner.repo.store_statistics(record.id, &stats).await? {
            debug!(job_id = %record.id, "statistics materialized");
            return Ok(stats);
        }
        // Someone else stored first; theirs is authoritative.
        match self.inner.repo.get(record.id).await? {
            Some(JobRecord {
                statistics: Some(stored),
                ..
            }) => Ok(stored),
            _ => Ok(stats),
        }
    }

    /// Cross-job rollup over materialized statistics of terminal jobs.
    pub async fn aggregate_statistics(&self) -> Result<AggregateStatistics> {
        let mut aggregate = AggregateStatistics::default();
        let active: Vec<JobStatus> = self
            .inner
            .active
            .read()
            .values()
            .map(|job| job.live().record.status)
            .collect();
        for status in active {
            aggregate.count_status(status);
        }

        for record in self.inner.repo.list_terminal().await? {
            aggregate.count_status(record.status);
            if record.statistics.is_none()
                && (result_log_key(&record.artifact_keys).is_none()
                    || self.inner.missing_logs.lock().contains(&record.id))
            {
                continue;
            }
            let statistics = match self.materialize(&record).await {
                Ok(stats) => stats,
                Err(err) => {
                    if matches!(err, VigilError::NotFound(_)) {
                        self.inner.missing_logs.lock().insert(record.id);
                    }
                    debug!(job_id = %record.id, error = %err, "job has no statistics");
                    continue;
                }
            };
            aggregate.absorb(JobStatisticsSummary {
                job_id: record.id,
                target: record.target,
                status: record.status,
                statistics,
            });
        }
        Ok(aggregate)
    }

    /// Delete a terminal job: objects first (best effort), then the row.
    /// Deleting an unknown id succeeds.
    #[instrument(skip(self), fields(job_id = %id))]
    pub async fn delete(&self, id: JobId) -> Result<bool> {
        if self.is_active(id) {
            return Err(VigilError::conflict(format!(
                "job {id} is active; cancel it first"
            )));
        }
        let record = self.inner.repo.get(id).await?;

        let mut keys = match self.inner.storage.list(&job_prefix(id)).await {
            Ok(keys) => keys,
            Err(err) => {
                warn!(error = %err, "failed to list job objects; using recorded keys");
                Vec::new()
            }
        };
        if let Some(record) = &record {
            for key in &record.artifact_keys {
                if !keys.contains(key) {
                    keys.push(key.clone());
                }
            }
        }
        for key in &keys {
            if let Err(err) = self.inner.storage.delete(key).await {
                warn!(key = %key, error = %err, "failed to delete job object; leaving it for the sweep");
            }
        }

        let deleted = self
            .inner
            .config
            .store_retry
            .run("delete job", || self.inner.repo.delete(id))
            .await?;
        self.inner.cache.purge(id, &keys).await;
        self.inner.missing_logs.lock().remove(&id);
        if deleted {
            info!(objects = keys.len(), "job deleted");
        }
        Ok(deleted)
    }

    /// Stream one stored artifact of a job.
    pub async fn artifact_stream(&self, id: JobId, name: &str) -> Result<ByteStream> {
        let record = self.get_status(id).await?;
        let key = artifact_key(id, name);
        if !record.artifact_keys.contains(&key) {
            return Err(VigilError::not_found(format!(
                "artifact '{name}' of job {id}"
            )));
        }
        self.inner.storage.stream(&key).await
    }

    /// Close out rows a previous process left non-terminal or `completed`
    /// without recorded artifacts.
    #[instrument(skip(self))]
    pub async fn recover_unfinished(&self) -> Result<usize> {
        let mut recovered = 0;
        for record in self.inner.repo.list_unfinished().await? {
            if self.is_active(record.id) {
                continue;
            }
            self.inner
                .config
                .store_retry
                .run("mark abandoned", || {
                    self.inner.repo.mark_abandoned(record.id, RESTART_MESSAGE)
                })
                .await?;
            warn!(job_id = %record.id, status = %record.status, "abandoned job marked as error");
            recovered += 1;
        }
        for record in self.inner.repo.list_unfinalized().await? {
            if self.is_active(record.id) {
                continue;
            }
            self.inner
                .config
                .store_retry
                .run("mark finalization failed", || {
                    self.inner
                        .repo
                        .mark_finalization_failed(record.id, UNFINALIZED_MESSAGE)
                })
                .await?;
            warn!(job_id = %record.id, "completed job without artifacts marked as error");
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Cancel every running job and wait up to `grace` for them to end.
    pub async fn shutdown(&self, grace: Duration) {
        let jobs: Vec<Arc<ActiveJob>> =
            self.inner.active.read().values().cloned().collect();
        if jobs.is_empty() {
            return;
        }
        info!(jobs = jobs.len(), "cancelling active jobs");
        for job in &jobs {
            job.gate.request_cancel();
        }
        let ids: Vec<JobId> = jobs.iter().map(|job| job.id).collect();
        drop(jobs);

        let wait = futures::future::join_all(
            ids.iter().map(|id| self.wait_for_terminal(*id)),
        );
        if tokio::time::timeout(grace, wait).await.is_err() {
            warn!(remaining = self.active_count(), "shutdown grace elapsed with jobs still active");
        }
    }
}
