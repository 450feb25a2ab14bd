use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{info, instrument, warn};
use vigil_model::JobId;

use super::JobRegistry;
use crate::{
    error::Result,
    storage::{JOBS_PREFIX, job_id_from_key},
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub keys_scanned: usize,
    pub jobs_orphaned: usize,
    pub keys_deleted: usize,
    pub failures: usize,
}

impl JobRegistry {
    /// Delete stored objects whose job is neither active nor has a row.
    #[instrument(skip(self))]
    pub async fn sweep_orphans(&self) -> Result<SweepReport> {
        let keys = self.inner.storage.list(JOBS_PREFIX).await?;
        let mut report = SweepReport {
            keys_scanned: keys.len(),
            ..SweepReport::default()
        };

        let mut by_job: BTreeMap<JobId, Vec<String>> = BTreeMap::new();
        for key in keys {
            if let Some(id) = job_id_from_key(&key) {
                by_job.entry(id).or_default().push(key);
            }
        }
        by_job.retain(|id, _| !self.is_active(*id));
        if by_job.is_empty() {
            return Ok(report);
        }

        let candidates: Vec<JobId> = by_job.keys().copied().collect();
        let known = self.inner.repo.existing_ids(&candidates).await?;

        for (id, keys) in by_job {
            // Re-check: the job may have started since the listing.
            if known.contains(&id) || self.is_active(id) {
                continue;
            }
            report.jobs_orphaned += 1;
            for key in keys {
                match self.inner.storage.delete(&key).await {
                    Ok(()) => report.keys_deleted += 1,
                    Err(err) => {
                        warn!(key = %key, error = %err, "failed to delete orphaned object");
                        report.failures += 1;
                    }
                }
            }
            self.inner.cache.evict(id);
        }

        if report.jobs_orphaned > 0 {
            info!(
                scanned = report.keys_scanned,
                orphaned_jobs = report.jobs_orphaned,
                deleted = report.keys_deleted,
                failures = report.failures,
                "orphan sweep finished"
            );
        }
        Ok(report)
    }
}
