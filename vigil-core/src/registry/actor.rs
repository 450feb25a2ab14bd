//! Per-job actor: the single writer of one active job.

use std::sync::Arc;

use chrono::Utc;
use tokio::{sync::mpsc, time::MissedTickBehavior};
use tracing::{debug, error, info, warn};
use vigil_model::{
    FramePayload, JobId, JobRecord, JobStatistics, JobStatus, ProgressEvent,
};

use super::{RegistryInner, active::ActiveJob, apply_progress};
use crate::{
    cache::result_log_key,
    database::JobRepository,
    error::VigilError,
    finalizer::FinalizedArtifact,
    runner::{ExitOutcome, RunnerEvent},
};

pub(super) async fn drive(
    inner: Arc<RegistryInner>,
    job: Arc<ActiveJob>,
    mut events: mpsc::Receiver<RunnerEvent>,
) {
    let mut ticker = tokio::time::interval(inner.config.snapshot_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    let mut dirty = false;
    let mut announced: Vec<String> = Vec::new();

    let outcome = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(RunnerEvent::Spawned { pid }) => {
                    debug!(job_id = %job.id, pid = ?pid, "job running");
                    job.publish(
                        FramePayload::Status {
                            status: JobStatus::Running,
                            error_message: None,
                        },
                        |live| {
                            live.record.status = JobStatus::Running;
                            live.record.started_at = Some(Utc::now());
                        },
                    );
                    persist_snapshot(&inner, &job).await;
                    dirty = false;
                }
                Some(RunnerEvent::Progress(event)) => {
                    if let ProgressEvent::ArtifactReady { location } = &event
                        && !announced.contains(location)
                    {
                        announced.push(location.clone());
                    }
                    let applied = event.clone();
                    job.publish(FramePayload::Progress(event), |live| {
                        apply_progress(&mut live.record, &applied);
                    });
                    dirty = true;
                }
                Some(RunnerEvent::Exited(outcome)) => break outcome,
                None => break ExitOutcome::SpawnError {
                    reason: "job runner stopped without reporting an exit".into(),
                },
            },
            _ = ticker.tick(), if dirty => {
                persist_snapshot(&inner, &job).await;
                dirty = false;
            }
        }
    };

    conclude(&inner, &job, outcome, &announced).await;
    inner.active.write().remove(&job.id);
    debug!(job_id = %job.id, "job left the active set");
}

async fn persist_snapshot(inner: &RegistryInner, job: &ActiveJob) {
    let record = job.live().record;
    if let Err(err) = inner
        .config
        .store_retry
        .run("save snapshot", || inner.repo.save_snapshot(&record))
        .await
    {
        warn!(job_id = %job.id, error = %err, "failed to persist progress snapshot");
    }
}

/// Terminal status and message for a runner outcome.
fn terminal_state(
    current: JobStatus,
    outcome: ExitOutcome,
) -> (JobStatus, Option<String>) {
    let (status, message) = match outcome {
        ExitOutcome::Completed => (JobStatus::Completed, None),
        ExitOutcome::Failed { reason, .. } => (JobStatus::Failed, Some(reason)),
        ExitOutcome::Cancelled => (JobStatus::Cancelled, None),
        ExitOutcome::SpawnError { reason } => (JobStatus::Error, Some(reason)),
    };
    if current.can_transition_to(status) {
        (status, message)
    } else {
        (
            JobStatus::Error,
            Some(format!(
                "scan ended as {status} while job was {current}{}",
                message.map(|m| format!(": {m}")).unwrap_or_default()
            )),
        )
    }
}

/// Persist the terminal state, finalize artifacts, record their keys and
/// publish the final frame. Runs exactly once per job.
async fn conclude(
    inner: &RegistryInner,
    job: &ActiveJob,
    outcome: ExitOutcome,
    announced: &[String],
) {
    job.state.send_modify(|live| live.finalizing = true);

    let mut record = job.live().record;
    let (status, message) = terminal_state(record.status, outcome);
    record.status = status;
    if message.is_some() {
        record.error_message = message;
    } else if status == JobStatus::Completed {
        record.error_message = None;
    }
    record.current_unit = None;
    record.completed_at = Some(Utc::now());
    record.artifact_keys.clear();
    record.statistics = None;

    // (1) final counts and status.
    let written = inner
        .config
        .store_retry
        .run("write terminal", || inner.repo.write_terminal(&record))
        .await;
    match written {
        Ok(()) => {}
        Err(VigilError::Conflict(reason)) => {
            warn!(job_id = %job.id, reason = %reason, "row already holds another terminal status");
            abandon(inner, job, record, format!("terminal status conflict: {reason}")).await;
            return;
        }
        Err(err) => {
            error!(job_id = %job.id, error = %err, "failed to persist terminal status");
            let message = format!("failed to persist terminal status: {err}");
            abandon(inner, job, record, message).await;
            return;
        }
    }

    // (2) finalize, (3) record keys.
    match finalize(inner, &record, announced).await {
        Ok(Some((keys, statistics))) => {
            record.artifact_keys = keys;
            record.statistics = statistics;
        }
        Ok(None) => {}
        Err(err) if record.status == JobStatus::Completed => {
            let message = err.to_string();
            error!(job_id = %job.id, error = %message, "finalization failed; marking job as error");
            persist_error(inner, job.id, &message).await;
            record.status = JobStatus::Error;
            record.error_message = Some(message);
        }
        Err(err) => {
            warn!(job_id = %job.id, status = %record.status, error = %err, "artifacts of unsuccessful job not stored");
        }
    }

    info!(
        job_id = %job.id,
        status = %record.status,
        completed_units = record.completed_units,
        artifacts = record.artifact_keys.len(),
        "job finished"
    );
    // (4) publish; the caller removes the job from the active set.
    publish_final(job, record);
}

/// Settle a job whose terminal write did not go through as `error`, then
/// publish whatever the row ended up holding.
async fn abandon(
    inner: &RegistryInner,
    job: &ActiveJob,
    mut record: JobRecord,
    message: String,
) {
    match persist_error(inner, job.id, &message).await {
        Some(row) if row.is_terminal() => publish_final(job, row),
        _ => {
            record.status = JobStatus::Error;
            record.error_message = Some(message);
            publish_final(job, record);
        }
    }
}

/// Retry [`settle_as_error`] until the store accepts it. The job stays in
/// the active set meanwhile.
async fn persist_error(
    inner: &RegistryInner,
    id: JobId,
    message: &str,
) -> Option<JobRecord> {
    let mut round = 0u32;
    loop {
        let settled = inner
            .config
            .store_retry
            .run("mark job as error", || {
                settle_as_error(inner.repo.as_ref(), id, message)
            })
            .await;
        match settled {
            Ok(stored) => return stored,
            Err(VigilError::NotFound(_)) => return None,
            Err(err) => {
                let delay = inner.config.store_retry.delay_for(round);
                error!(
                    job_id = %id,
                    error = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "failed to mark job as error"
                );
                tokio::time::sleep(delay).await;
                round = round.saturating_add(1);
            }
        }
    }
}

/// Move the row to `error` whether it is still non-terminal or a lost
/// acknowledgement left it `completed` without artifacts.
async fn settle_as_error(
    repo: &dyn JobRepository,
    id: JobId,
    message: &str,
) -> Result<Option<JobRecord>, VigilError> {
    repo.mark_abandoned(id, message).await?;
    if let Some(row) = repo.get(id).await?
        && row.status == JobStatus::Completed
        && row.artifact_keys.is_empty()
    {
        repo.mark_finalization_failed(id, message).await?;
    }
    repo.get(id).await
}

/// Upload artifacts and record their keys. `Ok(None)` means nothing was
/// stored, which is only acceptable for unsuccessful jobs.
async fn finalize(
    inner: &RegistryInner,
    record: &JobRecord,
    announced: &[String],
) -> Result<Option<(Vec<String>, Option<JobStatistics>)>, VigilError> {
    let artifacts = inner.finalizer.finalize(record.id, announced).await?;
    if artifacts.is_empty() {
        return if record.status == JobStatus::Completed {
            Err(VigilError::StorageInconsistency(
                "scan completed without producing any artifact".into(),
            ))
        } else {
            Ok(None)
        };
    }

    let keys: Vec<String> = artifacts.iter().map(|a| a.key.clone()).collect();
    let statistics = match result_log_key(&keys)
        .and_then(|key| artifacts.iter().find(|a| a.key == key))
    {
        Some(FinalizedArtifact { key, bytes, .. }) => {
            let entry = inner.cache.seed(record.id, key, bytes).await;
            Some((*entry.statistics).clone())
        }
        None => None,
    };

    let recorded = inner
        .config
        .store_retry
        .run("record artifacts", || {
            inner
                .repo
                .record_artifacts(record.id, &keys, statistics.as_ref())
        })
        .await;
    if let Err(err) = recorded {
        for key in &keys {
            if let Err(del) = inner.storage.delete(key).await {
                warn!(key = %key, error = %del, "failed to remove unrecorded artifact");
            }
        }
        inner.cache.evict(record.id);
        return Err(VigilError::StorageInconsistency(format!(
            "failed to record artifact keys: {err}"
        )));
    }
    Ok(Some((keys, statistics)))
}

fn publish_final(job: &ActiveJob, record: JobRecord) {
    let payload = FramePayload::Status {
        status: record.status,
        error_message: record.error_message.clone(),
    };
    job.publish(payload, move |live| {
        live.record = record;
        live.finalizing = false;
    });
}
