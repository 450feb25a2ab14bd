use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ids::JobId, job::JobRecord, status::JobStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitOutcome {
    Pass,
    Fail,
}

/// Pass/fail tally reported for one unit under one detector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitResult {
    pub unit: String,
    pub detector: String,
    pub passed: u32,
    pub total: u32,
    pub outcome: UnitOutcome,
}

/// Typed event recognised in scanner output.
///
/// Transient: these are folded into a [`JobRecord`] and fanned out to
/// subscribers but never persisted on their own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressEvent {
    ProgressUpdate {
        completed: Option<u32>,
        total: Option<u32>,
        current_unit: Option<String>,
    },
    UnitResult(UnitResult),
    ArtifactReady {
        location: String,
    },
    Completed,
    Failed {
        reason: String,
    },
}

impl ProgressEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ProgressEvent::ProgressUpdate { .. } => "progress_update",
            ProgressEvent::UnitResult(_) => "unit_result",
            ProgressEvent::ArtifactReady { .. } => "artifact_ready",
            ProgressEvent::Completed => "completed",
            ProgressEvent::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FramePayload {
    Progress(ProgressEvent),
    Status {
        status: JobStatus,
        error_message: Option<String>,
    },
}

/// Sequenced entry on a job's event channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub sequence: u64,
    pub job_id: JobId,
    pub at: DateTime<Utc>,
    pub payload: FramePayload,
}

/// Point-in-time view of a job as delivered on the live stream.
///
/// `error_message` is serialized on every snapshot, including as `null`,
/// so a reconnecting subscriber always sees the current failure reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub sequence: u64,
    pub job_id: JobId,
    pub status: JobStatus,
    pub current_unit: Option<String>,
    pub total_units: u32,
    pub completed_units: u32,
    pub pass_count: u32,
    pub fail_count: u32,
    pub error_message: Option<String>,
    pub artifact_keys: Vec<String>,
    pub at: DateTime<Utc>,
}

impl JobSnapshot {
    pub fn from_record(record: &JobRecord, sequence: u64) -> Self {
        Self {
            sequence,
            job_id: record.id,
            status: record.status,
            current_unit: record.current_unit.clone(),
            total_units: record.total_units,
            completed_units: record.completed_units,
            pass_count: record.pass_count,
            fail_count: record.fail_count,
            error_message: record.error_message.clone(),
            artifact_keys: record.artifact_keys.clone(),
            at: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
