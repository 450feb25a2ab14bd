use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    events::UnitResult, ids::JobId, stats::JobStatistics, status::JobStatus,
};

/// What a job scans, e.g. `{ kind: "openai", name: "gpt-4o-mini" }`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetDescriptor {
    pub kind: String,
    pub name: String,
}

impl TargetDescriptor {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

/// Start request payload. Frozen into the job record on acceptance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub target: TargetDescriptor,
    pub units: Vec<String>,
    #[serde(default)]
    pub config: serde_json::Value,
    /// Extra environment for the scanner process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl JobSpec {
    pub fn new(target: TargetDescriptor, units: Vec<String>) -> Self {
        Self {
            target,
            units,
            config: serde_json::Value::Null,
            env: BTreeMap::new(),
        }
    }
}

/// Full state of a scan job.
///
/// While `status` is non-terminal the orchestrator's in-memory copy is
/// authoritative; afterwards the persisted row is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub target: TargetDescriptor,
    pub units: Vec<String>,
    pub config: serde_json::Value,
    pub status: JobStatus,
    pub current_unit: Option<String>,
    pub total_units: u32,
    pub completed_units: u32,
    pub pass_count: u32,
    pub fail_count: u32,
    pub error_message: Option<String>,
    pub artifact_keys: Vec<String>,
    #[serde(default)]
    pub results: Vec<UnitResult>,
    pub statistics: Option<JobStatistics>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn pending(id: JobId, spec: &JobSpec, now: DateTime<Utc>) -> Self {
        Self {
            id,
            target: spec.target.clone(),
            units: spec.units.clone(),
            config: spec.config.clone(),
            status: JobStatus::Pending,
            current_unit: None,
            total_units: u32::try_from(spec.units.len()).unwrap_or(u32::MAX),
            completed_units: 0,
            pass_count: 0,
            fail_count: 0,
            error_message: None,
            artifact_keys: Vec::new(),
            results: Vec::new(),
            statistics: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Share of passing unit results, `None` before any result arrived.
    pub fn pass_rate(&self) -> Option<f64> {
        let decided = self.pass_count + self.fail_count;
        (decided > 0).then(|| f64::from(self.pass_count) / f64::from(decided))
    }
}
