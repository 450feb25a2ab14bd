use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{ids::JobId, job::TargetDescriptor, status::JobStatus};

/// Passed/total attempt counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub passed: u64,
    pub total: u64,
}

impl Tally {
    pub fn record(&mut self, passed: u64, total: u64) {
        self.passed += passed.min(total);
        self.total += total;
    }

    pub fn merge(&mut self, other: &Tally) {
        self.passed += other.passed;
        self.total += other.total;
    }

    pub fn failed(&self) -> u64 {
        self.total - self.passed
    }

    pub fn pass_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.passed as f64 / self.total as f64
        }
    }
}

/// Materialized statistics for one job, derived from its result log.
///
/// Maps are ordered so that serializing the same statistics twice yields
/// identical bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobStatistics {
    pub totals: Tally,
    pub pass_rate: f64,
    pub units: BTreeMap<String, Tally>,
    pub categories: BTreeMap<String, Tally>,
    pub detectors: BTreeMap<String, Tally>,
    pub eval_entries: u64,
    pub other_entries: u64,
    pub skipped_lines: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatisticsSummary {
    pub job_id: JobId,
    pub target: TargetDescriptor,
    pub status: JobStatus,
    pub statistics: JobStatistics,
}

/// Cross-job rollup built only from materialized per-job statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateStatistics {
    pub job_count: u64,
    pub by_status: BTreeMap<String, u64>,
    pub totals: Tally,
    pub pass_rate: f64,
    pub categories: BTreeMap<String, Tally>,
    pub jobs: Vec<JobStatisticsSummary>,
}

impl AggregateStatistics {
    pub fn absorb(&mut self, summary: JobStatisticsSummary) {
        self.totals.merge(&summary.statistics.totals);
        for (category, tally) in &summary.statistics.categories {
            self.categories
                .entry(category.clone())
                .or_default()
                .merge(tally);
        }
        self.pass_rate = self.totals.pass_rate();
        self.jobs.push(summary);
    }

    pub fn count_status(&mut self, status: JobStatus) {
        self.job_count += 1;
        *self.by_status.entry(status.as_str().to_string()).or_default() += 1;
    }
}
