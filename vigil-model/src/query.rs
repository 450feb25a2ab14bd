use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{error::ModelError, job::JobRecord, status::JobStatus};

pub const DEFAULT_PAGE_SIZE: u32 = 25;
pub const MAX_PAGE_SIZE: u32 = 200;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSort {
    #[default]
    StartedAt,
    PassRate,
}

impl FromStr for JobSort {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "started_at" => Ok(JobSort::StartedAt),
            "pass_rate" => Ok(JobSort::PassRate),
            other => Err(ModelError::UnknownSort(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortOrder::Asc => f.write_str("ASC"),
            SortOrder::Desc => f.write_str("DESC"),
        }
    }
}

/// Filter, sort and paging parameters for job listings.
///
/// `page` is 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobQuery {
    pub status: Option<JobStatus>,
    pub target_kind: Option<String>,
    pub target_name: Option<String>,
    pub sort: JobSort,
    pub order: SortOrder,
    pub page: u32,
    pub per_page: u32,
}

impl Default for JobQuery {
    fn default() -> Self {
        Self {
            status: None,
            target_kind: None,
            target_name: None,
            sort: JobSort::default(),
            order: SortOrder::default(),
            page: 1,
            per_page: DEFAULT_PAGE_SIZE,
        }
    }
}

impl JobQuery {
    /// Clamp paging into the supported range.
    pub fn normalized(mut self) -> Self {
        self.page = self.page.max(1);
        self.per_page = self.per_page.clamp(1, MAX_PAGE_SIZE);
        self
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.per_page)
    }

    pub fn matches(&self, record: &JobRecord) -> bool {
        self.status.is_none_or(|status| record.status == status)
            && self
                .target_kind
                .as_deref()
                .is_none_or(|kind| record.target.kind == kind)
            && self
                .target_name
                .as_deref()
                .is_none_or(|name| record.target.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPage {
    pub jobs: Vec<JobRecord>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}
