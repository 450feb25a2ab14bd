//! Relational job metadata.
//!
//! Rows are written from the orchestrator's in-memory state while a job is
//! active. Once a row turns terminal it is immutable, except for the
//! one-time fill of artifact keys and materialized statistics and the
//! single `completed -> error` downgrade when finalization fails.

mod memory;
mod postgres;

use std::{collections::HashSet, fmt};

use async_trait::async_trait;
use vigil_model::{JobId, JobPage, JobQuery, JobRecord, JobStatistics};

pub use memory::InMemoryJobRepository;
pub use postgres::PostgresJobRepository;

use crate::error::Result;

#[async_trait]
pub trait JobRepository: Send + Sync + fmt::Debug {
    /// Insert a new row. Fails with `Conflict` if the id exists.
    async fn insert(&self, record: &JobRecord) -> Result<()>;

    /// Overwrite progress fields of a non-terminal row. Writes against a
    /// terminal row are ignored.
    async fn save_snapshot(&self, record: &JobRecord) -> Result<()>;

    /// Persist the terminal status and final counts. Succeeds without
    /// writing if the row already has this terminal status; fails with
    /// `Conflict` if it has another.
    async fn write_terminal(&self, record: &JobRecord) -> Result<()>;

    /// One-time fill of artifact keys (and statistics when known).
    /// Repeating the fill with the same keys succeeds.
    async fn record_artifacts(
        &self,
        id: JobId,
        keys: &[String],
        statistics: Option<&JobStatistics>,
    ) -> Result<()>;

    /// Downgrade a `completed` row without artifacts to `error`. Succeeds
    /// if the row is already an `error` without artifacts.
    async fn mark_finalization_failed(
        &self,
        id: JobId,
        message: &str,
    ) -> Result<()>;

    /// Store statistics if none are stored yet. Returns whether it wrote.
    async fn store_statistics(
        &self,
        id: JobId,
        statistics: &JobStatistics,
    ) -> Result<bool>;

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>>;

    async fn list(&self, query: &JobQuery) -> Result<JobPage>;

    /// Every terminal row, oldest first.
    async fn list_terminal(&self) -> Result<Vec<JobRecord>>;

    /// Delete a row. Returns whether one existed.
    async fn delete(&self, id: JobId) -> Result<bool>;

    /// Subset of `ids` that have rows.
    async fn existing_ids(&self, ids: &[JobId]) -> Result<HashSet<JobId>>;

    /// Rows left non-terminal, e.g. by a crashed orchestrator.
    async fn list_unfinished(&self) -> Result<Vec<JobRecord>>;

    /// `completed` rows whose artifact keys were never recorded.
    async fn list_unfinalized(&self) -> Result<Vec<JobRecord>>;

    /// Move a non-terminal row to `error`. Terminal rows are left alone.
    async fn mark_abandoned(&self, id: JobId, message: &str) -> Result<()>;
}
