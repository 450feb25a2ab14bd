use std::{cmp::Ordering, collections::HashMap, collections::HashSet, fmt};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use vigil_model::{
    JobId, JobPage, JobQuery, JobRecord, JobSort, JobStatistics, JobStatus,
    SortOrder,
};

use super::JobRepository;
use crate::error::{Result, VigilError};

/// Process-local repository used when no database is configured and in
/// tests. Same semantics as the Postgres implementation.
#[derive(Default)]
pub struct InMemoryJobRepository {
    rows: RwLock<HashMap<JobId, JobRecord>>,
}

impl fmt::Debug for InMemoryJobRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryJobRepository")
            .field("rows", &self.rows.read().len())
            .finish()
    }
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn missing(id: JobId) -> VigilError {
        VigilError::not_found(format!("job {id}"))
    }
}

/// `None` sorts last in both directions.
fn compare_optional<T: PartialOrd>(
    a: Option<T>,
    b: Option<T>,
    order: SortOrder,
) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => {
            let ord = a.partial_cmp(&b).unwrap_or(Ordering::Equal);
            match order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            }
        }
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn insert(&self, record: &JobRecord) -> Result<()> {
        let mut rows = self.rows.write();
        if rows.contains_key(&record.id) {
            return Err(VigilError::conflict(format!(
                "job {} already exists",
                record.id
            )));
        }
        rows.insert(record.id, record.clone());
        Ok(())
    }

    async fn save_snapshot(&self, record: &JobRecord) -> Result<()> {
        let mut rows = self.rows.write();
        let row = rows.get_mut(&record.id).ok_or_else(|| Self::missing(record.id))?;
        if row.status.is_terminal() || record.status.is_terminal() {
            return Ok(());
        }
        row.status = record.status;
        row.current_unit = record.current_unit.clone();
        row.total_units = record.total_units;
        row.completed_units = record.completed_units;
        row.pass_count = record.pass_count;
        row.fail_count = record.fail_count;
        row.error_message = record.error_message.clone();
        row.results = record.results.clone();
        row.started_at = record.started_at;
        Ok(())
    }

    async fn write_terminal(&self, record: &JobRecord) -> Result<()> {
        if !record.status.is_terminal() {
            return Err(VigilError::internal(format!(
                "write_terminal called with non-terminal status {}",
                record.status
            )));
        }
        let mut rows = self.rows.write();
        let row = rows.get_mut(&record.id).ok_or_else(|| Self::missing(record.id))?;
        if row.status == record.status {
            return Ok(());
        }
        if row.status.is_terminal() {
            return Err(VigilError::conflict(format!(
                "job {} is already {}",
                record.id, row.status
            )));
        }
        let created_at = row.created_at;
        *row = record.clone();
        row.created_at = created_at;
        row.artifact_keys.clear();
        row.statistics = None;
        Ok(())
    }

    async fn record_artifacts(
        &self,
        id: JobId,
        keys: &[String],
        statistics: Option<&JobStatistics>,
    ) -> Result<()> {
        let mut rows = self.rows.write();
        let row = rows.get_mut(&id).ok_or_else(|| Self::missing(id))?;
        if !row.status.is_terminal() {
            return Err(VigilError::conflict(format!(
                "job {id} is not terminal"
            )));
        }
        if row.artifact_keys.as_slice() == keys {
            return Ok(());
        }
        if !row.artifact_keys.is_empty() {
            return Err(VigilError::conflict(format!(
                "job {id} already has artifacts recorded"
            )));
        }
        row.artifact_keys = keys.to_vec();
        if row.statistics.is_none() {
            row.statistics = statistics.cloned();
        }
        Ok(())
    }

    async fn mark_finalization_failed(
        &self,
        id: JobId,
        message: &str,
    ) -> Result<()> {
        let mut rows = self.rows.write();
        let row = rows.get_mut(&id).ok_or_else(|| Self::missing(id))?;
        if row.status == JobStatus::Error && row.artifact_keys.is_empty() {
            return Ok(());
        }
        if row.status != JobStatus::Completed || !row.artifact_keys.is_empty() {
            return Err(VigilError::conflict(format!(
                "job {id} is {} and cannot be marked as a finalization failure",
                row.status
            )));
        }
        row.status = JobStatus::Error;
        row.error_message = Some(message.to_string());
        Ok(())
    }

    async fn store_statistics(
        &self,
        id: JobId,
        statistics: &JobStatistics,
    ) -> Result<bool> {
        let mut rows = self.rows.write();
        let row = rows.get_mut(&id).ok_or_else(|| Self::missing(id))?;
        if row.statistics.is_some() || !row.status.is_terminal() {
            return Ok(false);
        }
        row.statistics = Some(statistics.clone());
        Ok(true)
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>> {
        Ok(self.rows.read().get(&id).cloned())
    }

    async fn list(&self, query: &JobQuery) -> Result<JobPage> {
        let query = query.clone().normalized();
        let mut matching: Vec<JobRecord> = self
            .rows
            .read()
            .values()
            .filter(|record| query.matches(record))
            .cloned()
            .collect();

        matching.sort_by(|a, b| {
            let primary = match query.sort {
                JobSort::StartedAt => {
                    compare_optional(a.started_at, b.started_at, query.order)
                }
                JobSort::PassRate => {
                    compare_optional(a.pass_rate(), b.pass_rate(), query.order)
                }
            };
            primary
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });

        let total = matching.len() as u64;
        let jobs = matching
            .into_iter()
            .skip(usize::try_from(query.offset()).unwrap_or(usize::MAX))
            .take(query.per_page as usize)
            .collect();

        Ok(JobPage {
            jobs,
            total,
            page: query.page,
            per_page: query.per_page,
        })
    }

    async fn list_terminal(&self) -> Result<Vec<JobRecord>> {
        let mut terminal: Vec<JobRecord> = self
            .rows
            .read()
            .values()
            .filter(|record| record.status.is_terminal())
            .cloned()
            .collect();
        terminal.sort_by(|a, b| {
            a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id))
        });
        Ok(terminal)
    }

    async fn delete(&self, id: JobId) -> Result<bool> {
        Ok(self.rows.write().remove(&id).is_some())
    }

    async fn existing_ids(&self, ids: &[JobId]) -> Result<HashSet<JobId>> {
        let rows = self.rows.read();
        Ok(ids.iter().copied().filter(|id| rows.contains_key(id)).collect())
    }

    async fn list_unfinished(&self) -> Result<Vec<JobRecord>> {
        Ok(self
            .rows
            .read()
            .values()
            .filter(|record| !record.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn list_unfinalized(&self) -> Result<Vec<JobRecord>> {
        let mut rows: Vec<JobRecord> = self
            .rows
            .read()
            .values()
            .filter(|record| {
                record.status == JobStatus::Completed
                    && record.artifact_keys.is_empty()
            })
            .cloned()
            .collect();
        rows.sort_by_key(|record| record.created_at);
        Ok(rows)
    }

    async fn mark_abandoned(&self, id: JobId, message: &str) -> Result<()> {
        let mut rows = self.rows.write();
        let row = rows.get_mut(&id).ok_or_else(|| Self::missing(id))?;
        if row.status.is_terminal() {
            return Ok(());
        }
        row.status = JobStatus::Error;
        row.error_message = Some(message.to_string());
        row.current_unit = None;
        row.completed_at = Some(Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use vigil_model::{JobSpec, TargetDescriptor};

    use super::*;

    fn record(kind: &str, pass: u32, fail: u32, minutes_ago: i64) -> JobRecord {
        let spec = JobSpec::new(
            TargetDescriptor::new(kind, "model"),
            vec!["dan.Dan_11_0".into()],
        );
        let now = Utc::now();
        let mut record = JobRecord::pending(JobId::generate(), &spec, now);
        record.status = JobStatus::Completed;
        record.pass_count = pass;
        record.fail_count = fail;
        record.started_at = Some(now - Duration::minutes(minutes_ago));
        record
    }

    #[tokio::test]
    async fn insert_rejects_duplicates() {
        let repo = InMemoryJobRepository::new();
        let row = record("openai", 1, 0, 1);
        repo.insert(&row).await.unwrap();
        assert!(matches!(
            repo.insert(&row).await,
            Err(VigilError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn list_filters_sorts_and_pages() {
        let repo = InMemoryJobRepository::new();
        let best = record("openai", 9, 1, 30);
        let worst = record("openai", 1, 9, 20);
        let middle = record("openai", 5, 5, 10);
        let other = record("huggingface", 10, 0, 5);
        for row in [&best, &worst, &middle, &other] {
            repo.insert(row).await.unwrap();
        }

        let page = repo
            .list(&JobQuery {
                target_kind: Some("openai".into()),
                sort: JobSort::PassRate,
                order: SortOrder::Desc,
                per_page: 2,
                ..JobQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 3);
        let ids: Vec<JobId> = page.jobs.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![best.id, middle.id]);

        let recent = repo
            .list(&JobQuery {
                per_page: 1,
                ..JobQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(recent.total, 4);
        assert_eq!(recent.jobs[0].id, other.id);
    }

    #[tokio::test]
    async fn terminal_rows_are_immutable() {
        let repo = InMemoryJobRepository::new();
        let spec = JobSpec::new(TargetDescriptor::new("k", "n"), vec!["u".into()]);
        let mut row = JobRecord::pending(JobId::generate(), &spec, Utc::now());
        repo.insert(&row).await.unwrap();

        row.status = JobStatus::Cancelled;
        row.completed_units = 1;
        repo.write_terminal(&row).await.unwrap();

        let mut late = row.clone();
        late.status = JobStatus::Running;
        late.completed_units = 3;
        repo.save_snapshot(&late).await.unwrap();
        let mut other = row.clone();
        other.status = JobStatus::Completed;
        assert!(matches!(
            repo.write_terminal(&other).await,
            Err(VigilError::Conflict(_))
        ));
        assert!(matches!(
            repo.mark_finalization_failed(row.id, "nope").await,
            Err(VigilError::Conflict(_))
        ));

        let stored = repo.get(row.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert_eq!(stored.completed_units, 1);
    }

    #[tokio::test]
    async fn statistics_are_stored_once() {
        let repo = InMemoryJobRepository::new();
        let row = record("k", 1, 1, 1);
        repo.insert(&row).await.unwrap();
        let first = JobStatistics {
            eval_entries: 1,
            ..JobStatistics::default()
        };
        let second = JobStatistics {
            eval_entries: 2,
            ..JobStatistics::default()
        };
        assert!(repo.store_statistics(row.id, &first).await.unwrap());
        assert!(!repo.store_statistics(row.id, &second).await.unwrap());
        let stored = repo.get(row.id).await.unwrap().unwrap();
        assert_eq!(stored.statistics, Some(first));
    }

    #[tokio::test]
    async fn repeated_terminal_writes_are_accepted() {
        let repo = InMemoryJobRepository::new();
        let spec = JobSpec::new(TargetDescriptor::new("k", "n"), vec!["u".into()]);
        let mut row = JobRecord::pending(JobId::generate(), &spec, Utc::now());
        repo.insert(&row).await.unwrap();

        row.status = JobStatus::Completed;
        repo.write_terminal(&row).await.unwrap();
        repo.write_terminal(&row).await.unwrap();
        assert_eq!(repo.list_unfinalized().await.unwrap().len(), 1);

        let keys = vec![format!("jobs/{}/report.jsonl", row.id)];
        repo.record_artifacts(row.id, &keys, None).await.unwrap();
        repo.record_artifacts(row.id, &keys, None).await.unwrap();
        assert!(matches!(
            repo.record_artifacts(row.id, &["jobs/x/other".to_string()], None).await,
            Err(VigilError::Conflict(_))
        ));
        assert!(repo.list_unfinalized().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn finalization_failure_can_be_repeated() {
        let repo = InMemoryJobRepository::new();
        let spec = JobSpec::new(TargetDescriptor::new("k", "n"), vec!["u".into()]);
        let mut row = JobRecord::pending(JobId::generate(), &spec, Utc::now());
        repo.insert(&row).await.unwrap();
        row.status = JobStatus::Completed;
        repo.write_terminal(&row).await.unwrap();

        repo.mark_finalization_failed(row.id, "upload failed").await.unwrap();
        repo.mark_finalization_failed(row.id, "upload failed").await.unwrap();
        let stored = repo.get(row.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Error);
        assert!(repo.list_unfinalized().await.unwrap().is_empty());
    }
}
