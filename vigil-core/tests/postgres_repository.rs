#![cfg(feature = "pg-tests")]

use chrono::{Duration, Utc};
use sqlx::PgPool;
use vigil_core::{
    JobRepository, PostgresJobRepository, Result, VigilError,
    model::{
        JobId, JobQuery, JobRecord, JobSort, JobSpec, JobStatistics, JobStatus,
        SortOrder, Tally, TargetDescriptor,
    },
};

fn record(kind: &str, pass: u32, fail: u32, minutes_ago: i64) -> JobRecord {
    let spec = JobSpec::new(
        TargetDescriptor::new(kind, "model"),
        vec!["dan.Dan_11_0".into(), "encoding.InjectHex".into()],
    );
    let now = Utc::now() - Duration::minutes(minutes_ago);
    let mut record = JobRecord::pending(JobId::generate(), &spec, now);
    record.status = JobStatus::Running;
    record.started_at = Some(now);
    record.pass_count = pass;
    record.fail_count = fail;
    record
}

fn finished(mut record: JobRecord, status: JobStatus) -> JobRecord {
    record.status = status;
    record.completed_at = Some(Utc::now());
    record.completed_units = record.total_units;
    record
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
async fn insert_and_read_back(pool: PgPool) -> Result<()> {
    let repo = PostgresJobRepository::new(pool);
    let job = record("openai", 0, 0, 0);
    repo.insert(&job).await?;

    let stored = repo.get(job.id).await?.expect("row inserted");
    assert_eq!(stored.id, job.id);
    assert_eq!(stored.target, job.target);
    assert_eq!(stored.units, job.units);
    assert_eq!(stored.status, JobStatus::Running);

    assert!(matches!(repo.insert(&job).await, Err(VigilError::Conflict(_))));
    assert!(repo.get(JobId::generate()).await?.is_none());
    Ok(())
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
async fn terminal_rows_ignore_snapshots(pool: PgPool) -> Result<()> {
    let repo = PostgresJobRepository::new(pool);
    let mut job = record("openai", 1, 0, 0);
    repo.insert(&job).await?;

    job.completed_units = 1;
    job.current_unit = Some("dan.Dan_11_0".into());
    repo.save_snapshot(&job).await?;
    assert_eq!(repo.get(job.id).await?.unwrap().completed_units, 1);

    let done = finished(job.clone(), JobStatus::Completed);
    repo.write_terminal(&done).await?;
    // Same status again is a no-op; a different one conflicts.
    repo.write_terminal(&done).await?;
    assert!(matches!(
        repo.write_terminal(&finished(job.clone(), JobStatus::Failed)).await,
        Err(VigilError::Conflict(_))
    ));

    // A late snapshot must not resurrect the row.
    repo.save_snapshot(&job).await?;
    let stored = repo.get(job.id).await?.unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(stored.completed_units, 2);
    Ok(())
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
async fn artifacts_and_statistics_fill_once(pool: PgPool) -> Result<()> {
    let repo = PostgresJobRepository::new(pool);
    let job = record("openai", 2, 1, 0);
    repo.insert(&job).await?;
    repo.write_terminal(&finished(job.clone(), JobStatus::Completed))
        .await?;

    let keys = vec![format!("jobs/{}/report.jsonl", job.id)];
    let mut stats = JobStatistics::default();
    stats.totals = Tally {
        passed: 2,
        total: 3,
    };
    repo.record_artifacts(job.id, &keys, Some(&stats)).await?;
    repo.record_artifacts(job.id, &keys, None).await?;
    assert!(matches!(
        repo.record_artifacts(job.id, &[format!("jobs/{}/other", job.id)], None)
            .await,
        Err(VigilError::Conflict(_))
    ));

    let stored = repo.get(job.id).await?.unwrap();
    assert_eq!(stored.artifact_keys, keys);
    assert_eq!(stored.statistics, Some(stats.clone()));
    assert!(!repo.store_statistics(job.id, &JobStatistics::default()).await?);

    // Artifacts are recorded, so there is nothing to downgrade.
    assert!(matches!(
        repo.mark_finalization_failed(job.id, "late").await,
        Err(VigilError::Conflict(_))
    ));
    Ok(())
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
async fn completed_without_artifacts_downgrades_to_error(pool: PgPool) -> Result<()> {
    let repo = PostgresJobRepository::new(pool);
    let job = record("openai", 1, 0, 0);
    repo.insert(&job).await?;
    repo.write_terminal(&finished(job.clone(), JobStatus::Completed))
        .await?;
    let pending: Vec<JobId> =
        repo.list_unfinalized().await?.iter().map(|r| r.id).collect();
    assert_eq!(pending, vec![job.id]);

    repo.mark_finalization_failed(job.id, "upload failed").await?;
    let stored = repo.get(job.id).await?.unwrap();
    assert_eq!(stored.status, JobStatus::Error);
    assert_eq!(stored.error_message.as_deref(), Some("upload failed"));
    assert!(repo.list_unfinalized().await?.is_empty());

    // A retried downgrade finds the work done.
    repo.mark_finalization_failed(job.id, "upload failed").await?;
    Ok(())
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
async fn list_filters_sorts_and_pages(pool: PgPool) -> Result<()> {
    let repo = PostgresJobRepository::new(pool);
    let high = record("openai", 9, 1, 30);
    let low = record("openai", 1, 9, 20);
    let undecided = record("openai", 0, 0, 10);
    let other = record("huggingface", 5, 5, 5);
    for job in [&high, &low, &undecided, &other] {
        repo.insert(job).await?;
    }

    let by_rate = repo
        .list(&JobQuery {
            target_kind: Some("openai".into()),
            sort: JobSort::PassRate,
            order: SortOrder::Desc,
            ..JobQuery::default()
        })
        .await?;
    assert_eq!(by_rate.total, 3);
    let ids: Vec<JobId> = by_rate.jobs.iter().map(|j| j.id).collect();
    // Jobs without results sort last in either direction.
    assert_eq!(ids, vec![high.id, low.id, undecided.id]);

    let newest_first = repo
        .list(&JobQuery {
            per_page: 2,
            page: 1,
            ..JobQuery::default()
        })
        .await?;
    assert_eq!(newest_first.total, 4);
    let ids: Vec<JobId> = newest_first.jobs.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![other.id, undecided.id]);

    let second_page = repo
        .list(&JobQuery {
            per_page: 2,
            page: 2,
            ..JobQuery::default()
        })
        .await?;
    let ids: Vec<JobId> = second_page.jobs.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![low.id, high.id]);
    Ok(())
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
async fn unfinished_rows_can_be_abandoned(pool: PgPool) -> Result<()> {
    let repo = PostgresJobRepository::new(pool);
    let running = record("openai", 0, 0, 0);
    let done = record("openai", 0, 0, 0);
    repo.insert(&running).await?;
    repo.insert(&done).await?;
    repo.write_terminal(&finished(done.clone(), JobStatus::Cancelled))
        .await?;

    let unfinished = repo.list_unfinished().await?;
    assert_eq!(unfinished.len(), 1);
    assert_eq!(unfinished[0].id, running.id);

    repo.mark_abandoned(running.id, "orchestrator restarted").await?;
    assert!(repo.list_unfinished().await?.is_empty());
    assert_eq!(repo.list_terminal().await?.len(), 2);

    let known = repo
        .existing_ids(&[running.id, JobId::generate()])
        .await?;
    assert_eq!(known.len(), 1);
    assert!(known.contains(&running.id));

    assert!(repo.delete(running.id).await?);
    assert!(!repo.delete(running.id).await?);
    Ok(())
}
