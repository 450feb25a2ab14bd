use std::{collections::HashSet, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    PgPool, Postgres, QueryBuilder, postgres::PgPoolOptions, types::Json,
};
use tracing::warn;
use uuid::Uuid;
use vigil_model::{
    JobId, JobPage, JobQuery, JobRecord, JobSort, JobStatistics, JobStatus,
    TargetDescriptor, UnitResult,
};

use super::JobRepository;
use crate::error::{Result, VigilError};

const JOB_COLUMNS: &str = r#"
    id, target_kind, target_name, units, config, status, current_unit,
    total_units, completed_units, pass_count, fail_count, error_message,
    artifact_keys, results, statistics, created_at, started_at, completed_at
"#;

const NON_TERMINAL: &str = "status IN ('pending', 'running')";

const PASS_RATE_EXPR: &str =
    "(pass_count::float8 / NULLIF(pass_count + fail_count, 0))";

#[derive(Clone, Debug)]
pub struct PostgresJobRepository {
    pool: PgPool,
}

impl PostgresJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool against `url`.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending migrations.
    pub async fn initialize_schema(&self) -> Result<()> {
        crate::MIGRATOR.run(&self.pool).await.map_err(|e| {
            VigilError::Database(format!("Migration failed: {e}"))
        })
    }

    /// Resolve a guarded update that touched no row. A row that already
    /// holds the intended state counts as success, so a retry after a lost
    /// acknowledgement is harmless.
    async fn explain_noop<F>(
        &self,
        id: JobId,
        already_applied: F,
        conflict: String,
    ) -> Result<()>
    where
        F: FnOnce(&JobRecord) -> bool,
    {
        match self.get(id).await? {
            Some(row) if already_applied(&row) => Ok(()),
            Some(_) => Err(VigilError::Conflict(conflict)),
            None => Err(VigilError::not_found(format!("job {id}"))),
        }
    }
}

fn to_db_count(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn from_db_count(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    target_kind: String,
    target_name: String,
    units: Json<Vec<String>>,
    config: Json<serde_json::Value>,
    status: String,
    current_unit: Option<String>,
    total_units: i32,
    completed_units: i32,
    pass_count: i32,
    fail_count: i32,
    error_message: Option<String>,
    artifact_keys: Vec<String>,
    results: Json<Vec<UnitResult>>,
    statistics: Option<Json<JobStatistics>>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = VigilError;

    fn try_from(row: JobRow) -> Result<Self> {
        let status: JobStatus = row.status.parse().map_err(|err| {
            VigilError::internal(format!("job {}: {err}", row.id))
        })?;
        Ok(JobRecord {
            id: JobId(row.id),
            target: TargetDescriptor::new(row.target_kind, row.target_name),
            units: row.units.0,
            config: row.config.0,
            status,
            current_unit: row.current_unit,
            total_units: from_db_count(row.total_units),
            completed_units: from_db_count(row.completed_units),
            pass_count: from_db_count(row.pass_count),
            fail_count: from_db_count(row.fail_count),
            error_message: row.error_message,
            artifact_keys: row.artifact_keys,
            results: row.results.0,
            statistics: row.statistics.map(|stats| stats.0),
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

fn rows_to_records(rows: Vec<JobRow>) -> Result<Vec<JobRecord>> {
    rows.into_iter().map(JobRecord::try_from).collect()
}

fn push_filters(builder: &mut QueryBuilder<'_, Postgres>, query: &JobQuery) {
    builder.push(" WHERE 1=1");
    if let Some(status) = query.status {
        builder.push(" AND status = ");
        builder.push_bind(status.as_str());
    }
    if let Some(kind) = &query.target_kind {
        builder.push(" AND target_kind = ");
        builder.push_bind(kind.clone());
    }
    if let Some(name) = &query.target_name {
        builder.push(" AND target_name = ");
        builder.push_bind(name.clone());
    }
}

#[async_trait]
impl JobRepository for PostgresJobRepository {
    async fn insert(&self, record: &JobRecord) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO scan_jobs (
                id, target_kind, target_name, units, config, status,
                total_units, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(record.id.to_uuid())
        .bind(&record.target.kind)
        .bind(&record.target.name)
        .bind(Json(&record.units))
        .bind(Json(&record.config))
        .bind(record.status.as_str())
        .bind(to_db_count(record.total_units))
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(VigilError::conflict(format!(
                "job {} already exists",
                record.id
            )));
        }
        Ok(())
    }

    async fn save_snapshot(&self, record: &JobRecord) -> Result<()> {
        if record.status.is_terminal() {
            return Ok(());
        }
        let sql = format!(
            r#"
            UPDATE scan_jobs SET
                status = $2,
                current_unit = $3,
                total_units = $4,
                completed_units = $5,
                pass_count = $6,
                fail_count = $7,
                error_message = $8,
                results = $9,
                started_at = $10,
                updated_at = NOW()
            WHERE id = $1 AND {NON_TERMINAL}
            "#
        );
        let result = sqlx::query(&sql)
            .bind(record.id.to_uuid())
            .bind(record.status.as_str())
            .bind(record.current_unit.as_deref())
            .bind(to_db_count(record.total_units))
            .bind(to_db_count(record.completed_units))
            .bind(to_db_count(record.pass_count))
            .bind(to_db_count(record.fail_count))
            .bind(record.error_message.as_deref())
            .bind(Json(&record.results))
            .bind(record.started_at)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            warn!(job_id = %record.id, "snapshot ignored: row missing or terminal");
        }
        Ok(())
    }

    async fn write_terminal(&self, record: &JobRecord) -> Result<()> {
        if !record.status.is_terminal() {
            return Err(VigilError::internal(format!(
                "write_terminal called with non-terminal status {}",
                record.status
            )));
        }
        let sql = format!(
            r#"
            UPDATE scan_jobs SET
                status = $2,
                current_unit = $3,
                total_units = $4,
                completed_units = $5,
                pass_count = $6,
                fail_count = $7,
                error_message = $8,
                results = $9,
                started_at = $10,
                completed_at = $11,
                updated_at = NOW()
            WHERE id = $1 AND {NON_TERMINAL}
            "#
        );
        let result = sqlx::query(&sql)
            .bind(record.id.to_uuid())
            .bind(record.status.as_str())
            .bind(record.current_unit.as_deref())
            .bind(to_db_count(record.total_units))
            .bind(to_db_count(record.completed_units))
            .bind(to_db_count(record.pass_count))
            .bind(to_db_count(record.fail_count))
            .bind(record.error_message.as_deref())
            .bind(Json(&record.results))
            .bind(record.started_at)
            .bind(record.completed_at)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return self
                .explain_noop(
                    record.id,
                    |row| row.status == record.status,
                    format!("job {} is already terminal", record.id),
                )
                .await;
        }
        Ok(())
    }

    async fn record_artifacts(
        &self,
        id: JobId,
        keys: &[String],
        statistics: Option<&JobStatistics>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE scan_jobs SET
                artifact_keys = $2,
                statistics = COALESCE(statistics, $3),
                updated_at = NOW()
            WHERE id = $1
              AND status IN ('completed', 'failed', 'cancelled', 'error')
              AND cardinality(artifact_keys) = 0
            "#,
        )
        .bind(id.to_uuid())
        .bind(keys)
        .bind(statistics.map(Json))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return self
                .explain_noop(
                    id,
                    |row| row.artifact_keys.as_slice() == keys,
                    format!("job {id} is not terminal or already has artifacts"),
                )
                .await;
        }
        Ok(())
    }

    async fn mark_finalization_failed(
        &self,
        id: JobId,
        message: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE scan_jobs SET
                status = 'error',
                error_message = $2,
                updated_at = NOW()
            WHERE id = $1
              AND status = 'completed'
              AND cardinality(artifact_keys) = 0
            "#,
        )
        .bind(id.to_uuid())
        .bind(message)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return self
                .explain_noop(
                    id,
                    |row| {
                        row.status == JobStatus::Error
                            && row.artifact_keys.is_empty()
                    },
                    format!(
                        "job {id} cannot be marked as a finalization failure"
                    ),
                )
                .await;
        }
        Ok(())
    }

    async fn store_statistics(
        &self,
        id: JobId,
        statistics: &JobStatistics,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scan_jobs SET statistics = $2, updated_at = NOW()
            WHERE id = $1
              AND statistics IS NULL
              AND status IN ('completed', 'failed', 'cancelled', 'error')
            "#,
        )
        .bind(id.to_uuid())
        .bind(Json(statistics))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM scan_jobs WHERE id = $1");
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id.to_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.map(JobRecord::try_from).transpose()
    }

    async fn list(&self, query: &JobQuery) -> Result<JobPage> {
        let query = query.clone().normalized();

        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM scan_jobs");
        push_filters(&mut count, &query);
        let total = count.build_query_scalar::<i64>().fetch_one(&self.pool).await?;

        let mut builder =
            QueryBuilder::<Postgres>::new(format!("SELECT {JOB_COLUMNS} FROM scan_jobs"));
        push_filters(&mut builder, &query);
        let sort_expr = match query.sort {
            JobSort::StartedAt => "started_at",
            JobSort::PassRate => PASS_RATE_EXPR,
        };
        builder.push(format!(
            " ORDER BY {sort_expr} {} NULLS LAST, created_at DESC, id ASC",
            query.order
        ));
        builder.push(" LIMIT ");
        builder.push_bind(i64::from(query.per_page));
        builder.push(" OFFSET ");
        builder.push_bind(i64::try_from(query.offset()).unwrap_or(i64::MAX));

        let rows = builder
            .build_query_as::<JobRow>()
            .fetch_all(&self.pool)
            .await?;

        Ok(JobPage {
            jobs: rows_to_records(rows)?,
            total: u64::try_from(total).unwrap_or(0),
            page: query.page,
            per_page: query.per_page,
        })
    }

    async fn list_terminal(&self) -> Result<Vec<JobRecord>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM scan_jobs WHERE NOT ({NON_TERMINAL}) \
             ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        rows_to_records(rows)
    }

    async fn delete(&self, id: JobId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM scan_jobs WHERE id = $1")
            .bind(id.to_uuid())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn existing_ids(&self, ids: &[JobId]) -> Result<HashSet<JobId>> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let uuids: Vec<Uuid> = ids.iter().map(JobId::to_uuid).collect();
        let found: Vec<Uuid> =
            sqlx::query_scalar("SELECT id FROM scan_jobs WHERE id = ANY($1)")
                .bind(&uuids)
                .fetch_all(&self.pool)
                .await?;
        Ok(found.into_iter().map(JobId).collect())
    }

    async fn list_unfinished(&self) -> Result<Vec<JobRecord>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM scan_jobs WHERE {NON_TERMINAL} \
             ORDER BY created_at ASC"
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        rows_to_records(rows)
    }

    async fn list_unfinalized(&self) -> Result<Vec<JobRecord>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM scan_jobs \
             WHERE status = 'completed' AND cardinality(artifact_keys) = 0 \
             ORDER BY created_at ASC"
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        rows_to_records(rows)
    }

    async fn mark_abandoned(&self, id: JobId, message: &str) -> Result<()> {
        let sql = format!(
            r#"
            UPDATE scan_jobs SET
                status = 'error',
                error_message = $2,
                current_unit = NULL,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND {NON_TERMINAL}
            "#
        );
        sqlx::query(&sql)
            .bind(id.to_uuid())
            .bind(message)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
