use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use vigil_core::CancelOutcome;
use vigil_model::{JobId, JobPage, JobQuery, JobRecord, JobSpec, JobStatus, SortOrder};

use crate::infra::{
    app_state::AppState,
    errors::{AppError, AppResult},
};

/// Raw listing parameters; parsed by hand so bad values surface as JSON
/// errors naming the parameter.
#[derive(Debug, Default, Deserialize)]
pub struct ListJobsParams {
    pub status: Option<String>,
    pub target_kind: Option<String>,
    pub target_name: Option<String>,
    pub sort: Option<String>,
    pub order: Option<String>,
    pub page: Option<String>,
    pub per_page: Option<String>,
}

impl ListJobsParams {
    pub fn into_query(self) -> AppResult<JobQuery> {
        let mut query = JobQuery::default();
        if let Some(raw) = non_empty(self.status) {
            query.status = Some(
                raw.parse::<JobStatus>()
                    .map_err(|err| AppError::bad_request(err.to_string()))?,
            );
        }
        query.target_kind = non_empty(self.target_kind);
        query.target_name = non_empty(self.target_name);
        if let Some(raw) = non_empty(self.sort) {
            query.sort = raw
                .parse()
                .map_err(|err: vigil_model::ModelError| {
                    AppError::bad_request(err.to_string())
                })?;
        }
        if let Some(raw) = non_empty(self.order) {
            query.order = match raw.to_ascii_lowercase().as_str() {
                "asc" => SortOrder::Asc,
                "desc" => SortOrder::Desc,
                other => {
                    return Err(AppError::bad_request(format!(
                        "unknown sort order '{other}'"
                    )));
                }
            };
        }
        if let Some(raw) = non_empty(self.page) {
            query.page = parse_number("page", &raw)?;
        }
        if let Some(raw) = non_empty(self.per_page) {
            query.per_page = parse_number("per_page", &raw)?;
        }
        Ok(query.normalized())
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|raw| !raw.trim().is_empty())
}

fn parse_number(name: &str, raw: &str) -> AppResult<u32> {
    raw.trim().parse().map_err(|_| {
        AppError::bad_request(format!("{name} must be a positive integer"))
    })
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub job_id: JobId,
    pub status: String,
}

pub async fn start_job_handler(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
    Json(spec): Json<JobSpec>,
) -> AppResult<impl IntoResponse> {
    let record = state.registry.start(job_id, spec).await?;
    Ok((StatusCode::ACCEPTED, Json(record)))
}

pub async fn cancel_job_handler(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<impl IntoResponse> {
    let (status, label) = match state.registry.cancel(job_id).await? {
        CancelOutcome::Cancelling => {
            (StatusCode::ACCEPTED, "cancelling".to_string())
        }
        CancelOutcome::AlreadyTerminal(status) => {
            (StatusCode::OK, status.to_string())
        }
    };
    Ok((
        status,
        Json(CancelResponse {
            job_id,
            status: label,
        }),
    ))
}

pub async fn get_job_handler(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<Json<JobRecord>> {
    Ok(Json(state.registry.get_status(job_id).await?))
}

pub async fn list_jobs_handler(
    State(state): State<AppState>,
    Query(params): Query<ListJobsParams>,
) -> AppResult<Json<JobPage>> {
    let query = params.into_query()?;
    Ok(Json(state.registry.list(&query).await?))
}

pub async fn delete_job_handler(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<StatusCode> {
    if !state.registry.delete(job_id).await? {
        info!(job_id = %job_id, "delete of unknown job ignored");
    }
    Ok(StatusCode::NO_CONTENT)
}
