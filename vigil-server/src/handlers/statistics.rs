use axum::{
    Json,
    extract::{Path, State},
};

use vigil_model::{AggregateStatistics, JobId, JobStatistics};

use crate::infra::{app_state::AppState, errors::AppResult};

/// Materialized statistics of one terminal job.
pub async fn job_statistics_handler(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<Json<JobStatistics>> {
    Ok(Json(state.registry.statistics(job_id).await?))
}

pub async fn aggregate_statistics_handler(
    State(state): State<AppState>,
) -> AppResult<Json<AggregateStatistics>> {
    Ok(Json(state.registry.aggregate_statistics().await?))
}
