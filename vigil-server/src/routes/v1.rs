use axum::{
    Router,
    routing::{get, post},
};

use crate::{handlers, infra::app_state::AppState};

/// Create all v1 API routes
pub fn create_v1_router() -> Router<AppState> {
    Router::new()
        .route("/jobs", get(handlers::list_jobs_handler))
        .route(
            "/jobs/{id}",
            get(handlers::get_job_handler)
                .post(handlers::start_job_handler)
                .delete(handlers::delete_job_handler),
        )
        .route("/jobs/{id}/cancel", post(handlers::cancel_job_handler))
        .route("/jobs/{id}/progress", get(handlers::job_progress_sse_handler))
        .route("/jobs/{id}/events", get(handlers::job_events_handler))
        .route(
            "/jobs/{id}/statistics",
            get(handlers::job_statistics_handler),
        )
        .route(
            "/jobs/{id}/artifacts/{name}",
            get(handlers::download_artifact_handler),
        )
        .route("/statistics", get(handlers::aggregate_statistics_handler))
}
