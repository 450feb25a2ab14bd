use axum::{
    body::Body,
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
};
use vigil_model::JobId;

use crate::infra::{app_state::AppState, errors::AppResult};

pub async fn download_artifact_handler(
    State(state): State<AppState>,
    Path((job_id, name)): Path<(JobId, String)>,
) -> AppResult<Response> {
    let stream = state.registry.artifact_stream(job_id, &name).await?;
    let body = Body::from_stream(stream);
    Ok((
        [
            (header::CONTENT_TYPE, content_type_for(&name)),
            (header::CACHE_CONTROL, "private, max-age=31536000, immutable"),
        ],
        body,
    )
        .into_response())
}

fn content_type_for(name: &str) -> &'static str {
    if name.ends_with(".jsonl") {
        "application/x-ndjson"
    } else if name.ends_with(".html") {
        "text/html; charset=utf-8"
    } else if name.ends_with(".json") {
        "application/json"
    } else {
        "application/octet-stream"
    }
}
