use axum::response::sse::{Event, KeepAlive};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::HeaderMap,
    response::Sse,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::{convert::Infallible, time::Duration};
use tracing::warn;

use vigil_model::{EventFrame, JobId, JobSnapshot};

use crate::infra::{app_state::AppState, errors::AppResult};

const LAST_EVENT_ID_HEADER: &str = "last-event-id";
const SNAPSHOT_EVENT: &str = "snapshot";

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    /// Only frames with a greater sequence are returned.
    pub since: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct JobEventsResponse {
    pub job_id: JobId,
    pub events: Vec<EventFrame>,
}

/// Live snapshot stream. Ends after the terminal snapshot.
pub async fn job_progress_sse_handler(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
    headers: HeaderMap,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let last_sequence = headers
        .get(LAST_EVENT_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.trim().parse::<u64>().ok());
    let retry_hint = state.gateway.config().retry_hint;

    let snapshots = state.gateway.snapshots(job_id, last_sequence).await?;
    let mut first = true;
    let stream = snapshots.filter_map(move |snapshot| {
        let event = snapshot_to_event(&snapshot).map(|event| {
            if std::mem::take(&mut first) {
                event.retry(retry_hint)
            } else {
                event
            }
        });
        futures::future::ready(event.map(Ok))
    });

    Ok(Sse::new(stream).keep_alive(default_keep_alive()))
}

pub async fn job_events_handler(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
    Query(query): Query<EventsQuery>,
) -> AppResult<Json<JobEventsResponse>> {
    let events = state
        .registry
        .events_since(job_id, query.since.unwrap_or(0))
        .await?;
    Ok(Json(JobEventsResponse { job_id, events }))
}

fn snapshot_to_event(snapshot: &JobSnapshot) -> Option<Event> {
    serde_json::to_string(snapshot)
        .map(|data| {
            Event::default()
                .event(SNAPSHOT_EVENT)
                .id(snapshot.sequence.to_string())
                .data(data)
        })
        .map_err(|err| {
            warn!(job_id = %snapshot.job_id, "failed to serialize snapshot: {err}");
            err
        })
        .ok()
}

fn default_keep_alive() -> KeepAlive {
    KeepAlive::new()
        .interval(Duration::from_secs(15))
        .text("keep-alive")
}
