use axum::{Json, extract::State};
use serde_json::{Value, json};

use crate::infra::app_state::AppState;

pub async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "active_jobs": state.registry.active_count(),
        "capacity": state.registry.runner().limit(),
    }))
}
