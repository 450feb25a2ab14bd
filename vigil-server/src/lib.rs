//! HTTP front end of the Vigil scan-job orchestrator.

pub mod handlers;
pub mod infra;
pub mod routes;

pub use infra::app_state::AppState;
