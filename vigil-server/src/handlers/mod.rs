//! HTTP request handlers organized by functionality

pub mod artifacts;
pub mod health;
pub mod jobs;
pub mod progress;
pub mod statistics;

pub use artifacts::download_artifact_handler;
pub use health::health_handler;
pub use jobs::{
    cancel_job_handler, delete_job_handler, get_job_handler,
    list_jobs_handler, start_job_handler,
};
pub use progress::{job_events_handler, job_progress_sse_handler};
pub use statistics::{aggregate_statistics_handler, job_statistics_handler};
