//! Core data model definitions shared across Vigil crates.
#![allow(missing_docs)]

pub use ::chrono;

pub mod error;
pub mod events;
pub mod ids;
pub mod job;
pub mod query;
pub mod stats;
pub mod status;

pub use error::ModelError;
pub use events::{
    EventFrame, FramePayload, JobSnapshot, ProgressEvent, UnitOutcome,
    UnitResult,
};
pub use ids::JobId;
pub use job::{JobRecord, JobSpec, TargetDescriptor};
pub use query::{JobPage, JobQuery, JobSort, SortOrder};
pub use stats::{
    AggregateStatistics, JobStatistics, JobStatisticsSummary, Tally,
};
pub use status::JobStatus;
