//! # Vigil Core
//!
//! Orchestration of long-running scan jobs executed as external processes.
//!
//! The crate is organized leaves first:
//!
//! - [`storage`]: artifact storage behind one trait (local filesystem, S3, memory)
//! - [`database`]: job metadata repository (PostgreSQL, in-memory)
//! - [`parser`]: scanner output lines to typed progress events
//! - [`runner`]: one subprocess per job, admission control and cancellation
//! - [`finalizer`]: rename-then-upload of job artifacts
//! - [`registry`]: the authoritative view over all jobs
//! - [`gateway`]: cadence-limited snapshot streams for subscribers

#![allow(missing_docs)]

pub mod cache;
pub mod database;
pub mod error;
pub mod finalizer;
pub mod gateway;
pub mod parser;
pub mod registry;
pub mod report;
pub mod retry;
pub mod runner;
pub mod storage;

pub use vigil_model as model;

pub use cache::{ArtifactBlobStore, ArtifactCache, CacheEntry};
pub use database::{InMemoryJobRepository, JobRepository, PostgresJobRepository};
pub use error::{Result, VigilError};
pub use finalizer::{FinalizeError, FinalizedArtifact, ReportFinalizer};
pub use gateway::{EventGateway, GatewayConfig};
pub use parser::{DEFAULT_FATAL_SIGNATURES, StreamParser};
pub use registry::{
    CancelOutcome, JobRegistry, LiveJob, RESTART_MESSAGE, RegistryConfig,
    SweepReport, UNFINALIZED_MESSAGE,
};
pub use retry::RetryPolicy;
pub use runner::{
    CommandBuilder, CommandLine, ExitGate, ExitOutcome, Invocation, JobRunner,
    RunnerConfig, RunnerEvent, ScannerCommand,
};
pub use storage::{
    ObjectStorage, ObjectStoreBackend, S3StorageConfig, StorageConfig,
    build_object_storage,
};

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
