//! Subprocess ownership: admission control, spawning, output pumping,
//! cancellation and exit classification.

mod command;
mod process;

use std::{collections::BTreeMap, fmt, path::PathBuf, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError, mpsc};
use tokio_util::sync::CancellationToken;
use vigil_model::{JobId, JobSpec, ProgressEvent};

pub use command::{
    CommandBuilder, CommandLine, Invocation, ScannerCommand, merge_environment,
    rewrite_loopback,
};

use crate::{
    error::{Result, VigilError},
    parser::StreamParser,
};

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub max_concurrent_jobs: usize,
    /// Hard limit on process creation; exceeding it ends the job in `error`.
    pub spawn_timeout: Duration,
    /// Time between SIGTERM and SIGKILL on cancellation.
    pub cancel_grace: Duration,
    /// How long to keep reading output after the process exited.
    pub drain_timeout: Duration,
    /// Output lines attached to failures no pattern explained.
    pub diagnostic_lines: usize,
    pub event_buffer: usize,
    pub scratch_dir: PathBuf,
    /// Container-routable name substituted for loopback addresses.
    pub host_alias: Option<String>,
    pub env: BTreeMap<String, String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            spawn_timeout: Duration::from_secs(10),
            cancel_grace: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(2),
            diagnostic_lines: 20,
            event_buffer: 256,
            scratch_dir: std::env::temp_dir().join("vigil-scratch"),
            host_alias: None,
            env: BTreeMap::new(),
        }
    }
}

/// What the runner reports about one process, in order: at most one
/// `Spawned`, any number of `Progress`, exactly one `Exited`.
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerEvent {
    Spawned { pid: Option<u32> },
    Progress(ProgressEvent),
    Exited(ExitOutcome),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExitOutcome {
    Completed,
    Failed {
        exit_code: Option<i32>,
        reason: String,
        diagnostics: Vec<String>,
    },
    Cancelled,
    /// The process never started.
    SpawnError { reason: String },
}

/// Orders a cancel request against the process exit. Whichever is
/// recorded first decides how the job ends.
#[derive(Debug, Default)]
pub struct ExitGate {
    token: CancellationToken,
    state: Mutex<GateState>,
}

#[derive(Debug, Default)]
struct GateState {
    exited: bool,
    cancel_requested: bool,
}

impl ExitGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires when termination was requested.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Ask for termination. Returns `false`, and does nothing, once the
    /// process has exited.
    pub fn request_cancel(&self) -> bool {
        let mut state = self.state.lock();
        if state.exited {
            return false;
        }
        state.cancel_requested = true;
        self.token.cancel();
        true
    }

    /// Record the exit. Returns whether a cancel was accepted before it.
    pub fn mark_exited(&self) -> bool {
        let mut state = self.state.lock();
        state.exited = true;
        state.cancel_requested
    }

    pub fn has_exited(&self) -> bool {
        self.state.lock().exited
    }
}

/// A reserved execution slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

#[derive(Clone)]
pub struct JobRunner {
    inner: Arc<RunnerInner>,
}

struct RunnerInner {
    config: RunnerConfig,
    command: Arc<dyn CommandBuilder>,
    parser: StreamParser,
    slots: Arc<Semaphore>,
}

impl fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRunner")
            .field("limit", &self.limit())
            .field("running", &self.running())
            .field("command", &self.inner.command)
            .finish_non_exhaustive()
    }
}

impl JobRunner {
    pub fn new(
        config: RunnerConfig,
        command: Arc<dyn CommandBuilder>,
        parser: StreamParser,
    ) -> Self {
        let limit = config.max_concurrent_jobs.max(1);
        Self {
            inner: Arc::new(RunnerInner {
                config,
                command,
                parser,
                slots: Arc::new(Semaphore::new(limit)),
            }),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.inner.config
    }

    pub fn limit(&self) -> usize {
        self.inner.config.max_concurrent_jobs.max(1)
    }

    pub fn running(&self) -> usize {
        self.limit()
            .saturating_sub(self.inner.slots.available_permits())
    }

    /// Claim a slot or fail with [`VigilError::Capacity`]. Never queues.
    pub fn reserve(&self) -> Result<AdmissionPermit> {
        match Arc::clone(&self.inner.slots).try_acquire_owned() {
            Ok(permit) => Ok(AdmissionPermit { _permit: permit }),
            Err(TryAcquireError::NoPermits) => Err(VigilError::Capacity {
                running: self.running(),
                limit: self.limit(),
            }),
            Err(TryAcquireError::Closed) => {
                Err(VigilError::internal("job runner has been shut down"))
            }
        }
    }

    /// Start the process for `job_id` in the background.
    ///
    /// The slot is held until the process exits. A cancel accepted by
    /// `gate` terminates the process group.
    pub fn launch(
        &self,
        permit: AdmissionPermit,
        job_id: JobId,
        spec: JobSpec,
        gate: Arc<ExitGate>,
    ) -> mpsc::Receiver<RunnerEvent> {
        let (tx, rx) = mpsc::channel(self.inner.config.event_buffer.max(1));
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            process::supervise(inner, permit, job_id, spec, tx, gate).await;
        });
        rx
    }
}
