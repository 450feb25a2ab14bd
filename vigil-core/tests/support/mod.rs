//! Shared harness for registry integration tests.
//!
//! Scans are played by `/bin/sh` scripts written into a temp dir. Each
//! script receives the regular scanner flags, so `--report_prefix` tells
//! it where the result log belongs.

#![allow(dead_code)]

use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;
use tokio::sync::broadcast;
use vigil_core::{
    ArtifactCache, InMemoryJobRepository, JobRegistry, JobRepository, JobRunner,
    ObjectStorage, ObjectStoreBackend, RegistryConfig, Result, RetryPolicy,
    RunnerConfig, ScannerCommand, StreamParser, VigilError,
    model::{EventFrame, FramePayload, JobSpec, ProgressEvent, TargetDescriptor},
    storage::ByteStream,
};

/// Script prologue: pick the report prefix out of the scanner flags.
const PROLOGUE: &str = r#"prefix=""
while [ $# -gt 0 ]; do
  case "$1" in
    --report_prefix) prefix="$2"; shift 2 ;;
    *) shift ;;
  esac
done
report="${prefix}.report.jsonl"
"#;

/// Three units, one result line each, then a clean exit.
pub const THREE_UNITS: &str = r#"echo "reporting to $report"
echo "queue of probes: dan.Dan_11_0, encoding.InjectHex, lmrc.Profanity"
echo "[1/3] dan.Dan_11_0"
echo "dan.Dan_11_0 mitigation.MitigationBypass: FAIL ok on 3/5"
echo '{"entry_type":"eval","probe":"probes.dan.Dan_11_0","detector":"detectors.mitigation.MitigationBypass","passed":3,"total":5}' >> "$report"
echo "[2/3] encoding.InjectHex"
echo "encoding.InjectHex encoding.DecodeMatch: PASS ok on 5/5"
echo '{"entry_type":"eval","probe":"probes.encoding.InjectHex","detector":"detectors.encoding.DecodeMatch","passed":5,"total":5}' >> "$report"
echo "[3/3] lmrc.Profanity"
echo "lmrc.Profanity unsafe_content.SurgeProfanity: PASS ok on 4/4"
echo '{"entry_type":"eval","probe":"probes.lmrc.Profanity","detector":"detectors.unsafe_content.SurgeProfanity","passed":4,"total":4}' >> "$report"
echo '{"entry_type":"completion","run":"x"}' >> "$report"
echo "garak run complete in 0.01s"
"#;

/// One result, then hangs until signalled.
pub const HANGS_AFTER_FIRST_UNIT: &str = r#"echo "reporting to $report"
echo "[1/3] dan.Dan_11_0"
echo "dan.Dan_11_0 mitigation.MitigationBypass: PASS ok on 5/5"
echo '{"entry_type":"eval","probe":"probes.dan.Dan_11_0","passed":5,"total":5}' >> "$report"
sleep 30
echo "[2/3] encoding.InjectHex"
"#;

/// Exits nonzero without any recognised failure line.
pub const CRASHES: &str = r#"echo "loading generator"
echo "segmentation fault in plugin loader" >&2
exit 3
"#;

/// Blocks without output until signalled.
pub const SLEEPS: &str = "sleep 30\n";

#[derive(Debug)]
pub struct Harness {
    pub registry: JobRegistry,
    pub repo: Arc<InMemoryJobRepository>,
    pub storage: Arc<dyn ObjectStorage>,
    pub scratch: PathBuf,
    dir: TempDir,
}

impl Harness {
    pub fn new(script: &str) -> Self {
        Self::with(script, Arc::new(ObjectStoreBackend::in_memory()), 4)
    }

    pub fn with(
        script: &str,
        storage: Arc<dyn ObjectStorage>,
        max_concurrent_jobs: usize,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let script_path = dir.path().join("scan.sh");
        std::fs::write(&script_path, format!("{PROLOGUE}{script}")).unwrap();
        let command = ScannerCommand::new("/bin/sh")
            .with_base_args([script_path.to_string_lossy().into_owned()]);
        Self::with_command(dir, command, storage, max_concurrent_jobs)
    }

    pub fn with_command(
        dir: TempDir,
        command: ScannerCommand,
        storage: Arc<dyn ObjectStorage>,
        max_concurrent_jobs: usize,
    ) -> Self {
        Self::assemble(dir, command, storage, max_concurrent_jobs, |repo| {
            repo as Arc<dyn JobRepository>
        })
    }

    /// Like [`Harness::new`], with the registry seeing the in-memory
    /// repository through `wrap`.
    pub fn with_repository(
        script: &str,
        wrap: impl FnOnce(Arc<InMemoryJobRepository>) -> Arc<dyn JobRepository>,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let script_path = dir.path().join("scan.sh");
        std::fs::write(&script_path, format!("{PROLOGUE}{script}")).unwrap();
        let command = ScannerCommand::new("/bin/sh")
            .with_base_args([script_path.to_string_lossy().into_owned()]);
        Self::assemble(
            dir,
            command,
            Arc::new(ObjectStoreBackend::in_memory()),
            4,
            wrap,
        )
    }

    fn assemble(
        dir: TempDir,
        command: ScannerCommand,
        storage: Arc<dyn ObjectStorage>,
        max_concurrent_jobs: usize,
        wrap: impl FnOnce(Arc<InMemoryJobRepository>) -> Arc<dyn JobRepository>,
    ) -> Self {
        let scratch = dir.path().join("scratch");
        let runner = JobRunner::new(
            RunnerConfig {
                max_concurrent_jobs,
                cancel_grace: Duration::from_millis(500),
                drain_timeout: Duration::from_millis(500),
                scratch_dir: scratch.clone(),
                ..RunnerConfig::default()
            },
            Arc::new(command),
            StreamParser::default(),
        );
        let repo = Arc::new(InMemoryJobRepository::new());
        let cache = Arc::new(ArtifactCache::new(Arc::clone(&storage)));
        let registry = JobRegistry::new(
            RegistryConfig {
                snapshot_interval: Duration::from_millis(50),
                store_retry: fast_retry(),
                finalize_retry: fast_retry(),
                ..RegistryConfig::default()
            },
            runner,
            wrap(Arc::clone(&repo)),
            Arc::clone(&storage),
            cache,
        );
        Self {
            registry,
            repo,
            storage,
            scratch,
            dir,
        }
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::default()
        .with_max_retries(2)
        .with_delays(Duration::from_millis(1), Duration::from_millis(5))
        .without_jitter()
}

pub fn spec() -> JobSpec {
    JobSpec::new(
        TargetDescriptor::new("test", "echo"),
        vec![
            "dan.Dan_11_0".into(),
            "encoding.InjectHex".into(),
            "lmrc.Profanity".into(),
        ],
    )
}

/// Wait for the first frame matching `predicate`, replayed history
/// included.
pub async fn next_frame(
    backlog: Vec<EventFrame>,
    rx: &mut broadcast::Receiver<EventFrame>,
    predicate: impl Fn(&FramePayload) -> bool,
) -> EventFrame {
    if let Some(frame) = backlog.into_iter().find(|f| predicate(&f.payload)) {
        return frame;
    }
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(frame) if predicate(&frame.payload) => return frame,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    panic!("event channel closed before the expected frame")
                }
            }
        }
    })
    .await
    .expect("frame did not arrive in time")
}

pub fn is_unit_result(payload: &FramePayload) -> bool {
    matches!(payload, FramePayload::Progress(ProgressEvent::UnitResult(_)))
}

/// Storage that accepts nothing; reads and listings come back empty.
#[derive(Debug, Default)]
pub struct UnreachableStore;

#[async_trait]
impl ObjectStorage for UnreachableStore {
    async fn put(&self, key: &str, _data: Bytes) -> Result<()> {
        Err(VigilError::TransientIo(format!("put {key}: connection refused")))
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        Err(VigilError::TransientIo(format!("get {key}: connection refused")))
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    async fn list(&self, _prefix: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn stream(&self, key: &str) -> Result<ByteStream> {
        Err(VigilError::TransientIo(format!("get {key}: connection refused")))
    }

    fn backend_name(&self) -> &'static str {
        "unreachable"
    }
}
