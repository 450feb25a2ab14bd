//! Test application wired like production, minus Postgres: in-memory job
//! rows, in-memory object store, `/bin/sh` scripts standing in for the
//! scanner.

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use axum_test::TestServer;
use serde_json::{Value, json};
use tempfile::TempDir;
use vigil_core::{InMemoryJobRepository, StorageConfig, build_object_storage};
use vigil_model::JobId;
use vigil_server::{
    AppState,
    infra::{config::Config, startup},
    routes,
};

const PROLOGUE: &str = r#"prefix=""
while [ $# -gt 0 ]; do
  case "$1" in
    --report_prefix) prefix="$2"; shift 2 ;;
    *) shift ;;
  esac
done
report="${prefix}.report.jsonl"
"#;

pub const TWO_UNITS: &str = r#"echo "reporting to $report"
echo "[1/2] dan.Dan_11_0"
echo "dan.Dan_11_0 mitigation.MitigationBypass: FAIL ok on 3/5"
echo '{"entry_type":"eval","probe":"probes.dan.Dan_11_0","detector":"detectors.mitigation.MitigationBypass","passed":3,"total":5}' >> "$report"
echo "[2/2] encoding.InjectHex"
echo "encoding.InjectHex encoding.DecodeMatch: PASS ok on 5/5"
echo '{"entry_type":"eval","probe":"probes.encoding.InjectHex","detector":"detectors.encoding.DecodeMatch","passed":5,"total":5}' >> "$report"
echo "garak run complete in 0.01s"
"#;

pub const HANGS_AFTER_FIRST_UNIT: &str = r#"echo "reporting to $report"
echo "[1/2] dan.Dan_11_0"
echo "dan.Dan_11_0 mitigation.MitigationBypass: PASS ok on 5/5"
echo '{"entry_type":"eval","probe":"probes.dan.Dan_11_0","passed":5,"total":5}' >> "$report"
sleep 30
"#;

pub const FAILS_WITH_SIGNATURE: &str = r#"echo "loading generator"
echo "garak.exception.BadGeneratorException: model gpt-x not found"
exit 1
"#;

pub struct TestApp {
    pub server: TestServer,
    pub state: AppState,
    _dir: TempDir,
}

impl TestApp {
    pub fn spawn(script: &str) -> Self {
        Self::with_limit(script, 4)
    }

    pub fn with_limit(script: &str, max_concurrent_jobs: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let script_path = dir.path().join("scan.sh");
        std::fs::write(&script_path, format!("{PROLOGUE}{script}")).unwrap();

        let mut config = Config::default();
        config.storage = StorageConfig::Memory;
        config.sweep.interval = None;
        config.runner.executable = "/bin/sh".into();
        config.runner.base_args = vec![script_path.to_string_lossy().into_owned()];
        config.runner.scratch_dir = dir.path().join("scratch");
        config.runner.max_concurrent_jobs = max_concurrent_jobs;
        config.runner.cancel_grace = Duration::from_millis(500);
        config.runner.drain_timeout = Duration::from_millis(500);
        config.orchestrator.snapshot_interval = Duration::from_millis(50);
        config.orchestrator.store_retries = 2;
        config.orchestrator.upload_retries = 2;
        config.orchestrator.retry_base = Duration::from_millis(1);
        config.orchestrator.retry_max = Duration::from_millis(5);
        config.gateway.poll_interval = Duration::from_millis(20);
        config.gateway.retry_hint = Duration::from_millis(1500);
        let config = Arc::new(config);

        let storage = build_object_storage(&config.storage).unwrap();
        let registry = startup::build_registry(
            &config,
            Arc::new(InMemoryJobRepository::new()),
            storage,
        );
        let state = AppState::new(config, registry);
        let server = TestServer::new(routes::create_app(state.clone())).unwrap();
        Self {
            server,
            state,
            _dir: dir,
        }
    }

    /// Poll until the job has left the active set.
    pub async fn settle(&self, id: JobId) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while self.state.registry.is_active(id) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("job settles");
    }
}

pub fn job_body(units: &[&str]) -> Value {
    json!({
        "target": { "kind": "test", "name": "echo" },
        "units": units,
    })
}

pub fn job_path(id: JobId) -> String {
    format!("/api/v1/jobs/{id}")
}
