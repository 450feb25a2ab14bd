use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, sleep_until, timeout},
};
use tracing::{debug, info, trace, warn};
use vigil_model::{JobId, JobSpec, ProgressEvent};

use super::{
    AdmissionPermit, ExitGate, ExitOutcome, RunnerEvent, RunnerInner,
    command::{Invocation, merge_environment},
};
use crate::{
    error::{Result, VigilError},
    parser::StreamParser,
};

const LINE_BUFFER: usize = 512;
const MAX_LINE_BYTES: usize = 16 * 1024;

pub(super) async fn supervise(
    inner: Arc<RunnerInner>,
    permit: AdmissionPermit,
    job_id: JobId,
    spec: JobSpec,
    events: mpsc::Sender<RunnerEvent>,
    gate: Arc<ExitGate>,
) {
    let outcome = match run(&inner, job_id, &spec, &events, &gate).await {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(job_id = %job_id, error = %err, "scan process could not be started");
            ExitOutcome::SpawnError {
                reason: err.to_string(),
            }
        }
    };
    gate.mark_exited();
    drop(permit);

    match &outcome {
        ExitOutcome::Completed => info!(job_id = %job_id, "scan process completed"),
        ExitOutcome::Cancelled => info!(job_id = %job_id, "scan process cancelled"),
        ExitOutcome::Failed {
            exit_code, reason, ..
        } => {
            warn!(job_id = %job_id, exit_code = ?exit_code, reason = %reason, "scan process failed")
        }
        ExitOutcome::SpawnError { .. } => {}
    }

    if events.send(RunnerEvent::Exited(outcome)).await.is_err() {
        debug!(job_id = %job_id, "exit outcome dropped; no listener");
    }
}

async fn run(
    inner: &RunnerInner,
    job_id: JobId,
    spec: &JobSpec,
    events: &mpsc::Sender<RunnerEvent>,
    gate: &ExitGate,
) -> Result<ExitOutcome> {
    let config = &inner.config;
    let cancel = gate.token();
    tokio::fs::create_dir_all(&config.scratch_dir)
        .await
        .map_err(|err| {
            VigilError::SpawnFailure(format!(
                "scratch directory {}: {err}",
                config.scratch_dir.display()
            ))
        })?;

    let report_prefix = config.scratch_dir.join(format!("vigil.{job_id}"));
    let config_path =
        write_frozen_config(&config.scratch_dir, job_id, &spec.config).await?;
    let line = inner
        .command
        .build(&Invocation {
            job_id,
            spec,
            report_prefix: &report_prefix,
            config_path: config_path.as_deref(),
        })
        .map_err(|err| VigilError::SpawnFailure(err.to_string()))?;

    let env = merge_environment(
        &config.env,
        &spec.env,
        config.host_alias.as_deref(),
    );
    let mut command = Command::new(&line.program);
    command
        .args(&line.args)
        .envs(&env)
        .current_dir(&config.scratch_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    debug!(job_id = %job_id, program = %line.program.display(), args = ?line.args, "spawning scan process");
    let mut child = spawn_with_timeout(command, config.spawn_timeout)
        .await
        .map_err(|err| match err {
            VigilError::SpawnFailure(reason) => VigilError::SpawnFailure(
                format!("{}: {reason}", line.program.display()),
            ),
            other => other,
        })?;

    let pid = child.id();
    info!(job_id = %job_id, pid = ?pid, "scan process spawned");
    let _ = events.send(RunnerEvent::Spawned { pid }).await;

    let (line_tx, mut line_rx) = mpsc::channel::<String>(LINE_BUFFER);
    let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(pump_lines(stdout, line_tx.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(pump_lines(stderr, line_tx.clone())));
    }
    drop(line_tx);

    let mut output = OutputState::new(config.diagnostic_lines);
    let mut cancel_requested = false;
    let mut kill_deadline: Option<Instant> = None;
    let mut lines_open = true;

    let status = loop {
        tokio::select! {
            _ = cancel.cancelled(), if !cancel_requested => {
                cancel_requested = true;
                info!(job_id = %job_id, grace = ?config.cancel_grace, "terminating scan process");
                if !signal_group(pid, StopSignal::Terminate) {
                    let _ = child.start_kill();
                }
                kill_deadline = Some(Instant::now() + config.cancel_grace);
            }
            _ = sleep_until(kill_deadline.unwrap_or_else(Instant::now)), if kill_deadline.is_some() => {
                warn!(job_id = %job_id, "scan process ignored SIGTERM; killing");
                signal_group(pid, StopSignal::Kill);
                let _ = child.start_kill();
                kill_deadline = None;
            }
            line = line_rx.recv(), if lines_open => match line {
                Some(line) => output.forward(&inner.parser, job_id, line, events).await,
                None => lines_open = false,
            },
            status = child.wait() => break status,
        }
    };
    // A cancel accepted before this point ends the job cancelled even if
    // the select above had not seen it yet.
    let cancel_requested = gate.mark_exited() || cancel_requested;

    let drained = timeout(config.drain_timeout, async {
        while let Some(line) = line_rx.recv().await {
            output.forward(&inner.parser, job_id, line, events).await;
        }
    })
    .await;
    if drained.is_err() {
        warn!(job_id = %job_id, "output pipes still open after exit; killing process group");
        signal_group(pid, StopSignal::Kill);
    }
    for reader in readers {
        reader.abort();
    }

    if let Some(path) = config_path {
        if let Err(err) = tokio::fs::remove_file(&path).await {
            debug!(path = %path.display(), error = %err, "frozen config not removed");
        }
    }

    Ok(output.classify(status, cancel_requested))
}

async fn spawn_with_timeout(
    mut command: Command,
    limit: Duration,
) -> Result<Child> {
    // A spawn that completes after the deadline is dropped, and
    // kill_on_drop reaps it.
    let handle = tokio::task::spawn_blocking(move || command.spawn());
    match timeout(limit, handle).await {
        Ok(Ok(Ok(child))) => Ok(child),
        Ok(Ok(Err(err))) => Err(VigilError::SpawnFailure(err.to_string())),
        Ok(Err(join)) => Err(VigilError::SpawnFailure(format!(
            "spawn task failed: {join}"
        ))),
        Err(_) => Err(VigilError::SpawnFailure(format!(
            "spawn did not complete within {limit:?}"
        ))),
    }
}

async fn write_frozen_config(
    dir: &Path,
    job_id: JobId,
    config: &serde_json::Value,
) -> Result<Option<PathBuf>> {
    let empty = match config {
        serde_json::Value::Null => true,
        serde_json::Value::Object(map) => map.is_empty(),
        _ => false,
    };
    if empty {
        return Ok(None);
    }
    let path = dir.join(format!("vigil.{job_id}.config.json"));
    let bytes = serde_json::to_vec_pretty(config)?;
    tokio::fs::write(&path, bytes).await.map_err(|err| {
        VigilError::SpawnFailure(format!(
            "failed to write job config {}: {err}",
            path.display()
        ))
    })?;
    Ok(Some(path))
}

/// Split a byte stream into lines on `\n` or `\r`, decoding lossily.
async fn pump_lines<R>(mut stream: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    let mut pending: Vec<u8> = Vec::with_capacity(256);
    loop {
        let read = match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                debug!(error = %err, "output stream closed with error");
                break;
            }
        };
        for &byte in &chunk[..read] {
            if byte == b'\n' || byte == b'\r' {
                if !pending.is_empty() && !emit(&tx, &mut pending).await {
                    return;
                }
            } else {
                pending.push(byte);
                if pending.len() >= MAX_LINE_BYTES && !emit(&tx, &mut pending).await {
                    return;
                }
            }
        }
    }
    if !pending.is_empty() {
        emit(&tx, &mut pending).await;
    }
}

async fn emit(tx: &mpsc::Sender<String>, pending: &mut Vec<u8>) -> bool {
    let line = String::from_utf8_lossy(pending).into_owned();
    pending.clear();
    tx.send(line).await.is_ok()
}

struct OutputState {
    tail: VecDeque<String>,
    limit: usize,
    fatal: Option<String>,
}

impl OutputState {
    fn new(limit: usize) -> Self {
        Self {
            tail: VecDeque::with_capacity(limit.min(256)),
            limit,
            fatal: None,
        }
    }

    async fn forward(
        &mut self,
        parser: &StreamParser,
        job_id: JobId,
        line: String,
        events: &mpsc::Sender<RunnerEvent>,
    ) {
        trace!(target: "vigil::subprocess", job_id = %job_id, "{line}");
        let event = parser.parse_line(&line);
        self.remember(line);

        if let Some(event) = event {
            if let ProgressEvent::Failed { reason } = &event {
                if self.fatal.is_none() {
                    self.fatal = Some(reason.clone());
                }
            }
            let _ = events.send(RunnerEvent::Progress(event)).await;
        }
    }

    fn remember(&mut self, line: String) {
        if self.limit == 0 || line.trim().is_empty() {
            return;
        }
        if self.tail.len() == self.limit {
            self.tail.pop_front();
        }
        self.tail.push_back(line);
    }

    fn classify(
        self,
        status: std::io::Result<ExitStatus>,
        cancelled: bool,
    ) -> ExitOutcome {
        if cancelled {
            return ExitOutcome::Cancelled;
        }
        let diagnostics: Vec<String> = self.tail.into_iter().collect();
        let status = match status {
            Ok(status) => status,
            Err(err) => {
                return ExitOutcome::Failed {
                    exit_code: None,
                    reason: format!("lost track of scan process: {err}"),
                    diagnostics,
                };
            }
        };

        match (status.success(), self.fatal) {
            (true, None) => ExitOutcome::Completed,
            (_, Some(reason)) => ExitOutcome::Failed {
                exit_code: status.code(),
                reason,
                diagnostics,
            },
            (false, None) => {
                let mut reason = describe_exit(status);
                if !diagnostics.is_empty() {
                    reason.push_str("; last output:\n");
                    reason.push_str(&diagnostics.join("\n"));
                }
                ExitOutcome::Failed {
                    exit_code: status.code(),
                    reason,
                    diagnostics,
                }
            }
        }
    }
}

fn describe_exit(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("scan process exited with code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("scan process terminated by signal {signal}");
        }
    }
    "scan process exited abnormally".to_string()
}

#[derive(Debug, Clone, Copy)]
enum StopSignal {
    Terminate,
    Kill,
}

/// Signal the whole process group led by `pid`. Returns `false` when no
/// signal could be delivered and the caller should fall back to the child
/// handle.
#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: StopSignal) -> bool {
    use nix::{
        errno::Errno,
        sys::signal::{Signal, killpg},
        unistd::Pid,
    };

    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return false;
    };
    let signal = match signal {
        StopSignal::Terminate => Signal::SIGTERM,
        StopSignal::Kill => Signal::SIGKILL,
    };
    match killpg(Pid::from_raw(pid), signal) {
        Ok(()) | Err(Errno::ESRCH) => true,
        Err(err) => {
            warn!(pid, signal = ?signal, error = %err, "failed to signal process group");
            false
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: StopSignal) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn exit_status(code: i32) -> ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        ExitStatus::from_raw(code << 8)
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_exit_without_pattern_attaches_tail() {
        let mut output = OutputState::new(2);
        for line in ["one", "two", "three"] {
            output.remember(line.to_string());
        }
        match output.classify(Ok(exit_status(3)), false) {
            ExitOutcome::Failed {
                exit_code,
                reason,
                diagnostics,
            } => {
                assert_eq!(exit_code, Some(3));
                assert_eq!(diagnostics, vec!["two", "three"]);
                assert!(reason.ends_with("two\nthree"), "{reason}");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn recognised_fatal_overrides_clean_exit() {
        let mut output = OutputState::new(4);
        output.fatal = Some("APIKeyMissingError: set OPENAI_API_KEY".into());
        assert!(matches!(
            output.classify(Ok(exit_status(0)), false),
            ExitOutcome::Failed { exit_code: Some(0), ref reason, .. }
                if reason.starts_with("APIKeyMissingError")
        ));
    }

    #[cfg(unix)]
    #[test]
    fn cancellation_wins_over_exit_code() {
        let output = OutputState::new(4);
        assert_eq!(
            output.classify(Ok(exit_status(143)), true),
            ExitOutcome::Cancelled
        );
    }

    #[tokio::test]
    async fn pump_splits_on_carriage_returns_and_decodes_lossily() {
        let input: &[u8] = b"first\r\nsecond\rthird\xff\nlast";
        let (tx, mut rx) = mpsc::channel(8);
        pump_lines(input, tx).await;
        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        assert_eq!(lines, vec!["first", "second", "third\u{fffd}", "last"]);
    }
}
