use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
};

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use vigil_model::{JobId, JobSpec};

use crate::error::{Result, VigilError};

/// Inputs available when building a scanner command line.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    pub job_id: JobId,
    pub spec: &'a JobSpec,
    /// Path prefix the scanner must write its artifacts under.
    pub report_prefix: &'a Path,
    /// Frozen job configuration, written to disk when present.
    pub config_path: Option<&'a Path>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// Maps a job onto the scanner's command line.
pub trait CommandBuilder: Send + Sync + fmt::Debug {
    fn build(&self, invocation: &Invocation<'_>) -> Result<CommandLine>;
}

/// Default builder: a fixed executable plus garak-style flags.
#[derive(Debug, Clone)]
pub struct ScannerCommand {
    program: PathBuf,
    base_args: Vec<String>,
}

impl ScannerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
        }
    }

    pub fn with_base_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base_args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl CommandBuilder for ScannerCommand {
    fn build(&self, invocation: &Invocation<'_>) -> Result<CommandLine> {
        let spec = invocation.spec;
        if spec.units.is_empty() {
            return Err(VigilError::InvalidRequest(
                "at least one unit must be requested".into(),
            ));
        }

        let mut args = self.base_args.clone();
        args.push("--target_type".into());
        args.push(spec.target.kind.clone());
        args.push("--target_name".into());
        args.push(spec.target.name.clone());
        args.push("--probes".into());
        args.push(spec.units.join(","));
        args.push("--report_prefix".into());
        args.push(invocation.report_prefix.to_string_lossy().into_owned());
        if let Some(config) = invocation.config_path {
            args.push("--config".into());
            args.push(config.to_string_lossy().into_owned());
        }

        Ok(CommandLine {
            program: self.program.clone(),
            args,
        })
    }
}

static LOOPBACK_HOST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?P<pre>^|//|@)(?:localhost|127\.0\.0\.1)(?P<post>[:/]|$)")
        .expect("loopback regex")
});

/// Point loopback hosts in `value` at `alias`, e.g.
/// `http://localhost:11434` -> `http://host.docker.internal:11434`.
pub fn rewrite_loopback(value: &str, alias: &str) -> String {
    LOOPBACK_HOST
        .replace_all(value, |caps: &Captures<'_>| {
            format!("{}{}{}", &caps["pre"], alias, &caps["post"])
        })
        .into_owned()
}

/// Merge global and per-job environment overrides, rewriting loopback
/// addresses when a host alias is configured. Per-job values win.
pub fn merge_environment(
    global: &BTreeMap<String, String>,
    job: &BTreeMap<String, String>,
    host_alias: Option<&str>,
) -> BTreeMap<String, String> {
    global
        .iter()
        .chain(job.iter())
        .map(|(key, value)| {
            let value = match host_alias {
                Some(alias) => rewrite_loopback(value, alias),
                None => value.clone(),
            };
            (key.clone(), value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use vigil_model::TargetDescriptor;

    use super::*;

    #[test]
    fn rewrites_only_loopback_hosts() {
        let alias = "host.docker.internal";
        assert_eq!(
            rewrite_loopback("http://localhost:11434/api", alias),
            "http://host.docker.internal:11434/api"
        );
        assert_eq!(
            rewrite_loopback("127.0.0.1:8000", alias),
            "host.docker.internal:8000"
        );
        assert_eq!(
            rewrite_loopback("postgres://u:p@localhost/db", alias),
            "postgres://u:p@host.docker.internal/db"
        );
        assert_eq!(
            rewrite_loopback("http://mylocalhost.example:80", alias),
            "http://mylocalhost.example:80"
        );
    }

    #[test]
    fn job_environment_overrides_global() {
        let global = BTreeMap::from([
            ("OLLAMA_HOST".to_string(), "http://localhost:11434".to_string()),
            ("MODE".to_string(), "global".to_string()),
        ]);
        let job = BTreeMap::from([("MODE".to_string(), "job".to_string())]);
        let merged = merge_environment(&global, &job, Some("gateway"));
        assert_eq!(merged["OLLAMA_HOST"], "http://gateway:11434");
        assert_eq!(merged["MODE"], "job");
    }

    #[test]
    fn scanner_command_appends_job_flags() {
        let spec = JobSpec::new(
            TargetDescriptor::new("openai", "gpt-4o-mini"),
            vec!["dan.Dan_11_0".into(), "encoding.InjectHex".into()],
        );
        let prefix = PathBuf::from("/scratch/vigil.job");
        let line = ScannerCommand::new("python")
            .with_base_args(["-m", "garak"])
            .build(&Invocation {
                job_id: JobId::generate(),
                spec: &spec,
                report_prefix: &prefix,
                config_path: None,
            })
            .unwrap();
        assert_eq!(
            line.args,
            vec![
                "-m",
                "garak",
                "--target_type",
                "openai",
                "--target_name",
                "gpt-4o-mini",
                "--probes",
                "dan.Dan_11_0,encoding.InjectHex",
                "--report_prefix",
                "/scratch/vigil.job",
            ]
        );
    }
}
