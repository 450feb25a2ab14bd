//! Line-oriented translation of scanner output into [`ProgressEvent`]s.
//!
//! Output is a human log, not a protocol. Each line is tested against an
//! ordered rule list and the first rule that produces an event wins.
//! Unrecognised or malformed lines produce nothing. The parser keeps no
//! state between lines.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use vigil_model::{ProgressEvent, UnitOutcome, UnitResult};

/// Exception class names that abort interpretation of a run, checked in
/// this order. The first signature found on a line names the failure.
pub const DEFAULT_FATAL_SIGNATURES: &[&str] = &[
    "BadGeneratorException",
    "GarakException",
    "PluginConfigurationError",
    "ConfigFailure",
    "APIKeyMissingError",
    "ModelNameMissingError",
    "RateLimitHit",
    "ConnectionRefusedError",
    "ModuleNotFoundError",
];

static ANSI_ESCAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("ansi escape regex")
});

static UNIT_RESULT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<unit>[\w.\-]+)\s+(?P<detector>[\w.\-]+):\s+(?P<outcome>PASS|FAIL)\s+ok on\s+(?P<passed>\d+)\s*/\s*(?P<total>\d+)",
    )
    .expect("unit result regex")
});

static PROGRESS_COUNTER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[(?P<done>\d+)\s*/\s*(?P<total>\d+)\](?:\s+(?P<unit>\S+))?")
        .expect("progress counter regex")
});

static UNIT_START: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:probes\.(?P<bar>[\w.\-]+):\s+\d+%|(?:running|starting)\s+(?:probe|unit)\s+(?P<named>[\w.\-]+))",
    )
    .expect("unit start regex")
});

static UNIT_QUEUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^queue of (?:probes|units):\s*(?P<units>.+)$")
        .expect("unit queue regex")
});

static ARTIFACT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:reporting to|report closed :\)|report html summary being written to)\s+(?P<path>\S+)",
    )
    .expect("artifact regex")
});

static RUN_COMPLETE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:\w+\s+)?run complete\b").expect("run complete regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rule {
    Fatal,
    UnitResult,
    ProgressCounter,
    UnitStart,
    UnitQueue,
    Artifact,
    RunComplete,
}

const RULES: [Rule; 7] = [
    Rule::Fatal,
    Rule::UnitResult,
    Rule::ProgressCounter,
    Rule::UnitStart,
    Rule::UnitQueue,
    Rule::Artifact,
    Rule::RunComplete,
];

#[derive(Debug, Clone)]
pub struct StreamParser {
    fatal_signatures: Vec<String>,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self {
            fatal_signatures: DEFAULT_FATAL_SIGNATURES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append signatures after the defaults; order is preserved.
    pub fn with_extra_signatures<I, S>(mut self, extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for signature in extra {
            let signature = signature.into();
            let trimmed = signature.trim();
            if !trimmed.is_empty()
                && !self.fatal_signatures.iter().any(|s| s == trimmed)
            {
                self.fatal_signatures.push(trimmed.to_string());
            }
        }
        self
    }

    pub fn fatal_signatures(&self) -> &[String] {
        &self.fatal_signatures
    }

    /// Translate one output line. Never panics; returns `None` for noise.
    pub fn parse_line(&self, raw: &str) -> Option<ProgressEvent> {
        let line = normalize(raw);
        if line.is_empty() {
            return None;
        }
        RULES.iter().find_map(|rule| self.apply(*rule, &line))
    }

    fn apply(&self, rule: Rule, line: &str) -> Option<ProgressEvent> {
        match rule {
            Rule::Fatal => self.match_fatal(line),
            Rule::UnitResult => UNIT_RESULT.captures(line).and_then(unit_result),
            Rule::ProgressCounter => {
                PROGRESS_COUNTER.captures(line).and_then(progress_counter)
            }
            Rule::UnitStart => UNIT_START.captures(line).and_then(|caps| {
                let unit = caps.name("bar").or_else(|| caps.name("named"))?;
                Some(ProgressEvent::ProgressUpdate {
                    completed: None,
                    total: None,
                    current_unit: Some(unit.as_str().to_string()),
                })
            }),
            Rule::UnitQueue => UNIT_QUEUE.captures(line).and_then(|caps| {
                let count = caps["units"]
                    .split([',', ' '])
                    .filter(|unit| !unit.trim().is_empty())
                    .count();
                let total = u32::try_from(count).ok().filter(|n| *n > 0)?;
                Some(ProgressEvent::ProgressUpdate {
                    completed: None,
                    total: Some(total),
                    current_unit: None,
                })
            }),
            Rule::Artifact => ARTIFACT.captures(line).map(|caps| {
                ProgressEvent::ArtifactReady {
                    location: caps["path"].to_string(),
                }
            }),
            Rule::RunComplete => {
                RUN_COMPLETE.is_match(line).then_some(ProgressEvent::Completed)
            }
        }
    }

    fn match_fatal(&self, line: &str) -> Option<ProgressEvent> {
        self.fatal_signatures.iter().find_map(|signature| {
            let start = find_class_name(line, signature)?;
            let reason = line[start..].trim();
            Some(ProgressEvent::Failed {
                reason: reason.to_string(),
            })
        })
    }
}

/// Strip terminal escapes, carriage-return redraws and leading glyphs.
fn normalize(raw: &str) -> String {
    let cleaned = ANSI_ESCAPE.replace_all(raw, "");
    let last_frame = cleaned
        .split('\r')
        .map(str::trim)
        .rfind(|segment| !segment.is_empty())
        .unwrap_or("");
    last_frame
        .trim_start_matches(|c: char| !c.is_alphanumeric() && c != '[')
        .trim_end()
        .to_string()
}

/// Byte offset of `name` in `line` when it appears as a whole identifier.
/// A dotted module path in front (`garak.exception.X`) is allowed.
fn find_class_name(line: &str, name: &str) -> Option<usize> {
    let is_ident = |c: char| c.is_alphanumeric() || c == '_';
    line.match_indices(name).map(|(idx, _)| idx).find(|&idx| {
        let before_ok = line[..idx].chars().next_back().is_none_or(|c| !is_ident(c));
        let after_ok = line[idx + name.len()..]
            .chars()
            .next()
            .is_none_or(|c| !is_ident(c));
        before_ok && after_ok
    })
}

fn unit_result(caps: Captures<'_>) -> Option<ProgressEvent> {
    let passed: u32 = caps["passed"].parse().ok()?;
    let total: u32 = caps["total"].parse().ok()?;
    if passed > total {
        return None;
    }
    let outcome = match &caps["outcome"] {
        "PASS" => UnitOutcome::Pass,
        _ => UnitOutcome::Fail,
    };
    Some(ProgressEvent::UnitResult(UnitResult {
        unit: caps["unit"].to_string(),
        detector: caps["detector"].to_string(),
        passed,
        total,
        outcome,
    }))
}

fn progress_counter(caps: Captures<'_>) -> Option<ProgressEvent> {
    let done: u32 = caps["done"].parse().ok()?;
    let total: u32 = caps["total"].parse().ok()?;
    if total == 0 || done > total {
        return None;
    }
    Some(ProgressEvent::ProgressUpdate {
        completed: Some(done),
        total: Some(total),
        current_unit: caps.name("unit").map(|m| m.as_str().to_string()),
    })
}
