//! Result-log parsing into materialized statistics.
//!
//! The scanner's result log is JSON Lines. Only `eval` entries feed the
//! tallies; every other entry type is counted and ignored, and lines that
//! are not JSON objects are counted as skipped.

use serde::Deserialize;
use vigil_model::{JobStatistics, Tally};

#[derive(Debug, Deserialize)]
struct EvalEntry {
    probe: String,
    #[serde(default)]
    detector: Option<String>,
    passed: u64,
    total: u64,
}

/// Category of a unit name: its first dotted segment, ignoring a leading
/// `probes.` namespace.
pub fn unit_category(unit: &str) -> &str {
    let unit = unit.strip_prefix("probes.").unwrap_or(unit);
    unit.split('.').next().unwrap_or(unit)
}

fn strip_namespace<'a>(name: &'a str, namespace: &str) -> &'a str {
    name.strip_prefix(namespace).unwrap_or(name)
}

pub fn parse_report(bytes: &[u8]) -> JobStatistics {
    let mut stats = JobStatistics::default();

    for line in bytes.split(|b| *b == b'\n') {
        let line = line.trim_ascii();
        if line.is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_slice::<serde_json::Value>(line) else {
            stats.skipped_lines += 1;
            continue;
        };
        let Some(entry_type) = value.get("entry_type").and_then(|v| v.as_str())
        else {
            stats.skipped_lines += 1;
            continue;
        };
        if entry_type != "eval" {
            stats.other_entries += 1;
            continue;
        }
        let Ok(entry) = serde_json::from_value::<EvalEntry>(value) else {
            stats.skipped_lines += 1;
            continue;
        };

        let unit = strip_namespace(&entry.probe, "probes.").to_string();
        let category = unit_category(&unit).to_string();
        let detector = entry
            .detector
            .as_deref()
            .map(|d| strip_namespace(d, "detectors.").to_string())
            .unwrap_or_else(|| "unknown".to_string());

        stats.eval_entries += 1;
        stats.totals.record(entry.passed, entry.total);
        stats
            .units
            .entry(unit)
            .or_insert_with(Tally::default)
            .record(entry.passed, entry.total);
        stats
            .categories
            .entry(category)
            .or_insert_with(Tally::default)
            .record(entry.passed, entry.total);
        stats
            .detectors
            .entry(detector)
            .or_insert_with(Tally::default)
            .record(entry.passed, entry.total);
    }

    stats.pass_rate = stats.totals.pass_rate();
    stats
}
