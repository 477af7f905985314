use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::utils::time::{format_duration, rfc3339_millis};

use super::{UnitResult, UnitState};

/// File name of the JSON report written into the output directory.
pub const REPORT_FILE_NAME: &str = "run_report.json";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchStatus {
    Success,
    Failure,
}

impl BatchStatus {
    pub fn exit_code(self) -> u8 {
        match self {
            BatchStatus::Success => 0,
            BatchStatus::Failure => 1,
        }
    }
}

/// Results partitioned by outcome. Names are sorted, so the partition does not
/// depend on completion order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
}

impl Summary {
    pub fn from_results(results: &[UnitResult]) -> Self {
        let mut summary = Summary::default();
        for r in results {
            if r.succeeded {
                summary.succeeded.push(r.name.clone());
            } else {
                summary.failed.push(r.name.clone());
            }
        }
        summary.succeeded.sort();
        summary.failed.sort();
        summary
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn status(&self) -> BatchStatus {
        if self.failed.is_empty() {
            BatchStatus::Success
        } else {
            BatchStatus::Failure
        }
    }

    pub fn write_tally<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(
            out,
            "{} succeeded, {} failed ({} total)",
            self.succeeded.len(),
            self.failed.len(),
            self.total()
        )?;
        if !self.failed.is_empty() {
            writeln!(out, "failed:")?;
            for name in &self.failed {
                writeln!(out, "  - {name}")?;
            }
        }
        Ok(())
    }
}

/// Partition `results`, print the per-unit lines and the tally to `out`, and
/// return the overall status: success only if every unit succeeded.
pub fn summarize<W: Write>(results: &[UnitResult], out: &mut W) -> io::Result<BatchStatus> {
    let mut sorted: Vec<&UnitResult> = results.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    for r in sorted {
        let mark = if r.succeeded { "ok  " } else { "FAIL" };
        writeln!(
            out,
            "[{mark}] {} ({})",
            r.name,
            format_duration(r.duration)
        )?;
    }

    let summary = Summary::from_results(results);
    summary.write_tally(out)?;
    Ok(summary.status())
}

#[derive(Debug, Serialize)]
pub struct UnitReport {
    pub name: String,
    pub state: UnitState,
    pub exit_code: Option<i32>,
    pub duration_secs: f64,
}

/// Machine-readable record of one batch.
#[derive(Debug, Serialize)]
pub struct BatchReport {
    pub run_id: Uuid,
    pub started_at: String,
    pub finished_at: String,
    pub concurrency: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub peak_in_flight: usize,
    pub units: Vec<UnitReport>,
}

impl BatchReport {
    pub fn new(
        results: &[UnitResult],
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        concurrency: usize,
        peak_in_flight: usize,
    ) -> Self {
        let summary = Summary::from_results(results);
        let mut units: Vec<UnitReport> = results
            .iter()
            .map(|r| UnitReport {
                name: r.name.clone(),
                state: r.state(),
                exit_code: r.exit_code,
                duration_secs: r.duration.as_secs_f64(),
            })
            .collect();
        units.sort_by(|a, b| a.name.cmp(&b.name));

        Self {
            run_id: Uuid::new_v4(),
            started_at: rfc3339_millis(started_at),
            finished_at: rfc3339_millis(finished_at),
            concurrency,
            succeeded: summary.succeeded.len(),
            failed: summary.failed.len(),
            peak_in_flight,
            units,
        }
    }

    /// Write the report as pretty JSON into `output_dir`, creating it if needed,
    /// and return the file path.
    pub fn write_to(&self, output_dir: &Path) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(output_dir)
            .with_context(|| format!("creating {}", output_dir.display()))?;
        let path = output_dir.join(REPORT_FILE_NAME);
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }

    pub fn log(&self) {
        let payload = serde_json::json!({
            "event": "batch_summary",
            "run_id": self.run_id,
            "started_at": self.started_at,
            "finished_at": self.finished_at,
            "concurrency": self.concurrency,
            "succeeded": self.succeeded,
            "failed": self.failed,
            "peak_in_flight": self.peak_in_flight,
        });
        info!(target: "runner", "{payload}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn result(name: &str, succeeded: bool) -> UnitResult {
        UnitResult {
            name: name.to_string(),
            succeeded,
            exit_code: Some(if succeeded { 0 } else { 1 }),
            duration: Duration::from_millis(120),
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    #[test]
    fn failure_if_any_unit_failed() {
        let results = vec![result("A", true), result("B", false)];
        let mut out = Vec::new();
        let status = summarize(&results, &mut out).unwrap();
        let printed = String::from_utf8(out).unwrap();

        assert_eq!(status, BatchStatus::Failure);
        assert_eq!(status.exit_code(), 1);
        assert!(printed.contains("1 succeeded, 1 failed (2 total)"));
        assert!(printed.contains("failed:\n  - B\n"));
        assert!(!printed.contains("  - A"));
    }

    #[test]
    fn success_when_all_succeeded() {
        let results = vec![result("b", true), result("a", true)];
        let mut out = Vec::new();
        assert_eq!(summarize(&results, &mut out).unwrap(), BatchStatus::Success);
        let printed = String::from_utf8(out).unwrap();
        assert!(printed.starts_with("[ok  ] a (120ms)\n[ok  ] b (120ms)\n"));
        assert!(!printed.contains("failed:"));
    }

    #[test]
    fn empty_batch_is_success() {
        let mut out = Vec::new();
        assert_eq!(summarize(&[], &mut out).unwrap(), BatchStatus::Success);
    }

    #[test]
    fn summary_is_order_independent() {
        let forward = vec![result("x", false), result("y", true), result("z", false)];
        let mut backward = forward.clone();
        backward.reverse();
        assert_eq!(
            Summary::from_results(&forward),
            Summary::from_results(&backward)
        );
    }

    #[test]
    fn report_counts_outcomes() {
        let results = vec![result("a", true), result("b", false), result("c", true)];
        let now = Utc::now();
        let report = BatchReport::new(&results, now, now, 2, 2);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.units.len(), 3);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["units"][1]["name"], "b");
        assert_eq!(json["units"][1]["state"], "failed");
    }

    #[test]
    fn report_creates_missing_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let output_dir = dir.path().join("output/nested");
        let now = Utc::now();

        let path = BatchReport::new(&[], now, now, 1, 0)
            .write_to(&output_dir)
            .unwrap();
        assert_eq!(path, output_dir.join(REPORT_FILE_NAME));

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["succeeded"], 0);
        assert_eq!(written["units"].as_array().unwrap().len(), 0);
    }
}
