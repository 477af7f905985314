use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::monitoring::dashboard::spawn_progress_task;
use crate::monitoring::metrics::RunMetrics;
use crate::utils::time::format_duration;

use super::{RunContext, Runnable, UnitResult, DATASET_ROOT_ENV, OUTPUT_DIR_ENV};

/// Last lines of a unit's stderr worth putting in a log record.
const STDERR_TAIL_LINES: usize = 5;

/// Executes units as child processes. Cloning is cheap; clones share metrics.
#[derive(Clone)]
pub struct BatchRunner {
    ctx: RunContext,
    metrics: RunMetrics,
    progress_interval: Option<Duration>,
}

impl BatchRunner {
    pub fn new(ctx: RunContext) -> Self {
        Self {
            ctx,
            metrics: RunMetrics::new(),
            progress_interval: None,
        }
    }

    /// Log a progress record every `period` while `run_many` is in flight.
    pub fn with_progress_interval(mut self, period: Option<Duration>) -> Self {
        self.progress_interval = period.filter(|p| !p.is_zero());
        self
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn metrics(&self) -> &RunMetrics {
        &self.metrics
    }

    /// Run a single unit to completion and record its outcome.
    ///
    /// Never fails: anything that goes wrong, including a failure to start the
    /// process, is reported through the returned record.
    pub async fn run_one(&self, unit: &dyn Runnable) -> UnitResult {
        let name = unit.name().to_string();
        let started = Instant::now();

        if let Err(e) = tokio::fs::create_dir_all(&self.ctx.output_dir).await {
            return UnitResult::fault(
                name,
                started.elapsed(),
                format!(
                    "failed to create output directory {}: {e}",
                    self.ctx.output_dir.display()
                ),
            );
        }

        let mut cmd = unit.command(&self.ctx);
        cmd.current_dir(&self.ctx.working_dir)
            .env(DATASET_ROOT_ENV, &self.ctx.dataset_root)
            .env(OUTPUT_DIR_ENV, &self.ctx.output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        self.metrics.record_started(&name);

        let result = match cmd.spawn() {
            Err(e) => UnitResult::fault(
                name,
                started.elapsed(),
                format!("failed to start analysis: {e}"),
            ),
            Ok(child) => match child.wait_with_output().await {
                Ok(output) => UnitResult {
                    name,
                    succeeded: output.status.success(),
                    exit_code: output.status.code(),
                    duration: started.elapsed(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                },
                Err(e) => UnitResult::fault(
                    name,
                    started.elapsed(),
                    format!("failed to collect analysis output: {e}"),
                ),
            },
        };

        let elapsed_ms = u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX);
        self.metrics
            .record_finished(&result.name, result.succeeded, elapsed_ms);

        if result.succeeded {
            debug!(
                target: "runner",
                unit = %result.name,
                elapsed = %format_duration(result.duration),
                "analysis succeeded"
            );
        } else {
            warn!(
                target: "runner",
                unit = %result.name,
                exit_code = ?result.exit_code,
                elapsed = %format_duration(result.duration),
                stderr_tail = %stderr_tail(&result.stderr),
                "analysis failed"
            );
        }

        result
    }

    /// Run every unit, at most `concurrency_limit` at a time, and wait for all of them.
    ///
    /// Returns one record per unit, sorted by name, regardless of individual failures.
    pub async fn run_many(
        &self,
        units: Vec<Arc<dyn Runnable>>,
        concurrency_limit: usize,
    ) -> Vec<UnitResult> {
        let limit = concurrency_limit.max(1);
        let names: Vec<String> = units.iter().map(|u| u.name().to_string()).collect();

        info!(
            target: "runner",
            units = units.len(),
            concurrency = limit,
            "starting batch"
        );
        self.metrics.record_scheduled(&names);

        let progress = self
            .progress_interval
            .map(|period| spawn_progress_task(self.metrics.clone(), period));

        // Semaphore permits are granted in FIFO order, so waiting units are
        // started in submission order as slots free up.
        let slots = Arc::new(Semaphore::new(limit));
        let mut tasks = JoinSet::new();

        for (idx, unit) in units.into_iter().enumerate() {
            let runner = self.clone();
            let slots = Arc::clone(&slots);
            tasks.spawn(async move {
                let _permit = match slots.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return (
                            idx,
                            UnitResult::fault(unit.name(), Duration::ZERO, "scheduler closed"),
                        )
                    }
                };
                let started = Instant::now();
                let result = AssertUnwindSafe(runner.run_one(unit.as_ref()))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        UnitResult::fault(
                            unit.name(),
                            started.elapsed(),
                            format!("runner panicked: {}", panic_message(panic.as_ref())),
                        )
                    });
                (idx, result)
            });
        }

        let mut finished: Vec<Option<UnitResult>> = vec![None; names.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, result)) => finished[idx] = Some(result),
                Err(e) => error!(target: "runner", error = %e, "unit task did not complete"),
            }
        }

        if let Some(handle) = progress {
            handle.abort();
        }

        let mut results: Vec<UnitResult> = finished
            .into_iter()
            .zip(names)
            .map(|(slot, name)| {
                slot.unwrap_or_else(|| {
                    UnitResult::fault(name, Duration::ZERO, "unit task did not complete")
                })
            })
            .collect();
        results.sort_by(|a, b| a.name.cmp(&b.name));

        info!(
            target: "runner",
            units = results.len(),
            failed = results.iter().filter(|r| !r.succeeded).count(),
            peak_in_flight = self.metrics.peak_in_flight(),
            "batch finished"
        );

        results
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stderr_tail_keeps_last_lines() {
        let stderr = "1\n2\n3\n4\n5\n6\n7";
        assert_eq!(stderr_tail(stderr), "3 | 4 | 5 | 6 | 7");
        assert_eq!(stderr_tail(""), "");
    }

    #[test]
    fn panic_message_reads_payloads() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
