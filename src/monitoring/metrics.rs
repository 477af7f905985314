use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::{info, warn};

use crate::runner::UnitState;

#[derive(Default)]
struct MetricsInner {
    scheduled: AtomicUsize,
    started: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    busy_millis: AtomicU64,
    states: Mutex<BTreeMap<String, UnitState>>,
}

/// Per-batch counters backed by atomics so the handle can be cloned into every unit task.
#[derive(Clone, Default)]
pub struct RunMetrics {
    inner: Arc<MetricsInner>,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn states(&self) -> MutexGuard<'_, BTreeMap<String, UnitState>> {
        self.inner
            .states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Move `unit` to `next`. Terminal states are final.
    fn transition(&self, unit: &str, next: UnitState) {
        let mut states = self.states();
        match states.get(unit) {
            Some(current) if current.is_terminal() => {
                warn!(
                    target: "metrics",
                    unit = %unit,
                    state = %current,
                    next = %next,
                    "ignoring transition out of a terminal state"
                );
            }
            _ => {
                states.insert(unit.to_string(), next);
            }
        }
    }

    /// Units queued for a batch; each starts out pending.
    pub fn record_scheduled(&self, units: &[String]) {
        self.inner.scheduled.fetch_add(units.len(), Ordering::Relaxed);
        let mut states = self.states();
        for unit in units {
            states.insert(unit.clone(), UnitState::Pending);
        }
    }

    /// A unit moved from pending to running.
    pub fn record_started(&self, unit: &str) {
        self.transition(unit, UnitState::Running);
        self.inner.started.fetch_add(1, Ordering::Relaxed);
        let now = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        info!(
            target: "metrics",
            event = "unit_started",
            unit = %unit,
            in_flight = now,
            "unit started"
        );
    }

    /// A unit reached a terminal state.
    pub fn record_finished(&self, unit: &str, succeeded: bool, elapsed_millis: u64) {
        self.transition(
            unit,
            if succeeded {
                UnitState::Succeeded
            } else {
                UnitState::Failed
            },
        );
        let counter = if succeeded {
            &self.inner.succeeded
        } else {
            &self.inner.failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.inner
            .busy_millis
            .fetch_add(elapsed_millis, Ordering::Relaxed);
        let now = self.inner.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;

        info!(
            target: "metrics",
            event = "unit_finished",
            unit = %unit,
            succeeded,
            elapsed_ms = elapsed_millis,
            in_flight = now,
            "unit finished"
        );
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Largest number of units observed running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.inner.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn unit_state(&self, unit: &str) -> Option<UnitState> {
        self.states().get(unit).copied()
    }

    /// Names of the units currently in `state`, sorted.
    pub fn units_in(&self, state: UnitState) -> Vec<String> {
        self.states()
            .iter()
            .filter(|(_, s)| **s == state)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let finished = self.inner.succeeded.load(Ordering::Relaxed)
            + self.inner.failed.load(Ordering::Relaxed);
        MetricsSnapshot {
            scheduled: self.inner.scheduled.load(Ordering::Relaxed),
            started: self.inner.started.load(Ordering::Relaxed),
            succeeded: self.inner.succeeded.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            pending: self
                .inner
                .scheduled
                .load(Ordering::Relaxed)
                .saturating_sub(self.inner.started.load(Ordering::Relaxed)),
            finished,
            in_flight: self.in_flight(),
            peak_in_flight: self.peak_in_flight(),
            busy_millis: self.inner.busy_millis.load(Ordering::Relaxed),
            running: self.units_in(UnitState::Running),
        }
    }
}

/// Serializable view of the batch counters.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub scheduled: usize,
    pub started: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub pending: usize,
    pub finished: usize,
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub busy_millis: u64,
    pub running: Vec<String>,
}

pub fn log_metrics_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        target: "metrics",
        event = "batch_progress",
        pending = snapshot.pending,
        in_flight = snapshot.in_flight,
        succeeded = snapshot.succeeded,
        failed = snapshot.failed,
        scheduled = snapshot.scheduled,
        running = ?snapshot.running,
        "batch progress"
    );
}
