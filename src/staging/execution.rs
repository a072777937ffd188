use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::error;

use crate::types::ImportError;

/// Live counters of one step.
pub struct StepStats {
    name: String,
    workers: usize,
    batches: AtomicU64,
    items: AtomicU64,
    busy_nanos: AtomicU64,
}

impl StepStats {
    fn new(name: String, workers: usize) -> Self {
        Self {
            name,
            workers,
            batches: AtomicU64::new(0),
            items: AtomicU64::new(0),
            busy_nanos: AtomicU64::new(0),
        }
    }

    pub(crate) fn record(&self, items: usize, busy: Duration) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.items.fetch_add(items as u64, Ordering::Relaxed);
        self.busy_nanos
            .fetch_add(busy.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> StepSnapshot {
        let batches = self.batches.load(Ordering::Relaxed);
        let busy_nanos = self.busy_nanos.load(Ordering::Relaxed);
        StepSnapshot {
            name: self.name.clone(),
            workers: self.workers,
            batches,
            items: self.items.load(Ordering::Relaxed),
            busy_ms: busy_nanos / 1_000_000,
            avg_batch_latency_us: if batches == 0 {
                0
            } else {
                busy_nanos / batches / 1_000
            },
        }
    }
}

/// Counters of one step at a point in time.
#[derive(Clone, Debug, Serialize)]
pub struct StepSnapshot {
    /// Step name.
    pub name: String,
    /// Worker threads.
    pub workers: usize,
    /// Batches processed.
    pub batches: u64,
    /// Items processed.
    pub items: u64,
    /// Total processing time across workers.
    pub busy_ms: u64,
    /// Average processing time per batch.
    pub avg_batch_latency_us: u64,
}

/// Shared state of a running stage: health, first failure and step counters.
pub struct StageExecution {
    stage: String,
    started: Instant,
    steps: Vec<StepStats>,
    panicked: AtomicBool,
    failure: Mutex<Option<ImportError>>,
    finished: Mutex<usize>,
    all_finished: Condvar,
    total_workers: usize,
}

impl StageExecution {
    pub(crate) fn new(stage: String, steps: Vec<(String, usize)>) -> Self {
        let total_workers = steps.iter().map(|(_, w)| *w).sum();
        Self {
            stage,
            started: Instant::now(),
            steps: steps
                .into_iter()
                .map(|(name, workers)| StepStats::new(name, workers))
                .collect(),
            panicked: AtomicBool::new(false),
            failure: Mutex::new(None),
            finished: Mutex::new(0),
            all_finished: Condvar::new(),
            total_workers,
        }
    }

    /// Stage name.
    pub fn stage_name(&self) -> &str {
        &self.stage
    }

    /// Time since the stage started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// False once any step failed.
    pub fn is_healthy(&self) -> bool {
        !self.panicked.load(Ordering::Acquire)
    }

    /// Counters of every step, in step order.
    pub fn step_snapshots(&self) -> Vec<StepSnapshot> {
        self.steps.iter().map(StepStats::snapshot).collect()
    }

    /// Items emitted by the producer so far.
    pub fn produced_items(&self) -> u64 {
        self.steps
            .first()
            .map(|s| s.items.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub(crate) fn step(&self, index: usize) -> &StepStats {
        &self.steps[index]
    }

    /// Records `err` as the failure of step `index` and tells every worker to stop.
    ///
    /// Only the first failure is kept.
    pub(crate) fn fail(&self, index: usize, err: ImportError) {
        let step = &self.steps[index].name;
        error!(stage = %self.stage, step = %step, error = %err, "stage.step.failed");
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(err);
        }
        self.panicked.store(true, Ordering::Release);
    }

    pub(crate) fn worker_finished(&self) {
        let mut finished = self.finished.lock();
        *finished += 1;
        if *finished >= self.total_workers {
            self.all_finished.notify_all();
        }
    }

    /// Waits up to `timeout` for every worker to finish.
    pub(crate) fn await_completion(&self, timeout: Duration) -> bool {
        let mut finished = self.finished.lock();
        if *finished >= self.total_workers {
            return true;
        }
        self.all_finished.wait_for(&mut finished, timeout);
        *finished >= self.total_workers
    }

    /// Removes and returns the first recorded failure.
    pub fn take_failure(&self) -> Option<ImportError> {
        self.failure.lock().take()
    }

    /// Surfaces the first recorded failure as an error.
    pub fn assert_healthy(&self) -> crate::types::Result<()> {
        match self.take_failure() {
            Some(err) => Err(err),
            None if !self.is_healthy() => Err(ImportError::StepFailed {
                stage: self.stage.clone(),
                step: "unknown".into(),
                message: "stage marked unhealthy".into(),
            }),
            None => Ok(()),
        }
    }
}
