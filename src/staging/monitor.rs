use std::io::IsTerminal;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use tracing::info;

use super::execution::StageExecution;

/// Observer of stage executions. Purely observational.
pub trait ExecutionMonitor: Send + Sync {
    /// A stage is about to start its workers.
    fn start(&self, _execution: &StageExecution) {}
    /// Periodic callback while the stage runs.
    fn check(&self, _execution: &StageExecution) {}
    /// The stage finished, successfully or not.
    fn end(&self, _execution: &StageExecution, _elapsed: Duration) {}
    /// The whole import finished.
    fn done(&self, _successful: bool, _total: Duration, _summary: &str) {}
}

/// Monitor that ignores everything.
#[derive(Default)]
pub struct SilentMonitor;

impl ExecutionMonitor for SilentMonitor {}

/// Monitor that emits `tracing` events, throttled to one progress line per interval.
pub struct LoggingMonitor {
    interval: Duration,
    last: Mutex<Instant>,
}

impl LoggingMonitor {
    /// Logs progress at most once per `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(Instant::now()),
        }
    }
}

impl Default for LoggingMonitor {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl ExecutionMonitor for LoggingMonitor {
    fn start(&self, execution: &StageExecution) {
        *self.last.lock() = Instant::now();
        info!(stage = execution.stage_name(), "monitor.stage.start");
    }

    fn check(&self, execution: &StageExecution) {
        let mut last = self.last.lock();
        if last.elapsed() < self.interval {
            return;
        }
        *last = Instant::now();
        let busiest = execution
            .step_snapshots()
            .into_iter()
            .max_by_key(|s| s.busy_ms / s.workers.max(1) as u64)
            .map(|s| s.name)
            .unwrap_or_default();
        info!(
            stage = execution.stage_name(),
            items = execution.produced_items(),
            elapsed_ms = execution.elapsed().as_millis() as u64,
            bottleneck = %busiest,
            "monitor.stage.progress"
        );
    }

    fn end(&self, execution: &StageExecution, elapsed: Duration) {
        info!(
            stage = execution.stage_name(),
            items = execution.produced_items(),
            elapsed_ms = elapsed.as_millis() as u64,
            healthy = execution.is_healthy(),
            "monitor.stage.end"
        );
    }

    fn done(&self, successful: bool, total: Duration, summary: &str) {
        info!(
            successful,
            total_ms = total.as_millis() as u64,
            summary,
            "monitor.import.done"
        );
    }
}

/// Terminal spinner per stage, for interactive runs.
pub struct ProgressMonitor {
    bar: Mutex<Option<ProgressBar>>,
    style: ProgressStyle,
    enabled: bool,
}

impl ProgressMonitor {
    /// Creates a monitor that draws only when stderr is a terminal.
    pub fn new() -> Self {
        let style = ProgressStyle::with_template("{prefix} {spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏");
        Self {
            bar: Mutex::new(None),
            style,
            enabled: std::io::stderr().is_terminal(),
        }
    }
}

impl Default for ProgressMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionMonitor for ProgressMonitor {
    fn start(&self, execution: &StageExecution) {
        if !self.enabled {
            return;
        }
        let bar = ProgressBar::new_spinner();
        bar.set_style(self.style.clone());
        bar.set_prefix(execution.stage_name().to_owned());
        bar.enable_steady_tick(Duration::from_millis(120));
        *self.bar.lock() = Some(bar);
    }

    fn check(&self, execution: &StageExecution) {
        if let Some(bar) = self.bar.lock().as_ref() {
            bar.set_message(format!(
                "{} items, {:.1}s",
                execution.produced_items(),
                execution.elapsed().as_secs_f64()
            ));
        }
    }

    fn end(&self, execution: &StageExecution, elapsed: Duration) {
        if let Some(bar) = self.bar.lock().take() {
            bar.finish_with_message(format!(
                "{} items in {:.2}s",
                execution.produced_items(),
                elapsed.as_secs_f64()
            ));
        }
    }

    fn done(&self, successful: bool, total: Duration, summary: &str) {
        if !self.enabled {
            return;
        }
        let outcome = if successful { "completed" } else { "failed" };
        eprintln!("import {outcome} in {:.2}s\n{summary}", total.as_secs_f64());
    }
}

/// Monitor that records the names of finished stages, for tests and embedding.
#[derive(Default)]
pub struct CapturingMonitor {
    stages: Mutex<Vec<(String, bool)>>,
    done: Mutex<Option<bool>>,
}

impl CapturingMonitor {
    /// Finished stages with their health, in order.
    pub fn stages(&self) -> Vec<(String, bool)> {
        self.stages.lock().clone()
    }

    /// Outcome passed to [`ExecutionMonitor::done`], if called.
    pub fn outcome(&self) -> Option<bool> {
        *self.done.lock()
    }
}

impl ExecutionMonitor for CapturingMonitor {
    fn end(&self, execution: &StageExecution, _elapsed: Duration) {
        self.stages
            .lock()
            .push((execution.stage_name().to_owned(), execution.is_healthy()));
    }

    fn done(&self, successful: bool, _total: Duration, _summary: &str) {
        *self.done.lock() = Some(successful);
    }
}
