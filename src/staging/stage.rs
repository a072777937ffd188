use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use super::execution::{StageExecution, StepSnapshot};
use super::monitor::ExecutionMonitor;
use super::step::{Batch, Processor, Producer, Sink, Step};
use crate::types::{ImportError, Result};

/// Sizing of stage queues, batches and worker pools.
#[derive(Clone, Copy, Debug)]
pub struct StageConfig {
    /// Items per batch for producers that do not dictate their own size.
    pub batch_size: usize,
    /// Capacity of each queue between two steps.
    pub queue_size: usize,
    /// Upper bound of worker threads per step.
    pub max_processors: usize,
    /// Interval at which the coordinating thread checks progress and health.
    pub check_interval: Duration,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            queue_size: 16,
            max_processors: thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            check_interval: Duration::from_millis(50),
        }
    }
}

/// Outcome of a successful stage.
#[derive(Clone, Debug, Serialize)]
pub struct StageSummary {
    /// Stage name.
    pub name: String,
    /// Wall time of the stage.
    pub elapsed_ms: u64,
    /// Final step counters.
    pub steps: Vec<StepSnapshot>,
}

/// Ordered list of steps connected by bounded queues.
pub struct Stage<'a, T> {
    name: String,
    config: StageConfig,
    steps: Vec<Step<'a, T>>,
}

struct Reorder<T> {
    next: u64,
    pending: BTreeMap<u64, Batch<T>>,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_owned()
    }
}

fn run_worker(execution: &StageExecution, step: usize, body: impl FnOnce() -> Result<()>) {
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => execution.fail(step, err),
        Err(payload) => {
            let message = format!("panicked: {}", panic_message(payload.as_ref()));
            let err = ImportError::StepFailed {
                stage: execution.stage_name().to_owned(),
                step: execution.step(step).snapshot().name,
                message,
            };
            execution.fail(step, err);
        }
    }
    execution.worker_finished();
}

fn produce_loop<T>(
    execution: &StageExecution,
    producer: &mut (dyn Producer<T> + '_),
    batch_size: usize,
    out: Sender<Batch<T>>,
    recycled: Receiver<Vec<T>>,
) -> Result<()> {
    let mut ticket = 0u64;
    while execution.is_healthy() {
        let buffer = match recycled.try_recv() {
            Ok(mut buffer) => {
                buffer.clear();
                buffer
            }
            Err(_) => Vec::with_capacity(batch_size),
        };
        let started = Instant::now();
        let Some(items) = producer.next_batch(buffer)? else {
            break;
        };
        execution.step(0).record(items.len(), started.elapsed());
        if items.is_empty() {
            continue;
        }
        if out.send(Batch { ticket, items }).is_err() {
            break;
        }
        ticket += 1;
    }
    Ok(())
}

fn process_loop<T>(
    execution: &StageExecution,
    index: usize,
    processor: &dyn Processor<T>,
    worker: usize,
    input: Receiver<Batch<T>>,
    out: Sender<Batch<T>>,
    reorder: Option<&Mutex<Reorder<T>>>,
) -> Result<()> {
    for mut batch in input.iter() {
        if !execution.is_healthy() {
            break;
        }
        let started = Instant::now();
        let len = batch.items.len();
        processor.process(worker, &mut batch)?;
        execution.step(index).record(len, started.elapsed());
        match reorder {
            Some(reorder) => {
                let mut guard = reorder.lock();
                guard.pending.insert(batch.ticket, batch);
                loop {
                    let next = guard.next;
                    let Some(ready) = guard.pending.remove(&next) else {
                        break;
                    };
                    guard.next += 1;
                    if out.send(ready).is_err() {
                        return Ok(());
                    }
                }
            }
            None => {
                if out.send(batch).is_err() {
                    break;
                }
            }
        }
    }
    Ok(())
}

fn sink_loop<T>(
    execution: &StageExecution,
    index: usize,
    sink: &dyn Sink<T>,
    worker: usize,
    input: Receiver<Batch<T>>,
    recycle: Sender<Vec<T>>,
) -> Result<()> {
    for batch in input.iter() {
        if !execution.is_healthy() {
            break;
        }
        let started = Instant::now();
        sink.consume(worker, &batch)?;
        execution
            .step(index)
            .record(batch.items.len(), started.elapsed());
        let _ = recycle.try_send(batch.items);
    }
    Ok(())
}

impl<'a, T: Send + 'a> Stage<'a, T> {
    /// Creates an empty stage.
    pub fn new(name: impl Into<String>, config: StageConfig) -> Self {
        Self {
            name: name.into(),
            config,
            steps: Vec::new(),
        }
    }

    /// Appends a step.
    pub fn add(mut self, step: Step<'a, T>) -> Self {
        self.steps.push(step);
        self
    }

    /// Stage name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self) -> Result<()> {
        let last = self.steps.len().saturating_sub(1);
        if self.steps.len() < 2 {
            return Err(ImportError::invalid(format!(
                "stage {} needs a producer and a sink",
                self.name
            )));
        }
        for (i, step) in self.steps.iter().enumerate() {
            let ok = match step {
                Step::Producer { .. } => i == 0,
                Step::Processor { .. } => i > 0 && i < last,
                Step::Sink { .. } => i == last,
            };
            if !ok {
                return Err(ImportError::invalid(format!(
                    "step {} is misplaced in stage {}",
                    step.name(),
                    self.name
                )));
            }
        }
        Ok(())
    }

    /// Runs the stage to completion and surfaces the first step failure.
    ///
    /// The calling thread only supervises: it waits at the configured check
    /// interval and reports progress to `monitor` while pool threads do the work.
    pub fn execute(self, monitor: &dyn ExecutionMonitor) -> Result<StageSummary> {
        self.validate()?;
        let Stage {
            name,
            config,
            mut steps,
        } = self;
        let max_workers = config.max_processors.max(1);
        let layout: Vec<(String, usize)> = steps
            .iter()
            .map(|s| (s.name().to_owned(), s.workers().min(max_workers)))
            .collect();
        let execution = StageExecution::new(name.clone(), layout.clone());
        info!(stage = %name, steps = steps.len(), "import.stage.start");
        monitor.start(&execution);

        let queue_size = config.queue_size.max(1);
        let reorders: Vec<Option<Mutex<Reorder<T>>>> = steps
            .iter()
            .map(|s| match s {
                Step::Processor { ordered: true, .. } => Some(Mutex::new(Reorder {
                    next: 0,
                    pending: BTreeMap::new(),
                })),
                _ => None,
            })
            .collect();

        thread::scope(|scope| {
            let execution = &execution;
            let (recycle_tx, recycle_rx) = bounded::<Vec<T>>(queue_size);
            let links: Vec<(Sender<Batch<T>>, Receiver<Batch<T>>)> =
                (1..steps.len()).map(|_| bounded(queue_size)).collect();
            let mut unspawned = 0usize;
            for (index, step) in steps.iter_mut().enumerate() {
                let workers = layout[index].1;
                if unspawned > 0 {
                    unspawned += workers;
                    continue;
                }
                let thread_name = |worker: usize| format!("{name}-{index}-{worker}");
                let spawned = match step {
                    Step::Producer { producer, .. } => {
                        let out = links[index].0.clone();
                        let recycled = recycle_rx.clone();
                        let batch_size = config.batch_size;
                        let producer: &mut (dyn Producer<T> + 'a) = &mut **producer;
                        thread::Builder::new()
                            .name(thread_name(0))
                            .spawn_scoped(scope, move || {
                                run_worker(execution, index, || {
                                    produce_loop(execution, producer, batch_size, out, recycled)
                                })
                            })
                            .map(|_| 1)
                    }
                    Step::Processor { processor, .. } => {
                        let processor: &(dyn Processor<T> + 'a) = &**processor;
                        let reorder = reorders[index].as_ref();
                        let mut started = Ok(0);
                        for worker in 0..workers {
                            let input = links[index - 1].1.clone();
                            let out = links[index].0.clone();
                            let spawn = thread::Builder::new()
                                .name(thread_name(worker))
                                .spawn_scoped(scope, move || {
                                    run_worker(execution, index, || {
                                        process_loop(
                                            execution, index, processor, worker, input, out,
                                            reorder,
                                        )
                                    })
                                });
                            match spawn {
                                Ok(_) => started = started.map(|n| n + 1),
                                Err(err) => {
                                    unspawned += workers - worker;
                                    started = Err(err);
                                    break;
                                }
                            }
                        }
                        started
                    }
                    Step::Sink { sink, .. } => {
                        let sink: &(dyn Sink<T> + 'a) = &**sink;
                        let mut started = Ok(0);
                        for worker in 0..workers {
                            let input = links[index - 1].1.clone();
                            let recycle = recycle_tx.clone();
                            let spawn = thread::Builder::new()
                                .name(thread_name(worker))
                                .spawn_scoped(scope, move || {
                                    run_worker(execution, index, || {
                                        sink_loop(execution, index, sink, worker, input, recycle)
                                    })
                                });
                            match spawn {
                                Ok(_) => started = started.map(|n| n + 1),
                                Err(err) => {
                                    unspawned += workers - worker;
                                    started = Err(err);
                                    break;
                                }
                            }
                        }
                        started
                    }
                };
                if let Err(err) = spawned {
                    if unspawned == 0 {
                        unspawned = workers;
                    }
                    execution.fail(index, ImportError::Io(err));
                }
            }
            // Workers hold their own channel ends; dropping ours lets disconnects propagate.
            drop(links);
            drop(recycle_tx);
            drop(recycle_rx);
            for _ in 0..unspawned {
                execution.worker_finished();
            }
            while !execution.await_completion(config.check_interval) {
                monitor.check(execution);
            }
        });

        let elapsed = execution.elapsed();
        monitor.end(&execution, elapsed);
        execution.assert_healthy()?;
        let summary = StageSummary {
            name,
            elapsed_ms: elapsed.as_millis() as u64,
            steps: execution.step_snapshots(),
        };
        debug!(stage = %summary.name, elapsed_ms = summary.elapsed_ms, "import.stage.end");
        Ok(summary)
    }
}
