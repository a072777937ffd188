//! Staged, parallel batch processing.
//!
//! A [`Stage`] is an ordered list of [`Step`]s: one producer, any number of
//! processors and one sink, connected by bounded queues. Producers block when a
//! queue is full, so queue capacity bounds the batches in flight. A failing or
//! panicking step marks the [`StageExecution`] unhealthy, every other worker
//! stops at its next batch, and [`Stage::execute`] returns the first failure.

mod execution;
mod monitor;
mod stage;
mod step;
mod worker_local;

pub use execution::{StageExecution, StepSnapshot, StepStats};
pub use monitor::{CapturingMonitor, ExecutionMonitor, LoggingMonitor, ProgressMonitor, SilentMonitor};
pub use stage::{Stage, StageConfig, StageSummary};
pub use step::{Batch, Processor, Producer, Sink, Step};
pub use worker_local::WorkerLocal;

/// Producer over an in-memory list, handing out fixed-size batches.
pub struct VecProducer<T> {
    items: std::vec::IntoIter<T>,
    batch_size: usize,
}

impl<T> VecProducer<T> {
    /// Batches `items` in chunks of `batch_size`.
    pub fn new(items: Vec<T>, batch_size: usize) -> Self {
        Self {
            items: items.into_iter(),
            batch_size: batch_size.max(1),
        }
    }
}

impl<T: Send> Producer<T> for VecProducer<T> {
    fn next_batch(&mut self, mut buffer: Vec<T>) -> crate::types::Result<Option<Vec<T>>> {
        buffer.extend(self.items.by_ref().take(self.batch_size));
        Ok((!buffer.is_empty()).then_some(buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ImportError, Result};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::thread;
    use std::time::Duration;

    fn config(workers: usize) -> StageConfig {
        StageConfig {
            batch_size: 8,
            queue_size: 2,
            max_processors: workers,
            check_interval: Duration::from_millis(5),
        }
    }

    struct Jitter;

    impl Processor<u64> for Jitter {
        fn process(&self, _worker: usize, batch: &mut Batch<u64>) -> Result<()> {
            if batch.ticket % 3 == 0 {
                thread::sleep(Duration::from_millis(3));
            }
            for item in batch.items.iter_mut() {
                *item *= 2;
            }
            Ok(())
        }
    }

    #[test]
    fn ordered_processor_emits_in_ticket_order() -> Result<()> {
        let seen = Mutex::new(Vec::new());
        let stage = Stage::new("ordered", config(4))
            .add(Step::producer("source", VecProducer::new((0..200).collect(), 8)))
            .add(Step::processor("double", Jitter).with_workers(4).in_order())
            .add(Step::sink("collect", |_w: usize, batch: &Batch<u64>| {
                seen.lock().push(batch.ticket);
                Ok(())
            }));
        let summary = stage.execute(&SilentMonitor)?;
        let tickets = seen.into_inner();
        assert_eq!(tickets, (0..25).collect::<Vec<_>>());
        assert_eq!(summary.steps[0].items, 200);
        assert_eq!(summary.steps[2].batches, 25);
        Ok(())
    }

    #[test]
    fn parallel_sink_sees_every_item_once() -> Result<()> {
        let sum = AtomicU64::new(0);
        let locals = WorkerLocal::new(3, |_| 0u64);
        Stage::new("sum", config(3))
            .add(Step::producer("source", VecProducer::new((1..=1000).collect(), 16)))
            .add(
                Step::sink("add", |worker: usize, batch: &Batch<u64>| {
                    let local: u64 = batch.items.iter().sum();
                    sum.fetch_add(local, Ordering::Relaxed);
                    *locals.get(worker) += batch.items.len() as u64;
                    Ok(())
                })
                .with_workers(3),
            )
            .execute(&SilentMonitor)?;
        assert_eq!(sum.load(Ordering::Relaxed), 500_500);
        assert_eq!(locals.fold(0, |acc, n| acc + n), 1000);
        Ok(())
    }

    #[test]
    fn failing_step_aborts_the_stage_with_its_error() {
        let consumed = AtomicU64::new(0);
        let monitor = CapturingMonitor::default();
        let err = Stage::new("failing", config(2))
            .add(Step::producer("source", VecProducer::new((0..10_000).collect(), 8)))
            .add(
                Step::sink("explode", |_w: usize, batch: &Batch<u64>| {
                    consumed.fetch_add(1, Ordering::Relaxed);
                    if batch.ticket == 3 {
                        return Err(ImportError::corruption("bad batch"));
                    }
                    Ok(())
                })
                .with_workers(2),
            )
            .execute(&monitor)
            .unwrap_err();
        assert!(matches!(err, ImportError::Corruption(msg) if msg == "bad batch"));
        assert!(consumed.load(Ordering::Relaxed) < 1250);
        assert_eq!(monitor.stages(), vec![("failing".to_owned(), false)]);
    }

    #[test]
    fn panicking_step_is_reported_as_step_failure() {
        let err = Stage::new("panicky", config(1))
            .add(Step::producer("source", VecProducer::new(vec![1u64, 2, 3], 1)))
            .add(Step::sink("boom", |_w: usize, batch: &Batch<u64>| {
                if batch.items[0] == 2 {
                    panic!("kaboom");
                }
                Ok(())
            }))
            .execute(&SilentMonitor)
            .unwrap_err();
        match err {
            ImportError::StepFailed { stage, step, message } => {
                assert_eq!(stage, "panicky");
                assert_eq!(step, "boom");
                assert!(message.contains("kaboom"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn misplaced_steps_are_rejected() {
        let result = Stage::new("broken", config(1))
            .add(Step::sink("sink", |_w: usize, _b: &Batch<u64>| Ok(())))
            .add(Step::producer("source", VecProducer::new(vec![1u64], 1)))
            .execute(&SilentMonitor);
        assert!(matches!(result, Err(ImportError::Invalid(_))));
    }
}
