use crate::types::Result;

/// Unit of transfer between steps.
#[derive(Debug)]
pub struct Batch<T> {
    /// Sequence number assigned by the producer.
    pub ticket: u64,
    /// Items of the batch.
    pub items: Vec<T>,
}

/// First step of a stage: turns a source into a stream of batches.
pub trait Producer<T>: Send {
    /// Fills `buffer` (empty, possibly recycled) with the next items.
    ///
    /// Returns `None` when the source is exhausted.
    fn next_batch(&mut self, buffer: Vec<T>) -> Result<Option<Vec<T>>>;
}

/// Middle step of a stage: transforms batches in place.
pub trait Processor<T>: Send + Sync {
    /// Processes one batch on behalf of worker `worker`.
    fn process(&self, worker: usize, batch: &mut Batch<T>) -> Result<()>;
}

/// Last step of a stage: consumes batches.
pub trait Sink<T>: Send + Sync {
    /// Consumes one batch on behalf of worker `worker`.
    fn consume(&self, worker: usize, batch: &Batch<T>) -> Result<()>;
}

impl<T, F> Sink<T> for F
where
    F: Fn(usize, &Batch<T>) -> Result<()> + Send + Sync,
{
    fn consume(&self, worker: usize, batch: &Batch<T>) -> Result<()> {
        self(worker, batch)
    }
}

/// One step of a stage.
pub enum Step<'a, T> {
    /// Source of batches; always the first step.
    Producer {
        /// Step name.
        name: String,
        /// Batch source.
        producer: Box<dyn Producer<T> + 'a>,
    },
    /// Transformation; zero or more between producer and sink.
    Processor {
        /// Step name.
        name: String,
        /// Transformation.
        processor: Box<dyn Processor<T> + 'a>,
        /// Worker threads.
        workers: usize,
        /// Whether output must follow ticket order.
        ordered: bool,
    },
    /// Consumer of batches; always the last step.
    Sink {
        /// Step name.
        name: String,
        /// Batch consumer.
        sink: Box<dyn Sink<T> + 'a>,
        /// Worker threads.
        workers: usize,
    },
}

impl<'a, T> Step<'a, T> {
    /// Producer step.
    pub fn producer(name: impl Into<String>, producer: impl Producer<T> + 'a) -> Self {
        Step::Producer {
            name: name.into(),
            producer: Box::new(producer),
        }
    }

    /// Single-worker processor step.
    pub fn processor(name: impl Into<String>, processor: impl Processor<T> + 'a) -> Self {
        Step::Processor {
            name: name.into(),
            processor: Box::new(processor),
            workers: 1,
            ordered: false,
        }
    }

    /// Single-worker sink step.
    pub fn sink(name: impl Into<String>, sink: impl Sink<T> + 'a) -> Self {
        Step::Sink {
            name: name.into(),
            sink: Box::new(sink),
            workers: 1,
        }
    }

    /// Sets the worker count of a processor or sink.
    pub fn with_workers(mut self, n: usize) -> Self {
        match &mut self {
            Step::Processor { workers, .. } | Step::Sink { workers, .. } => *workers = n.max(1),
            Step::Producer { .. } => {}
        }
        self
    }

    /// Makes a processor emit batches in ticket order.
    pub fn in_order(mut self) -> Self {
        if let Step::Processor { ordered, .. } = &mut self {
            *ordered = true;
        }
        self
    }

    /// Step name.
    pub fn name(&self) -> &str {
        match self {
            Step::Producer { name, .. } | Step::Processor { name, .. } | Step::Sink { name, .. } => {
                name
            }
        }
    }

    /// Worker threads of the step.
    pub fn workers(&self) -> usize {
        match self {
            Step::Producer { .. } => 1,
            Step::Processor { workers, .. } | Step::Sink { workers, .. } => *workers,
        }
    }
}
