use parking_lot::{Mutex, MutexGuard};

/// One accumulator per worker of a step, folded once the stage is done.
///
/// Worker `i` only ever touches slot `i`, so the locks are uncontended.
pub struct WorkerLocal<S> {
    slots: Vec<Mutex<S>>,
}

impl<S> WorkerLocal<S> {
    /// Creates `workers` slots with `init(worker)`.
    pub fn new(workers: usize, mut init: impl FnMut(usize) -> S) -> Self {
        Self {
            slots: (0..workers.max(1)).map(|w| Mutex::new(init(w))).collect(),
        }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true when there are no slots; never the case after [`WorkerLocal::new`].
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Locks the slot of `worker`.
    pub fn get(&self, worker: usize) -> MutexGuard<'_, S> {
        self.slots[worker % self.slots.len()].lock()
    }

    /// Consumes the accumulators.
    pub fn into_inner(self) -> Vec<S> {
        self.slots.into_iter().map(Mutex::into_inner).collect()
    }

    /// Folds all accumulators into one value.
    pub fn fold<A>(self, init: A, f: impl FnMut(A, S) -> A) -> A {
        self.into_inner().into_iter().fold(init, f)
    }
}
