use std::marker::PhantomData;
use std::sync::Arc;

use super::id_generator::IdGenerator;
use super::record::RecordFormat;
use crate::primitives::io::FileIo;
use crate::types::{ImportError, Result, RESERVED_ID};

/// Page size the stores are laid out in.
pub const PAGE_SIZE: usize = 8192;

/// Store of fixed-size records addressed by id.
///
/// Record `id` lives at byte offset `id * R::SIZE`. Writers on different ids may
/// run concurrently.
pub struct RecordStore<R: RecordFormat> {
    io: Arc<dyn FileIo>,
    ids: IdGenerator,
    _marker: PhantomData<fn() -> R>,
}

impl<R: RecordFormat> RecordStore<R> {
    /// Opens a store over `io`, deriving the high id from the file length.
    pub fn open(io: Arc<dyn FileIo>, max_id: u64) -> Result<Self> {
        let len = io.len()?;
        let high_id = len.div_ceil(R::SIZE as u64);
        Ok(Self {
            io,
            ids: IdGenerator::new(R::STORE, high_id, max_id),
            _marker: PhantomData,
        })
    }

    /// Store name.
    pub fn name(&self) -> &'static str {
        R::STORE
    }

    /// Records that fit in one page; the default id batch size.
    pub fn records_per_page(&self) -> usize {
        PAGE_SIZE / R::SIZE
    }

    /// Next never-used id.
    pub fn high_id(&self) -> u64 {
        self.ids.high_id()
    }

    /// Id generator of this store.
    pub fn id_generator(&self) -> &IdGenerator {
        &self.ids
    }

    /// Fresh, not-in-use record for `id`.
    pub fn new_record(&self, id: u64) -> R {
        R::new(id)
    }

    /// Validates that `record` may be written and accounts for its id.
    pub fn prepare_for_commit(&self, record: &R) -> Result<()> {
        let id = record.id();
        if id == RESERVED_ID || id > self.ids.max_id() {
            return Err(ImportError::invalid(format!(
                "{} record id {id} is not addressable",
                R::STORE
            )));
        }
        self.ids.mark_used(id);
        Ok(())
    }

    /// Reads record `id`. Ids past the end of the file read as not in use.
    pub fn get_record(&self, id: u64) -> Result<R> {
        let mut buf = vec![0u8; R::SIZE];
        self.io.read_at(id * R::SIZE as u64, &mut buf)?;
        R::decode(id, &buf)
    }

    /// Writes `record` at its id.
    pub fn update_record(&self, record: &R) -> Result<()> {
        self.prepare_for_commit(record)?;
        let mut buf = vec![0u8; R::SIZE];
        record.encode(&mut buf);
        self.io.write_at(record.id() * R::SIZE as u64, &buf)
    }

    /// Writes `records`, coalescing runs of consecutive ids into single writes.
    pub fn update_records(&self, records: &[R]) -> Result<()> {
        let mut run: Vec<u8> = Vec::new();
        let mut run_start = 0u64;
        let mut run_next = 0u64;
        for record in records {
            self.prepare_for_commit(record)?;
            if run.is_empty() || record.id() != run_next {
                if !run.is_empty() {
                    self.io.write_at(run_start * R::SIZE as u64, &run)?;
                    run.clear();
                }
                run_start = record.id();
            }
            let at = run.len();
            run.resize(at + R::SIZE, 0);
            record.encode(&mut run[at..]);
            run_next = record.id() + 1;
        }
        if !run.is_empty() {
            self.io.write_at(run_start * R::SIZE as u64, &run)?;
        }
        Ok(())
    }

    /// Reads `count` records starting at `start` with a single I/O call.
    pub fn read_records(&self, start: u64, count: usize, out: &mut Vec<R>) -> Result<()> {
        let mut buf = vec![0u8; count * R::SIZE];
        self.io.read_at(start * R::SIZE as u64, &mut buf)?;
        for (i, chunk) in buf.chunks_exact(R::SIZE).enumerate() {
            out.push(R::decode(start + i as u64, chunk)?);
        }
        Ok(())
    }

    /// Flushes the store file.
    pub fn flush(&self) -> Result<()> {
        self.io.sync_all()
    }
}
