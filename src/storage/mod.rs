//! Record stores the importer writes into.
//!
//! Each store is a flat file of fixed-size records addressed by id, with a
//! high-water-mark id generator. [`BatchingStores`] bundles all of them for one
//! import together with token registries, counts and token indexes.

mod counts;
mod id_batch;
mod id_generator;
/// Record layouts.
pub mod record;
mod store;
mod stores;
mod tokens;

pub use counts::{
    CountsSnapshot, CountsStore, NodeCounts, RelationshipCountKey, RelationshipCounts, TokenIndex,
};
pub use id_batch::BatchingIdGetter;
pub use id_generator::{IdGenerator, IdRange, IdRangeSource};
pub use record::{
    DynamicRecord, NodeLabels, NodeRecord, PropertyBlock, PropertyKind, PropertyRecord,
    RecordFormat, RelationshipGroupRecord, RelationshipRecord,
};
pub use store::{RecordStore, PAGE_SIZE};
pub use stores::BatchingStores;
pub use tokens::{TokenHolder, TokenHolders, TokenSnapshot};
