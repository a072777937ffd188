//! The import pipeline: entity importers, stages and the orchestrator that runs them.

mod batch_importer;
pub mod collector;
mod importer;
mod logic;
pub mod properties;
pub mod sanity;
pub mod schema;
pub mod stages;
mod statistics;

pub use batch_importer::{batch_importer, BatchImporter, ParallelBatchImporter, SequentialBatchImporter};
pub use collector::{BadCollector, BadEntry, BadEntryKind, Collector};
pub use importer::{EntityContext, ImporterStats, NodeImporter, RelationshipImporter};
pub use logic::{
    ImportLogic, ImportReport, ImportState, NoLinkingMonitor, RelationshipLinkingMonitor,
};
pub use sanity::SanityWarning;
pub use schema::{AffectedSchema, NoSchemaMonitor, SchemaMonitor, UniquenessMonitor};
pub use statistics::{DataStatistics, RelationshipTypeCount};
