//! The stages an import runs, in the order the orchestrator runs them.

mod counts;
mod defrag;
mod degrees;
mod duplicates;
mod entities;
mod linking;
mod scan;

pub use counts::{NodeCountsAndLabelIndexBuildStage, RelationshipCountsAndTypeIndexBuildStage};
pub use defrag::{CountGroupsStage, NodeFirstGroupStage, ScanAndCacheGroupsStage, WriteGroupsStage};
pub use degrees::{ExplicitlyDenseNodesStage, NodeDegreeCountStage};
pub use duplicates::{prepare_id_mapper, DeleteDuplicateNodesStage};
pub use entities::{EntityImportOutcome, InputProducer, NodeImportStage, RelationshipImportStage};
pub use linking::{
    LinkingRound, RelationshipGroupStage, RelationshipLinkBackwardStage,
    RelationshipLinkForwardStage, SparseNodeFirstRelationshipStage,
};
pub use scan::{RecordScanProducer, UpdateRecordsSink};
