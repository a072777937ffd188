//! Parallel bulk importer for graph record stores.
//!
//! Nodes and relationships are read from an [`input::Input`], written into
//! empty [`storage::BatchingStores`] and then linked into per-node
//! relationship chains by a fixed sequence of parallel stages run by
//! [`import::ImportLogic`].

#![warn(missing_docs)]

pub mod cache;
pub mod config;
pub mod idmapping;
pub mod import;
pub mod input;
pub mod primitives;
pub mod staging;
pub mod storage;
pub mod types;

pub use config::{ImportConfig, ImporterKind, UniqueConstraint};
pub use import::{batch_importer, BatchImporter, ImportReport};
