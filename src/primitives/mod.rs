//! Low-level primitives the record stores are built on.

/// Byte-level utilities for fixed-layout records.
pub mod bytes;

/// Positional file I/O.
///
/// Interfaces for reading/writing record files, plus an in-memory variant.
pub mod io;
