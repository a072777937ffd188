use std::fmt;
use std::io;

use thiserror::Error;

/// Result alias for operations that can only fail fatally.
pub type Result<T> = std::result::Result<T, ImportError>;

/// Result alias for per-entity work that may either be rejected or fail fatally.
pub type EntityResult<T> = std::result::Result<T, EntityError>;

/// Errors that abort the whole import.
#[derive(Debug, Error)]
pub enum ImportError {
    /// Underlying file I/O failed.
    #[error("IO: {0}")]
    Io(#[from] io::Error),
    /// A store or cache contains data that violates a structural invariant.
    #[error("corruption: {0}")]
    Corruption(String),
    /// An argument or call sequence was not valid.
    #[error("invalid argument: {0}")]
    Invalid(String),
    /// An id allocator handed out a non-consecutive id.
    #[error("id sequence broken: expected {expected}, got {actual}")]
    IdSequence {
        /// Id that should have been issued next.
        expected: u64,
        /// Id that was actually issued.
        actual: u64,
    },
    /// A store ran out of addressable ids.
    #[error("id space of the {store} store is exhausted at {high_id}")]
    ReservedIdExhausted {
        /// Store whose id space ran out.
        store: &'static str,
        /// High id when allocation failed.
        high_id: u64,
    },
    /// A pipeline step failed or panicked.
    #[error("stage {stage} failed in step {step}: {message}")]
    StepFailed {
        /// Stage that was executing.
        stage: String,
        /// Step that recorded the failure.
        step: String,
        /// Rendered failure cause.
        message: String,
    },
    /// More bad entities were collected than the configured tolerance allows.
    #[error("too many bad entries, tolerance is {tolerance}")]
    TooManyBadEntries {
        /// Configured tolerance.
        tolerance: u64,
    },
    /// Configuration could not be loaded or validated.
    #[error("configuration: {0}")]
    Config(String),
    /// JSON encoding of a persisted artifact failed.
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Malformed CSV input.
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl ImportError {
    /// Shorthand for [`ImportError::Invalid`].
    pub fn invalid(msg: impl Into<String>) -> Self {
        ImportError::Invalid(msg.into())
    }

    /// Shorthand for [`ImportError::Corruption`].
    pub fn corruption(msg: impl Into<String>) -> Self {
        ImportError::Corruption(msg.into())
    }
}

/// Reason a single input entity was not imported.
///
/// Rejections are handed to the bad-entity collector and never abort the run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rejection {
    /// The start node id could not be resolved.
    MissingStartNode,
    /// The end node id could not be resolved.
    MissingEndNode,
    /// The relationship had no type.
    MissingType,
    /// The node id was already seen in the same id group.
    DuplicateNode,
    /// The entity violates a schema constraint.
    ConstraintViolation(String),
    /// The entity itself was malformed.
    Malformed(String),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::MissingStartNode => write!(f, "start node not found"),
            Rejection::MissingEndNode => write!(f, "end node not found"),
            Rejection::MissingType => write!(f, "relationship type missing"),
            Rejection::DuplicateNode => write!(f, "duplicate node id"),
            Rejection::ConstraintViolation(detail) => write!(f, "constraint violation: {detail}"),
            Rejection::Malformed(detail) => write!(f, "malformed entity: {detail}"),
        }
    }
}

/// Outcome of a failed per-entity write.
#[derive(Debug, Error)]
pub enum EntityError {
    /// The failure aborts the import.
    #[error(transparent)]
    Fatal(#[from] ImportError),
    /// The entity is skipped and reported.
    #[error("rejected: {0}")]
    Rejected(Rejection),
}

impl From<Rejection> for EntityError {
    fn from(value: Rejection) -> Self {
        EntityError::Rejected(value)
    }
}

impl From<io::Error> for EntityError {
    fn from(value: io::Error) -> Self {
        EntityError::Fatal(ImportError::Io(value))
    }
}
