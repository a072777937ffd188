#![forbid(unsafe_code)]
//! Identifiers, values and error types shared by every import layer.

mod error;
mod ids;
mod value;

pub use error::{EntityError, EntityResult, ImportError, Rejection, Result};
pub use ids::{
    Direction, GroupId, InputId, LabelId, PropId, TypeId, MAX_RELATIONSHIP_ID, NULL_REF,
    RESERVED_ID,
};
pub use value::Value;
