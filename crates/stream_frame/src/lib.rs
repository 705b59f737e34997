//! Strongly-typed columnar frames: the unit of data every pipeline stage
//! produces and consumes, plus the JSON wire format used to ship them to
//! subscribers.

pub mod config;
pub mod field;
pub mod frame;
pub mod json;

use thiserror::Error;

pub use config::{FieldConfig, Threshold, ThresholdsConfig, ThresholdsMode};
pub use field::{Field, FieldType, FieldValue, Labels, Vector};
pub use frame::Frame;
pub use json::{FrameJson, Include, SchemaFingerprint};

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("field `{field}` expects {expected} values, got {got}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        got: String,
    },

    #[error("field `{0}` is not nullable")]
    NullNotAllowed(String),

    #[error("field `{field}` has {got} rows, frame has {expected}")]
    RowCountMismatch {
        field: String,
        expected: usize,
        got: usize,
    },

    #[error("row has {got} values, frame has {expected} fields")]
    RowWidthMismatch { expected: usize, got: usize },

    #[error("unknown field type `{0}`")]
    UnknownFieldType(String),

    #[error("malformed frame JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame JSON has no {0} section")]
    MissingSection(&'static str),
}
