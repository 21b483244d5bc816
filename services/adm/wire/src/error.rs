//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Line is not a JSON object
    #[error("malformed envelope: {0}")]
    Malformed(String),

    /// No line terminator within the size limit
    #[error("line exceeds {limit} bytes without terminator")]
    Oversized {
        /// Configured maximum line length
        limit: usize,
    },

    /// A field the envelope kind requires is absent or has the wrong type
    #[error("missing or invalid field `{0}`")]
    MissingField(&'static str),

    /// Serialization failure on the encode side
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}
