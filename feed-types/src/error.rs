//! Error types for rtfeed wire types.

use thiserror::Error;

/// Errors that can occur while handling wire types.
#[derive(Debug, Error)]
pub enum TypesError {
    /// JSON serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] serde_json::Error),

    /// JSON deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] serde_json::Error),

    /// A feed id was not of the form `group:id`
    #[error("invalid fid: {0:?}")]
    InvalidFid(String),
}
