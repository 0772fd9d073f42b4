//! AMOP errors.

use bcos_ws::{CodecError, WsError};
use thiserror::Error;

/// Failures of topic operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmopError {
    /// The transport could not deliver the message or its reply.
    #[error(transparent)]
    Transport(#[from] WsError),
    /// Topic or data could not be framed.
    #[error("topic framing: {0}")]
    Codec(#[from] CodecError),
    /// The topic-sync payload could not be serialized.
    #[error("topic sync payload: {0}")]
    Json(String),
    /// The session a request arrived on is gone, so it cannot be answered.
    #[error("origin session to {endpoint} is closed")]
    OriginClosed {
        /// Endpoint of the closed session.
        endpoint: String,
    },
}

impl From<serde_json::Error> for AmopError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

/// Result type for AMOP operations.
pub type Result<T> = std::result::Result<T, AmopError>;
