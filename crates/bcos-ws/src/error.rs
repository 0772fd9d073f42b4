//! Transport error types.
//!
//! Three layers: [`CodecError`] for malformed bytes, [`ConnectError`] for the
//! phases of opening a stream, and [`WsError`] for everything a caller's
//! request can fail with.

use thiserror::Error;

/// Malformed or oversized wire data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Buffer shorter than the fixed header.
    #[error("buffer too short: {len} bytes, need at least {min}")]
    TooShort {
        /// Bytes available.
        len: usize,
        /// Bytes required.
        min: usize,
    },
    /// A length-prefixed field runs past the end of the buffer.
    #[error("field at offset {offset} needs {need} bytes but buffer has {len}")]
    Overrun {
        /// Read position.
        offset: usize,
        /// Bytes the field needs.
        need: usize,
        /// Total buffer length.
        len: usize,
    },
    /// A seq token was not exactly 32 bytes.
    #[error("seq must be 32 bytes, got {0}")]
    InvalidSeqLength(usize),
    /// Topic longer than a u16 length prefix can carry.
    #[error("topic is {0} bytes, limit is 65535")]
    TopicTooLong(usize),
    /// Topic bytes are not valid UTF-8.
    #[error("topic is not valid UTF-8")]
    InvalidTopic,
}

/// Failure to open a stream, tagged with the phase that failed.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Name resolution failed or produced no addresses.
    #[error("resolve {endpoint} failed: {reason}")]
    Resolve {
        /// Endpoint being dialed.
        endpoint: String,
        /// Resolver message.
        reason: String,
    },
    /// No resolved address accepted a TCP connection.
    #[error("connect to {endpoint} failed: {reason}")]
    Connect {
        /// Endpoint being dialed.
        endpoint: String,
        /// Last socket error.
        reason: String,
    },
    /// The WebSocket upgrade was rejected or broken.
    #[error("websocket handshake with {endpoint} failed: {reason}")]
    Handshake {
        /// Endpoint being dialed.
        endpoint: String,
        /// Upgrade error.
        reason: String,
    },
    /// The overall deadline elapsed.
    #[error("connect to {endpoint} timed out after {timeout_ms}ms")]
    Timeout {
        /// Endpoint being dialed.
        endpoint: String,
        /// Deadline in milliseconds.
        timeout_ms: u64,
    },
}

impl ConnectError {
    /// Short phase label, used as a metrics tag.
    pub fn phase(&self) -> &'static str {
        match self {
            Self::Resolve { .. } => "resolve",
            Self::Connect { .. } => "connect",
            Self::Handshake { .. } => "handshake",
            Self::Timeout { .. } => "timeout",
        }
    }
}

/// Request-level failures delivered to callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WsError {
    /// Direct send to an endpoint with no live session.
    #[error("no session for endpoint {endpoint}")]
    EndpointNotFound {
        /// Requested endpoint key.
        endpoint: String,
    },
    /// The pool has no live sessions.
    #[error("no session available")]
    NoSessionAvailable,
    /// The topology has no endpoint serving the group (and node).
    #[error("no endpoint for group {group}{}", node_suffix(.node))]
    GroupNotFound {
        /// Requested group.
        group: String,
        /// Requested node, if any.
        node: Option<String>,
    },
    /// No response before the request timer fired.
    #[error("request timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout in milliseconds.
        timeout_ms: u64,
    },
    /// The session closed before the request completed.
    #[error("session to {endpoint} dropped")]
    SessionDropped {
        /// Endpoint of the dropped session.
        endpoint: String,
    },
    /// Another request with the same seq is still outstanding on the session.
    #[error("seq {seq} already in flight")]
    DuplicateSeq {
        /// The clashing seq, as text.
        seq: String,
    },
    /// The peer answered with a non-zero status.
    #[error("remote status {status}")]
    RemoteStatus {
        /// Status field of the reply frame.
        status: u16,
    },
    /// Every candidate session failed.
    #[error("all {attempts} candidate sessions failed, last error: {last}")]
    Exhausted {
        /// Number of sessions tried.
        attempts: usize,
        /// Error from the final attempt.
        last: Box<WsError>,
    },
    /// The protocol handshake was rejected or malformed.
    #[error("handshake failed: {0}")]
    Handshake(String),
    /// Wire data could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// A JSON payload could not be built or parsed.
    #[error("json payload: {0}")]
    Json(String),
}

fn node_suffix(node: &Option<String>) -> String {
    node.as_deref().map(|n| format!(" node {n}")).unwrap_or_default()
}

impl From<serde_json::Error> for WsError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, WsError>;
