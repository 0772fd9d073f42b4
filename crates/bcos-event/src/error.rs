//! EventSub errors.

use bcos_core::SubscriptionId;
use bcos_ws::WsError;
use thiserror::Error;

/// Failures of subscription operations and terminal push errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventSubError {
    /// The request or its acknowledgement could not be exchanged.
    #[error(transparent)]
    Transport(#[from] WsError),
    /// The node acknowledged with a non-zero result.
    #[error("subscription {id} rejected with result {result}")]
    Rejected {
        /// Task id.
        id: SubscriptionId,
        /// Result code from the acknowledgement.
        result: i64,
    },
    /// A push carried an error status; the task has been removed.
    #[error("subscription {id} ended with status {status}")]
    RemoteStatus {
        /// Task id.
        id: SubscriptionId,
        /// Status code from the push.
        status: i64,
    },
    /// No task with this id exists.
    #[error("no subscription {id}")]
    TaskNotFound {
        /// Requested id.
        id: SubscriptionId,
    },
    /// A request or acknowledgement payload was not valid JSON.
    #[error("event payload: {0}")]
    Json(String),
}

impl From<serde_json::Error> for EventSubError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

/// Result type for EventSub operations.
pub type Result<T> = std::result::Result<T, EventSubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_task() {
        let err = EventSubError::Rejected {
            id: SubscriptionId::from("sub-1"),
            result: 3,
        };
        assert_eq!(err.to_string(), "subscription sub-1 rejected with result 3");
        let err = EventSubError::TaskNotFound {
            id: SubscriptionId::from("x"),
        };
        assert_eq!(err.to_string(), "no subscription x");
    }

    #[test]
    fn transport_error_converts() {
        let err: EventSubError = WsError::NoSessionAvailable.into();
        assert!(matches!(err, EventSubError::Transport(WsError::NoSessionAvailable)));
    }
}
