//! Subscription filters, wire payloads and callback notices.

use std::sync::Arc;

use bcos_core::SubscriptionId;
use bcos_ws::SessionRef;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EventSubError;

/// Push status: logs delivered, subscription continues.
pub const STATUS_SUCCESS: i64 = 0;
/// Push status: the range is exhausted, subscription ends.
pub const STATUS_END_OF_PUSH: i64 = 1;

/// Log filter sent with a subscribe request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSubParams {
    /// First block to scan; -1 means the latest block.
    pub from_block: i64,
    /// Last block to scan; -1 means keep following new blocks.
    pub to_block: i64,
    /// Contract addresses; empty matches any.
    #[serde(default)]
    pub addresses: Vec<String>,
    /// Topic filter per log position; `None` matches any value there.
    #[serde(default)]
    pub topics: Vec<Option<Vec<String>>>,
}

impl Default for EventSubParams {
    fn default() -> Self {
        Self {
            from_block: -1,
            to_block: -1,
            addresses: Vec::new(),
            topics: Vec::new(),
        }
    }
}

impl EventSubParams {
    /// Copy with `from_block` raised to `checkpoint` when that is later.
    #[must_use]
    pub fn resumed_from(&self, checkpoint: Option<i64>) -> Self {
        let mut params = self.clone();
        if let Some(block) = checkpoint {
            params.from_block = params.from_block.max(block);
        }
        params
    }
}

/// Subscribe request body.
#[derive(Debug, Serialize)]
pub(crate) struct SubscribeRequest<'a> {
    pub id: &'a str,
    pub group: &'a str,
    pub params: &'a EventSubParams,
}

/// Unsubscribe request body.
#[derive(Debug, Serialize)]
pub(crate) struct UnsubscribeRequest<'a> {
    pub id: &'a str,
    pub group: &'a str,
}

/// Acknowledgement of a subscribe or unsubscribe request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventAck {
    /// Task id the ack refers to.
    pub id: String,
    /// 0 on success.
    pub result: i64,
}

/// Server push for a subscription.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventPush {
    /// Task id.
    pub id: String,
    /// [`STATUS_SUCCESS`], [`STATUS_END_OF_PUSH`] or an error code.
    pub status: i64,
    /// Matched logs.
    #[serde(default)]
    pub result: Vec<Value>,
}

impl EventPush {
    /// Block number of the first log, as a number or a decimal or `0x` string.
    pub fn first_block_number(&self) -> Option<i64> {
        match self.result.first()?.get("blockNumber")? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => match s.strip_prefix("0x") {
                Some(hex) => i64::from_str_radix(hex, 16).ok(),
                None => s.parse().ok(),
            },
            _ => None,
        }
    }
}

/// What a subscription callback receives.
#[derive(Clone, Debug, PartialEq)]
pub enum EventNotice {
    /// Logs from a push; more may follow.
    Logs(Vec<Value>),
    /// Final logs; the subscription has ended.
    Completed(Vec<Value>),
    /// The subscription failed and has been removed.
    Failed(EventSubError),
}

impl EventNotice {
    /// Whether no more notices follow.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Logs(_))
    }
}

/// Callback for one subscription.
pub type EventCallback = Arc<dyn Fn(&SubscriptionId, EventNotice) + Send + Sync>;

/// Where a task currently lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Bound to a live session and receiving pushes.
    Working,
    /// Waiting for a session to resubscribe on.
    Suspended,
}

/// Snapshot of a task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskInfo {
    /// Stable id.
    pub id: SubscriptionId,
    /// Group subscribed in.
    pub group: String,
    /// Filter as originally requested.
    pub params: EventSubParams,
    /// Highest block seen in a push.
    pub checkpoint: Option<i64>,
    /// Working or suspended.
    pub state: TaskState,
    /// Session the task is bound to while working.
    pub session: Option<SessionRef>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn params_json_shape() {
        let params = EventSubParams {
            from_block: 10,
            to_block: -1,
            addresses: vec!["0xabc".into()],
            topics: vec![Some(vec!["0x01".into()]), None],
        };
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "fromBlock": 10,
                "toBlock": -1,
                "addresses": ["0xabc"],
                "topics": [["0x01"], null]
            })
        );
    }

    #[test]
    fn subscribe_request_json_shape() {
        let params = EventSubParams::default();
        let body = SubscribeRequest {
            id: "sub-1",
            group: "group0",
            params: &params,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["id"], "sub-1");
        assert_eq!(json["group"], "group0");
        assert_eq!(json["params"]["fromBlock"], -1);
    }

    #[test]
    fn push_first_block_number() {
        let push = |result: Value| EventPush {
            id: "x".into(),
            status: 0,
            result: serde_json::from_value(result).unwrap(),
        };
        assert_eq!(push(serde_json::json!([{"blockNumber": 7}, {"blockNumber": 9}])).first_block_number(), Some(7));
        assert_eq!(push(serde_json::json!([{"blockNumber": "0x1f"}])).first_block_number(), Some(31));
        assert_eq!(push(serde_json::json!([{"blockNumber": "12"}])).first_block_number(), Some(12));
        assert_eq!(push(serde_json::json!([{"other": 1}])).first_block_number(), None);
        assert_eq!(push(serde_json::json!([])).first_block_number(), None);
    }

    #[test]
    fn push_result_defaults_empty() {
        let push: EventPush = serde_json::from_str(r#"{"id":"a","status":1}"#).unwrap();
        assert_eq!(push.status, STATUS_END_OF_PUSH);
        assert!(push.result.is_empty());
    }

    #[test]
    fn notice_terminality() {
        assert!(!EventNotice::Logs(vec![]).is_terminal());
        assert!(EventNotice::Completed(vec![]).is_terminal());
    }

    proptest! {
        #[test]
        fn resume_never_moves_backwards(from in -1i64..1000, checkpoint in proptest::option::of(0i64..2000)) {
            let params = EventSubParams { from_block: from, ..EventSubParams::default() };
            let resumed = params.resumed_from(checkpoint);
            prop_assert!(resumed.from_block >= from);
            if let Some(c) = checkpoint {
                prop_assert!(resumed.from_block >= c);
            }
        }
    }
}
