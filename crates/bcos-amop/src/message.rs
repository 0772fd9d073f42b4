//! Inbound topic messages and the topic-sync payload.

use std::fmt;
use std::sync::Arc;

use bcos_ws::{Seq, Session};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// How a topic message was sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AmopKind {
    /// Expects one response from a subscriber.
    Request,
    /// Delivered to every subscriber, no response.
    Broadcast,
}

impl AmopKind {
    /// Metrics label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Broadcast => "broadcast",
        }
    }
}

impl fmt::Display for AmopKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A topic message delivered to a callback.
#[derive(Clone, Debug)]
pub struct AmopMessage {
    /// Topic it was published on.
    pub topic: String,
    /// Application data.
    pub data: Bytes,
    /// Seq of the carrying frame; a response must reuse it.
    pub seq: Seq,
    /// Request or broadcast.
    pub kind: AmopKind,
    /// Session it arrived on.
    pub session: Arc<Session>,
}

/// Callback for topic messages.
pub type TopicCallback = Arc<dyn Fn(AmopMessage) + Send + Sync>;

/// Body of an AmopSubscribeTopics frame: the full local topic set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSync {
    /// Every subscribed topic.
    pub topics: Vec<String>,
}
