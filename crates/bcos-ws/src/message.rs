//! Message type space carried in the frame header.

use std::fmt;

/// Known frame types. The wire value is the `u16` discriminant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum MessageType {
    /// Protocol version and topology exchange on a fresh session.
    Handshake = 0x100,
    /// Node reports a new block for a group.
    BlockNotify = 0x101,
    /// JSON-RPC request/response.
    RpcRequest = 0x102,
    /// Node reports a changed group configuration.
    GroupNotify = 0x103,
    /// Client pushes its full AMOP topic set.
    AmopSubscribeTopics = 0x110,
    /// Point-to-point topic message expecting a response.
    AmopRequest = 0x111,
    /// Topic message fanned out to every subscriber.
    AmopBroadcast = 0x112,
    /// Response to an [`MessageType::AmopRequest`].
    AmopResponse = 0x113,
    /// Register an event-log subscription.
    EventSubscribe = 0x120,
    /// Cancel an event-log subscription.
    EventUnsubscribe = 0x121,
    /// Node pushes event logs for a subscription.
    EventLogPush = 0x122,
}

impl MessageType {
    /// Every known type, in wire order.
    pub const ALL: [Self; 11] = [
        Self::Handshake,
        Self::BlockNotify,
        Self::RpcRequest,
        Self::GroupNotify,
        Self::AmopSubscribeTopics,
        Self::AmopRequest,
        Self::AmopBroadcast,
        Self::AmopResponse,
        Self::EventSubscribe,
        Self::EventUnsubscribe,
        Self::EventLogPush,
    ];

    /// Wire value.
    pub const fn code(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for MessageType {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|t| t.code() == value)
            .ok_or(value)
    }
}

impl From<MessageType> for u16 {
    fn from(t: MessageType) -> Self {
        t.code()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}(0x{:x})", self.code())
    }
}
