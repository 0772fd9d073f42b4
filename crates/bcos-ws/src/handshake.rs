//! Protocol handshake.
//!
//! The first frame on every session. Until a node answers with a supported
//! `protocolVersion` the session stays unhandshaken and the pool refuses to
//! route anything through it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bcos_core::constants::{CLIENT_TYPE, MAX_PROTOCOL_VERSION, MIN_PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec::Frame;
use crate::error::{Result, WsError};
use crate::message::MessageType;
use crate::session::Session;
use crate::topology::GroupInfo;

/// What the client offers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    /// Lowest version the client speaks.
    pub min_protocol_version: u32,
    /// Highest version the client speaks.
    pub max_protocol_version: u32,
    /// Client identifier.
    pub client_type: String,
}

impl HandshakeRequest {
    /// The range this build supports.
    pub fn current() -> Self {
        Self {
            min_protocol_version: MIN_PROTOCOL_VERSION,
            max_protocol_version: MAX_PROTOCOL_VERSION,
            client_type: CLIENT_TYPE.to_owned(),
        }
    }

    /// Wrap as a Handshake frame.
    pub fn to_frame(&self) -> Result<Frame> {
        Ok(Frame::new(MessageType::Handshake, serde_json::to_vec(self)?))
    }
}

/// What the node answers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    /// Version the node picked.
    pub protocol_version: u32,
    /// Groups visible through this node.
    #[serde(default)]
    pub group_info_list: Vec<GroupInfo>,
    /// Current block number per group, one map per entry.
    #[serde(default)]
    pub group_block_number: Vec<HashMap<String, i64>>,
}

impl HandshakeResponse {
    /// Parse and validate a response payload.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let response: Self = serde_json::from_slice(payload)
            .map_err(|e| WsError::Handshake(format!("malformed response: {e}")))?;
        if !(MIN_PROTOCOL_VERSION..=MAX_PROTOCOL_VERSION).contains(&response.protocol_version) {
            return Err(WsError::Handshake(format!(
                "unsupported protocol version {} (supported {MIN_PROTOCOL_VERSION}..={MAX_PROTOCOL_VERSION})",
                response.protocol_version
            )));
        }
        Ok(response)
    }
}

/// Run the handshake on a fresh session and stamp the negotiated version.
///
/// The caller drops the session on error.
pub async fn perform(session: &Arc<Session>, timeout: Duration) -> Result<HandshakeResponse> {
    let frame = HandshakeRequest::current().to_frame()?;
    let reply = session.request(frame, timeout).await?;
    if reply.frame.status != 0 {
        return Err(WsError::Handshake(format!(
            "node answered status {}",
            reply.frame.status
        )));
    }
    let response = HandshakeResponse::parse(&reply.frame.payload)?;
    session.set_protocol_version(response.protocol_version);
    debug!(
        session_id = session.id(),
        endpoint = %session.endpoint(),
        protocol_version = response.protocol_version,
        groups = response.group_info_list.len(),
        "handshake complete"
    );
    Ok(response)
}
