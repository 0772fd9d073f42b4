//! In-memory peers for tests.
//!
//! [`ws_pair`] joins a client and a server WebSocket over
//! `tokio::io::duplex`, [`FakeNode`] plays a scripted node on the server side,
//! and [`MockConnector`] hands out such pairs to a pool by endpoint.
//!
//! Enabled for this crate's tests and, through the `test-util` feature, for
//! dependent crates' tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bcos_core::Endpoint;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_util::sync::CancellationToken;

use crate::codec::Frame;
use crate::connector::{BoxedTransport, Connection, Connector, WsStream};
use crate::error::ConnectError;
use crate::handshake::HandshakeResponse;
use crate::message::MessageType;
use crate::topology::{GroupInfo, GroupNodeInfo};

/// Maps each inbound frame to the frames the node sends back.
pub type Responder = Arc<dyn Fn(&Frame) -> Vec<Frame> + Send + Sync>;

/// Connected client/server WebSocket pair with no network underneath.
pub async fn ws_pair() -> (Connection, WsStream) {
    let (a, b) = tokio::io::duplex(1 << 20);
    let a: BoxedTransport = Box::new(a);
    let b: BoxedTransport = Box::new(b);
    let client = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
    let server = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
    (
        Connection {
            stream: client,
            peer: None,
        },
        server,
    )
}

/// Poll `cond` every few milliseconds; panic after five seconds.
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// A group served by the given node names.
pub fn group(group_id: &str, nodes: &[&str]) -> GroupInfo {
    GroupInfo {
        chain_id: "chain0".into(),
        group_id: group_id.into(),
        node_list: nodes
            .iter()
            .map(|name| GroupNodeInfo {
                name: (*name).to_owned(),
                node_type: 0,
            })
            .collect(),
    }
}

/// Successful handshake reply listing `groups`.
pub fn handshake_reply(request: &Frame, groups: &[GroupInfo]) -> Frame {
    let body = HandshakeResponse {
        protocol_version: bcos_core::constants::MAX_PROTOCOL_VERSION,
        group_info_list: groups.to_vec(),
        group_block_number: Vec::new(),
    };
    let payload = serde_json::to_vec(&body).unwrap_or_default();
    request.reply(MessageType::Handshake, 0, payload)
}

/// Node that completes the handshake with `groups`, then defers to `rest`.
pub fn node_responder<F>(groups: Vec<GroupInfo>, rest: F) -> Responder
where
    F: Fn(&Frame) -> Vec<Frame> + Send + Sync + 'static,
{
    Arc::new(move |frame: &Frame| {
        if frame.message_type() == Some(MessageType::Handshake) {
            vec![handshake_reply(frame, &groups)]
        } else {
            rest(frame)
        }
    })
}

/// Node that completes the handshake and ignores everything else.
pub fn handshake_only(groups: Vec<GroupInfo>) -> Responder {
    node_responder(groups, |_| Vec::new())
}

/// Server side of one in-memory connection.
#[derive(Clone)]
pub struct FakeNode {
    received: Arc<Mutex<Vec<Frame>>>,
    push_tx: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
    closed: Arc<AtomicBool>,
}

impl FakeNode {
    /// Serve `stream`, answering each decoded frame through `responder`.
    pub fn spawn(stream: WsStream, responder: Responder) -> Self {
        let (push_tx, mut push_rx) = mpsc::unbounded_channel::<Message>();
        let node = Self {
            received: Arc::new(Mutex::new(Vec::new())),
            push_tx,
            cancel: CancellationToken::new(),
            closed: Arc::new(AtomicBool::new(false)),
        };

        let received = Arc::clone(&node.received);
        let cancel = node.cancel.clone();
        let closed = Arc::clone(&node.closed);
        let _ = tokio::spawn(async move {
            let (mut sink, mut stream) = stream.split();
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    Some(msg) = push_rx.recv() => {
                        if sink.send(msg).await.is_err() {
                            break;
                        }
                    }
                    incoming = stream.next() => {
                        let Some(Ok(msg)) = incoming else { break };
                        if msg.is_close() {
                            break;
                        }
                        if !msg.is_binary() {
                            continue;
                        }
                        let Ok(frame) = Frame::decode(&msg.into_data()) else { continue };
                        let replies = responder(&frame);
                        received.lock().push(frame);
                        for reply in replies {
                            if sink.send(Message::Binary(reply.encode().into())).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            let _ = sink.close().await;
            closed.store(true, Ordering::SeqCst);
        });
        node
    }

    /// Send a server-initiated frame.
    pub fn push(&self, frame: Frame) {
        let _ = self.push_tx.send(Message::Binary(frame.encode().into()));
    }

    /// Send an arbitrary WebSocket message.
    pub fn push_raw(&self, msg: Message) {
        let _ = self.push_tx.send(msg);
    }

    /// Every frame received so far, in order.
    pub fn received(&self) -> Vec<Frame> {
        self.received.lock().clone()
    }

    /// Received frames of one type.
    pub fn received_of(&self, msg_type: MessageType) -> Vec<Frame> {
        self.received
            .lock()
            .iter()
            .filter(|f| f.msg_type == msg_type.code())
            .cloned()
            .collect()
    }

    /// Close the connection from the node side.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Whether the connection has ended.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Connector serving registered endpoints from in-memory [`FakeNode`]s.
#[derive(Default)]
pub struct MockConnector {
    responders: Mutex<HashMap<String, Responder>>,
    nodes: Mutex<HashMap<String, Vec<FakeNode>>>,
    attempts: AtomicUsize,
}

impl MockConnector {
    /// Empty connector; every endpoint refuses until added.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `endpoint` reachable, answering with `responder`.
    pub fn add_node(&self, endpoint: &Endpoint, responder: Responder) {
        let _ = self.responders.lock().insert(endpoint.key(), responder);
    }

    /// Make `endpoint` refuse future connects. Live connections stay up.
    pub fn remove_node(&self, endpoint: &Endpoint) {
        let _ = self.responders.lock().remove(&endpoint.key());
    }

    /// Most recent connection to `endpoint`.
    pub fn node(&self, endpoint: &Endpoint) -> Option<FakeNode> {
        self.nodes
            .lock()
            .get(&endpoint.key())
            .and_then(|v| v.last().cloned())
    }

    /// Number of connections made to `endpoint`.
    pub fn connections(&self, endpoint: &Endpoint) -> usize {
        self.nodes.lock().get(&endpoint.key()).map_or(0, Vec::len)
    }

    /// Total connect calls, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Connection, ConnectError> {
        let _ = self.attempts.fetch_add(1, Ordering::SeqCst);
        let responder = self.responders.lock().get(&endpoint.key()).cloned();
        let Some(responder) = responder else {
            return Err(ConnectError::Connect {
                endpoint: endpoint.key(),
                reason: "connection refused".into(),
            });
        };
        let (client, server) = ws_pair().await;
        let node = FakeNode::spawn(server, responder);
        self.nodes
            .lock()
            .entry(endpoint.key())
            .or_default()
            .push(node);
        Ok(client)
    }
}
