//! # bcos-ws
//!
//! Client transport to bcos nodes over WebSocket.
//!
//! - [`codec`]: fixed-header binary [`Frame`] and length-prefixed [`TopicFrame`]
//! - [`message`]: the [`MessageType`] space
//! - [`connector`]: resolve + dial + WebSocket upgrade under one deadline
//! - [`session`]: one live stream: read loop, FIFO write queue, seq correlation
//! - [`service`]: the pool: reconnection loop, direct / pick-one / broadcast
//!   dispatch, inbound routing by message type
//! - [`handshake`] and [`topology`]: protocol gate and group/node maps
//! - [`notify`]: block-number tracking from node pushes
//!
//! ## Crate Position
//!
//! Depends on `bcos-core` and `bcos-settings`. Used by `bcos-amop` and
//! `bcos-event`.

#![deny(unsafe_code)]

pub mod codec;
pub mod connector;
pub mod error;
pub mod handshake;
pub mod message;
pub mod notify;
pub mod service;
pub mod session;
pub mod topology;

#[cfg(any(test, feature = "test-util"))]
pub mod testutil;

pub use codec::{Frame, Seq, TopicFrame};
pub use connector::{Connection, Connector, TcpConnector, WsStream};
pub use error::{CodecError, ConnectError, Result, WsError};
pub use handshake::{HandshakeRequest, HandshakeResponse};
pub use message::MessageType;
pub use notify::{BlockNotification, BlockNotifier, BlockNumbers};
pub use service::{MessageHandler, SendOptions, ServiceConfig, SessionHandler, WsService};
pub use session::{Reply, ReplyCallback, Session, SessionObserver, SessionRef};
pub use topology::{GroupInfo, GroupNodeInfo, Topology};
