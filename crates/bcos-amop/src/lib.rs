//! # bcos-amop
//!
//! Topic-addressed publish/subscribe on top of the `bcos-ws` pool.
//!
//! - [`Amop`]: the topic set, per-topic and default callbacks, publish,
//!   broadcast and responses
//! - [`AmopMessage`]: what a callback receives
//!
//! Publishing uses pick-one-with-retry, so a request reaches at most one
//! subscriber's node; broadcasting goes to every live session.

#![deny(unsafe_code)]

pub mod client;
pub mod error;
pub mod message;

pub use client::Amop;
pub use error::{AmopError, Result};
pub use message::{AmopKind, AmopMessage, TopicCallback, TopicSync};
