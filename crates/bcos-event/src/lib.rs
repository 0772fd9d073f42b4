//! # bcos-event
//!
//! Contract log subscriptions over the `bcos-ws` pool.
//!
//! [`EventSub`] keeps every subscription as a task with a stable id. Tasks
//! whose session drops are suspended and resubscribed on the next live
//! session, resuming from the highest block already delivered.

#![deny(unsafe_code)]

pub mod error;
pub mod registry;
pub mod types;

pub use error::{EventSubError, Result};
pub use registry::EventSub;
pub use types::{
    EventAck, EventCallback, EventNotice, EventPush, EventSubParams, STATUS_END_OF_PUSH,
    STATUS_SUCCESS, TaskInfo, TaskState,
};
