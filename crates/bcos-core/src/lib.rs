//! # bcos-core
//!
//! Shared vocabulary for the bcos transport crates:
//!
//! - **Endpoints**: [`endpoint::Endpoint`] parsed from `host:port` / `[v6]:port`
//! - **Ids**: [`ids::SubscriptionId`] branded newtype and [`ids::seq_token`]
//!   for 32-byte frame correlation tokens
//! - **Logging**: [`logging::init_subscriber`] for the `tracing` subscriber
//! - **Constants**: protocol version bounds and client identification
//!
//! ## Crate Position
//!
//! Foundation crate. Depended on by every other bcos crate.

#![deny(unsafe_code)]

pub mod constants;
pub mod endpoint;
pub mod ids;
pub mod logging;

pub use endpoint::{Endpoint, EndpointError};
pub use ids::{SubscriptionId, seq_token};
