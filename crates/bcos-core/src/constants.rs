//! Package-level constants.

/// Current version of the transport (sourced from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Client identification sent in the handshake.
pub const CLIENT_TYPE: &str = "bcos-transport-rs";

/// Lowest protocol version this client speaks.
pub const MIN_PROTOCOL_VERSION: u32 = 1;

/// Highest protocol version this client speaks.
pub const MAX_PROTOCOL_VERSION: u32 = 1;

/// Length of a frame correlation token in bytes.
pub const SEQ_LEN: usize = 32;
