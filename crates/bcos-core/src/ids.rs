//! Identifiers.
//!
//! Subscription ids are branded newtypes over UUID v7 strings so they cannot
//! be confused with other string keys (topics, groups, endpoints). Frame
//! correlation tokens are the 32 lowercase hex digits of a UUID v7.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::SEQ_LEN;

/// Generate a fresh 32-byte correlation token.
pub fn seq_token() -> [u8; SEQ_LEN] {
    let mut buf = [0u8; SEQ_LEN];
    let _ = Uuid::now_v7().simple().encode_lower(&mut buf);
    buf
}

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new random id (UUID v7, time-ordered).
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::now_v7().to_string())
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

branded_id! {
    /// Identifier of an event subscription task. Stable across resubscribes.
    SubscriptionId
}
