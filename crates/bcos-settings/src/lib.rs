//! # bcos-settings
//!
//! Configuration for the bcos transport, loaded from three layers (in
//! priority order):
//! 1. **Compiled defaults**: [`BcosSettings::default()`]
//! 2. **User file**: `~/.bcos/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `BCOS_*` overrides (highest priority)
//!
//! There is no process-wide cache. Callers load a [`BcosSettings`] once and
//! pass it (or values derived from it) to the components that need it.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides_with, deep_merge, load_settings, load_settings_from_path,
    settings_path,
};
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_exports_work() {
        let _settings = BcosSettings::default();
        let _path = settings_path();
    }

    #[test]
    fn default_settings_are_valid() {
        let settings = BcosSettings::default();
        assert_eq!(settings.transport.peers, vec!["127.0.0.1:20200".to_string()]);
        assert_eq!(settings.transport.reconnect_period_ms, 10_000);
        assert_eq!(settings.logging.level, "info");
        assert!(settings.amop.topics.is_empty());
        assert!(settings.validate().is_ok());
    }
}
