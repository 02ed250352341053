//! # feedcast-settings
//!
//! Configuration for the feedcast broadcast server, loaded from three layers
//! (in priority order):
//! 1. **Compiled defaults**: [`FeedSettings::default()`]
//! 2. **User file**: `~/.feedcast/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `FEEDCAST_*` overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

use std::sync::OnceLock;

static SETTINGS: OnceLock<FeedSettings> = OnceLock::new();

/// Get the global settings instance.
///
/// On first call, loads settings from `~/.feedcast/settings.json` with env
/// var overrides. If loading fails, returns compiled defaults.
pub fn get_settings() -> &'static FeedSettings {
    SETTINGS.get_or_init(|| {
        load_settings().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load settings, using defaults");
            FeedSettings::default()
        })
    })
}

/// Initialize the global settings with a specific value.
///
/// Returns the settings back if the global was already initialized.
#[allow(clippy::result_large_err)]
pub fn init_settings(settings: FeedSettings) -> std::result::Result<(), FeedSettings> {
    SETTINGS.set(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid() {
        let settings = FeedSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.logging.level, "info");
        assert_eq!(settings.broadcaster.ping_interval_ms, 5_000);
    }

    #[test]
    fn deep_merge_re_exported() {
        let merged = deep_merge(serde_json::json!({"x": 1}), serde_json::json!({"y": 2}));
        assert_eq!(merged["x"], 1);
        assert_eq!(merged["y"], 2);
    }
}
