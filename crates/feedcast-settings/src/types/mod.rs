//! Settings types.

mod broadcaster;
mod logging;

pub use broadcaster::BroadcasterSettings;
pub use logging::{LogFormat, LoggingSettings};

use serde::{Deserialize, Serialize};

use crate::errors::Result;

/// Root settings document (`~/.feedcast/settings.json`).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FeedSettings {
    /// Per-connection delivery settings.
    pub broadcaster: BroadcasterSettings,
    /// Log output settings.
    pub logging: LoggingSettings,
}

impl FeedSettings {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        self.broadcaster.validate()
    }
}
