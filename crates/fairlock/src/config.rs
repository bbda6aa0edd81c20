use std::time::Duration;

use fairlock_arbiter::FairArbiterConfig;
use fairlock_vfs::DEFAULT_ARBITER_NAME;
use serde::{Deserialize, Serialize};

/// Settings for an [`Environment`](crate::Environment).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FairlockConfig {
    /// Registry name file shims bind their arbiter from.
    pub arbiter_name: String,
    /// Install a [`FairArbiter`](fairlock_arbiter::FairArbiter) under
    /// `arbiter_name`. When off, the name is bound to the disabled sentinel
    /// and files open uncoordinated.
    pub fair_locking: bool,
    /// Wait budget for a blocked lock request. `None` waits forever.
    pub lock_timeout_ms: Option<u64>,
    /// VFS each connection wraps; `None` wraps the registry default.
    pub root_vfs: Option<String>,
}

impl Default for FairlockConfig {
    fn default() -> Self {
        Self {
            arbiter_name: DEFAULT_ARBITER_NAME.to_owned(),
            fair_locking: false,
            lock_timeout_ms: Some(5000),
            root_vfs: None,
        }
    }
}

impl FairlockConfig {
    /// Parse a config from JSON. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or a field has the wrong type.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    #[must_use]
    pub fn arbiter_config(&self) -> FairArbiterConfig {
        FairArbiterConfig {
            timeout: self.lock_timeout_ms.map(Duration::from_millis),
        }
    }
}
