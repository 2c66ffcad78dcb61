//! Client configuration with sensible defaults.
//!
//! Every policy knob of the session layer lives here: idle maintenance
//! intervals, ratchet reset defaults, human confirmation timeouts and KX
//! bookkeeping expiry. The struct is serde (de)serializable so hosts can
//! keep it in a JSON settings file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Result, RvlinkError};

const DAY_SECS: u64 = 24 * 60 * 60;

/// Configuration of the rvlink client.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    /// Peers whose last decrypted message is older than this get an
    /// automatic handshake attempt. Zero disables auto handshakes.
    pub auto_handshake_interval_secs: u64,

    /// Peers idle for longer than this are unsubscribed from local posts
    /// and removed from administered group chats. Zero disables it.
    pub auto_remove_idle_users_interval_secs: u64,

    /// Nicks (or hex user ids) that idle eviction must never touch.
    pub auto_remove_idle_users_ignore_list: Vec<String>,

    /// Whether a freshly linked peer is subscribed to for posts.
    pub auto_subscribe_to_posts: bool,

    /// Age cutoff used by bulk ratchet reset when the caller passes zero.
    pub reset_old_ratchets_default_days: u64,

    /// How long a human confirmation gate waits before denying.
    pub confirm_timeout_secs: u64,

    /// Period of the idle maintenance scheduler.
    pub idle_check_interval_secs: u64,

    /// Unfinished KX records older than this are considered expired.
    pub kx_expiry_days: u64,

    /// Largest accepted avatar in bytes.
    pub max_avatar_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            auto_handshake_interval_secs: 21 * DAY_SECS,
            auto_remove_idle_users_interval_secs: 60 * DAY_SECS,
            auto_remove_idle_users_ignore_list: Vec::new(),
            auto_subscribe_to_posts: true,
            reset_old_ratchets_default_days: 30,
            confirm_timeout_secs: 60,
            idle_check_interval_secs: 60 * 60,
            kx_expiry_days: 7,
            max_avatar_bytes: 200 * 1024,
        }
    }
}

impl ClientConfig {
    /// Loads a configuration from a JSON file. Missing fields take their
    /// default value.
    ///
    /// # Errors
    ///
    /// Returns [`RvlinkError::Config`] if the file cannot be read, is not
    /// valid JSON, or fails [`ClientConfig::validate`].
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| RvlinkError::Config {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| RvlinkError::Config {
            reason: format!("failed to parse {}: {e}", path.display()),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates all configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.reset_old_ratchets_default_days == 0 {
            return Err(RvlinkError::Config {
                reason: "reset_old_ratchets_default_days must be greater than 0".into(),
            });
        }

        if self.confirm_timeout_secs == 0 {
            return Err(RvlinkError::Config {
                reason: "confirm_timeout_secs must be greater than 0".into(),
            });
        }

        if self.idle_check_interval_secs == 0 {
            return Err(RvlinkError::Config {
                reason: "idle_check_interval_secs must be greater than 0".into(),
            });
        }

        if self.kx_expiry_days == 0 {
            return Err(RvlinkError::Config {
                reason: "kx_expiry_days must be greater than 0".into(),
            });
        }

        if self.max_avatar_bytes == 0 {
            return Err(RvlinkError::Config {
                reason: "max_avatar_bytes must be greater than 0".into(),
            });
        }

        Ok(())
    }

    /// Auto handshake interval, `None` when disabled.
    pub fn auto_handshake_interval(&self) -> Option<Duration> {
        non_zero_secs(self.auto_handshake_interval_secs)
    }

    /// Idle eviction interval, `None` when disabled.
    pub fn auto_remove_idle_users_interval(&self) -> Option<Duration> {
        non_zero_secs(self.auto_remove_idle_users_interval_secs)
    }

    pub fn reset_old_ratchets_default(&self) -> Duration {
        Duration::from_secs(self.reset_old_ratchets_default_days * DAY_SECS)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.confirm_timeout_secs)
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_secs(self.idle_check_interval_secs)
    }

    pub fn kx_expiry(&self) -> Duration {
        Duration::from_secs(self.kx_expiry_days * DAY_SECS)
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
