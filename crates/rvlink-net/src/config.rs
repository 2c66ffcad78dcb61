//! Connection keeper configuration.
//!
//! All values have documented defaults. Validation rejects zero delays
//! and inconsistent backoff bounds at startup. Collaborators (dialer,
//! certificate confirmer, unwelcome handler) are passed to
//! [`ConnKeeper::new`](crate::keeper::ConnKeeper::new) separately since
//! they cannot be serialized.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use rvlink_types::{Result, RvlinkError};

/// Relay connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnKeeperConfig {
    /// Interval at which the client pings the relay, in seconds.
    ///
    /// Clamped during the welcome to what the server tolerates. Zero
    /// disables pings. Default: `60`.
    pub ping_interval_secs: u64,

    /// Smallest ping interval the client accepts after clamping.
    ///
    /// A server whose ping limit would force a shorter interval is
    /// refused. Default: `15`.
    pub min_ping_interval_secs: u64,

    /// Delay before the first reconnection attempt after a failed one,
    /// in milliseconds. Doubles per consecutive failure.
    ///
    /// Default: `5000`.
    pub reconnect_delay_ms: u64,

    /// Upper bound for the reconnection delay, in milliseconds.
    ///
    /// Default: `300000` (5 minutes).
    pub max_reconnect_delay_ms: u64,

    /// Seconds before a dial attempt is aborted. Default: `30`.
    pub dial_timeout_secs: u64,

    /// Seconds allowed for the server KX and the welcome message.
    ///
    /// Default: `30`.
    pub welcome_timeout_secs: u64,

    /// Hex encoded signing key the relay identity must match.
    ///
    /// When unset the first identity the relay presents is pinned for
    /// the lifetime of the keeper.
    pub server_sig_key: Option<String>,
}

impl Default for ConnKeeperConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: 60,
            min_ping_interval_secs: 15,
            reconnect_delay_ms: 5_000,
            max_reconnect_delay_ms: 300_000,
            dial_timeout_secs: 30,
            welcome_timeout_secs: 30,
            server_sig_key: None,
        }
    }
}

impl ConnKeeperConfig {
    /// Validates all configuration values.
    ///
    /// Returns `Err(RvlinkError::Config)` if any value is outside its
    /// acceptable range.
    pub fn validate(&self) -> Result<()> {
        if self.reconnect_delay_ms == 0 {
            return Err(RvlinkError::Config {
                reason: "reconnect_delay_ms must be greater than 0".into(),
            });
        }
        if self.max_reconnect_delay_ms < self.reconnect_delay_ms {
            return Err(RvlinkError::Config {
                reason: "max_reconnect_delay_ms must not be below reconnect_delay_ms".into(),
            });
        }
        if self.dial_timeout_secs == 0 {
            return Err(RvlinkError::Config {
                reason: "dial_timeout_secs must be greater than 0".into(),
            });
        }
        if self.welcome_timeout_secs == 0 {
            return Err(RvlinkError::Config {
                reason: "welcome_timeout_secs must be greater than 0".into(),
            });
        }
        if self.server_sig_key.is_some() {
            self.pinned_sig_key()?;
        }
        Ok(())
    }

    /// Decodes `server_sig_key`, if set.
    pub fn pinned_sig_key(&self) -> Result<Option<[u8; 32]>> {
        let Some(encoded) = &self.server_sig_key else {
            return Ok(None);
        };
        let bytes = hex::decode(encoded).map_err(|e| RvlinkError::Config {
            reason: format!("server_sig_key is not hex: {e}"),
        })?;
        let key: [u8; 32] = bytes.try_into().map_err(|_| RvlinkError::Config {
            reason: "server_sig_key must be 32 bytes".into(),
        })?;
        Ok(Some(key))
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn min_ping_interval(&self) -> Duration {
        Duration::from_secs(self.min_ping_interval_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn welcome_timeout(&self) -> Duration {
        Duration::from_secs(self.welcome_timeout_secs)
    }

    /// Delay before the next attempt after `failures` consecutive failed
    /// attempts. Zero failures means the previous session was healthy and
    /// the keeper reconnects immediately.
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let shift = (failures - 1).min(20);
        let delay = self
            .reconnect_delay_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_reconnect_delay_ms);
        Duration::from_millis(delay)
    }
}
