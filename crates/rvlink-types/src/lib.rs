//! Core shared types for the rvlink session and identity-linking layer.
//!
//! This crate defines the identifiers, the public identity record, the
//! workspace-wide error enum, configuration and the events exposed to
//! front ends. Every other rvlink crate depends on it; it depends on no
//! other rvlink crate.

pub mod config;
pub mod events;

use std::fmt;
use std::str::FromStr;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Fixed-size identifiers
// ---------------------------------------------------------------------------

/// Declares a 32-byte identifier newtype with hex display/parsing.
macro_rules! id32 {
    ($(#[$meta:meta])* $name:ident, $what:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
        pub struct $name([u8; 32]);

        impl $name {
            /// The fixed byte length of this identifier.
            pub const LEN: usize = 32;

            /// Creates the identifier from raw bytes.
            pub fn new(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// Returns the underlying bytes.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Returns true if every byte is zero.
            pub fn is_empty(&self) -> bool {
                self.0 == [0u8; 32]
            }

            /// Builds the identifier from a slice, which must be exactly
            /// 32 bytes long.
            pub fn from_slice(bytes: &[u8]) -> Result<Self> {
                if bytes.len() != 32 {
                    return Err(RvlinkError::Protocol {
                        reason: format!(
                            "expected 32 bytes for {}, got {}",
                            $what,
                            bytes.len()
                        ),
                    });
                }
                let mut arr = [0u8; 32];
                arr.copy_from_slice(bytes);
                Ok(Self(arr))
            }

            /// Returns the first 8 bytes as hex, used in log fields.
            pub fn short(&self) -> String {
                hex::encode(&self.0[..8])
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.short())
            }
        }

        impl FromStr for $name {
            type Err = RvlinkError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                let bytes = hex::decode(s).map_err(|_| RvlinkError::Protocol {
                    reason: format!("invalid hex encoding for {}", $what),
                })?;
                Self::from_slice(&bytes)
            }
        }
    };
}

id32!(
    /// Stable identity of a peer: a hash over its signing and KX keys.
    ///
    /// This is the key of the peer session registry and of every
    /// persisted per-peer record.
    UserId,
    "user id"
);

id32!(
    /// Rendezvous point on the relay server.
    ///
    /// Peers listen on rendezvous points for specific categories of
    /// incoming messages (initial KX, full KX, reset requests).
    RvId,
    "rendezvous id"
);

id32!(
    /// Identifier of a group chat administered through the group chat
    /// subsystem.
    GroupChatId,
    "group chat id"
);

id32!(
    /// Identifier of a post published through the posts subsystem.
    PostId,
    "post id"
);

impl RvId {
    /// Generates a fresh random rendezvous id from OS entropy.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }
}

// ---------------------------------------------------------------------------
// PublicIdentity
// ---------------------------------------------------------------------------

/// Public identity of a peer as exchanged in invites and KX messages.
///
/// Immutable once KX'd, except for explicitly announced profile updates
/// (currently only the avatar).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PublicIdentity {
    /// Free-form display name.
    pub name: String,
    /// Short nick advertised by the peer.
    pub nick: String,
    /// Ed25519 verifying key.
    pub sig_key: [u8; 32],
    /// X25519 public key used to seal KX payloads to this identity.
    pub kx_key: [u8; 32],
    /// Identity derived from `sig_key` and `kx_key`.
    pub identity: UserId,
    /// Optional avatar image bytes.
    #[serde(default)]
    pub avatar: Option<Vec<u8>>,
}

// ---------------------------------------------------------------------------
// ServerPolicy
// ---------------------------------------------------------------------------

/// Policy advertised by the relay in its welcome message.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ServerPolicy {
    /// Server clock at welcome time (unix seconds).
    pub server_time: i64,
    /// Maximum idle time the server tolerates between pings, in seconds.
    pub ping_limit_secs: u64,
    /// Maximum size of a single relayed message, in bytes.
    pub max_msg_size: u32,
    /// Days the relay keeps unfetched rendezvous data.
    pub expiration_days: u64,
    /// Effective client ping interval in milliseconds (0 disables pings).
    pub ping_interval_ms: u64,
}

// ---------------------------------------------------------------------------
// RvlinkError
// ---------------------------------------------------------------------------

/// Central error type for rvlink.
///
/// All crates in the workspace convert their internal errors into
/// variants of this enum. The enum is `Clone` so it can be forwarded to
/// status observers and callbacks as well as returned to the caller.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RvlinkError {
    /// A transport-level failure (dial, read, write, closed stream).
    #[error("network error: {reason}")]
    Network {
        /// Human-readable description of the network failure.
        reason: String,
    },

    /// The relay refused or is incompatible with this client.
    #[error("unwelcome: {reason}")]
    Unwelcome {
        /// Reason reported by the welcome negotiation.
        reason: String,
    },

    /// A key exchange failed (server-level or peer-level).
    #[error("kx error: {reason}")]
    Kx {
        /// Human-readable description of the KX failure.
        reason: String,
    },

    /// A storage or database operation failed.
    #[error("storage error: {reason}")]
    Storage {
        /// Human-readable description of the storage failure.
        reason: String,
    },

    /// A cryptographic operation failed.
    #[error("crypto error: {reason}")]
    Crypto {
        /// Human-readable description of the cryptographic failure.
        reason: String,
    },

    /// A wire-level encoding or protocol invariant was violated.
    #[error("protocol error: {reason}")]
    Protocol {
        /// Human-readable description of the protocol failure.
        reason: String,
    },

    /// A configuration value is invalid or missing.
    #[error("config error: {reason}")]
    Config {
        /// Human-readable description of the configuration problem.
        reason: String,
    },

    /// A public identity failed validation.
    #[error("invalid identity: {reason}")]
    InvalidIdentity {
        /// Human-readable description of the validation failure.
        reason: String,
    },

    /// The requested record or peer does not exist.
    #[error("not found: {what}")]
    NotFound {
        /// Description of what was looked up.
        what: String,
    },

    /// The record or peer already exists.
    #[error("already exists: {what}")]
    AlreadyExists {
        /// Description of what already exists.
        what: String,
    },

    /// The governing cancellation token fired.
    #[error("operation canceled")]
    Canceled,

    /// A bounded wait elapsed without a result.
    #[error("timed out: {what}")]
    Timeout {
        /// Description of what was being waited for.
        what: String,
    },
}

impl RvlinkError {
    /// Returns true for the `NotFound` sentinel.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true for the `AlreadyExists` sentinel.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Returns true when the error reports cancellation of the root
    /// context, which every call site treats as expected shutdown.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// Returns true for negotiation failures.
    pub fn is_unwelcome(&self) -> bool {
        matches!(self, Self::Unwelcome { .. })
    }

    /// Returns true for KX failures.
    pub fn is_kx(&self) -> bool {
        matches!(self, Self::Kx { .. })
    }

    /// Shorthand for building a `NotFound` error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Shorthand for building an `AlreadyExists` error.
    pub fn already_exists(what: impl Into<String>) -> Self {
        Self::AlreadyExists { what: what.into() }
    }
}

// ---------------------------------------------------------------------------
// Result alias
// ---------------------------------------------------------------------------

/// Convenience result type using [`RvlinkError`].
pub type Result<T> = std::result::Result<T, RvlinkError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
