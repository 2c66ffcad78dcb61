//! Relay session message set.
//!
//! After the server-level KX every frame on the relay stream carries one
//! CBOR-encoded [`Message`]: a tag used to correlate replies and a
//! [`Command`]. The first message the server sends is always
//! [`Command::Welcome`].

use rvlink_types::RvId;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Relay protocol version spoken by this client. The server must
/// announce exactly this version.
pub const PROTOCOL_VERSION: u32 = 11;

/// First plaintext command sent after TLS to request a KX'd session.
pub const INITIAL_CMD_SESSION: &str = "session";

/// Server clock in unix seconds. Required.
pub const PROP_SERVER_TIME: &str = "server_time";
/// Maximum tolerated ping interval, in seconds.
pub const PROP_PING_LIMIT: &str = "ping_limit";
/// Version selecting the maximum message size.
pub const PROP_MAX_MSG_SIZE_VERSION: &str = "max_msg_size_version";
/// Days the server keeps unfetched rendezvous data.
pub const PROP_EXPIRATION_DAYS: &str = "expiration_days";

/// Ping limit assumed when the server does not announce one.
pub const PROP_PING_LIMIT_DEFAULT_SECS: u64 = 300;
/// Expiration assumed when the server does not announce one.
pub const PROP_EXPIRATION_DAYS_DEFAULT: u64 = 7;

/// Returns the maximum message size for a given size version, or
/// `None` for versions this client does not know.
pub fn max_msg_size_for_version(version: u64) -> Option<u32> {
    match version {
        0 => Some(1024 * 1024),
        1 => Some(10 * 1024 * 1024),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Welcome
// ---------------------------------------------------------------------------

/// A single server-announced property.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ServerProperty {
    pub key: String,
    pub value: String,
    /// When true, a client that does not understand `key` must refuse
    /// the session.
    pub required: bool,
}

/// First message of every relay session.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Welcome {
    pub version: u32,
    pub server_time: i64,
    pub properties: Vec<ServerProperty>,
}

/// Properties this client understands, with their default values.
pub fn supported_server_properties() -> Vec<ServerProperty> {
    vec![
        ServerProperty {
            key: PROP_SERVER_TIME.into(),
            value: String::new(),
            required: true,
        },
        ServerProperty {
            key: PROP_PING_LIMIT.into(),
            value: PROP_PING_LIMIT_DEFAULT_SECS.to_string(),
            required: false,
        },
        ServerProperty {
            key: PROP_MAX_MSG_SIZE_VERSION.into(),
            value: "0".into(),
            required: false,
        },
        ServerProperty {
            key: PROP_EXPIRATION_DAYS.into(),
            value: PROP_EXPIRATION_DAYS_DEFAULT.to_string(),
            required: false,
        },
    ]
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Commands exchanged over an established relay session.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Server greeting with version and properties.
    Welcome(Welcome),
    /// Keepalive sent by the client.
    Ping,
    /// Keepalive answer.
    Pong,
    /// Ask the relay to forward anything pushed to `rv`.
    Subscribe { rv: RvId },
    /// Stop forwarding `rv`.
    Unsubscribe { rv: RvId },
    /// Store `payload` at `rv` for whoever subscribes to it.
    Push { rv: RvId, payload: Vec<u8> },
    /// Server delivering data pushed to a subscribed rendezvous.
    Routed { rv: RvId, payload: Vec<u8> },
    /// Store a prepaid invite blob at `rv`.
    PushPrepaid { rv: RvId, payload: Vec<u8> },
    /// Fetch (and consume) the prepaid invite blob at `rv`.
    FetchPrepaid { rv: RvId },
    /// Reply to the request carrying the same tag.
    Reply {
        error: Option<String>,
        payload: Option<Vec<u8>>,
    },
}

impl Command {
    /// Short name used in log fields.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Welcome(_) => "welcome",
            Command::Ping => "ping",
            Command::Pong => "pong",
            Command::Subscribe { .. } => "subscribe",
            Command::Unsubscribe { .. } => "unsubscribe",
            Command::Push { .. } => "push",
            Command::Routed { .. } => "routed",
            Command::PushPrepaid { .. } => "push_prepaid",
            Command::FetchPrepaid { .. } => "fetch_prepaid",
            Command::Reply { .. } => "reply",
        }
    }
}

/// Envelope for every relay command.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Request tag; replies echo it. Zero for unsolicited messages.
    pub tag: u32,
    pub command: Command,
}

impl Message {
    pub fn new(tag: u32, command: Command) -> Self {
        Self { tag, command }
    }

    /// Builds a reply to `tag`.
    pub fn reply(tag: u32, error: Option<String>, payload: Option<Vec<u8>>) -> Self {
        Self {
            tag,
            command: Command::Reply { error, payload },
        }
    }
}
