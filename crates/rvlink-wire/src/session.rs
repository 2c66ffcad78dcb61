//! Relay session handshake.
//!
//! The handshake runs in plaintext frames directly on the dialed stream:
//!
//! 1. server -> client: [`ServerHello`] carrying the relay identity.
//! 2. client -> server: the [`INITIAL_CMD_SESSION`](crate::message::INITIAL_CMD_SESSION) string.
//! 3. client -> server: [`ClientKx`] with a fresh X25519 public key.
//! 4. server -> client: [`ServerKx`] with the server ephemeral and a
//!    signature by the relay identity over both ephemerals.
//!
//! Every later frame is encrypted with the directional keys derived from
//! the shared secret.

use rvlink_types::PublicIdentity;
use serde::{Deserialize, Serialize};

/// Domain separator for the server KX signature.
const SERVER_KX_CONTEXT: &[u8] = b"rvlink-server-kx-v1";

/// HKDF info for the client-to-server stream key.
pub const CLIENT_TO_SERVER_INFO: &[u8] = b"rvlink session c2s";
/// HKDF info for the server-to-client stream key.
pub const SERVER_TO_CLIENT_INFO: &[u8] = b"rvlink session s2c";

/// First frame sent by the relay.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ServerHello {
    pub identity: PublicIdentity,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ClientKx {
    pub ephemeral: [u8; 32],
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ServerKx {
    pub ephemeral: [u8; 32],
    pub sig: Vec<u8>,
}

/// Bytes the relay signs to bind its ephemeral to the client's.
pub fn server_kx_signing_bytes(client_ephemeral: &[u8; 32], server_ephemeral: &[u8; 32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(SERVER_KX_CONTEXT.len() + 64);
    out.extend_from_slice(SERVER_KX_CONTEXT);
    out.extend_from_slice(client_ephemeral);
    out.extend_from_slice(server_ephemeral);
    out
}

/// HKDF salt shared by both stream keys.
pub fn session_salt(client_ephemeral: &[u8; 32], server_ephemeral: &[u8; 32]) -> [u8; 64] {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(client_ephemeral);
    salt[32..].copy_from_slice(server_ephemeral);
    salt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signing_bytes_depend_on_order() {
        let a = server_kx_signing_bytes(&[1; 32], &[2; 32]);
        let b = server_kx_signing_bytes(&[2; 32], &[1; 32]);
        assert_ne!(a, b);
        assert!(a.starts_with(SERVER_KX_CONTEXT));
    }

    #[test]
    fn salt_layout() {
        let salt = session_salt(&[1; 32], &[2; 32]);
        assert_eq!(salt[0], 1);
        assert_eq!(salt[63], 2);
    }
}
