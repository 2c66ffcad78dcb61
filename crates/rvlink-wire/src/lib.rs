//! Wire formats for the rvlink relay session and peer handshakes.
//!
//! Everything that crosses a process boundary is defined here: the
//! length-prefixed CBOR framing of the relay stream, the relay session
//! handshake, the relay command set, out-of-band identity invites, prepaid invite keys and the peer
//! KX payloads.

pub mod codec;
pub mod invite;
pub mod kx;
pub mod message;
pub mod session;
