//! Relay session handshake and the encrypted message stream.
//!
//! [`read_server_hello`] and [`client_kx`] run the client side of the
//! handshake described in [`rvlink_wire::session`]. [`accept_session`]
//! runs the relay side; it is what in-process relays use.
//!
//! After the handshake the stream is split into an [`EncryptedReader`]
//! and an [`EncryptedWriter`]. Each direction has its own key and a
//! strictly increasing counter nonce, so frames cannot be replayed or
//! reordered without failing authentication.
//!
//! # Errors
//!
//! Every failure during the KX itself (including I/O) surfaces as
//! [`RvlinkError::Kx`]. Once established, stream I/O failures are
//! [`RvlinkError::Network`] and authentication failures are
//! [`RvlinkError::Crypto`].

use async_trait::async_trait;
use tokio::io::{ReadHalf, WriteHalf};
use zeroize::Zeroizing;

use rvlink_crypto::aead::{decrypt_xchacha20, encrypt_xchacha20, AeadNonce};
use rvlink_crypto::hkdf::derive_key32;
use rvlink_crypto::identity::{validate_public_identity, verify_signature, EphemeralKey, LocalIdentity};
use rvlink_types::{PublicIdentity, Result, RvlinkError};
use rvlink_wire::codec::{decode_cbor, encode_cbor, read_frame, write_frame, MAX_FRAME_SIZE};
use rvlink_wire::message::{Message, INITIAL_CMD_SESSION};
use rvlink_wire::session::{
    server_kx_signing_bytes, session_salt, ClientKx, ServerHello, ServerKx, CLIENT_TO_SERVER_INFO,
    SERVER_TO_CLIENT_INFO,
};

use crate::dialer::BoxStream;

/// Upper bound on a plaintext handshake frame.
const HANDSHAKE_FRAME_LIMIT: usize = 64 * 1024;

fn kx_err(stage: &str, e: RvlinkError) -> RvlinkError {
    match e {
        RvlinkError::Kx { .. } => e,
        other => RvlinkError::Kx {
            reason: format!("{stage}: {other}"),
        },
    }
}

// ---------------------------------------------------------------------------
// Encrypted halves
// ---------------------------------------------------------------------------

/// Anything that yields relay messages. Implemented by the encrypted
/// stream and by test doubles.
#[async_trait]
pub trait MessageSource: Send {
    async fn read_msg(&mut self) -> Result<Message>;
}

pub struct EncryptedReader {
    inner: ReadHalf<BoxStream>,
    key: Zeroizing<[u8; 32]>,
    counter: u64,
}

impl EncryptedReader {
    pub async fn read_msg(&mut self) -> Result<Message> {
        let frame = read_frame(&mut self.inner, MAX_FRAME_SIZE).await?;
        let nonce = AeadNonce::from_counter(self.counter);
        let plain = decrypt_xchacha20(&self.key, &nonce, &frame, &[])?;
        self.counter += 1;
        decode_cbor(&plain)
    }
}

#[async_trait]
impl MessageSource for EncryptedReader {
    async fn read_msg(&mut self) -> Result<Message> {
        EncryptedReader::read_msg(self).await
    }
}

pub struct EncryptedWriter {
    inner: WriteHalf<BoxStream>,
    key: Zeroizing<[u8; 32]>,
    counter: u64,
}

impl EncryptedWriter {
    pub async fn write_msg(&mut self, msg: &Message) -> Result<()> {
        let plain = encode_cbor(msg)?;
        let nonce = AeadNonce::from_counter(self.counter);
        let sealed = encrypt_xchacha20(&self.key, &nonce, &plain, &[])?;
        self.counter += 1;
        write_frame(&mut self.inner, &sealed, MAX_FRAME_SIZE).await
    }
}

fn split(stream: BoxStream, recv: [u8; 32], send: [u8; 32]) -> (EncryptedReader, EncryptedWriter) {
    let (r, w) = tokio::io::split(stream);
    (
        EncryptedReader {
            inner: r,
            key: Zeroizing::new(recv),
            counter: 0,
        },
        EncryptedWriter {
            inner: w,
            key: Zeroizing::new(send),
            counter: 0,
        },
    )
}

fn derive_stream_keys(shared: &[u8; 32], client_eph: &[u8; 32], server_eph: &[u8; 32]) -> Result<([u8; 32], [u8; 32])> {
    let salt = session_salt(client_eph, server_eph);
    let c2s = derive_key32(shared, &salt, CLIENT_TO_SERVER_INFO)?;
    let s2c = derive_key32(shared, &salt, SERVER_TO_CLIENT_INFO)?;
    Ok((c2s, s2c))
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

/// Reads the relay's identity from a freshly dialed stream.
pub async fn read_server_hello(stream: &mut BoxStream) -> Result<PublicIdentity> {
    let frame = read_frame(stream, HANDSHAKE_FRAME_LIMIT).await?;
    let hello: ServerHello = decode_cbor(&frame)?;
    validate_public_identity(&hello.identity, 0)?;
    Ok(hello.identity)
}

/// Runs the client side of the session KX against a relay whose identity
/// was already confirmed.
pub async fn client_kx(
    mut stream: BoxStream,
    server: &PublicIdentity,
) -> Result<(EncryptedReader, EncryptedWriter)> {
    let eph = EphemeralKey::generate();
    let client_pub = eph.public();

    let cmd = encode_cbor(&INITIAL_CMD_SESSION).map_err(|e| kx_err("encoding session command", e))?;
    write_frame(&mut stream, &cmd, HANDSHAKE_FRAME_LIMIT)
        .await
        .map_err(|e| kx_err("writing session command", e))?;
    let hello = encode_cbor(&ClientKx { ephemeral: client_pub }).map_err(|e| kx_err("encoding client kx", e))?;
    write_frame(&mut stream, &hello, HANDSHAKE_FRAME_LIMIT)
        .await
        .map_err(|e| kx_err("writing client kx", e))?;

    let frame = read_frame(&mut stream, HANDSHAKE_FRAME_LIMIT)
        .await
        .map_err(|e| kx_err("reading server kx", e))?;
    let reply: ServerKx = decode_cbor(&frame).map_err(|e| kx_err("decoding server kx", e))?;
    verify_signature(
        &server.sig_key,
        &server_kx_signing_bytes(&client_pub, &reply.ephemeral),
        &reply.sig,
    )
    .map_err(|e| kx_err("verifying server kx", e))?;

    let shared = eph.dh(&reply.ephemeral).map_err(|e| kx_err("server kx dh", e))?;
    let (c2s, s2c) = derive_stream_keys(&shared, &client_pub, &reply.ephemeral)?;
    Ok(split(stream, s2c, c2s))
}

// ---------------------------------------------------------------------------
// Relay side
// ---------------------------------------------------------------------------

/// Runs the relay side of the handshake: announces `identity`, waits for
/// the session command and the client ephemeral, and answers with a
/// signed server ephemeral.
pub async fn accept_session(
    mut stream: BoxStream,
    identity: &LocalIdentity,
) -> Result<(EncryptedReader, EncryptedWriter)> {
    let hello = encode_cbor(&ServerHello {
        identity: identity.public(),
    })?;
    write_frame(&mut stream, &hello, HANDSHAKE_FRAME_LIMIT).await?;

    let cmd: String = decode_cbor(&read_frame(&mut stream, HANDSHAKE_FRAME_LIMIT).await?)?;
    if cmd != INITIAL_CMD_SESSION {
        return Err(RvlinkError::Protocol {
            reason: format!("unexpected initial command {cmd:?}"),
        });
    }
    let client: ClientKx = decode_cbor(&read_frame(&mut stream, HANDSHAKE_FRAME_LIMIT).await?)?;

    let eph = EphemeralKey::generate();
    let server_pub = eph.public();
    let sig = identity.sign(&server_kx_signing_bytes(&client.ephemeral, &server_pub));
    let reply = encode_cbor(&ServerKx {
        ephemeral: server_pub,
        sig: sig.to_vec(),
    })?;
    write_frame(&mut stream, &reply, HANDSHAKE_FRAME_LIMIT).await?;

    let shared = eph.dh(&client.ephemeral)?;
    let (c2s, s2c) = derive_stream_keys(&shared, &client.ephemeral, &server_pub)?;
    Ok(split(stream, c2s, s2c))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rvlink_wire::message::Command;

    #[tokio::test]
    async fn both_sides_agree_on_keys() -> std::result::Result<(), RvlinkError> {
        let relay = LocalIdentity::generate("relay", "relay");
        let (c, s) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(async move { accept_session(Box::new(s), &relay).await });

        let mut client_stream: BoxStream = Box::new(c);
        let server_id = read_server_hello(&mut client_stream).await?;
        let (mut cr, mut cw) = client_kx(client_stream, &server_id).await?;
        let (mut sr, mut sw) = server
            .await
            .map_err(|e| RvlinkError::Network { reason: e.to_string() })??;

        cw.write_msg(&Message::new(1, Command::Ping)).await?;
        assert_eq!(sr.read_msg().await?.command, Command::Ping);
        sw.write_msg(&Message::new(1, Command::Pong)).await?;
        sw.write_msg(&Message::new(2, Command::Pong)).await?;
        assert_eq!(cr.read_msg().await?.tag, 1);
        assert_eq!(cr.read_msg().await?.tag, 2);
        Ok(())
    }

    #[tokio::test]
    async fn wrong_server_identity_fails_kx() -> std::result::Result<(), RvlinkError> {
        let relay = LocalIdentity::generate("relay", "relay");
        let impostor = LocalIdentity::generate("relay", "relay").public();
        let (c, s) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move { accept_session(Box::new(s), &relay).await });

        let mut client_stream: BoxStream = Box::new(c);
        read_server_hello(&mut client_stream).await?;
        let err = client_kx(client_stream, &impostor).await.err();
        assert!(err.is_some_and(|e| e.is_kx()));
        Ok(())
    }

    #[tokio::test]
    async fn write_failure_is_a_kx_error() {
        let server = LocalIdentity::generate("relay", "relay").public();
        let (c, s) = tokio::io::duplex(1024);
        drop(s);
        let err = client_kx(Box::new(c), &server).await.err();
        assert!(err.is_some_and(|e| e.is_kx()));
    }
}
