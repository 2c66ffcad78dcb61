//! Anonymous sealed boxes addressed to an X25519 public key.
//!
//! Format: `ephemeral_pub (32) || nonce (24) || ciphertext`. The AEAD key
//! is `HKDF(DH(eph, recipient), salt = eph_pub || recipient_pub)`, so
//! only the holder of the recipient secret can open the box and the
//! sender stays anonymous at this layer.

use rvlink_types::{Result, RvlinkError};

use crate::aead;
use crate::hkdf::derive_key32;
use crate::identity::{EphemeralKey, LocalIdentity};

const SEALED_BOX_INFO: &[u8] = b"rvlink sealed box v1";

/// Minimum size of a sealed box (empty plaintext).
pub const SEALED_OVERHEAD: usize = 32 + 24 + aead::TAG_LEN;

fn box_key(shared: &[u8; 32], eph_pub: &[u8; 32], recipient: &[u8; 32]) -> Result<[u8; 32]> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(eph_pub);
    salt[32..].copy_from_slice(recipient);
    derive_key32(shared, &salt, SEALED_BOX_INFO)
}

/// Seals `plaintext` so that only the owner of `recipient_kx` can read it.
pub fn seal_to(recipient_kx: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
    let eph = EphemeralKey::generate();
    let eph_pub = eph.public();
    let shared = eph.dh(recipient_kx)?;
    let key = box_key(&shared, &eph_pub, recipient_kx)?;

    let body = aead::seal(&key, plaintext, &eph_pub)?;
    let mut out = Vec::with_capacity(32 + body.len());
    out.extend_from_slice(&eph_pub);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Opens a box produced by [`seal_to`] with the local identity key.
///
/// # Errors
///
/// Returns [`RvlinkError::Crypto`] if the box is truncated or was not
/// sealed to this identity.
pub fn open_sealed(local: &LocalIdentity, sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < SEALED_OVERHEAD {
        return Err(RvlinkError::Crypto {
            reason: format!("sealed box too short: {} bytes", sealed.len()),
        });
    }
    let mut eph_pub = [0u8; 32];
    eph_pub.copy_from_slice(&sealed[..32]);

    let shared = local.dh(&eph_pub)?;
    let recipient = x25519_dalek::PublicKey::from(local.kx_secret()).to_bytes();
    let key = box_key(&shared, &eph_pub, &recipient)?;

    aead::open(&key, &sealed[32..], &eph_pub)
}
