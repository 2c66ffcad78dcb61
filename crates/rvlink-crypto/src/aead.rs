//! XChaCha20-Poly1305 authenticated encryption with associated data.
//!
//! All symmetric encryption in rvlink uses XChaCha20-Poly1305 with
//! 192-bit nonces drawn from OS entropy. [`seal`] and [`open`] pack the
//! nonce in front of the ciphertext so a blob is self-contained.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use rvlink_types::{Result, RvlinkError};

/// Length of the Poly1305 tag appended to every ciphertext.
pub const TAG_LEN: usize = 16;

// ---------------------------------------------------------------------------
// AeadNonce
// ---------------------------------------------------------------------------

/// 192-bit (24-byte) nonce for XChaCha20-Poly1305.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AeadNonce([u8; 24]);

impl AeadNonce {
    /// Fixed byte length of an XChaCha20-Poly1305 nonce.
    pub const LEN: usize = 24;

    pub fn from_bytes(bytes: [u8; 24]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 24] {
        &self.0
    }

    /// Builds a nonce whose last 8 bytes hold a big-endian counter.
    /// Used by sequenced streams where each key is paired with a
    /// strictly increasing counter.
    pub fn from_counter(counter: u64) -> Self {
        let mut bytes = [0u8; 24];
        bytes[16..].copy_from_slice(&counter.to_be_bytes());
        Self(bytes)
    }
}

/// Generates a fresh random nonce from OS entropy.
pub fn generate_aead_nonce() -> AeadNonce {
    let mut bytes = [0u8; 24];
    OsRng.fill_bytes(&mut bytes);
    AeadNonce(bytes)
}

// ---------------------------------------------------------------------------
// Encrypt / Decrypt
// ---------------------------------------------------------------------------

/// Encrypts `plaintext` with XChaCha20-Poly1305. The returned ciphertext
/// carries the 16-byte tag.
pub fn encrypt_xchacha20(
    key: &[u8; 32],
    nonce: &AeadNonce,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let xnonce = XNonce::from_slice(&nonce.0);
    let payload = Payload { msg: plaintext, aad };

    cipher.encrypt(xnonce, payload).map_err(|e| RvlinkError::Crypto {
        reason: format!("XChaCha20-Poly1305 encryption failed: {e}"),
    })
}

/// Decrypts `ciphertext` with XChaCha20-Poly1305.
///
/// # Errors
///
/// Returns [`RvlinkError::Crypto`] if the tag does not verify (wrong
/// key, nonce, AAD, or tampered data).
pub fn decrypt_xchacha20(
    key: &[u8; 32],
    nonce: &AeadNonce,
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let xnonce = XNonce::from_slice(&nonce.0);
    let payload = Payload {
        msg: ciphertext,
        aad,
    };

    cipher.decrypt(xnonce, payload).map_err(|e| RvlinkError::Crypto {
        reason: format!("XChaCha20-Poly1305 decryption failed: {e}"),
    })
}

// ---------------------------------------------------------------------------
// Packed form
// ---------------------------------------------------------------------------

/// Encrypts under a random nonce and returns `nonce || ciphertext`.
pub fn seal(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let nonce = generate_aead_nonce();
    let ciphertext = encrypt_xchacha20(key, &nonce, plaintext, aad)?;
    let mut packed = Vec::with_capacity(AeadNonce::LEN + ciphertext.len());
    packed.extend_from_slice(nonce.as_bytes());
    packed.extend_from_slice(&ciphertext);
    Ok(packed)
}

/// Reverses [`seal`].
pub fn open(key: &[u8; 32], packed: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    if packed.len() < AeadNonce::LEN + TAG_LEN {
        return Err(RvlinkError::Crypto {
            reason: format!("sealed blob too short: {} bytes", packed.len()),
        });
    }
    let (nonce_bytes, ciphertext) = packed.split_at(AeadNonce::LEN);
    let mut nonce = [0u8; 24];
    nonce.copy_from_slice(nonce_bytes);
    decrypt_xchacha20(key, &AeadNonce(nonce), ciphertext, aad)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() -> std::result::Result<(), RvlinkError> {
        let key = [0x42u8; 32];
        let nonce = generate_aead_nonce();
        let ct = encrypt_xchacha20(&key, &nonce, b"hello rvlink", b"meta")?;
        assert_eq!(ct.len(), b"hello rvlink".len() + TAG_LEN);
        let pt = decrypt_xchacha20(&key, &nonce, &ct, b"meta")?;
        assert_eq!(pt, b"hello rvlink");
        Ok(())
    }

    #[test]
    fn wrong_aad_fails_decrypt() -> std::result::Result<(), RvlinkError> {
        let key = [0x42u8; 32];
        let nonce = generate_aead_nonce();
        let ct = encrypt_xchacha20(&key, &nonce, b"secret", b"correct")?;
        assert!(decrypt_xchacha20(&key, &nonce, &ct, b"wrong").is_err());
        Ok(())
    }

    #[test]
    fn sealed_blob_roundtrip() -> std::result::Result<(), RvlinkError> {
        let key = [0x07u8; 32];
        let packed = seal(&key, b"invite", b"")?;
        assert_eq!(packed.len(), AeadNonce::LEN + 6 + TAG_LEN);
        assert_eq!(open(&key, &packed, b"")?, b"invite");
        Ok(())
    }

    #[test]
    fn sealed_blob_wrong_key_rejected() -> std::result::Result<(), RvlinkError> {
        let packed = seal(&[0x01u8; 32], b"invite", b"")?;
        assert!(open(&[0x02u8; 32], &packed, b"").is_err());
        Ok(())
    }

    #[test]
    fn short_blob_rejected() {
        assert!(open(&[0u8; 32], &[0u8; 10], b"").is_err());
    }

    #[test]
    fn counter_nonces_differ() {
        assert_ne!(AeadNonce::from_counter(1), AeadNonce::from_counter(2));
        assert_eq!(&AeadNonce::from_counter(1).as_bytes()[..16], &[0u8; 16]);
    }
}
