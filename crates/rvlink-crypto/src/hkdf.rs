//! HKDF-SHA256 key derivation.
//!
//! Used to turn Diffie-Hellman outputs into ratchet chains, to split the
//! server session secret into directional keys, to derive storage
//! sub-keys and to map a prepaid invite key onto its rendezvous id.
//!
//! Output is zeroized on drop.

use hkdf::Hkdf;
use rvlink_types::{Result, RvlinkError};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Maximum output length in bytes.
const MAX_OUTPUT_LEN: usize = 64;

// ---------------------------------------------------------------------------
// HkdfOutput
// ---------------------------------------------------------------------------

/// Key material derived by HKDF-SHA256.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct HkdfOutput {
    bytes: Vec<u8>,
}

impl HkdfOutput {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

// HkdfOutput does not implement Clone/Debug to prevent leakage.

// ---------------------------------------------------------------------------
// Key derivation
// ---------------------------------------------------------------------------

/// Derives `output_len` bytes from `ikm` using HKDF-SHA256.
///
/// # Errors
///
/// - [`RvlinkError::Crypto`] if `output_len` is 0 or exceeds 64.
pub fn hkdf_sha256(ikm: &[u8], salt: &[u8], info: &[u8], output_len: usize) -> Result<HkdfOutput> {
    if output_len == 0 {
        return Err(RvlinkError::Crypto {
            reason: "HKDF output length must be at least 1 byte".into(),
        });
    }

    if output_len > MAX_OUTPUT_LEN {
        return Err(RvlinkError::Crypto {
            reason: format!("HKDF output length {output_len} exceeds maximum {MAX_OUTPUT_LEN}"),
        });
    }

    let salt_opt: Option<&[u8]> = if salt.is_empty() { None } else { Some(salt) };
    let hk = Hkdf::<Sha256>::new(salt_opt, ikm);

    let mut okm = vec![0u8; output_len];
    hk.expand(info, &mut okm).map_err(|e| RvlinkError::Crypto {
        reason: format!("HKDF-SHA256 expansion failed: {e}"),
    })?;

    Ok(HkdfOutput { bytes: okm })
}

/// Derives a single 32-byte key.
pub fn derive_key32(ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<[u8; 32]> {
    let out = hkdf_sha256(ikm, salt, info, 32)?;
    let mut key = [0u8; 32];
    key.copy_from_slice(out.as_bytes());
    Ok(key)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
