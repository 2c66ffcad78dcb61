//! SHA3-256 hashing and user id derivation.

use rvlink_types::UserId;
use sha3::{Digest, Sha3_256};

/// Computes the SHA3-256 hash of arbitrary data.
pub fn sha3_256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&result);
    out
}

/// Derives the stable [`UserId`] of an identity.
///
/// Formula: `UserId = SHA3-256(sig_key || kx_key)`.
pub fn compute_user_id(sig_key: &[u8; 32], kx_key: &[u8; 32]) -> UserId {
    let mut hasher = Sha3_256::new();
    hasher.update(sig_key);
    hasher.update(kx_key);
    let result = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&result);
    UserId::new(out)
}
