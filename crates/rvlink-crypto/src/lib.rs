//! Cryptographic primitives for rvlink.
//!
//! This crate is the only place in the workspace that touches raw key
//! material. Higher layers work with the types exported here.
//!
//! # Modules
//!
//! - [`aead`]: XChaCha20-Poly1305 encryption and nonce-prefixed packing
//! - [`hkdf`]: HKDF-SHA256 key derivation
//! - [`hash`]: SHA3-256 hashing and user id derivation
//! - [`identity`]: local Ed25519/X25519 identity, signing and identity validation
//! - [`sealed`]: anonymous sealed boxes addressed to an X25519 key
//! - [`ratchet`]: per-peer symmetric ratchet (seal/open/rotate)

pub mod aead;
pub mod hash;
pub mod hkdf;
pub mod identity;
pub mod ratchet;
pub mod sealed;
