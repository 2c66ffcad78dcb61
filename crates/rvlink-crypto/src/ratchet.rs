//! Per-peer symmetric ratchet.
//!
//! Higher layers treat the ratchet as an opaque capability with three
//! operations: [`RatchetState::seal`], [`RatchetState::open`] and
//! [`RatchetState::rotate`]. Internally it is a pair of HKDF hash chains
//! (one per direction) seeded from the KX shared secret. Each message key
//! is used once and the chain key is replaced after every step.
//!
//! # Wire format
//!
//! `epoch (u32 BE) || counter (u32 BE) || nonce (24) || ciphertext`
//!
//! The 8-byte header is authenticated as AAD.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rvlink_types::{Result, RvlinkError};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::aead;
use crate::hkdf::derive_key32;

/// Largest gap between the expected and received counter that the
/// receiving chain will skip over.
pub const MAX_SKIP: u32 = 1000;

const HEADER_LEN: usize = 8;

const INFO_ROOT: &[u8] = b"rvlink ratchet root";
const INFO_CHAIN_A: &[u8] = b"rvlink ratchet chain a";
const INFO_CHAIN_B: &[u8] = b"rvlink ratchet chain b";
const INFO_ROTATE: &[u8] = b"rvlink ratchet rotate";
const INFO_MSG: &[u8] = b"msg";
const INFO_NEXT: &[u8] = b"next";

// ---------------------------------------------------------------------------
// RatchetState
// ---------------------------------------------------------------------------

/// Ratchet state shared with exactly one peer.
#[derive(Clone, Serialize, Deserialize)]
pub struct RatchetState {
    root_key: [u8; 32],
    send_chain: [u8; 32],
    recv_chain: [u8; 32],
    send_count: u32,
    recv_count: u32,
    epoch: u32,
    initiator: bool,
    skipped: BTreeMap<u32, [u8; 32]>,
    last_encrypt: Option<DateTime<Utc>>,
    last_decrypt: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for RatchetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatchetState")
            .field("epoch", &self.epoch)
            .field("send_count", &self.send_count)
            .field("recv_count", &self.recv_count)
            .field("last_encrypt", &self.last_encrypt)
            .field("last_decrypt", &self.last_decrypt)
            .finish_non_exhaustive()
    }
}

impl Drop for RatchetState {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.send_chain.zeroize();
        self.recv_chain.zeroize();
        for key in self.skipped.values_mut() {
            key.zeroize();
        }
    }
}

fn chains_from_root(root: &[u8; 32], initiator: bool) -> Result<([u8; 32], [u8; 32])> {
    let a = derive_key32(root, b"", INFO_CHAIN_A)?;
    let b = derive_key32(root, b"", INFO_CHAIN_B)?;
    Ok(if initiator { (a, b) } else { (b, a) })
}

/// Advances a chain one step, returning `(message_key, next_chain)`.
fn step(chain: &[u8; 32]) -> Result<([u8; 32], [u8; 32])> {
    Ok((
        derive_key32(chain, b"", INFO_MSG)?,
        derive_key32(chain, b"", INFO_NEXT)?,
    ))
}

impl RatchetState {
    /// Seeds a ratchet from a KX shared secret.
    ///
    /// `context` binds the ratchet to the exchange (both sides must pass
    /// the same bytes). Exactly one side passes `initiator = true`.
    pub fn from_shared_secret(shared: &[u8; 32], context: &[u8], initiator: bool) -> Result<Self> {
        let root_key = derive_key32(shared, context, INFO_ROOT)?;
        let (send_chain, recv_chain) = chains_from_root(&root_key, initiator)?;
        Ok(Self {
            root_key,
            send_chain,
            recv_chain,
            send_count: 0,
            recv_count: 0,
            epoch: 0,
            initiator,
            skipped: BTreeMap::new(),
            last_encrypt: None,
            last_decrypt: None,
        })
    }

    /// Encrypts one message and advances the sending chain.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let (mut msg_key, next) = step(&self.send_chain)?;

        let mut header = [0u8; HEADER_LEN];
        header[..4].copy_from_slice(&self.epoch.to_be_bytes());
        header[4..].copy_from_slice(&self.send_count.to_be_bytes());

        let body = aead::seal(&msg_key, plaintext, &header);
        msg_key.zeroize();
        let body = body?;

        self.send_chain = next;
        self.send_count = self.send_count.checked_add(1).ok_or_else(|| RvlinkError::Crypto {
            reason: "ratchet send counter exhausted".into(),
        })?;
        self.last_encrypt = Some(Utc::now());

        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decrypts one message.
    ///
    /// Out-of-order messages within [`MAX_SKIP`] are accepted once. State
    /// is only updated when decryption succeeds.
    ///
    /// # Errors
    ///
    /// - [`RvlinkError::Crypto`] on epoch mismatch, replayed counters,
    ///   gaps larger than [`MAX_SKIP`], or authentication failure.
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < HEADER_LEN {
            return Err(RvlinkError::Crypto {
                reason: "ratchet message shorter than its header".into(),
            });
        }
        let header = &ciphertext[..HEADER_LEN];
        let mut epoch_bytes = [0u8; 4];
        epoch_bytes.copy_from_slice(&header[..4]);
        let mut counter_bytes = [0u8; 4];
        counter_bytes.copy_from_slice(&header[4..]);
        let epoch = u32::from_be_bytes(epoch_bytes);
        let counter = u32::from_be_bytes(counter_bytes);

        if epoch != self.epoch {
            return Err(RvlinkError::Crypto {
                reason: format!("ratchet epoch mismatch: got {epoch} wanted {}", self.epoch),
            });
        }

        let body = &ciphertext[HEADER_LEN..];

        if counter < self.recv_count {
            let msg_key = self.skipped.get(&counter).ok_or_else(|| RvlinkError::Crypto {
                reason: format!("message key {counter} already used"),
            })?;
            let plaintext = aead::open(msg_key, body, header)?;
            if let Some(mut used) = self.skipped.remove(&counter) {
                used.zeroize();
            }
            self.last_decrypt = Some(Utc::now());
            return Ok(plaintext);
        }

        if counter - self.recv_count > MAX_SKIP {
            return Err(RvlinkError::Crypto {
                reason: format!(
                    "ratchet gap too large: counter {counter}, expected {}",
                    self.recv_count
                ),
            });
        }

        let mut chain = self.recv_chain;
        let mut skipped = Vec::new();
        for n in self.recv_count..counter {
            let (mk, next) = step(&chain)?;
            skipped.push((n, mk));
            chain = next;
        }
        let (mut msg_key, next) = step(&chain)?;
        let opened = aead::open(&msg_key, body, header);
        msg_key.zeroize();
        chain.zeroize();
        let plaintext = opened?;

        self.recv_chain = next;
        self.recv_count = counter + 1;
        self.skipped.extend(skipped);
        while self.skipped.len() > MAX_SKIP as usize {
            if let Some((_, mut oldest)) = self.skipped.pop_first() {
                oldest.zeroize();
            }
        }
        self.last_decrypt = Some(Utc::now());
        Ok(plaintext)
    }

    /// Mixes fresh shared secret material into the root and restarts both
    /// chains in a new epoch. Both peers must rotate with the same secret
    /// before exchanging further messages.
    pub fn rotate(&mut self, fresh: &[u8; 32]) -> Result<()> {
        let root_key = derive_key32(fresh, &self.root_key, INFO_ROTATE)?;
        let (send_chain, recv_chain) = chains_from_root(&root_key, self.initiator)?;
        self.root_key = root_key;
        self.send_chain = send_chain;
        self.recv_chain = recv_chain;
        self.send_count = 0;
        self.recv_count = 0;
        for key in self.skipped.values_mut() {
            key.zeroize();
        }
        self.skipped.clear();
        self.epoch = self.epoch.checked_add(1).ok_or_else(|| RvlinkError::Crypto {
            reason: "ratchet epoch exhausted".into(),
        })?;
        Ok(())
    }

    /// Returns `(last_encrypt, last_decrypt)`.
    pub fn last_times(&self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        (self.last_encrypt, self.last_decrypt)
    }

    pub fn last_decrypt(&self) -> Option<DateTime<Utc>> {
        self.last_decrypt
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Overrides the activity timestamps, used when importing state from
    /// another store.
    pub fn restore_times(
        &mut self,
        last_encrypt: Option<DateTime<Utc>>,
        last_decrypt: Option<DateTime<Utc>>,
    ) {
        self.last_encrypt = last_encrypt;
        self.last_decrypt = last_decrypt;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
