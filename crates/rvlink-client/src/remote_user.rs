//! A linked peer.
//!
//! A [`RemoteUser`] is created once per identity and shared through the
//! registry for the lifetime of the link. A reset or re-KX swaps the
//! ratchet inside it under the per-user lock, so callers holding an
//! `Arc<RemoteUser>` keep using the same object across resets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use rvlink_crypto::ratchet::RatchetState;
use rvlink_types::{PublicIdentity, Result, UserId};

pub struct RemoteUser {
    id: PublicIdentity,
    nick: RwLock<String>,
    ignored: AtomicBool,
    ratchet: Mutex<RatchetState>,
}

impl std::fmt::Debug for RemoteUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteUser")
            .field("uid", &self.id.identity)
            .field("nick", &self.nick())
            .finish()
    }
}

impl RemoteUser {
    pub fn new(id: PublicIdentity, nick: String, ratchet: RatchetState) -> Self {
        Self {
            id,
            nick: RwLock::new(nick),
            ignored: AtomicBool::new(false),
            ratchet: Mutex::new(ratchet),
        }
    }

    pub fn uid(&self) -> UserId {
        self.id.identity
    }

    pub fn public(&self) -> &PublicIdentity {
        &self.id
    }

    /// Nick this peer is known by locally.
    pub fn nick(&self) -> String {
        self.nick.read().map(|n| n.clone()).unwrap_or_default()
    }

    pub fn set_nick(&self, nick: String) {
        if let Ok(mut n) = self.nick.write() {
            *n = nick;
        }
    }

    pub fn is_ignored(&self) -> bool {
        self.ignored.load(Ordering::Relaxed)
    }

    pub fn set_ignored(&self, ignored: bool) {
        self.ignored.store(ignored, Ordering::Relaxed);
    }

    /// Swaps in a fresh ratchet, waiting for in-flight seal/open calls.
    ///
    /// `persist` runs under the per-user lock before the swap; if it
    /// fails the old ratchet stays in place.
    pub async fn replace_ratchet<R, P>(&self, ratchet: RatchetState, persist: P) -> Result<R>
    where
        P: FnOnce(&RatchetState) -> Result<R>,
    {
        let mut current = self.ratchet.lock().await;
        let out = persist(&ratchet)?;
        *current = ratchet;
        tracing::debug!(uid = %self.id.identity.short(), "ratchet replaced");
        Ok(out)
    }

    /// Encrypts with the current ratchet. The advanced state is handed to
    /// `persist` and only kept when that succeeds.
    pub async fn seal<P>(&self, plaintext: &[u8], persist: P) -> Result<Vec<u8>>
    where
        P: FnOnce(&RatchetState) -> Result<()>,
    {
        let mut current = self.ratchet.lock().await;
        let mut next = current.clone();
        let ct = next.seal(plaintext)?;
        persist(&next)?;
        *current = next;
        Ok(ct)
    }

    /// Decrypts with the current ratchet, persisting like [`Self::seal`].
    pub async fn open<P>(&self, ciphertext: &[u8], persist: P) -> Result<Vec<u8>>
    where
        P: FnOnce(&RatchetState) -> Result<()>,
    {
        let mut current = self.ratchet.lock().await;
        let mut next = current.clone();
        let pt = next.open(ciphertext)?;
        persist(&next)?;
        *current = next;
        Ok(pt)
    }

    /// Last times a message was encrypted for and decrypted from this
    /// peer.
    pub async fn last_ratchet_times(&self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        self.ratchet.lock().await.last_times()
    }

    /// Last time a message from this peer was decrypted.
    pub async fn last_decrypt(&self) -> Option<DateTime<Utc>> {
        self.ratchet.lock().await.last_decrypt()
    }

    /// Epoch of the current ratchet.
    pub async fn ratchet_epoch(&self) -> u32 {
        self.ratchet.lock().await.epoch()
    }
}
