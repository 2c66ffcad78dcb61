//! Address book entries and per-peer ratchet state.
//!
//! Keys: `ab/<uid>` for [`AddressBookEntry`], `ratchet/<uid>` for the
//! peer's [`RatchetState`]. Both are written in the same transaction
//! whenever a peer is linked.

use chrono::{DateTime, Utc};
use rvlink_crypto::ratchet::RatchetState;
use rvlink_types::{PublicIdentity, Result, RvId, RvlinkError, UserId};
use serde::{Deserialize, Serialize};

use crate::engine::Tx;

const AB_PREFIX: &str = "ab/";
const RATCHET_PREFIX: &str = "ratchet/";

fn ab_key(uid: &UserId) -> String {
    format!("{AB_PREFIX}{uid}")
}

fn ratchet_key(uid: &UserId) -> String {
    format!("{RATCHET_PREFIX}{uid}")
}

// ---------------------------------------------------------------------------
// AddressBookEntry
// ---------------------------------------------------------------------------

/// Persisted metadata about a linked peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressBookEntry {
    /// The peer's public identity as received during KX.
    pub id: PublicIdentity,
    /// Rendezvous where we listen for reset requests from this peer.
    pub my_reset_rv: RvId,
    /// Rendezvous where the peer listens for our reset requests.
    pub their_reset_rv: RvId,
    pub ignored: bool,
    pub first_created: DateTime<Utc>,
    /// Local nick override. Wins over the nick the peer announces.
    pub nick_alias: Option<String>,
    pub last_handshake_attempt: Option<DateTime<Utc>>,
    pub last_completed_kx: Option<DateTime<Utc>>,
}

impl AddressBookEntry {
    /// Nick shown locally: the alias if set, else the announced nick.
    pub fn nick(&self) -> &str {
        self.nick_alias.as_deref().unwrap_or(&self.id.nick)
    }
}

// ---------------------------------------------------------------------------
// Tx accessors
// ---------------------------------------------------------------------------

impl Tx<'_> {
    /// Returns the address book entry of `uid`.
    ///
    /// # Errors
    ///
    /// [`RvlinkError::NotFound`] if the peer is not in the address book.
    pub fn address_book_entry(&self, uid: &UserId) -> Result<AddressBookEntry> {
        self.get(&ab_key(uid))?
            .ok_or_else(|| RvlinkError::not_found(format!("address book entry {}", uid.short())))
    }

    pub fn put_address_book_entry(&mut self, entry: &AddressBookEntry) -> Result<()> {
        self.put(&ab_key(&entry.id.identity), entry)
    }

    pub fn address_book_entries(&self) -> Result<Vec<AddressBookEntry>> {
        Ok(self
            .scan::<AddressBookEntry>(AB_PREFIX)?
            .into_iter()
            .map(|(_, e)| e)
            .collect())
    }

    /// Finds the peer whose reset requests arrive on `rv`.
    pub fn peer_by_my_reset_rv(&self, rv: &RvId) -> Result<Option<UserId>> {
        Ok(self
            .address_book_entries()?
            .into_iter()
            .find(|e| e.my_reset_rv == *rv)
            .map(|e| e.id.identity))
    }

    /// Records (or clears) the time of the last handshake attempt.
    pub fn set_last_handshake_attempt(
        &mut self,
        uid: &UserId,
        when: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut entry = self.address_book_entry(uid)?;
        entry.last_handshake_attempt = when;
        self.put_address_book_entry(&entry)
    }

    pub fn ratchet(&self, uid: &UserId) -> Result<RatchetState> {
        self.get(&ratchet_key(uid))?
            .ok_or_else(|| RvlinkError::not_found(format!("ratchet {}", uid.short())))
    }

    pub fn put_ratchet(&mut self, uid: &UserId, ratchet: &RatchetState) -> Result<()> {
        self.put(&ratchet_key(uid), ratchet)
    }

    /// Removes the address book entry and ratchet of `uid`, together
    /// with its post subscription flag and peer-keyed post-KX actions.
    ///
    /// # Errors
    ///
    /// [`RvlinkError::NotFound`] if no address book entry existed.
    pub fn remove_peer(&mut self, uid: &UserId) -> Result<()> {
        if !self.delete(&ab_key(uid))? {
            return Err(RvlinkError::not_found(format!(
                "address book entry {}",
                uid.short()
            )));
        }
        self.delete(&ratchet_key(uid))?;
        self.set_posts_subscription(uid, false)?;
        self.delete_post_kx_actions(uid)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
