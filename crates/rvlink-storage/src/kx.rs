//! In-flight KX bookkeeping.
//!
//! - `kx/<rv>`: a [`KxRecord`] for every exchange waiting on rendezvous
//!   `rv` (an invite waiting for its half-KX, a half-KX or reset request
//!   waiting for its full-KX).
//! - `kxsearch/<uid>`: a [`KxSearch`] for identities we are trying to
//!   reach through mutual peers.
//! - `unkxd/<uid>`: [`UnkxdUserInfo`] about group chat members we have
//!   not KX'd with yet.

use chrono::{DateTime, Duration, Utc};
use rvlink_types::{GroupChatId, PublicIdentity, Result, RvId, RvlinkError, UserId};
use serde::{Deserialize, Serialize};

use crate::engine::Tx;

const KX_PREFIX: &str = "kx/";
const KX_SEARCH_PREFIX: &str = "kxsearch/";
const UNKXD_PREFIX: &str = "unkxd/";

fn kx_key(rv: &RvId) -> String {
    format!("{KX_PREFIX}{rv}")
}

// ---------------------------------------------------------------------------
// KxRecord
// ---------------------------------------------------------------------------

/// Stage of a stored exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KxStage {
    /// We issued an invite and wait for a half-KX on its initial RV.
    InviteCreated,
    /// We accepted an invite and wait for the full-KX on the step-3 RV.
    HalfKxSent,
    /// We asked a known peer to reset and wait for the full-KX.
    ResetRequested,
}

/// A single in-flight exchange, keyed by the rendezvous it waits on.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KxRecord {
    pub stage: KxStage,
    /// Rendezvous this record waits on.
    pub rv: RvId,
    /// Initial rendezvous of the invite this exchange came from.
    pub initial_rv: RvId,
    /// Our ephemeral X25519 secret for this exchange.
    pub ephemeral: [u8; 32],
    /// Reset rendezvous we announced in this exchange.
    pub my_reset_rv: RvId,
    /// The remote identity, once known.
    pub their: Option<PublicIdentity>,
    /// Peer targeted by a reset.
    pub target: Option<UserId>,
    /// Peer that relayed a mediated reset, if any.
    pub mediator: Option<UserId>,
    pub is_for_reset: bool,
    pub timestamp: DateTime<Utc>,
}

impl KxRecord {
    pub fn is_expired(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        now - self.timestamp > max_age
    }
}

// ---------------------------------------------------------------------------
// KxSearch / UnkxdUserInfo
// ---------------------------------------------------------------------------

/// An ongoing search for a way to KX with `target`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KxSearch {
    pub target: UserId,
    pub started: DateTime<Utc>,
    /// Peers already asked to mediate.
    pub asked: Vec<UserId>,
}

/// What we know about a group chat member we have not KX'd with.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnkxdUserInfo {
    pub uid: UserId,
    pub gc: Option<GroupChatId>,
    pub first_seen: DateTime<Utc>,
    pub mediate_requests: u32,
}

// ---------------------------------------------------------------------------
// Tx accessors
// ---------------------------------------------------------------------------

impl Tx<'_> {
    pub fn put_kx(&mut self, record: &KxRecord) -> Result<()> {
        self.put(&kx_key(&record.rv), record)
    }

    /// Returns the exchange waiting on `rv`.
    ///
    /// # Errors
    ///
    /// [`RvlinkError::NotFound`] when nothing waits on `rv`.
    pub fn kx(&self, rv: &RvId) -> Result<KxRecord> {
        self.get(&kx_key(rv))?
            .ok_or_else(|| RvlinkError::not_found(format!("kx on rv {}", rv.short())))
    }

    pub fn delete_kx(&mut self, rv: &RvId) -> Result<bool> {
        self.delete(&kx_key(rv))
    }

    pub fn list_kxs(&self) -> Result<Vec<KxRecord>> {
        Ok(self
            .scan::<KxRecord>(KX_PREFIX)?
            .into_iter()
            .map(|(_, r)| r)
            .collect())
    }

    /// Returns the pending reset attempt targeting `uid`, if any.
    pub fn pending_reset(&self, uid: &UserId) -> Result<Option<KxRecord>> {
        Ok(self
            .list_kxs()?
            .into_iter()
            .find(|r| r.is_for_reset && r.target.as_ref() == Some(uid)))
    }

    /// Deletes reset attempts older than `max_age` and returns the peers
    /// that still have a fresh attempt in flight.
    pub fn prune_reset_attempts(
        &mut self,
        now: DateTime<Utc>,
        max_age: Duration,
    ) -> Result<Vec<UserId>> {
        let mut fresh = Vec::new();
        for record in self.list_kxs()? {
            if !record.is_for_reset {
                continue;
            }
            if record.is_expired(now, max_age) {
                tracing::debug!(rv = %record.rv.short(), "pruning stale reset attempt");
                self.delete_kx(&record.rv)?;
            } else if let Some(target) = record.target {
                fresh.push(target);
            }
        }
        Ok(fresh)
    }

    /// Deletes non-reset exchanges older than `max_age`. Returns the
    /// rendezvous of the dropped records.
    pub fn prune_expired_kxs(&mut self, now: DateTime<Utc>, max_age: Duration) -> Result<Vec<RvId>> {
        let mut dropped = Vec::new();
        for record in self.list_kxs()? {
            if !record.is_for_reset && record.is_expired(now, max_age) {
                self.delete_kx(&record.rv)?;
                dropped.push(record.rv);
            }
        }
        Ok(dropped)
    }

    pub fn put_kx_search(&mut self, search: &KxSearch) -> Result<()> {
        self.put(&format!("{KX_SEARCH_PREFIX}{}", search.target), search)
    }

    pub fn kx_search(&self, target: &UserId) -> Result<Option<KxSearch>> {
        self.get(&format!("{KX_SEARCH_PREFIX}{target}"))
    }

    /// Removes and returns the KX search for `target`.
    pub fn take_kx_search(&mut self, target: &UserId) -> Result<Option<KxSearch>> {
        let key = format!("{KX_SEARCH_PREFIX}{target}");
        let search = self.get(&key)?;
        if search.is_some() {
            self.delete(&key)?;
        }
        Ok(search)
    }

    pub fn put_unkxd_user(&mut self, info: &UnkxdUserInfo) -> Result<()> {
        self.put(&format!("{UNKXD_PREFIX}{}", info.uid), info)
    }

    pub fn unkxd_user(&self, uid: &UserId) -> Result<Option<UnkxdUserInfo>> {
        self.get(&format!("{UNKXD_PREFIX}{uid}"))
    }

    /// Removes unKX'd bookkeeping for `uid`. Returns whether any existed.
    pub fn remove_unkxd_user(&mut self, uid: &UserId) -> Result<bool> {
        self.delete(&format!("{UNKXD_PREFIX}{uid}"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ClientDb;

    fn reset_record(rv: u8, target: u8, age_days: i64) -> KxRecord {
        KxRecord {
            stage: KxStage::ResetRequested,
            rv: RvId::new([rv; 32]),
            initial_rv: RvId::new([0; 32]),
            ephemeral: [1; 32],
            my_reset_rv: RvId::new([2; 32]),
            their: None,
            target: Some(UserId::new([target; 32])),
            mediator: None,
            is_for_reset: true,
            timestamp: Utc::now() - Duration::days(age_days),
        }
    }

    #[test]
    fn prune_keeps_fresh_attempts() -> std::result::Result<(), RvlinkError> {
        let db = ClientDb::open_temporary(&[3; 32])?;
        db.update(|tx| {
            tx.put_kx(&reset_record(10, 1, 40))?;
            tx.put_kx(&reset_record(11, 2, 1))
        })?;
        let fresh = db.update(|tx| tx.prune_reset_attempts(Utc::now(), Duration::days(30)))?;
        assert_eq!(fresh, vec![UserId::new([2; 32])]);
        let left = db.view(|tx| tx.list_kxs())?;
        assert_eq!(left.len(), 1);
        assert!(db.view(|tx| tx.kx(&RvId::new([10; 32]))).is_err_and(|e| e.is_not_found()));
        Ok(())
    }

    #[test]
    fn pending_reset_lookup() -> std::result::Result<(), RvlinkError> {
        let db = ClientDb::open_temporary(&[3; 32])?;
        db.update(|tx| tx.put_kx(&reset_record(10, 1, 0)))?;
        let found = db.view(|tx| tx.pending_reset(&UserId::new([1; 32])))?;
        assert_eq!(found.map(|r| r.rv), Some(RvId::new([10; 32])));
        assert!(db.view(|tx| tx.pending_reset(&UserId::new([2; 32])))?.is_none());
        Ok(())
    }

    #[test]
    fn expired_invites_pruned_but_resets_untouched() -> std::result::Result<(), RvlinkError> {
        let db = ClientDb::open_temporary(&[3; 32])?;
        let mut invite = reset_record(20, 1, 10);
        invite.stage = KxStage::InviteCreated;
        invite.is_for_reset = false;
        invite.target = None;
        db.update(|tx| {
            tx.put_kx(&invite)?;
            tx.put_kx(&reset_record(21, 2, 10))
        })?;
        let dropped = db.update(|tx| tx.prune_expired_kxs(Utc::now(), Duration::days(7)))?;
        assert_eq!(dropped, vec![RvId::new([20; 32])]);
        assert_eq!(db.view(|tx| tx.list_kxs())?.len(), 1);
        Ok(())
    }

    #[test]
    fn take_kx_search_is_single_shot() -> std::result::Result<(), RvlinkError> {
        let db = ClientDb::open_temporary(&[3; 32])?;
        let target = UserId::new([5; 32]);
        db.update(|tx| {
            tx.put_kx_search(&KxSearch {
                target,
                started: Utc::now(),
                asked: vec![],
            })
        })?;
        assert!(db.update(|tx| tx.take_kx_search(&target))?.is_some());
        assert!(db.update(|tx| tx.take_kx_search(&target))?.is_none());
        Ok(())
    }
}
