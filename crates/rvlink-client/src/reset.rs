//! Ratchet resets.
//!
//! A reset is a KX with an already linked peer. The requester pushes a
//! [`ResetRequest`] to the peer's reset rendezvous and waits on a fresh
//! step-3 rendezvous; the peer answers with a full-KX and both sides
//! swap the ratchet of their existing registry entry.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use rvlink_crypto::identity::EphemeralKey;
use rvlink_crypto::ratchet::RatchetState;
use rvlink_storage::{KxRecord, KxStage};
use rvlink_types::{Result, RvId, RvlinkError, UserId};
use rvlink_wire::kx::{FullKx, KxPayload, ResetRequest};

use crate::client::{Client, Inner};
use crate::kx::verify_payload;
use crate::link::LinkRequest;

/// Result of [`Client::reset_all_old_ratchets`].
#[derive(Debug)]
pub struct ResetReport {
    /// Every peer a reset was started for.
    pub attempted: Vec<UserId>,
    /// First error reported by any of the resets. Later errors are only
    /// logged.
    pub first_error: Option<RvlinkError>,
}

impl ResetReport {
    pub fn into_result(self) -> Result<Vec<UserId>> {
        match self.first_error {
            Some(e) => Err(e),
            None => Ok(self.attempted),
        }
    }
}

/// Marks a reset with one peer as running until dropped.
struct InFlight {
    inner: Arc<Inner>,
    uid: UserId,
}

impl InFlight {
    fn acquire(inner: &Arc<Inner>, uid: UserId) -> Result<Option<Self>> {
        let mut running = inner.resets_in_flight.lock().map_err(|_| RvlinkError::Storage {
            reason: "reset set poisoned".into(),
        })?;
        if !running.insert(uid) {
            return Ok(None);
        }
        Ok(Some(Self {
            inner: Arc::clone(inner),
            uid,
        }))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Ok(mut running) = self.inner.resets_in_flight.lock() {
            running.remove(&self.uid);
        }
    }
}

impl Client {
    /// Asks `uid` to reset our shared ratchet.
    ///
    /// Safe to call again when the outcome of an earlier call is unknown:
    /// a stored attempt is replaced by the new one. A call made while
    /// another reset with the same peer is still being sent returns
    /// immediately.
    ///
    /// # Errors
    ///
    /// - [`RvlinkError::NotFound`] if `uid` is not linked.
    /// - [`RvlinkError::Kx`] if the request could not be sent.
    pub async fn reset_ratchet(&self, uid: &UserId) -> Result<()> {
        let Some(_running) = InFlight::acquire(&self.inner, *uid)? else {
            tracing::debug!(uid = %uid.short(), "reset already in flight");
            return Ok(());
        };
        let user = self.inner.registry.by_id(uid)?;
        let entry = self.inner.db.view(|tx| tx.address_book_entry(uid))?;

        let ephemeral = EphemeralKey::generate();
        let step3_rv = RvId::random();
        let my_reset_rv = RvId::random();
        let record = KxRecord {
            stage: KxStage::ResetRequested,
            rv: step3_rv,
            initial_rv: RvId::new([0; 32]),
            ephemeral: *ephemeral.to_bytes(),
            my_reset_rv,
            their: Some(entry.id.clone()),
            target: Some(*uid),
            mediator: None,
            is_for_reset: true,
            timestamp: Utc::now(),
        };
        let stale = self.inner.db.update(|tx| {
            let stale = tx.pending_reset(uid)?.map(|r| r.rv);
            if let Some(rv) = stale {
                tx.delete_kx(&rv)?;
            }
            tx.put_kx(&record)?;
            Ok(stale)
        })?;
        if let Some(rv) = stale {
            self.unsubscribe_in_background(rv);
        }
        self.inner.rendezvous.subscribe(step3_rv).await?;

        let request = self.sign_payload(KxPayload::Reset(ResetRequest {
            from: self.local_uid(),
            ephemeral: ephemeral.public(),
            step3_rv,
            reset_rv: my_reset_rv,
            sig: Vec::new(),
        }))?;
        tracing::info!(uid = %uid.short(), nick = %user.nick(), reset_rv = %entry.their_reset_rv.short(), "requesting ratchet reset");
        self.push_kx(entry.their_reset_rv, &entry.id.kx_key, &request).await
    }

    /// Peer side of a reset: answers with a full-KX and swaps the ratchet.
    pub(crate) async fn handle_reset_request(&self, uid: UserId, request: ResetRequest) -> Result<()> {
        let entry = self.inner.db.view(|tx| tx.address_book_entry(&uid))?;
        verify_payload(&entry.id.sig_key, &KxPayload::Reset(request.clone()))?;
        if request.from != uid {
            return Err(RvlinkError::Kx {
                reason: "reset request from a different identity".into(),
            });
        }

        let ephemeral = EphemeralKey::generate();
        let shared = ephemeral.dh(&request.ephemeral)?;
        let ratchet = RatchetState::from_shared_secret(&shared, request.step3_rv.as_bytes(), true)?;
        let my_reset_rv = RvId::random();

        let full = self.sign_payload(KxPayload::Full(FullKx {
            from: self.local_uid(),
            ephemeral: ephemeral.public(),
            step3_rv: request.step3_rv,
            reset_rv: my_reset_rv,
            sig: Vec::new(),
        }))?;
        self.push_kx(request.step3_rv, &entry.id.kx_key, &full).await?;
        tracing::info!(uid = %uid.short(), nick = %entry.nick(), "accepted ratchet reset");

        self.link_peer(LinkRequest {
            public: entry.id,
            ratchet,
            initial_rv: RvId::new([0; 32]),
            my_reset_rv,
            their_reset_rv: request.reset_rv,
            finished_kx: None,
        })
        .await?;
        Ok(())
    }

    /// Resets the ratchet of every peer not heard from within
    /// `limit_interval` (the configured default when zero).
    ///
    /// Stored reset attempts older than the limit are pruned and retried;
    /// peers with a fresher attempt are skipped. All resets run
    /// concurrently. Each finished reset is reported on `progress` when
    /// given. The report lists every attempted peer and the first error.
    ///
    /// # Errors
    ///
    /// Fails only if pruning the stored attempts fails or the client shuts
    /// down before the address book is loaded.
    pub async fn reset_all_old_ratchets(
        &self,
        limit_interval: Duration,
        progress: Option<mpsc::Sender<UserId>>,
    ) -> Result<ResetReport> {
        self.wait_address_book_loaded().await?;

        let limit_interval = if limit_interval.is_zero() {
            self.inner.cfg.reset_old_ratchets_default()
        } else {
            limit_interval
        };
        let limit = chrono::Duration::from_std(limit_interval).map_err(|e| RvlinkError::Config {
            reason: format!("reset interval out of range: {e}"),
        })?;
        let now = Utc::now();
        let cutoff = now - limit;

        let in_progress: HashSet<UserId> = self
            .inner
            .db
            .update(|tx| tx.prune_reset_attempts(now, limit))?
            .into_iter()
            .collect();

        let mut attempted = Vec::new();
        let mut tasks = JoinSet::new();
        for user in self.inner.registry.users() {
            let uid = user.uid();
            if in_progress.contains(&uid) {
                continue;
            }
            if user.last_decrypt().await.is_some_and(|t| t > cutoff) {
                continue;
            }
            attempted.push(uid);
            let client = self.clone();
            let progress = progress.clone();
            tasks.spawn(async move {
                let res = client.reset_ratchet(&uid).await;
                if let Some(tx) = progress {
                    tokio::select! {
                        _ = tx.send(uid) => {}
                        _ = client.inner.cancel.cancelled() => {}
                    }
                }
                (uid, res)
            });
        }
        tracing::info!(count = attempted.len(), "resetting old ratchets");

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let err = match joined {
                Ok((_, Ok(()))) => continue,
                Ok((uid, Err(e))) => {
                    tracing::warn!(uid = %uid.short(), error = %e, "ratchet reset failed");
                    e
                }
                Err(e) => RvlinkError::Network {
                    reason: format!("reset task failed: {e}"),
                },
            };
            if first_error.is_none() {
                first_error = Some(err);
            }
        }
        Ok(ResetReport { attempted, first_error })
    }
}
