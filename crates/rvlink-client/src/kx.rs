//! Peer key exchange.
//!
//! ```text
//!   inviter (A)                                   invitee (B)
//!   create_invite: kx/<initial_rv> InviteCreated
//!                                                 accept_invite:
//!                                                   kx/<step3_rv> HalfKxSent
//!         <-- HalfKx (sealed to A) on initial_rv --
//!   ratchet = DH(eph_a, eph_b), initiator
//!         -- FullKx (sealed to B) on step3_rv ---->
//!   link B                                        ratchet = DH(eph_b, eph_a)
//!                                                 link A
//! ```
//!
//! Every payload is sealed to the recipient's KX key and signed by its
//! sender. Routed payloads are dispatched by the rendezvous they arrived
//! on: a stored KX record, or a peer's reset rendezvous.

use chrono::Utc;
use futures::future::join_all;

use rvlink_crypto::identity::{validate_public_identity, verify_signature, EphemeralKey};
use rvlink_crypto::ratchet::RatchetState;
use rvlink_crypto::sealed::{open_sealed, seal_to};
use rvlink_net::RoutedMessage;
use rvlink_storage::{KxRecord, KxSearch, KxStage, UnkxdUserInfo};
use rvlink_types::{GroupChatId, Result, RvId, RvlinkError, UserId};
use rvlink_wire::invite::OobPublicIdentityInvite;
use rvlink_wire::kx::{FullKx, HalfKx, KxPayload};

use crate::client::Client;
use crate::link::LinkRequest;

/// Where a routed payload belongs.
enum Route {
    Kx(KxRecord),
    Reset(UserId),
    Unknown,
}

/// Checks the sender signature of `payload` against `sig_key`.
pub(crate) fn verify_payload(sig_key: &[u8; 32], payload: &KxPayload) -> Result<()> {
    verify_signature(sig_key, &payload.signing_bytes()?, payload.signature()).map_err(|e| RvlinkError::Kx {
        reason: format!("invalid {} signature: {e}", payload.kind()),
    })
}

impl Client {
    pub(crate) fn sign_payload(&self, mut payload: KxPayload) -> Result<KxPayload> {
        let sig = self.inner.local.sign(&payload.signing_bytes()?);
        payload.set_signature(sig.to_vec());
        Ok(payload)
    }

    /// Seals `payload` to `recipient_kx` and pushes it to `rv`.
    ///
    /// # Errors
    ///
    /// Any failure other than cancellation surfaces as
    /// [`RvlinkError::Kx`]. Nothing is retried.
    pub(crate) async fn push_kx(&self, rv: RvId, recipient_kx: &[u8; 32], payload: &KxPayload) -> Result<()> {
        let sealed = seal_to(recipient_kx, &payload.encode()?)?;
        self.inner
            .rendezvous
            .push(&self.inner.cancel, rv, sealed)
            .await
            .map_err(|e| match e {
                RvlinkError::Canceled => e,
                other => RvlinkError::Kx {
                    reason: format!("unable to send {}: {other}", payload.kind()),
                },
            })
    }

    // -----------------------------------------------------------------------
    // Invitee side
    // -----------------------------------------------------------------------

    /// Accepts `invite` by sending a half-KX to its initial rendezvous.
    /// The link completes when the inviter's full-KX arrives.
    ///
    /// # Errors
    ///
    /// - [`RvlinkError::InvalidIdentity`] for a malformed or self-issued
    ///   invite.
    /// - [`RvlinkError::AlreadyExists`] if this invite was already
    ///   accepted and is waiting for its full-KX.
    /// - [`RvlinkError::Kx`] if the half-KX could not be sent. Nothing of
    ///   the attempt is kept, so the same invite can be accepted again.
    pub async fn accept_invite(&self, invite: OobPublicIdentityInvite) -> Result<()> {
        validate_public_identity(&invite.public, self.inner.cfg.max_avatar_bytes)?;
        if invite.public.identity == self.local_uid() {
            return Err(RvlinkError::InvalidIdentity {
                reason: "cannot accept an invite issued by the local identity".into(),
            });
        }
        let initial_rv = invite.initial_rendezvous;

        let ephemeral = EphemeralKey::generate();
        let step3_rv = RvId::random();
        let my_reset_rv = RvId::random();
        let record = KxRecord {
            stage: KxStage::HalfKxSent,
            rv: step3_rv,
            initial_rv,
            ephemeral: *ephemeral.to_bytes(),
            my_reset_rv,
            their: Some(invite.public.clone()),
            target: None,
            mediator: None,
            is_for_reset: false,
            timestamp: Utc::now(),
        };
        self.inner.db.update(|tx| {
            let pending = tx
                .list_kxs()?
                .into_iter()
                .any(|r| r.stage == KxStage::HalfKxSent && r.initial_rv == initial_rv);
            if pending {
                return Err(RvlinkError::already_exists(format!(
                    "accepted invite {}",
                    initial_rv.short()
                )));
            }
            tx.put_kx(&record)
        })?;

        let sent = async {
            self.inner.rendezvous.subscribe(step3_rv).await?;
            let half = self.sign_payload(KxPayload::Half(HalfKx {
                public: self.inner.local.public(),
                initial_rv,
                ephemeral: ephemeral.public(),
                step3_rv,
                reset_rv: my_reset_rv,
                sig: Vec::new(),
            }))?;
            self.push_kx(initial_rv, &invite.public.kx_key, &half).await
        }
        .await;
        if let Err(e) = sent {
            if let Err(del) = self.inner.db.update(|tx| tx.delete_kx(&step3_rv)) {
                tracing::warn!(rv = %step3_rv.short(), error = %del, "unable to drop unsent half-kx");
            }
            self.unsubscribe_in_background(step3_rv);
            return Err(e);
        }
        tracing::info!(
            uid = %invite.public.identity.short(),
            nick = %invite.public.nick,
            initial_rv = %initial_rv.short(),
            "accepted invite, sent half-kx"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Searching for unlinked identities
    // -----------------------------------------------------------------------

    /// Records `uid` as a member of `gc` we have not linked with yet. The
    /// first sighting is kept. The record is dropped once `uid` links.
    pub fn note_unkxd_member(&self, uid: UserId, gc: Option<GroupChatId>) -> Result<()> {
        if uid == self.local_uid() || self.inner.registry.by_id(&uid).is_ok() {
            return Ok(());
        }
        self.inner.db.update(|tx| {
            let info = match tx.unkxd_user(&uid)? {
                Some(mut info) => {
                    info.gc = gc.or(info.gc);
                    info
                }
                None => UnkxdUserInfo {
                    uid,
                    gc,
                    first_seen: Utc::now(),
                    mediate_requests: 0,
                },
            };
            tx.put_unkxd_user(&info)
        })
    }

    /// Starts looking for a way to link with `target` by asking every
    /// linked, non-ignored peer to mediate a KX. Returns the peers asked.
    /// [`ClientEvent::KxSearchCompleted`] is emitted when `target` links,
    /// by whatever route.
    ///
    /// # Errors
    ///
    /// - [`RvlinkError::InvalidIdentity`] for the local identity.
    /// - [`RvlinkError::AlreadyExists`] if `target` is already linked or
    ///   a search for it is running.
    ///
    /// [`ClientEvent::KxSearchCompleted`]: rvlink_types::events::ClientEvent::KxSearchCompleted
    pub async fn start_kx_search(&self, target: UserId) -> Result<Vec<UserId>> {
        if target == self.local_uid() {
            return Err(RvlinkError::InvalidIdentity {
                reason: "cannot search for the local identity".into(),
            });
        }
        if self.inner.registry.by_id(&target).is_ok() {
            return Err(RvlinkError::already_exists(format!("linked peer {}", target.short())));
        }
        let mediators: Vec<UserId> = self
            .inner
            .registry
            .users()
            .into_iter()
            .filter(|u| !u.is_ignored())
            .map(|u| u.uid())
            .collect();

        self.inner.db.update(|tx| {
            if tx.kx_search(&target)?.is_some() {
                return Err(RvlinkError::already_exists(format!("kx search for {}", target.short())));
            }
            tx.put_kx_search(&KxSearch {
                target,
                started: Utc::now(),
                asked: mediators.clone(),
            })?;
            if let Some(mut info) = tx.unkxd_user(&target)? {
                info.mediate_requests = info.mediate_requests.saturating_add(1);
                tx.put_unkxd_user(&info)?;
            }
            Ok(())
        })?;
        tracing::info!(wanted = %target.short(), mediators = mediators.len(), "started kx search");

        let services = &self.inner.services;
        let requests = mediators.iter().map(|mediator| async move {
            if let Err(e) = services.request_mediate_kx(*mediator, target).await {
                tracing::warn!(
                    mediator = %mediator.short(),
                    wanted = %target.short(),
                    error = %e,
                    "unable to request mediated kx"
                );
            }
        });
        join_all(requests).await;
        Ok(mediators)
    }

    // -----------------------------------------------------------------------
    // Routed payloads
    // -----------------------------------------------------------------------

    /// Handles one payload routed from the relay.
    pub(crate) async fn handle_routed(&self, msg: RoutedMessage) -> Result<()> {
        let rv = msg.rv;
        let route = self.inner.db.view(|tx| match tx.kx(&rv) {
            Ok(record) => Ok(Route::Kx(record)),
            Err(e) if e.is_not_found() => Ok(tx
                .peer_by_my_reset_rv(&rv)?
                .map_or(Route::Unknown, Route::Reset)),
            Err(e) => Err(e),
        })?;
        if matches!(route, Route::Unknown) {
            tracing::debug!(rv = %rv.short(), "payload on unknown rendezvous");
            return Ok(());
        }

        let payload = KxPayload::decode(&open_sealed(&self.inner.local, &msg.payload)?)?;
        tracing::trace!(rv = %rv.short(), kind = payload.kind(), "routed kx payload");
        match (route, payload) {
            (Route::Kx(record), KxPayload::Half(half)) if record.stage == KxStage::InviteCreated => {
                self.handle_half_kx(record, half).await
            }
            (Route::Kx(record), KxPayload::Full(full))
                if matches!(record.stage, KxStage::HalfKxSent | KxStage::ResetRequested) =>
            {
                self.handle_full_kx(record, full).await
            }
            (Route::Reset(uid), KxPayload::Reset(request)) => self.handle_reset_request(uid, request).await,
            (_, other) => Err(RvlinkError::Protocol {
                reason: format!("unexpected {} on rendezvous {}", other.kind(), rv.short()),
            }),
        }
    }

    /// Inviter side: answers a half-KX with a full-KX and links.
    async fn handle_half_kx(&self, record: KxRecord, half: HalfKx) -> Result<()> {
        verify_payload(&half.public.sig_key, &KxPayload::Half(half.clone()))?;
        validate_public_identity(&half.public, self.inner.cfg.max_avatar_bytes)?;
        if half.initial_rv != record.rv {
            return Err(RvlinkError::Kx {
                reason: "half-kx answers a different invite".into(),
            });
        }
        if half.public.identity == self.local_uid() {
            return Err(RvlinkError::Kx {
                reason: "half-kx from the local identity".into(),
            });
        }

        let ephemeral = EphemeralKey::from_bytes(record.ephemeral);
        let shared = ephemeral.dh(&half.ephemeral)?;
        let ratchet = RatchetState::from_shared_secret(&shared, half.step3_rv.as_bytes(), true)?;

        let full = self.sign_payload(KxPayload::Full(FullKx {
            from: self.local_uid(),
            ephemeral: ephemeral.public(),
            step3_rv: half.step3_rv,
            reset_rv: record.my_reset_rv,
            sig: Vec::new(),
        }))?;
        self.push_kx(half.step3_rv, &half.public.kx_key, &full).await?;

        self.link_peer(LinkRequest {
            public: half.public,
            ratchet,
            initial_rv: record.initial_rv,
            my_reset_rv: record.my_reset_rv,
            their_reset_rv: half.reset_rv,
            finished_kx: Some(record.rv),
        })
        .await?;
        Ok(())
    }

    /// Invitee or reset requester side: finishes with the peer's full-KX.
    async fn handle_full_kx(&self, record: KxRecord, full: FullKx) -> Result<()> {
        let their = record.their.clone().ok_or_else(|| RvlinkError::Protocol {
            reason: format!("kx record {} without remote identity", record.rv.short()),
        })?;
        verify_payload(&their.sig_key, &KxPayload::Full(full.clone()))?;
        if full.from != their.identity || full.step3_rv != record.rv {
            return Err(RvlinkError::Kx {
                reason: "full-kx does not match the pending exchange".into(),
            });
        }

        let ephemeral = EphemeralKey::from_bytes(record.ephemeral);
        let shared = ephemeral.dh(&full.ephemeral)?;
        let ratchet = RatchetState::from_shared_secret(&shared, record.rv.as_bytes(), false)?;

        let (user, _) = self
            .link_peer(LinkRequest {
                public: their,
                ratchet,
                initial_rv: record.initial_rv,
                my_reset_rv: record.my_reset_rv,
                their_reset_rv: full.reset_rv,
                finished_kx: Some(record.rv),
            })
            .await?;
        if record.is_for_reset {
            tracing::info!(uid = %user.uid().short(), nick = %user.nick(), "ratchet reset completed");
        }
        Ok(())
    }
}
