//! Out-of-band invites.
//!
//! Creating an invite stores an `InviteCreated` KX record on a fresh
//! initial rendezvous and listens there for the invitee's half-KX. A
//! prepaid invite is additionally encrypted under a random
//! [`PaidInviteKey`] and parked on the relay at a rendezvous derived from
//! that key, so the key alone is enough to fetch it later.

use std::io::Write;

use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;

use rvlink_crypto::aead;
use rvlink_crypto::hkdf::derive_key32;
use rvlink_crypto::identity::EphemeralKey;
use rvlink_storage::{KxRecord, KxStage, PostKxAction, PostKxActionKind};
use rvlink_types::events::ClientEvent;
use rvlink_types::{GroupChatId, Result, RvId, RvlinkError};
use rvlink_wire::invite::{self, InviteFunds, OobPublicIdentityInvite, PaidInviteKey};

use crate::client::Client;

const PREPAID_INVITE_RV_INFO: &[u8] = b"prepaid-invite-rv";

/// Rendezvous where the invite sealed under `key` is parked.
pub fn prepaid_invite_rv(key: &PaidInviteKey) -> Result<RvId> {
    Ok(RvId::new(derive_key32(key.as_bytes(), b"", PREPAID_INVITE_RV_INFO)?))
}

/// Decodes an invite without acting on it.
pub fn read_invite<R: std::io::Read>(source: R) -> Result<OobPublicIdentityInvite> {
    invite::read_invite(source)
}

impl Client {
    /// Creates an invite, writes it to `sink` and starts listening for the
    /// reply. Performs no network I/O before returning.
    pub fn create_invite<W: Write>(&self, sink: W, funds: Option<InviteFunds>) -> Result<OobPublicIdentityInvite> {
        let invite = self.new_invite(funds)?;
        invite::write_invite(sink, &invite)?;
        self.subscribe_in_background(invite.initial_rendezvous);
        self.emit(ClientEvent::InviteCreated {
            initial_rv: invite.initial_rendezvous,
            public: Box::new(invite.public.clone()),
        });
        Ok(invite)
    }

    fn new_invite(&self, funds: Option<InviteFunds>) -> Result<OobPublicIdentityInvite> {
        let initial_rv = RvId::random();
        let ephemeral = EphemeralKey::generate();
        let record = KxRecord {
            stage: KxStage::InviteCreated,
            rv: initial_rv,
            initial_rv,
            ephemeral: *ephemeral.to_bytes(),
            my_reset_rv: RvId::random(),
            their: None,
            target: None,
            mediator: None,
            is_for_reset: false,
            timestamp: Utc::now(),
        };
        self.inner.db.update(|tx| tx.put_kx(&record))?;
        tracing::info!(initial_rv = %initial_rv.short(), "created invite");
        Ok(OobPublicIdentityInvite {
            public: self.inner.local.public(),
            initial_rendezvous: initial_rv,
            funds,
        })
    }

    /// Creates an invite like [`Client::create_invite`] and parks an
    /// encrypted copy on the relay. Returns the invite and the key that
    /// fetches it.
    pub async fn create_prepaid_invite<W: Write + Send>(
        &self,
        sink: W,
        funds: Option<InviteFunds>,
    ) -> Result<(OobPublicIdentityInvite, PaidInviteKey)> {
        let invite = self.create_invite(sink, funds)?;

        let mut key_bytes = [0u8; 32];
        OsRng.fill_bytes(&mut key_bytes);
        let key = PaidInviteKey::new(key_bytes);
        let rv = prepaid_invite_rv(&key)?;

        let mut blob = Vec::new();
        invite::write_invite(&mut blob, &invite)?;
        let sealed = aead::seal(key.as_bytes(), &blob, rv.as_bytes())?;
        self.inner
            .rendezvous
            .push_prepaid(&self.inner.cancel, rv, sealed)
            .await?;
        tracing::info!(initial_rv = %invite.initial_rendezvous.short(), "pushed prepaid invite");
        Ok((invite, key))
    }

    /// Downloads and decrypts the invite parked under `key`, writing the
    /// plain invite to `sink`. The relay deletes the blob once fetched.
    ///
    /// # Errors
    ///
    /// - [`RvlinkError::NotFound`] if nothing is parked under `key`.
    /// - [`RvlinkError::Crypto`] if the blob does not open under `key`.
    pub async fn fetch_prepaid_invite<W: Write + Send>(
        &self,
        key: &PaidInviteKey,
        mut sink: W,
    ) -> Result<OobPublicIdentityInvite> {
        let rv = prepaid_invite_rv(key)?;
        let sealed = self
            .inner
            .rendezvous
            .fetch_prepaid(&self.inner.cancel, rv)
            .await?;
        let blob = aead::open(key.as_bytes(), &sealed, rv.as_bytes()).map_err(|e| RvlinkError::Crypto {
            reason: format!("unable to decrypt prepaid invite: {e}"),
        })?;
        let invite = invite::read_invite(blob.as_slice())?;
        sink.write_all(&blob).map_err(|e| RvlinkError::Storage {
            reason: format!("unable to write fetched invite: {e}"),
        })?;
        Ok(invite)
    }

    /// Invites the peer that answers `initial_rv` to group chat `gc` once
    /// the KX completes.
    pub fn add_invite_on_kx(&self, initial_rv: &RvId, gc: GroupChatId) -> Result<()> {
        self.add_initial_kx_action(initial_rv, PostKxActionKind::InviteToGroupChat { gc })
    }

    /// Queues `kind` to run once the KX started on `initial_rv` completes.
    pub fn add_initial_kx_action(&self, initial_rv: &RvId, kind: PostKxActionKind) -> Result<()> {
        let action = PostKxAction::new(kind);
        self.inner
            .db
            .update(|tx| tx.add_initial_kx_action(initial_rv, &action))
    }
}
