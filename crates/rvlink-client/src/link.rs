//! Link completion, shared by invite KX and ratchet resets.
//!
//! A finished exchange produces a verified identity, a fresh ratchet and
//! the rendezvous ids announced by both sides. [`Client::link_peer`]
//! turns that into exactly one registry entry:
//!
//! - an unknown identity gets a new [`RemoteUser`], with its nick
//!   de-duplicated and any stored alias winning over the announced nick;
//! - a known identity keeps its existing [`RemoteUser`] and only has its
//!   ratchet swapped. The earlier nick is kept as the stored alias.
//!
//! All bookkeeping happens in a single storage transaction. For a known
//! identity that transaction runs under the peer's ratchet lock, so the
//! persisted and the in-memory ratchet cannot diverge. Rendezvous
//! changes, post-KX actions and post subscriptions run in the background.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;

use rvlink_crypto::ratchet::RatchetState;
use rvlink_storage::{AddressBookEntry, PostKxAction, PostKxActionKind};
use rvlink_types::events::ClientEvent;
use rvlink_types::{PublicIdentity, Result, RvId, UserId};

use crate::client::Client;
use crate::remote_user::RemoteUser;

/// Outcome of a finished exchange, ready to be linked.
pub(crate) struct LinkRequest {
    pub public: PublicIdentity,
    pub ratchet: RatchetState,
    /// Initial rendezvous of the invite. Empty for resets.
    pub initial_rv: RvId,
    pub my_reset_rv: RvId,
    pub their_reset_rv: RvId,
    /// KX record finished by this link, deleted in the same transaction.
    pub finished_kx: Option<RvId>,
}

struct Committed {
    nick: String,
    ignored: bool,
    old_my_reset_rv: Option<RvId>,
    actions: Vec<(u64, PostKxAction)>,
    had_search: bool,
}

impl Client {
    /// Links the peer described by `req`. Returns the registry entry and
    /// whether the peer is new.
    ///
    /// # Errors
    ///
    /// A storage failure aborts the link with nothing applied.
    pub(crate) async fn link_peer(&self, req: LinkRequest) -> Result<(Arc<RemoteUser>, bool)> {
        let uid = req.public.identity;
        let (user, is_new, committed) = match self.inner.registry.by_id(&uid) {
            Ok(user) => {
                let earliest = user.nick();
                let committed = user
                    .replace_ratchet(req.ratchet.clone(), |r| self.commit_link(&req, r, Some(earliest)))
                    .await?;
                tracing::debug!(uid = %uid.short(), "replaced ratchet of linked peer");
                (user, false, committed)
            }
            Err(e) if e.is_not_found() => {
                let committed = self.commit_link(&req, &req.ratchet, None)?;
                let fresh = Arc::new(RemoteUser::new(
                    req.public.clone(),
                    committed.nick.clone(),
                    req.ratchet.clone(),
                ));
                fresh.set_ignored(committed.ignored);
                let (user, collision) = self.inner.registry.add(fresh)?;
                if collision {
                    // Linked concurrently. Persist under the peer lock so the
                    // last linker wins both in memory and in storage.
                    user.replace_ratchet(req.ratchet.clone(), |r| {
                        self.inner.db.update(|tx| tx.put_ratchet(&uid, r))
                    })
                    .await?;
                }
                (user, !collision, committed)
            }
            Err(e) => return Err(e),
        };

        self.update_reset_listening(committed.old_my_reset_rv, req.my_reset_rv, req.finished_kx);

        if is_new
            && self.inner.cfg.auto_subscribe_to_posts
            && !committed
                .actions
                .iter()
                .any(|(_, a)| matches!(a.kind, PostKxActionKind::FetchPost { .. }))
        {
            let client = self.clone();
            tokio::spawn(async move {
                if let Err(e) = client.subscribe_to_posts(&uid).await {
                    tracing::warn!(uid = %uid.short(), error = %e, "unable to subscribe to posts");
                }
            });
        }

        if !committed.actions.is_empty() {
            let client = self.clone();
            let actions = committed.actions;
            tokio::spawn(async move { client.take_post_kx_actions(uid, actions).await });
        }

        if committed.had_search {
            self.emit(ClientEvent::KxSearchCompleted { target: uid });
        }

        tracing::info!(uid = %uid.short(), nick = %user.nick(), is_new, "kx completed");
        self.emit(ClientEvent::KxCompleted {
            initial_rv: req.initial_rv,
            uid,
            nick: user.nick(),
            is_new,
        });
        Ok((user, is_new))
    }

    fn commit_link(
        &self,
        req: &LinkRequest,
        ratchet: &RatchetState,
        earliest_nick: Option<String>,
    ) -> Result<Committed> {
        let uid = req.public.identity;
        let registry = &self.inner.registry;
        self.inner.db.update(|tx| {
            let prior = match tx.address_book_entry(&uid) {
                Ok(entry) => Some(entry),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e),
            };
            tx.put_ratchet(&uid, ratchet)?;

            let mut nick_alias = match &earliest_nick {
                Some(nick) if *nick != req.public.nick => Some(nick.clone()),
                _ => None,
            };
            if let Some(alias) = prior.as_ref().and_then(|p| p.nick_alias.clone()) {
                nick_alias = Some(alias);
            }
            if nick_alias.is_none() && earliest_nick.is_none() {
                let unique = registry.unique_nick(&uid, &req.public.nick)?;
                if unique != req.public.nick {
                    tracing::debug!(uid = %uid.short(), nick = %unique, "storing de-duplicated nick");
                    nick_alias = Some(unique);
                }
            }

            let now = Utc::now();
            let entry = AddressBookEntry {
                id: req.public.clone(),
                my_reset_rv: req.my_reset_rv,
                their_reset_rv: req.their_reset_rv,
                ignored: prior.as_ref().is_some_and(|p| p.ignored),
                first_created: prior.as_ref().map_or(now, |p| p.first_created),
                nick_alias,
                last_handshake_attempt: None,
                last_completed_kx: Some(now),
            };
            tx.put_address_book_entry(&entry)?;

            if !req.initial_rv.is_empty() {
                tx.move_initial_kx_actions(&req.initial_rv, &uid)?;
            }
            let actions = tx.post_kx_actions(&uid)?;
            let had_search = tx.take_kx_search(&uid)?.is_some();
            tx.remove_unkxd_user(&uid)?;
            if let Some(rv) = req.finished_kx {
                tx.delete_kx(&rv)?;
            }

            Ok(Committed {
                nick: entry.nick().to_string(),
                ignored: entry.ignored,
                old_my_reset_rv: prior.map(|p| p.my_reset_rv),
                actions,
                had_search,
            })
        })
    }

    /// Moves reset listening from the old rendezvous to the new one and
    /// stops listening on the finished KX rendezvous.
    fn update_reset_listening(&self, old: Option<RvId>, new: RvId, finished_kx: Option<RvId>) {
        let rendezvous = Arc::clone(&self.inner.rendezvous);
        tokio::spawn(async move {
            let mut stale: Vec<RvId> = finished_kx.into_iter().collect();
            stale.extend(old.filter(|rv| *rv != new));
            for rv in stale {
                if let Err(e) = rendezvous.unsubscribe(rv).await {
                    tracing::debug!(rv = %rv.short(), error = %e, "unable to unsubscribe");
                }
            }
            if let Err(e) = rendezvous.subscribe(new).await {
                tracing::warn!(rv = %new.short(), error = %e, "unable to listen for resets");
            }
        });
    }

    /// Runs every queued post-KX action concurrently, then deletes them.
    /// Each action runs once whether it succeeds or not.
    pub(crate) async fn take_post_kx_actions(&self, uid: UserId, actions: Vec<(u64, PostKxAction)>) {
        let services = &self.inner.services;
        let runs = actions.iter().map(|(id, action)| async move {
            let res = match &action.kind {
                PostKxActionKind::InviteToGroupChat { gc } => services.invite_to_group_chat(uid, *gc).await,
                PostKxActionKind::FetchPost { post } => services.fetch_post(uid, *post).await,
                PostKxActionKind::KxSearch { target } => services.request_mediate_kx(uid, *target).await,
            };
            if let Err(e) = res {
                tracing::error!(uid = %uid.short(), action = ?action.kind, error = %e, "post-kx action failed");
            }
            *id
        });
        let done = join_all(runs).await;

        let removed = self.inner.db.update(|tx| {
            let mut removed = 0usize;
            for id in &done {
                if tx.delete_post_kx_action(&uid, *id)? {
                    removed += 1;
                }
            }
            Ok(removed)
        });
        match removed {
            Ok(n) => tracing::debug!(uid = %uid.short(), count = n, "post-kx actions taken"),
            Err(e) => tracing::warn!(uid = %uid.short(), error = %e, "unable to remove post-kx actions"),
        }
    }
}
