//! Idle peer maintenance.
//!
//! Two routines scan the registry once the address book is loaded:
//! [`Client::handshake_idle_users`] retries a handshake with peers we
//! have not heard from in a while, and [`Client::unsub_idle_users`]
//! evicts peers that stayed silent even after that. Both run on the
//! [`Client::run_idle_maintenance`] schedule.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::time::MissedTickBehavior;

use rvlink_types::events::ClientEvent;
use rvlink_types::{Result, RvlinkError, UserId};

use crate::client::Client;

const IDLE_REMOVAL_REASON: &str = "User is idle for too long";

fn cutoff(now: DateTime<Utc>, interval: std::time::Duration) -> Result<DateTime<Utc>> {
    let interval = chrono::Duration::from_std(interval).map_err(|e| RvlinkError::Config {
        reason: format!("idle interval out of range: {e}"),
    })?;
    Ok(now - interval)
}

impl Client {
    /// Starts a handshake with every peer not heard from within the auto
    /// handshake interval. Returns the peers handshaked.
    ///
    /// Peers with an unanswered attempt on record are skipped. An attempt
    /// recorded before the last decrypted message is stale bookkeeping and
    /// is cleared first.
    pub async fn handshake_idle_users(&self) -> Result<Vec<UserId>> {
        self.wait_address_book_loaded().await?;
        let Some(interval) = self.inner.cfg.auto_handshake_interval() else {
            tracing::debug!("auto handshake with idle users is disabled");
            return Ok(Vec::new());
        };
        let limit = cutoff(Utc::now(), interval)?;

        let mut started = Vec::new();
        for user in self.inner.registry.users() {
            let uid = user.uid();
            let last_decrypt = user.last_decrypt().await;
            if last_decrypt.is_some_and(|t| t > limit) {
                continue;
            }
            let Ok(mut entry) = self.inner.db.view(|tx| tx.address_book_entry(&uid)) else {
                continue;
            };

            if let (Some(attempt), Some(decrypted)) = (entry.last_handshake_attempt, last_decrypt) {
                if attempt < decrypted {
                    tracing::info!(
                        uid = %uid.short(),
                        attempt = %attempt.to_rfc3339(),
                        decrypted = %decrypted.to_rfc3339(),
                        "clearing handshake attempt older than last decryption"
                    );
                    if let Err(e) = self
                        .inner
                        .db
                        .update(|tx| tx.set_last_handshake_attempt(&uid, None))
                    {
                        tracing::warn!(uid = %uid.short(), error = %e, "unable to clear handshake attempt");
                        continue;
                    }
                    entry.last_handshake_attempt = None;
                }
            }

            if entry.last_handshake_attempt.is_some() || entry.first_created > limit {
                continue;
            }

            tracing::info!(uid = %uid.short(), nick = %user.nick(), "automatic handshake with idle peer");
            match self.handshake(&uid).await {
                Ok(()) => started.push(uid),
                Err(e) if e.is_canceled() => return Err(e),
                Err(e) => tracing::warn!(uid = %uid.short(), error = %e, "automatic handshake failed"),
            }
        }
        Ok(started)
    }

    /// Unsubscribes peers idle for longer than the auto removal interval
    /// from our posts and removes them from every group chat we
    /// administer. Returns the peers acted upon.
    ///
    /// A peer is only evicted after a handshake was attempted at least
    /// half an auto handshake interval ago, so this does nothing while
    /// auto handshakes are disabled. Peers on the ignore list (by nick or
    /// hex id) are never touched.
    pub async fn unsub_idle_users(&self) -> Result<Vec<UserId>> {
        self.wait_address_book_loaded().await?;
        let Some(interval) = self.inner.cfg.auto_remove_idle_users_interval() else {
            tracing::debug!("auto removal of idle users is disabled");
            return Ok(Vec::new());
        };
        let Some(handshake_interval) = self.inner.cfg.auto_handshake_interval() else {
            tracing::debug!("auto removal of idle users is disabled because auto handshake is disabled");
            return Ok(Vec::new());
        };
        let now = Utc::now();
        let limit = cutoff(now, interval)?;
        let handshake_limit = cutoff(now, handshake_interval / 2)?;

        let mut keep = HashSet::new();
        for name in &self.inner.cfg.auto_remove_idle_users_ignore_list {
            match self.inner.registry.by_nick(name) {
                Ok(user) => {
                    keep.insert(user.uid());
                }
                Err(_) => match name.parse::<UserId>() {
                    Ok(uid) => {
                        keep.insert(uid);
                    }
                    Err(_) => tracing::warn!(nick = %name, "peer in idle removal ignore list not found"),
                },
            }
        }

        let services = &self.inner.services;
        let mut evicted = Vec::new();
        for user in self.inner.registry.users() {
            let uid = user.uid();
            if keep.contains(&uid) {
                tracing::trace!(uid = %uid.short(), "ignoring peer in idle removal");
                continue;
            }
            let last_decrypt = user.last_decrypt().await;
            if last_decrypt.is_some_and(|t| t > limit) {
                continue;
            }
            let Ok(entry) = self.inner.db.view(|tx| tx.address_book_entry(&uid)) else {
                continue;
            };
            if entry.first_created > limit {
                continue;
            }
            match entry.last_handshake_attempt {
                Some(attempt) if attempt <= handshake_limit => {}
                _ => {
                    tracing::trace!(uid = %uid.short(), "handshake not attempted or too recent");
                    continue;
                }
            }

            let gcs = match services.administered_group_chats_with(uid).await {
                Ok(gcs) => gcs,
                Err(e) => {
                    tracing::warn!(uid = %uid.short(), error = %e, "unable to list group chats");
                    continue;
                }
            };

            let last_decrypted = last_decrypt.unwrap_or(entry.first_created);
            tracing::info!(
                uid = %uid.short(),
                nick = %user.nick(),
                last_decrypted = %last_decrypted.to_rfc3339(),
                group_chats = gcs.len(),
                "peer is idle, unsubscribing from local posts"
            );
            self.emit(ClientEvent::UnsubscribingIdlePeer { uid, last_decrypted });

            if let Err(e) = services.unsubscribe_from_local_posts(uid).await {
                tracing::warn!(uid = %uid.short(), error = %e, "unable to unsubscribe from local posts");
            }
            let removals = gcs.iter().map(|gc| async move {
                if let Err(e) = services
                    .remove_from_group_chat(*gc, uid, IDLE_REMOVAL_REASON.to_string())
                    .await
                {
                    tracing::warn!(uid = %uid.short(), gc = %gc.short(), error = %e, "unable to remove from group chat");
                }
            });
            join_all(removals).await;
            evicted.push(uid);
        }
        Ok(evicted)
    }

    /// Drops unfinished invites and half-KXs older than the configured KX
    /// expiry and stops listening on their rendezvous.
    pub fn prune_expired_kxs(&self) -> Result<usize> {
        let expiry = chrono::Duration::from_std(self.inner.cfg.kx_expiry()).map_err(|e| RvlinkError::Config {
            reason: format!("kx expiry out of range: {e}"),
        })?;
        let dropped = self
            .inner
            .db
            .update(|tx| tx.prune_expired_kxs(Utc::now(), expiry))?;
        for rv in &dropped {
            self.unsubscribe_in_background(*rv);
        }
        if !dropped.is_empty() {
            tracing::info!(count = dropped.len(), "pruned expired kx attempts");
        }
        Ok(dropped.len())
    }

    /// Runs the idle routines every `idle_check_interval_secs` until the
    /// client shuts down. Errors are logged, never returned.
    pub async fn run_idle_maintenance(&self) {
        if self.wait_address_book_loaded().await.is_err() {
            return;
        }
        let mut ticker = tokio::time::interval(self.inner.cfg.idle_check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.prune_expired_kxs() {
                tracing::warn!(error = %e, "unable to prune expired kxs");
            }
            match self.handshake_idle_users().await {
                Err(e) if e.is_canceled() => return,
                Err(e) => tracing::warn!(error = %e, "idle handshake pass failed"),
                Ok(_) => {}
            }
            match self.unsub_idle_users().await {
                Err(e) if e.is_canceled() => return,
                Err(e) => tracing::warn!(error = %e, "idle removal pass failed"),
                Ok(_) => {}
            }
        }
    }
}
