//! The client facade.
//!
//! [`Client`] owns the local identity, the peer registry and the
//! collaborators the session layer drives. It is cheap to clone; every
//! clone shares the same state. Protocol specific operations live in
//! sibling modules as further `impl Client` blocks:
//!
//! - `invite`: creating, reading and fetching invites
//! - `kx`: accepting invites and handling routed KX payloads
//! - `link`: the shared link completion routine
//! - `reset`: single and bulk ratchet resets
//! - `idle`: idle peer maintenance

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use rvlink_crypto::identity::LocalIdentity;
use rvlink_net::{RoutedMessage, ServerSession};
use rvlink_storage::{ClientDb, KxRecord};
use rvlink_types::config::ClientConfig;
use rvlink_types::events::ClientEvent;
use rvlink_types::{PublicIdentity, Result, RvId, RvlinkError, UserId};

use crate::gate::ConfirmationGate;
use crate::registry::PeerRegistry;
use crate::remote_user::RemoteUser;
use crate::services::{LocalIdentityProvider, PeerServices, Rendezvous};

// ---------------------------------------------------------------------------
// Construction parameters
// ---------------------------------------------------------------------------

/// Everything a [`Client`] needs from its host.
pub struct ClientParams {
    pub config: ClientConfig,
    pub db: Arc<ClientDb>,
    pub rendezvous: Arc<dyn Rendezvous>,
    pub services: Arc<dyn PeerServices>,
    /// Consulted only when the database holds no local identity.
    pub identity_provider: Arc<dyn LocalIdentityProvider>,
    /// Sink of client events. Created by the host so that gated
    /// collaborators built before the client can share it.
    pub events: mpsc::UnboundedSender<ClientEvent>,
    /// Root cancellation token of the client.
    pub cancel: CancellationToken,
}

/// A peer together with the last time one of its messages was
/// decrypted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserLastReceived {
    pub uid: UserId,
    pub nick: String,
    pub last_decrypted: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub(crate) struct Inner {
    pub(crate) cfg: ClientConfig,
    pub(crate) db: Arc<ClientDb>,
    pub(crate) local: LocalIdentity,
    pub(crate) registry: PeerRegistry,
    pub(crate) rendezvous: Arc<dyn Rendezvous>,
    pub(crate) services: Arc<dyn PeerServices>,
    pub(crate) events: mpsc::UnboundedSender<ClientEvent>,
    pub(crate) cancel: CancellationToken,
    pub(crate) resets_in_flight: Mutex<HashSet<UserId>>,
    ab_loaded: watch::Sender<bool>,
    download_gate: ConfirmationGate<bool>,
}

/// Session and identity-linking client.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<Inner>,
}

impl Client {
    /// Builds the client, loading the local identity from the database or
    /// asking the identity provider for a new one.
    ///
    /// # Errors
    ///
    /// - [`RvlinkError::Config`] if the configuration is invalid.
    /// - Whatever the identity provider or the database return.
    pub async fn new(params: ClientParams) -> Result<Self> {
        params.config.validate()?;

        let local = match params.db.view(|tx| tx.local_identity())? {
            Some(local) => local,
            None => {
                let local = params.identity_provider.get(&params.cancel).await?;
                params.db.update(|tx| tx.create_local_identity(&local))?;
                tracing::info!(uid = %local.uid().short(), nick = %local.nick(), "created local identity");
                local
            }
        };

        let (ab_loaded, _) = watch::channel(false);
        let download_gate = ConfirmationGate::new(params.config.confirm_timeout());
        Ok(Self {
            inner: Arc::new(Inner {
                registry: PeerRegistry::new(local.nick()),
                cfg: params.config,
                db: params.db,
                local,
                rendezvous: params.rendezvous,
                services: params.services,
                events: params.events,
                cancel: params.cancel,
                resets_in_flight: Mutex::new(HashSet::new()),
                ab_loaded,
                download_gate,
            }),
        })
    }

    pub fn local_uid(&self) -> UserId {
        self.inner.local.uid()
    }

    pub fn local_nick(&self) -> &str {
        self.inner.local.nick()
    }

    pub fn public_identity(&self) -> PublicIdentity {
        self.inner.local.public()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.cfg
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        if self.inner.events.send(event).is_err() {
            tracing::trace!("client event dropped, no receiver");
        }
    }

    /// Subscribes to `rv` without waiting for the relay.
    pub(crate) fn subscribe_in_background(&self, rv: RvId) {
        let rendezvous = Arc::clone(&self.inner.rendezvous);
        tokio::spawn(async move {
            if let Err(e) = rendezvous.subscribe(rv).await {
                tracing::warn!(rv = %rv.short(), error = %e, "unable to subscribe");
            }
        });
    }

    pub(crate) fn unsubscribe_in_background(&self, rv: RvId) {
        let rendezvous = Arc::clone(&self.inner.rendezvous);
        tokio::spawn(async move {
            if let Err(e) = rendezvous.unsubscribe(rv).await {
                tracing::warn!(rv = %rv.short(), error = %e, "unable to unsubscribe");
            }
        });
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub fn is_address_book_loaded(&self) -> bool {
        *self.inner.ab_loaded.borrow()
    }

    /// Waits until [`Client::load_address_book`] finished.
    ///
    /// # Errors
    ///
    /// [`RvlinkError::Canceled`] if the client shuts down first.
    pub async fn wait_address_book_loaded(&self) -> Result<()> {
        let mut rx = self.inner.ab_loaded.subscribe();
        tokio::select! {
            _ = self.inner.cancel.cancelled() => Err(RvlinkError::Canceled),
            r = rx.wait_for(|loaded| *loaded) => r.map(|_| ()).map_err(|_| RvlinkError::Canceled),
        }
    }

    /// Loads every address book entry and ratchet into the registry,
    /// listens on each peer's reset rendezvous and on every pending KX,
    /// then opens the "address book loaded" gate.
    ///
    /// Calling it again after a successful load is a no-op.
    pub async fn load_address_book(&self) -> Result<()> {
        if self.is_address_book_loaded() {
            return Ok(());
        }
        let (entries, kxs) = self.inner.db.view(|tx| {
            let mut peers = Vec::new();
            for entry in tx.address_book_entries()? {
                let ratchet = tx.ratchet(&entry.id.identity)?;
                peers.push((entry, ratchet));
            }
            Ok((peers, tx.list_kxs()?))
        })?;

        let mut listen = Vec::with_capacity(entries.len() + kxs.len());
        for (entry, ratchet) in entries {
            let user = Arc::new(RemoteUser::new(entry.id.clone(), entry.nick().to_string(), ratchet));
            user.set_ignored(entry.ignored);
            let (user, collision) = self.inner.registry.add(user)?;
            if collision {
                tracing::warn!(uid = %user.uid().short(), "duplicate address book entry");
                continue;
            }
            if user.nick() != entry.nick() {
                let alias = user.nick();
                self.inner.db.update(|tx| {
                    let mut stored = tx.address_book_entry(&user.uid())?;
                    stored.nick_alias = Some(alias);
                    tx.put_address_book_entry(&stored)
                })?;
            }
            listen.push(entry.my_reset_rv);
        }
        listen.extend(kxs.iter().map(|kx: &KxRecord| kx.rv));

        for rv in listen {
            if let Err(e) = self.inner.rendezvous.subscribe(rv).await {
                tracing::warn!(rv = %rv.short(), error = %e, "unable to listen on rendezvous");
            }
        }

        let count = self.inner.registry.len();
        self.inner.ab_loaded.send_replace(true);
        tracing::info!(peers = count, pending_kxs = kxs.len(), "address book loaded");
        Ok(())
    }

    /// Runs the client until its cancellation token fires.
    ///
    /// Loads the address book, starts idle maintenance and dispatches
    /// every message routed from the relay. Errors handling a single
    /// message are logged and do not stop the loop.
    ///
    /// # Errors
    ///
    /// Returns [`RvlinkError::Canceled`] on shutdown, or the error that
    /// prevented the address book from loading.
    pub async fn run(&self, mut routed: mpsc::UnboundedReceiver<RoutedMessage>) -> Result<()> {
        self.load_address_book().await?;

        let maintenance = tokio::spawn({
            let client = self.clone();
            async move { client.run_idle_maintenance().await }
        });

        let cancel = self.inner.cancel.clone();
        let res = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Err(RvlinkError::Canceled),
                msg = routed.recv() => {
                    let Some(msg) = msg else {
                        break Err(RvlinkError::Network {
                            reason: "routed message channel closed".into(),
                        });
                    };
                    let rv = msg.rv;
                    if let Err(e) = self.handle_routed(msg).await {
                        if e.is_canceled() {
                            break Err(e);
                        }
                        tracing::warn!(rv = %rv.short(), error = %e, "unable to handle routed message");
                    }
                }
            }
        };
        maintenance.abort();
        res
    }

    /// Emits a `ServerSessionChanged` event for every session published
    /// by the connection keeper until the client shuts down.
    pub async fn forward_session_changes(&self, mut sessions: watch::Receiver<Option<ServerSession>>) {
        let mut last: Option<u64> = None;
        loop {
            let current = sessions.borrow_and_update().clone();
            let id = current.as_ref().map(|s| s.id());
            if id != last {
                last = id;
                self.emit(ClientEvent::ServerSessionChanged {
                    connected: current.is_some(),
                    policy: current.as_ref().map(|s| s.policy().clone()),
                });
            }
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return,
                r = sessions.changed() => {
                    if r.is_err() {
                        return;
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Peer lookup and management
    // -----------------------------------------------------------------------

    pub fn user_by_id(&self, uid: &UserId) -> Result<Arc<RemoteUser>> {
        self.inner.registry.by_id(uid)
    }

    pub fn user_by_nick(&self, nick: &str) -> Result<Arc<RemoteUser>> {
        self.inner.registry.by_nick(nick)
    }

    pub fn list_user_ids(&self) -> Vec<UserId> {
        self.inner.registry.list_ids()
    }

    /// Removes every trace of `uid` and stops listening for its resets.
    pub async fn block(&self, uid: &UserId) -> Result<()> {
        let entry = self.inner.db.update(|tx| {
            let entry = tx.address_book_entry(uid)?;
            tx.remove_peer(uid)?;
            Ok(entry)
        })?;
        if let Err(e) = self.inner.registry.remove(uid) {
            tracing::debug!(uid = %uid.short(), error = %e, "blocked peer was not loaded");
        }
        self.unsubscribe_in_background(entry.my_reset_rv);
        tracing::info!(uid = %uid.short(), nick = %entry.nick(), "blocked peer");
        self.emit(ClientEvent::PeerBlocked { uid: *uid });
        Ok(())
    }

    /// Marks `uid` as ignored (or not). Ignored peers stay linked.
    pub fn ignore(&self, uid: &UserId, ignored: bool) -> Result<()> {
        let user = self.inner.registry.by_id(uid)?;
        self.inner.db.update(|tx| {
            let mut entry = tx.address_book_entry(uid)?;
            entry.ignored = ignored;
            tx.put_address_book_entry(&entry)
        })?;
        user.set_ignored(ignored);
        Ok(())
    }

    /// Changes the local nick of `uid`.
    ///
    /// # Errors
    ///
    /// [`RvlinkError::AlreadyExists`] if another peer (or the local
    /// identity) already uses `nick`.
    pub fn rename_user(&self, uid: &UserId, nick: &str) -> Result<()> {
        let nick = nick.trim();
        if nick.is_empty() {
            return Err(RvlinkError::InvalidIdentity {
                reason: "empty nick".into(),
            });
        }
        let user = self.inner.registry.by_id(uid)?;
        if self.inner.registry.unique_nick(uid, nick)? != nick {
            return Err(RvlinkError::already_exists(format!("nick {nick}")));
        }
        self.inner.db.update(|tx| {
            let mut entry = tx.address_book_entry(uid)?;
            entry.nick_alias = Some(nick.to_string());
            tx.put_address_book_entry(&entry)
        })?;
        user.set_nick(nick.to_string());
        Ok(())
    }

    /// Every linked peer, most recently heard from first. Peers never
    /// heard from come last.
    pub async fn list_users_last_received_time(&self) -> Vec<UserLastReceived> {
        let mut out = Vec::with_capacity(self.inner.registry.len());
        for user in self.inner.registry.users() {
            out.push(UserLastReceived {
                uid: user.uid(),
                nick: user.nick(),
                last_decrypted: user.last_decrypt().await,
            });
        }
        out.sort_by(|a, b| b.last_decrypted.cmp(&a.last_decrypted));
        out
    }

    pub fn list_kxs(&self) -> Result<Vec<KxRecord>> {
        self.inner.db.view(|tx| tx.list_kxs())
    }

    /// Starts an application level handshake with `uid`: records the
    /// attempt, emits the `SYN` stage and asks the messaging layer to
    /// send it.
    pub async fn handshake(&self, uid: &UserId) -> Result<()> {
        let user = self.inner.registry.by_id(uid)?;
        self.inner
            .db
            .update(|tx| tx.set_last_handshake_attempt(uid, Some(Utc::now())))?;
        tracing::info!(uid = %uid.short(), nick = %user.nick(), "starting handshake");
        self.emit(ClientEvent::HandshakeStage {
            uid: *uid,
            stage: "SYN".into(),
        });
        self.inner.services.send_handshake(*uid).await
    }

    /// Subscribes to the posts of `uid`. Calling it again while already
    /// subscribed succeeds; the event fires only on a real transition.
    pub async fn subscribe_to_posts(&self, uid: &UserId) -> Result<()> {
        self.inner.registry.by_id(uid)?;
        self.inner.services.subscribe_to_posts(*uid).await?;
        let changed = self
            .inner
            .db
            .update(|tx| tx.set_posts_subscription(uid, true))?;
        if changed {
            self.emit(ClientEvent::PostsSubscriptionChanged {
                uid: *uid,
                subscribed: true,
            });
        }
        Ok(())
    }

    pub fn is_subscribed_to_posts(&self, uid: &UserId) -> Result<bool> {
        self.inner.db.view(|tx| tx.is_subscribed_to_posts(uid))
    }

    // -----------------------------------------------------------------------
    // Downloads
    // -----------------------------------------------------------------------

    /// Asks the host whether a download offered by `uid` may proceed.
    /// A timeout or shutdown counts as a refusal.
    pub async fn confirm_download(&self, uid: &UserId, name: &str, size: u64) -> bool {
        let answer = self
            .inner
            .download_gate
            .request(&self.inner.cancel, |request_id| {
                self.emit(ClientEvent::ConfirmDownload {
                    request_id,
                    uid: *uid,
                    name: name.to_string(),
                    size,
                });
            })
            .await;
        answer == Some(true)
    }

    /// Answers a [`ClientEvent::ConfirmDownload`] request.
    pub fn resolve_download(&self, request_id: u64, accept: bool) -> Result<()> {
        self.inner.download_gate.resolve(request_id, accept)
    }

    // -----------------------------------------------------------------------
    // Ratchet use
    // -----------------------------------------------------------------------

    /// Encrypts `plaintext` for `uid`, persisting the advanced ratchet.
    pub async fn encrypt_for(&self, uid: &UserId, plaintext: &[u8]) -> Result<Vec<u8>> {
        let user = self.inner.registry.by_id(uid)?;
        let db = &self.inner.db;
        user.seal(plaintext, |state| db.update(|tx| tx.put_ratchet(uid, state)))
            .await
    }

    /// Decrypts a message from `uid`, persisting the advanced ratchet.
    pub async fn decrypt_from(&self, uid: &UserId, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let user = self.inner.registry.by_id(uid)?;
        let db = &self.inner.db;
        user.open(ciphertext, |state| db.update(|tx| tx.put_ratchet(uid, state)))
            .await
    }
}
