//! Shared harness for client integration tests.
//!
//! [`Peer::spawn`] wires a full client (keeper, relay rendezvous, client
//! loop) to an in-process [`MemRelay`]. [`MemRendezvous`] and
//! [`RecordingServices`] stand in for the relay and the higher level
//! subsystems when a test drives the client directly.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use rvlink_client::{Client, ClientParams, LocalIdentityProvider, PeerServices, Rendezvous};
use rvlink_crypto::identity::{LocalIdentity, LocalIdentitySecrets};
use rvlink_net::testkit::MemRelay;
use rvlink_net::{ConnKeeper, ConnKeeperConfig, RelayRendezvous};
use rvlink_storage::ClientDb;
use rvlink_types::config::ClientConfig;
use rvlink_types::events::ClientEvent;
use rvlink_types::{GroupChatId, PostId, Result, RvId, RvlinkError, UserId};

pub type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Installs a log subscriber honoring `RUST_LOG`, once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ---------------------------------------------------------------------------
// Identity provider
// ---------------------------------------------------------------------------

pub struct FreshIdentity {
    pub name: String,
    pub nick: String,
}

#[async_trait]
impl LocalIdentityProvider for FreshIdentity {
    async fn get(&self, _cancel: &CancellationToken) -> Result<LocalIdentity> {
        Ok(LocalIdentity::generate(&self.name, &self.nick))
    }
}

/// Always hands out the same key material, under whatever nick the
/// secrets carry.
pub struct FixedIdentity(pub LocalIdentitySecrets);

#[async_trait]
impl LocalIdentityProvider for FixedIdentity {
    async fn get(&self, _cancel: &CancellationToken) -> Result<LocalIdentity> {
        Ok(LocalIdentity::from_secrets(&self.0))
    }
}

// ---------------------------------------------------------------------------
// Recording services
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    InviteToGroupChat(UserId, GroupChatId),
    FetchPost(UserId, PostId),
    RequestMediateKx(UserId, UserId),
    SubscribeToPosts(UserId),
    UnsubscribeFromLocalPosts(UserId),
    RemoveFromGroupChat(GroupChatId, UserId, String),
    SendHandshake(UserId),
}

#[derive(Default)]
pub struct RecordingServices {
    calls: Mutex<Vec<Call>>,
    group_chats: Mutex<Vec<GroupChatId>>,
}

impl RecordingServices {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Group chats reported as administered with every peer.
    pub fn set_group_chats(&self, gcs: Vec<GroupChatId>) {
        if let Ok(mut g) = self.group_chats.lock() {
            *g = gcs;
        }
    }

    fn record(&self, call: Call) {
        if let Ok(mut c) = self.calls.lock() {
            c.push(call);
        }
    }
}

#[async_trait]
impl PeerServices for RecordingServices {
    async fn invite_to_group_chat(&self, uid: UserId, gc: GroupChatId) -> Result<()> {
        self.record(Call::InviteToGroupChat(uid, gc));
        Ok(())
    }

    async fn fetch_post(&self, uid: UserId, post: PostId) -> Result<()> {
        self.record(Call::FetchPost(uid, post));
        Ok(())
    }

    async fn request_mediate_kx(&self, mediator: UserId, target: UserId) -> Result<()> {
        self.record(Call::RequestMediateKx(mediator, target));
        Ok(())
    }

    async fn subscribe_to_posts(&self, uid: UserId) -> Result<()> {
        self.record(Call::SubscribeToPosts(uid));
        Ok(())
    }

    async fn unsubscribe_from_local_posts(&self, uid: UserId) -> Result<()> {
        self.record(Call::UnsubscribeFromLocalPosts(uid));
        Ok(())
    }

    async fn administered_group_chats_with(&self, _uid: UserId) -> Result<Vec<GroupChatId>> {
        Ok(self.group_chats.lock().map(|g| g.clone()).unwrap_or_default())
    }

    async fn remove_from_group_chat(&self, gc: GroupChatId, uid: UserId, reason: String) -> Result<()> {
        self.record(Call::RemoveFromGroupChat(gc, uid, reason));
        Ok(())
    }

    async fn send_handshake(&self, uid: UserId) -> Result<()> {
        self.record(Call::SendHandshake(uid));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory rendezvous
// ---------------------------------------------------------------------------

/// Records subscriptions and pushes without any relay behind it.
#[derive(Default)]
pub struct MemRendezvous {
    subs: Mutex<HashSet<RvId>>,
    pushed: Mutex<Vec<(RvId, Vec<u8>)>>,
    failing_pushes: AtomicUsize,
}

impl MemRendezvous {
    /// Makes the next `n` pushes fail with a network error.
    pub fn fail_next_pushes(&self, n: usize) {
        self.failing_pushes.store(n, Ordering::SeqCst);
    }

    pub fn is_subscribed(&self, rv: &RvId) -> bool {
        self.subs.lock().map(|s| s.contains(rv)).unwrap_or(false)
    }

    pub fn pushed_to(&self, rv: &RvId) -> usize {
        self.pushed
            .lock()
            .map(|p| p.iter().filter(|(r, _)| r == rv).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Rendezvous for MemRendezvous {
    async fn subscribe(&self, rv: RvId) -> Result<()> {
        if let Ok(mut s) = self.subs.lock() {
            s.insert(rv);
        }
        Ok(())
    }

    async fn unsubscribe(&self, rv: RvId) -> Result<()> {
        if let Ok(mut s) = self.subs.lock() {
            s.remove(&rv);
        }
        Ok(())
    }

    async fn push(&self, _cancel: &CancellationToken, rv: RvId, payload: Vec<u8>) -> Result<()> {
        let failing = self
            .failing_pushes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(RvlinkError::Network {
                reason: "write failed".into(),
            });
        }
        if let Ok(mut p) = self.pushed.lock() {
            p.push((rv, payload));
        }
        Ok(())
    }

    async fn push_prepaid(&self, cancel: &CancellationToken, rv: RvId, payload: Vec<u8>) -> Result<()> {
        self.push(cancel, rv, payload).await
    }

    async fn fetch_prepaid(&self, _cancel: &CancellationToken, rv: RvId) -> Result<Vec<u8>> {
        Err(RvlinkError::not_found(format!("prepaid invite at {}", rv.short())))
    }
}

/// A client over `rendezvous` and fresh recording services, with no relay
/// or client loop behind it.
pub async fn offline_client(
    nick: &str,
    rendezvous: Arc<MemRendezvous>,
) -> std::result::Result<(Client, Arc<RecordingServices>, CancellationToken), Box<dyn std::error::Error>> {
    init_tracing();
    let cancel = CancellationToken::new();
    let (events, _) = mpsc::unbounded_channel();
    let services = Arc::new(RecordingServices::default());
    let client = Client::new(ClientParams {
        config: ClientConfig::default(),
        db: Arc::new(ClientDb::open_temporary(&[7; 32])?),
        rendezvous: rendezvous as Arc<dyn Rendezvous>,
        services: Arc::clone(&services) as Arc<dyn PeerServices>,
        identity_provider: Arc::new(FreshIdentity {
            name: nick.to_uppercase(),
            nick: nick.to_string(),
        }),
        events,
        cancel: cancel.clone(),
    })
    .await?;
    Ok((client, services, cancel))
}

// ---------------------------------------------------------------------------
// Peers on a shared relay
// ---------------------------------------------------------------------------

pub struct Peer {
    pub client: Client,
    pub events: mpsc::UnboundedReceiver<ClientEvent>,
    pub services: Arc<RecordingServices>,
    pub rendezvous: Arc<RelayRendezvous>,
    pub db: Arc<ClientDb>,
    pub cancel: CancellationToken,
}

impl Peer {
    pub async fn spawn(relay: &Arc<MemRelay>, nick: &str) -> std::result::Result<Self, Box<dyn std::error::Error>> {
        Self::spawn_with(relay, nick, ClientConfig::default()).await
    }

    pub async fn spawn_with(
        relay: &Arc<MemRelay>,
        nick: &str,
        config: ClientConfig,
    ) -> std::result::Result<Self, Box<dyn std::error::Error>> {
        let identity = FreshIdentity {
            name: nick.to_uppercase(),
            nick: nick.to_string(),
        };
        Self::spawn_as(relay, Arc::new(identity), config).await
    }

    pub async fn spawn_as(
        relay: &Arc<MemRelay>,
        identity_provider: Arc<dyn LocalIdentityProvider>,
        config: ClientConfig,
    ) -> std::result::Result<Self, Box<dyn std::error::Error>> {
        init_tracing();
        let cancel = CancellationToken::new();
        let keeper_cfg = ConnKeeperConfig {
            reconnect_delay_ms: 1,
            max_reconnect_delay_ms: 5,
            ..Default::default()
        };
        let (keeper, routed) = ConnKeeper::new(keeper_cfg, relay.dialer(), Arc::new(relay.confirmer()))?;
        let keeper = Arc::new(keeper);
        let rendezvous = Arc::new(RelayRendezvous::new(Arc::clone(&keeper)));
        tokio::spawn({
            let keeper = Arc::clone(&keeper);
            let cancel = cancel.clone();
            async move { keeper.run(&cancel).await }
        });
        tokio::spawn({
            let rendezvous = Arc::clone(&rendezvous);
            let cancel = cancel.clone();
            async move { rendezvous.run(&cancel).await }
        });

        let (events_tx, events) = mpsc::unbounded_channel();
        let services = Arc::new(RecordingServices::default());
        let db = Arc::new(ClientDb::open_temporary(&[7; 32])?);
        let client = Client::new(ClientParams {
            config,
            db: Arc::clone(&db),
            rendezvous: Arc::clone(&rendezvous) as Arc<dyn Rendezvous>,
            services: Arc::clone(&services) as Arc<dyn PeerServices>,
            identity_provider,
            events: events_tx,
            cancel: cancel.clone(),
        })
        .await?;
        tokio::spawn({
            let client = client.clone();
            async move { client.run(routed).await }
        });
        client.wait_address_book_loaded().await?;

        Ok(Self {
            client,
            events,
            services,
            rendezvous,
            db,
            cancel,
        })
    }

    /// Waits for the first event accepted by `select`, skipping others.
    pub async fn wait_event<T>(
        &mut self,
        mut select: impl FnMut(&ClientEvent) -> Option<T>,
    ) -> std::result::Result<T, Box<dyn std::error::Error>> {
        let wait = async {
            while let Some(ev) = self.events.recv().await {
                if let Some(out) = select(&ev) {
                    return Some(out);
                }
            }
            None
        };
        match tokio::time::timeout(EVENT_TIMEOUT, wait).await {
            Ok(Some(out)) => Ok(out),
            Ok(None) => Err("event channel closed".into()),
            Err(_) => Err("timed out waiting for event".into()),
        }
    }

    /// Waits for a `KxCompleted` event and returns `(uid, nick, is_new)`.
    pub async fn wait_kx_completed(&mut self) -> std::result::Result<(UserId, String, bool), Box<dyn std::error::Error>> {
        self.wait_event(|ev| match ev {
            ClientEvent::KxCompleted { uid, nick, is_new, .. } => Some((*uid, nick.clone(), *is_new)),
            _ => None,
        })
        .await
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Links `a` and `b` through a plain invite created by `a`.
pub async fn link(a: &mut Peer, b: &mut Peer) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let mut buf = Vec::new();
    let invite = a.client.create_invite(&mut buf, None)?;
    let read = rvlink_client::read_invite(buf.as_slice())?;
    assert_eq!(read.initial_rendezvous, invite.initial_rendezvous);
    b.client.accept_invite(read).await?;
    let (on_a, _, _) = a.wait_kx_completed().await?;
    let (on_b, _, _) = b.wait_kx_completed().await?;
    assert_eq!(on_a, b.client.local_uid());
    assert_eq!(on_b, a.client.local_uid());
    Ok(())
}

/// Polls `check` until it holds or the event timeout passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
