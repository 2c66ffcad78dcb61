//! In-process relay for tests.
//!
//! [`MemRelay`] speaks the full relay protocol over in-memory duplex
//! streams: session handshake, welcome, pings, subscriptions, pushes
//! (stored until someone subscribes) and prepaid invite slots. Its
//! [`dialer`](MemRelay::dialer) can be told to fail upcoming dials and
//! [`disconnect_all`](MemRelay::disconnect_all) drops every live session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use rvlink_crypto::identity::LocalIdentity;
use rvlink_types::{PublicIdentity, Result, RvId, RvlinkError};
use rvlink_wire::message::{
    supported_server_properties, Command, Message, ServerProperty, Welcome, PROP_SERVER_TIME,
    PROTOCOL_VERSION,
};

use crate::dialer::{BoxStream, Dialer, FingerprintConfirmer, TlsState};
use crate::server_kx::accept_session;
use crate::session::REPLY_NOT_FOUND;

const DUPLEX_BUFFER: usize = 256 * 1024;

#[derive(Default)]
struct RelayState {
    subs: HashMap<RvId, (u64, mpsc::UnboundedSender<Message>)>,
    stored: HashMap<RvId, Vec<Vec<u8>>>,
    prepaid: HashMap<RvId, Vec<u8>>,
    live: HashMap<u64, CancellationToken>,
}

pub struct MemRelay {
    identity: LocalIdentity,
    cert: Vec<u8>,
    welcome: Mutex<Welcome>,
    state: Mutex<RelayState>,
    dials: AtomicU64,
    fail_dials: AtomicU64,
    next_conn: AtomicU64,
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// A welcome accepted by the default client configuration.
pub fn default_welcome() -> Welcome {
    let server_time = now_secs();
    let properties = supported_server_properties()
        .into_iter()
        .map(|p| {
            if p.key == PROP_SERVER_TIME {
                ServerProperty {
                    value: server_time.to_string(),
                    ..p
                }
            } else {
                p
            }
        })
        .collect();
    Welcome {
        version: PROTOCOL_VERSION,
        server_time,
        properties,
    }
}

impl MemRelay {
    pub fn new() -> Arc<Self> {
        let identity = LocalIdentity::generate("memrelay", "memrelay");
        let cert = identity.public().sig_key.to_vec();
        Arc::new(Self {
            identity,
            cert,
            welcome: Mutex::new(default_welcome()),
            state: Mutex::new(RelayState::default()),
            dials: AtomicU64::new(0),
            fail_dials: AtomicU64::new(0),
            next_conn: AtomicU64::new(0),
        })
    }

    pub fn identity(&self) -> PublicIdentity {
        self.identity.public()
    }

    pub fn dialer(self: &Arc<Self>) -> Arc<dyn Dialer> {
        Arc::new(MemRelayDialer(Arc::clone(self)))
    }

    /// A confirmer trusting exactly this relay's certificate.
    pub fn confirmer(&self) -> FingerprintConfirmer {
        let tls = self.tls();
        FingerprintConfirmer::new(tls.fingerprint().ok())
    }

    /// Welcome sent to sessions established from now on.
    pub fn set_welcome(&self, welcome: Welcome) {
        if let Ok(mut w) = self.welcome.lock() {
            *w = welcome;
        }
    }

    pub fn dial_count(&self) -> u64 {
        self.dials.load(Ordering::SeqCst)
    }

    /// Makes the next `n` dials fail.
    pub fn fail_next_dials(&self, n: u64) {
        self.fail_dials.store(n, Ordering::SeqCst);
    }

    /// Drops every live session.
    pub fn disconnect_all(&self) {
        if let Ok(state) = self.state.lock() {
            for token in state.live.values() {
                token.cancel();
            }
        }
    }

    pub fn is_subscribed(&self, rv: &RvId) -> bool {
        self.state.lock().map(|s| s.subs.contains_key(rv)).unwrap_or(false)
    }

    /// Payloads waiting at `rv` for a subscriber.
    pub fn stored_count(&self, rv: &RvId) -> usize {
        self.state
            .lock()
            .map(|s| s.stored.get(rv).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    fn tls(&self) -> TlsState {
        TlsState {
            peer_certificates: vec![self.cert.clone()],
        }
    }

    async fn serve(self: Arc<Self>, stream: BoxStream) -> Result<()> {
        let (mut reader, mut writer) = accept_session(stream, &self.identity).await?;
        let conn = self.next_conn.fetch_add(1, Ordering::SeqCst);
        let kill = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        {
            let mut state = self.lock_state()?;
            state.live.insert(conn, kill.clone());
        }

        let welcome = self
            .welcome
            .lock()
            .map(|w| w.clone())
            .unwrap_or_else(|_| default_welcome());
        let _ = tx.send(Message::new(0, Command::Welcome(welcome)));

        let writer_kill = kill.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = writer_kill.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(m) => m,
                        None => break,
                    },
                };
                if writer.write_msg(&msg).await.is_err() {
                    writer_kill.cancel();
                    break;
                }
            }
        });

        let result = loop {
            let msg = tokio::select! {
                _ = kill.cancelled() => break Ok(()),
                msg = reader.read_msg() => msg,
            };
            match msg {
                Ok(msg) => self.handle(conn, &tx, msg),
                Err(e) => break Err(e),
            }
        };

        kill.cancel();
        if let Ok(mut state) = self.state.lock() {
            state.live.remove(&conn);
            state.subs.retain(|_, (owner, _)| *owner != conn);
        }
        result
    }

    fn handle(&self, conn: u64, tx: &mpsc::UnboundedSender<Message>, msg: Message) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let reply = match msg.command {
            Command::Ping => {
                let _ = tx.send(Message::new(0, Command::Pong));
                return;
            }
            Command::Subscribe { rv } => {
                state.subs.insert(rv, (conn, tx.clone()));
                for payload in state.stored.remove(&rv).unwrap_or_default() {
                    let _ = tx.send(Message::new(0, Command::Routed { rv, payload }));
                }
                Message::reply(msg.tag, None, None)
            }
            Command::Unsubscribe { rv } => {
                if state.subs.get(&rv).is_some_and(|(owner, _)| *owner == conn) {
                    state.subs.remove(&rv);
                }
                Message::reply(msg.tag, None, None)
            }
            Command::Push { rv, payload } => {
                let delivered = match state.subs.get(&rv) {
                    Some((_, sub)) => sub
                        .send(Message::new(0, Command::Routed { rv, payload: payload.clone() }))
                        .is_ok(),
                    None => false,
                };
                if !delivered {
                    state.stored.entry(rv).or_default().push(payload);
                }
                Message::reply(msg.tag, None, None)
            }
            Command::PushPrepaid { rv, payload } => {
                if state.prepaid.contains_key(&rv) {
                    Message::reply(msg.tag, Some("prepaid slot already used".into()), None)
                } else {
                    state.prepaid.insert(rv, payload);
                    Message::reply(msg.tag, None, None)
                }
            }
            Command::FetchPrepaid { rv } => match state.prepaid.remove(&rv) {
                Some(payload) => Message::reply(msg.tag, None, Some(payload)),
                None => Message::reply(msg.tag, Some(REPLY_NOT_FOUND.into()), None),
            },
            other => Message::reply(msg.tag, Some(format!("unsupported command {}", other.name())), None),
        };
        let _ = tx.send(reply);
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, RelayState>> {
        self.state.lock().map_err(|_| RvlinkError::Network {
            reason: "relay state poisoned".into(),
        })
    }
}

struct MemRelayDialer(Arc<MemRelay>);

#[async_trait]
impl Dialer for MemRelayDialer {
    async fn dial(&self, _cancel: &CancellationToken) -> Result<(BoxStream, TlsState)> {
        let relay = &self.0;
        relay.dials.fetch_add(1, Ordering::SeqCst);
        let failing = relay
            .fail_dials
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RvlinkError::Network {
                reason: "dial refused".into(),
            });
        }
        let (client, server) = tokio::io::duplex(DUPLEX_BUFFER);
        let serving = Arc::clone(relay);
        tokio::spawn(async move {
            if let Err(e) = serving.serve(Box::new(server)).await {
                tracing::debug!(error = %e, "memrelay session ended");
            }
        });
        Ok((Box::new(client), relay.tls()))
    }
}
