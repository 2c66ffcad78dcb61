//! An established, welcomed relay session.
//!
//! A [`ServerSession`] owns three background tasks:
//!
//! - a writer draining the outbound queue into the encrypted stream;
//! - a reader dispatching replies to waiting requests and forwarding
//!   routed payloads to the keeper's routed channel;
//! - a pinger sending keepalives at the negotiated interval.
//!
//! Any task failure closes the session. The keeper watches
//! [`ServerSession::closed`] and reconnects.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use rvlink_types::{PublicIdentity, Result, RvId, RvlinkError, ServerPolicy};
use rvlink_wire::message::{Command, Message};

use crate::server_kx::{EncryptedReader, EncryptedWriter};

/// Reply error text the relay uses for a missing record.
pub const REPLY_NOT_FOUND: &str = "not found";

/// Data the relay delivered for a subscribed rendezvous.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutedMessage {
    pub rv: RvId,
    pub payload: Vec<u8>,
    /// Id of the session that delivered it.
    pub session_id: u64,
}

type ReplySender = oneshot::Sender<Result<Option<Vec<u8>>>>;

struct Inner {
    id: u64,
    policy: ServerPolicy,
    server: PublicIdentity,
    outbound: mpsc::UnboundedSender<Message>,
    closed: CancellationToken,
    close_reason: Mutex<Option<RvlinkError>>,
    pending: Mutex<HashMap<u32, ReplySender>>,
    next_tag: AtomicU32,
    pong_seen: AtomicBool,
}

/// Handle to a live relay session. Cheap to clone.
#[derive(Clone)]
pub struct ServerSession {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSession")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ServerSession {
    /// Starts the session tasks over an encrypted stream that already
    /// delivered its welcome.
    pub fn start(
        id: u64,
        policy: ServerPolicy,
        server: PublicIdentity,
        reader: EncryptedReader,
        writer: EncryptedWriter,
        routed: mpsc::UnboundedSender<RoutedMessage>,
    ) -> Self {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let session = Self {
            inner: Arc::new(Inner {
                id,
                policy,
                server,
                outbound: out_tx,
                closed: CancellationToken::new(),
                close_reason: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                next_tag: AtomicU32::new(1),
                pong_seen: AtomicBool::new(true),
            }),
        };
        tokio::spawn(session.clone().write_loop(writer, out_rx));
        tokio::spawn(session.clone().read_loop(reader, routed));
        if session.inner.policy.ping_interval_ms > 0 {
            tokio::spawn(session.clone().ping_loop());
        }
        session
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn policy(&self) -> &ServerPolicy {
        &self.inner.policy
    }

    pub fn server_identity(&self) -> &PublicIdentity {
        &self.inner.server
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the session is closed.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    /// Why the session closed, if it did.
    pub fn close_reason(&self) -> Option<RvlinkError> {
        self.inner.close_reason.lock().ok().and_then(|r| r.clone())
    }

    /// Marks the session dead. Only the first reason is kept. Waiting
    /// requests fail with a network error.
    pub fn request_close(&self, reason: RvlinkError) {
        if let Ok(mut slot) = self.inner.close_reason.lock() {
            if slot.is_none() {
                tracing::debug!(session = self.inner.id, %reason, "closing relay session");
                *slot = Some(reason);
            }
        }
        self.inner.closed.cancel();
        if let Ok(mut pending) = self.inner.pending.lock() {
            for (_, tx) in pending.drain() {
                let _ = tx.send(Err(RvlinkError::Network {
                    reason: "relay session closed".into(),
                }));
            }
        }
    }

    /// Sends `command` and waits for its reply payload.
    ///
    /// # Errors
    ///
    /// - [`RvlinkError::Network`] if the session closes first.
    /// - [`RvlinkError::NotFound`] if the relay answers "not found".
    /// - [`RvlinkError::Protocol`] for any other error reply.
    pub async fn request(&self, command: Command) -> Result<Option<Vec<u8>>> {
        if self.is_closed() {
            return Err(RvlinkError::Network {
                reason: "relay session closed".into(),
            });
        }
        let tag = self.inner.next_tag.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .map_err(|_| RvlinkError::Network {
                reason: "pending request table poisoned".into(),
            })?
            .insert(tag, tx);

        let name = command.name();
        if self.inner.outbound.send(Message::new(tag, command)).is_err() {
            self.forget(tag);
            return Err(RvlinkError::Network {
                reason: "relay session writer stopped".into(),
            });
        }
        tracing::trace!(session = self.inner.id, tag, command = name, "relay request sent");

        tokio::select! {
            reply = rx => reply.unwrap_or_else(|_| Err(RvlinkError::Network {
                reason: "relay session closed".into(),
            })),
            _ = self.inner.closed.cancelled() => {
                self.forget(tag);
                Err(RvlinkError::Network { reason: "relay session closed".into() })
            }
        }
    }

    /// Pushes `payload` to `rv`, refusing payloads above the negotiated
    /// message size.
    pub async fn push(&self, rv: RvId, payload: Vec<u8>) -> Result<()> {
        let max = self.inner.policy.max_msg_size as usize;
        if payload.len() > max {
            return Err(RvlinkError::Protocol {
                reason: format!("payload of {} bytes exceeds relay limit {max}", payload.len()),
            });
        }
        self.request(Command::Push { rv, payload }).await.map(|_| ())
    }

    fn forget(&self, tag: u32) {
        if let Ok(mut pending) = self.inner.pending.lock() {
            pending.remove(&tag);
        }
    }

    fn resolve(&self, tag: u32, error: Option<String>, payload: Option<Vec<u8>>) {
        let tx = match self.inner.pending.lock() {
            Ok(mut pending) => pending.remove(&tag),
            Err(_) => None,
        };
        let Some(tx) = tx else {
            tracing::debug!(session = self.inner.id, tag, "reply for unknown tag");
            return;
        };
        let result = match error {
            None => Ok(payload),
            Some(e) if e == REPLY_NOT_FOUND => Err(RvlinkError::not_found("relay record")),
            Some(e) => Err(RvlinkError::Protocol { reason: e }),
        };
        let _ = tx.send(result);
    }

    // -----------------------------------------------------------------------
    // Background tasks
    // -----------------------------------------------------------------------

    async fn write_loop(self, mut writer: EncryptedWriter, mut rx: mpsc::UnboundedReceiver<Message>) {
        loop {
            let msg = tokio::select! {
                _ = self.inner.closed.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(m) => m,
                    None => break,
                },
            };
            if let Err(e) = writer.write_msg(&msg).await {
                self.request_close(e);
                break;
            }
        }
    }

    async fn read_loop(self, mut reader: EncryptedReader, routed: mpsc::UnboundedSender<RoutedMessage>) {
        loop {
            let msg = tokio::select! {
                _ = self.inner.closed.cancelled() => break,
                msg = reader.read_msg() => msg,
            };
            let msg = match msg {
                Ok(m) => m,
                Err(e) => {
                    self.request_close(e);
                    break;
                }
            };
            match msg.command {
                Command::Reply { error, payload } => self.resolve(msg.tag, error, payload),
                Command::Routed { rv, payload } => {
                    let _ = routed.send(RoutedMessage {
                        rv,
                        payload,
                        session_id: self.inner.id,
                    });
                }
                Command::Pong => self.inner.pong_seen.store(true, Ordering::Relaxed),
                other => {
                    tracing::warn!(session = self.inner.id, command = other.name(), "unexpected relay command");
                }
            }
        }
    }

    async fn ping_loop(self) {
        let period = Duration::from_millis(self.inner.policy.ping_interval_ms);
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.inner.closed.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !self.inner.pong_seen.swap(false, Ordering::Relaxed) {
                self.request_close(RvlinkError::Timeout {
                    what: "relay pong".into(),
                });
                break;
            }
            if self.inner.outbound.send(Message::new(0, Command::Ping)).is_err() {
                break;
            }
        }
    }
}
