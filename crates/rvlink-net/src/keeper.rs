//! Connection keeper.
//!
//! [`ConnKeeper`] keeps at most one welcomed [`ServerSession`] alive. Its
//! [`run`](ConnKeeper::run) loop dials, confirms the relay certificate,
//! runs the session KX and negotiates the welcome, then publishes the
//! session and waits for it to close. Failed attempts back off
//! exponentially up to a cap; the delay resets after a successful
//! session.
//!
//! Consumers obtain sessions through [`ConnKeeper::next_session`] or by
//! watching [`ConnKeeper::sessions`]. The online/offline toggle and the
//! cancellation token are the only ways to stop the loop.
//!
//! # Errors
//!
//! [`ConnKeeper::run`] returns only when canceled, with
//! `Err(RvlinkError::Canceled)`. Attempt failures are logged, published
//! on the status watch and retried.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use rvlink_types::{PublicIdentity, Result, RvlinkError, ServerPolicy};

use crate::config::ConnKeeperConfig;
use crate::dialer::{CertConfirmer, Dialer};
use crate::server_kx::{client_kx, read_server_hello};
use crate::session::{RoutedMessage, ServerSession};
use crate::state::{ConnEvent, ConnState, ConnStatus};
use crate::welcome::{attempt_welcome, UnwelcomeHandler};

pub struct ConnKeeper {
    cfg: ConnKeeperConfig,
    dialer: Arc<dyn Dialer>,
    confirmer: Arc<dyn CertConfirmer>,
    on_unwelcome: Option<UnwelcomeHandler>,
    online_tx: watch::Sender<bool>,
    session_tx: watch::Sender<Option<ServerSession>>,
    status_tx: watch::Sender<ConnStatus>,
    routed_tx: mpsc::UnboundedSender<RoutedMessage>,
    pinned: Mutex<Option<[u8; 32]>>,
    attempts: AtomicU64,
    next_session_id: AtomicU64,
    running: AtomicBool,
}

impl ConnKeeper {
    /// Creates a keeper that wants to be online. Routed payloads from
    /// every session it establishes arrive on the returned receiver.
    ///
    /// # Errors
    ///
    /// [`RvlinkError::Config`] if `cfg` does not validate.
    pub fn new(
        cfg: ConnKeeperConfig,
        dialer: Arc<dyn Dialer>,
        confirmer: Arc<dyn CertConfirmer>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RoutedMessage>)> {
        cfg.validate()?;
        let pinned = cfg.pinned_sig_key()?;
        let (routed_tx, routed_rx) = mpsc::unbounded_channel();
        let (online_tx, _) = watch::channel(true);
        let (session_tx, _) = watch::channel(None);
        let (status_tx, _) = watch::channel(ConnStatus::default());
        Ok((
            Self {
                cfg,
                dialer,
                confirmer,
                on_unwelcome: None,
                online_tx,
                session_tx,
                status_tx,
                routed_tx,
                pinned: Mutex::new(pinned),
                attempts: AtomicU64::new(0),
                next_session_id: AtomicU64::new(0),
                running: AtomicBool::new(false),
            },
            routed_rx,
        ))
    }

    /// Installs a callback invoked once per welcome refusal.
    pub fn with_unwelcome_handler(mut self, handler: UnwelcomeHandler) -> Self {
        self.on_unwelcome = Some(handler);
        self
    }

    // -----------------------------------------------------------------------
    // Control and observation
    // -----------------------------------------------------------------------

    /// Asks the keeper to connect (the default).
    pub fn go_online(&self) {
        self.online_tx.send_replace(true);
    }

    /// Asks the keeper to drop the current session and stay offline until
    /// [`go_online`](Self::go_online).
    pub fn remain_offline(&self) {
        self.online_tx.send_replace(false);
    }

    pub fn wants_online(&self) -> bool {
        *self.online_tx.borrow()
    }

    /// Connection attempts made so far.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> watch::Receiver<ConnStatus> {
        self.status_tx.subscribe()
    }

    /// Watch on the published session. `None` while no session is up.
    pub fn sessions(&self) -> watch::Receiver<Option<ServerSession>> {
        self.session_tx.subscribe()
    }

    /// The current live session, if any.
    pub fn current_session(&self) -> Option<ServerSession> {
        self.session_tx.borrow().as_ref().filter(|s| !s.is_closed()).cloned()
    }

    /// Waits for a live session.
    ///
    /// Returns `None` immediately while the keeper is asked to stay
    /// offline, and when `cancel` fires.
    pub async fn next_session(&self, cancel: &CancellationToken) -> Option<ServerSession> {
        let mut sessions = self.session_tx.subscribe();
        let mut online = self.online_tx.subscribe();
        loop {
            if let Some(s) = sessions.borrow_and_update().as_ref() {
                if !s.is_closed() {
                    return Some(s.clone());
                }
            }
            if !*online.borrow_and_update() {
                return None;
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                r = sessions.changed() => {
                    if r.is_err() {
                        return None;
                    }
                }
                r = online.changed() => {
                    if r.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Run loop
    // -----------------------------------------------------------------------

    /// Runs the keeper until `cancel` fires.
    ///
    /// # Errors
    ///
    /// - [`RvlinkError::Canceled`] on cancellation (the normal exit).
    /// - [`RvlinkError::Config`] if the keeper is already running.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(RvlinkError::Config {
                reason: "connection keeper already running".into(),
            });
        }
        let result = self.run_loop(cancel).await;
        if let Some(s) = self.session_tx.send_replace(None) {
            s.request_close(RvlinkError::Canceled);
        }
        self.publish(ConnState::Offline, None, None);
        self.running.store(false, Ordering::SeqCst);
        tracing::info!("connection keeper stopped");
        result
    }

    async fn run_loop(&self, cancel: &CancellationToken) -> Result<()> {
        let mut online_rx = self.online_tx.subscribe();
        let mut state = ConnState::Offline;
        let mut current: Option<ServerSession> = None;
        let mut failures: u32 = 0;
        let mut last_error: Option<RvlinkError> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(RvlinkError::Canceled);
            }
            let online = *online_rx.borrow_and_update();
            if !online && state != ConnState::Offline {
                if let Some(s) = current.take() {
                    s.request_close(RvlinkError::Network {
                        reason: "going offline".into(),
                    });
                    self.session_tx.send_replace(None);
                }
                tracing::info!("relay connection going offline");
                state = state.next(ConnEvent::GoOffline);
            }

            match state {
                ConnState::Offline => {
                    self.publish(state, last_error.clone(), None);
                    if online {
                        state = state.next(ConnEvent::GoOnline);
                        continue;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(RvlinkError::Canceled),
                        _ = online_rx.changed() => {}
                    }
                }

                ConnState::Dialing | ConnState::ServerKx | ConnState::Welcoming => {
                    let attempt = tokio::select! {
                        _ = cancel.cancelled() => return Err(RvlinkError::Canceled),
                        _ = wait_offline(&mut online_rx) => continue,
                        r = self.attempt(cancel, &mut state, &last_error) => r,
                    };
                    match attempt {
                        Ok(session) => {
                            failures = 0;
                            last_error = None;
                            state = state.next(ConnEvent::Welcomed);
                            self.publish(state, None, Some(session.policy().clone()));
                            self.session_tx.send_replace(Some(session.clone()));
                            current = Some(session);
                        }
                        Err(e) if e.is_canceled() => return Err(e),
                        Err(e) => {
                            failures = failures.saturating_add(1);
                            tracing::warn!(error = %e, failures, "relay connection attempt failed");
                            last_error = Some(e);
                            state = state.next(ConnEvent::AttemptFailed);
                        }
                    }
                }

                ConnState::Online => {
                    let Some(session) = current.clone() else {
                        state = state.next(ConnEvent::SessionClosed);
                        continue;
                    };
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(RvlinkError::Canceled),
                        _ = wait_offline(&mut online_rx) => continue,
                        _ = session.closed() => {}
                    }
                    let reason = session.close_reason();
                    tracing::info!(
                        session = session.id(),
                        reason = reason.as_ref().map(|e| e.to_string()).unwrap_or_default(),
                        "relay session closed"
                    );
                    current = None;
                    self.session_tx.send_replace(None);
                    last_error = reason;
                    state = state.next(ConnEvent::SessionClosed);
                }

                ConnState::Backoff => {
                    self.publish(state, last_error.clone(), None);
                    let delay = self.cfg.backoff_delay(failures);
                    tracing::debug!(delay_ms = delay.as_millis() as u64, "waiting before next relay attempt");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(RvlinkError::Canceled),
                        _ = wait_offline(&mut online_rx) => continue,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    state = state.next(ConnEvent::BackoffElapsed);
                }
            }
        }
    }

    /// One full connection attempt. Advances `state` through the attempt
    /// stages as each completes.
    async fn attempt(
        &self,
        cancel: &CancellationToken,
        state: &mut ConnState,
        last_error: &Option<RvlinkError>,
    ) -> Result<ServerSession> {
        let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        self.publish(*state, last_error.clone(), None);
        tracing::debug!(attempt = n, "dialing relay");

        let (mut stream, tls) = timeout(self.cfg.dial_timeout(), self.dialer.dial(cancel))
            .await
            .map_err(|_| RvlinkError::Timeout {
                what: "relay dial".into(),
            })??;
        tls.leaf()?;

        let server = timeout(self.cfg.welcome_timeout(), read_server_hello(&mut stream))
            .await
            .map_err(|_| RvlinkError::Timeout {
                what: "relay hello".into(),
            })??;
        self.check_pinned(&server)?;
        self.confirmer.confirm(cancel, &tls, &server).await?;
        *state = state.next(ConnEvent::Dialed);
        self.publish(*state, last_error.clone(), None);

        let (mut reader, writer) = timeout(self.cfg.welcome_timeout(), client_kx(stream, &server))
            .await
            .map_err(|_| RvlinkError::Kx {
                reason: "timed out waiting for server kx".into(),
            })??;
        *state = state.next(ConnEvent::ServerKxDone);
        self.publish(*state, last_error.clone(), None);

        let policy = timeout(
            self.cfg.welcome_timeout(),
            attempt_welcome(
                &mut reader,
                self.cfg.ping_interval(),
                self.cfg.min_ping_interval(),
                self.on_unwelcome.as_ref(),
            ),
        )
        .await
        .map_err(|_| RvlinkError::Timeout {
            what: "relay welcome".into(),
        })??;

        self.pin(&server);
        let id = self.next_session_id.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(
            session = id,
            server = %server.identity.short(),
            max_msg_size = policy.max_msg_size,
            ping_interval_ms = policy.ping_interval_ms,
            "relay session established"
        );
        Ok(ServerSession::start(id, policy, server, reader, writer, self.routed_tx.clone()))
    }

    fn check_pinned(&self, server: &PublicIdentity) -> Result<()> {
        let pinned = self.pinned.lock().ok().and_then(|p| *p);
        match pinned {
            Some(key) if key != server.sig_key => Err(RvlinkError::Network {
                reason: format!("relay identity {} does not match the pinned key", server.identity.short()),
            }),
            _ => Ok(()),
        }
    }

    fn pin(&self, server: &PublicIdentity) {
        if let Ok(mut pinned) = self.pinned.lock() {
            if pinned.is_none() {
                *pinned = Some(server.sig_key);
            }
        }
    }

    fn publish(&self, state: ConnState, last_error: Option<RvlinkError>, policy: Option<ServerPolicy>) {
        let attempts = self.attempts();
        self.status_tx.send_replace(ConnStatus {
            state,
            last_error,
            policy,
            attempts,
        });
    }
}

/// Resolves when the online flag reads false.
async fn wait_offline(rx: &mut watch::Receiver<bool>) {
    loop {
        if !*rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
