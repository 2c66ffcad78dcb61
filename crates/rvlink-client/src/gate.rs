//! Human confirmation gates.
//!
//! A [`ConfirmationGate`] turns "ask a human" into a single-use future:
//! the requester registers a request id, emits an event carrying it, and
//! waits. The host answers through [`ConfirmationGate::resolve`]. A
//! timeout or cancellation resolves the request as `None`, which every
//! caller treats as a denial.
//!
//! The same gate backs certificate confirmation
//! ([`GatedCertConfirmer`]), local identity creation
//! ([`GatedIdentityProvider`]) and download confirmation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use rvlink_crypto::identity::LocalIdentity;
use rvlink_net::{CertConfirmer, TlsState};
use rvlink_types::events::ClientEvent;
use rvlink_types::{PublicIdentity, Result, RvlinkError};

use crate::services::LocalIdentityProvider;

// ---------------------------------------------------------------------------
// ConfirmationGate
// ---------------------------------------------------------------------------

pub struct ConfirmationGate<T> {
    pending: Mutex<HashMap<u64, oneshot::Sender<T>>>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl<T: Send> ConfirmationGate<T> {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            timeout,
        }
    }

    /// Registers a request, hands its id to `announce` and waits for the
    /// answer. Returns `None` on timeout or cancellation.
    pub async fn request<F>(&self, cancel: &CancellationToken, announce: F) -> Option<T>
    where
        F: FnOnce(u64),
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        match self.pending.lock() {
            Ok(mut pending) => {
                pending.insert(id, tx);
            }
            Err(_) => return None,
        }
        announce(id);

        let answer = tokio::select! {
            _ = cancel.cancelled() => None,
            _ = tokio::time::sleep(self.timeout) => {
                tracing::debug!(request = id, "confirmation timed out");
                None
            }
            r = rx => r.ok(),
        };
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&id);
        }
        answer
    }

    /// Answers request `id`.
    ///
    /// # Errors
    ///
    /// [`RvlinkError::NotFound`] if no such request is waiting (already
    /// answered, timed out or never issued).
    pub fn resolve(&self, id: u64, value: T) -> Result<()> {
        let tx = self
            .pending
            .lock()
            .ok()
            .and_then(|mut p| p.remove(&id))
            .ok_or_else(|| RvlinkError::not_found(format!("confirmation request {id}")))?;
        tx.send(value)
            .map_err(|_| RvlinkError::not_found(format!("confirmation request {id}")))
    }

    /// Number of requests still waiting for an answer.
    pub fn pending(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Certificate confirmation
// ---------------------------------------------------------------------------

/// Asks the host to approve every relay certificate.
pub struct GatedCertConfirmer {
    gate: Arc<ConfirmationGate<bool>>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl GatedCertConfirmer {
    pub fn new(gate: Arc<ConfirmationGate<bool>>, events: mpsc::UnboundedSender<ClientEvent>) -> Self {
        Self { gate, events }
    }
}

#[async_trait]
impl CertConfirmer for GatedCertConfirmer {
    async fn confirm(&self, cancel: &CancellationToken, tls: &TlsState, server: &PublicIdentity) -> Result<()> {
        let cert_fingerprint = tls.fingerprint()?;
        let server_identity = Some(hex::encode(server.sig_key));
        let accepted = self
            .gate
            .request(cancel, |request_id| {
                let _ = self.events.send(ClientEvent::ConfirmServerCert {
                    request_id,
                    cert_fingerprint: cert_fingerprint.clone(),
                    server_identity,
                });
            })
            .await;
        if accepted == Some(true) {
            Ok(())
        } else if cancel.is_cancelled() {
            Err(RvlinkError::Canceled)
        } else {
            Err(RvlinkError::Network {
                reason: format!("server certificate {cert_fingerprint} not accepted"),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Local identity creation
// ---------------------------------------------------------------------------

/// Name and nick chosen by the user for a new local identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityRequest {
    pub name: String,
    pub nick: String,
}

/// Asks the host for a name and nick, then generates the identity.
pub struct GatedIdentityProvider {
    gate: Arc<ConfirmationGate<IdentityRequest>>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl GatedIdentityProvider {
    pub fn new(
        gate: Arc<ConfirmationGate<IdentityRequest>>,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Self {
        Self { gate, events }
    }
}

#[async_trait]
impl LocalIdentityProvider for GatedIdentityProvider {
    async fn get(&self, cancel: &CancellationToken) -> Result<LocalIdentity> {
        let answer = self
            .gate
            .request(cancel, |request_id| {
                let _ = self.events.send(ClientEvent::LocalIdentityRequired { request_id });
            })
            .await;
        match answer {
            Some(req) if !req.nick.trim().is_empty() => Ok(LocalIdentity::generate(&req.name, req.nick.trim())),
            Some(_) => Err(RvlinkError::InvalidIdentity {
                reason: "empty nick".into(),
            }),
            None if cancel.is_cancelled() => Err(RvlinkError::Canceled),
            None => Err(RvlinkError::Timeout {
                what: "local identity".into(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_answers_the_waiter() -> std::result::Result<(), RvlinkError> {
        let gate = Arc::new(ConfirmationGate::<bool>::new(Duration::from_secs(5)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let waiter = tokio::spawn({
            let gate = Arc::clone(&gate);
            let cancel = cancel.clone();
            async move { gate.request(&cancel, |id| drop(tx.send(id))).await }
        });
        let id = rx.recv().await.ok_or(RvlinkError::Canceled)?;
        gate.resolve(id, true)?;
        let answer = waiter.await.map_err(|e| RvlinkError::Network { reason: e.to_string() })?;
        assert_eq!(answer, Some(true));
        assert!(gate.resolve(id, false).is_err_and(|e| e.is_not_found()));
        assert_eq!(gate.pending(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn timeout_denies() {
        let gate = ConfirmationGate::<bool>::new(Duration::from_millis(10));
        let cancel = CancellationToken::new();
        assert_eq!(gate.request(&cancel, |_| {}).await, None);
        assert_eq!(gate.pending(), 0);
    }

    #[tokio::test]
    async fn cancel_denies() {
        let gate = ConfirmationGate::<bool>::new(Duration::from_secs(60));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(gate.request(&cancel, |_| {}).await, None);
    }

    #[tokio::test]
    async fn cert_confirmer_emits_and_waits() -> std::result::Result<(), RvlinkError> {
        let gate = Arc::new(ConfirmationGate::new(Duration::from_secs(5)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let confirmer = GatedCertConfirmer::new(Arc::clone(&gate), tx);
        let relay = LocalIdentity::generate("relay", "relay").public();
        let tls = TlsState {
            peer_certificates: vec![b"cert".to_vec()],
        };
        let cancel = CancellationToken::new();

        let answerer = tokio::spawn({
            let gate = Arc::clone(&gate);
            async move {
                while let Some(ev) = rx.recv().await {
                    if let ClientEvent::ConfirmServerCert { request_id, .. } = ev {
                        let _ = gate.resolve(request_id, false);
                    }
                }
            }
        });
        let err = confirmer.confirm(&cancel, &tls, &relay).await;
        assert!(matches!(err, Err(RvlinkError::Network { .. })));
        drop(confirmer);
        let _ = answerer.await;
        Ok(())
    }

    #[tokio::test]
    async fn identity_provider_generates_from_answer() -> std::result::Result<(), RvlinkError> {
        let gate = Arc::new(ConfirmationGate::new(Duration::from_secs(5)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let provider = GatedIdentityProvider::new(Arc::clone(&gate), tx);
        let cancel = CancellationToken::new();

        tokio::spawn({
            let gate = Arc::clone(&gate);
            async move {
                if let Some(ClientEvent::LocalIdentityRequired { request_id }) = rx.recv().await {
                    let _ = gate.resolve(
                        request_id,
                        IdentityRequest {
                            name: "Alice".into(),
                            nick: "alice".into(),
                        },
                    );
                }
            }
        });
        let id = provider.get(&cancel).await?;
        assert_eq!(id.nick(), "alice");
        Ok(())
    }
}
