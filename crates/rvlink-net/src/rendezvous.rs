//! Rendezvous operations over the keeper's sessions.
//!
//! [`RelayRendezvous`] remembers which rendezvous points the client wants
//! to hear from and re-subscribes all of them on every new session, so
//! callers subscribe once regardless of reconnects.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use rvlink_types::{Result, RvId, RvlinkError};
use rvlink_wire::message::Command;

use crate::keeper::ConnKeeper;
use crate::session::ServerSession;

pub struct RelayRendezvous {
    keeper: Arc<ConnKeeper>,
    subs: Mutex<HashSet<RvId>>,
}

impl RelayRendezvous {
    pub fn new(keeper: Arc<ConnKeeper>) -> Self {
        Self {
            keeper,
            subs: Mutex::new(HashSet::new()),
        }
    }

    pub fn keeper(&self) -> &Arc<ConnKeeper> {
        &self.keeper
    }

    /// Re-subscribes every wanted rendezvous on each new session until
    /// `cancel` fires.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let mut sessions = self.keeper.sessions();
        let mut last_id = None;
        loop {
            let current = sessions.borrow_and_update().clone();
            if let Some(session) = current {
                if last_id != Some(session.id()) && !session.is_closed() {
                    last_id = Some(session.id());
                    self.resubscribe(&session).await;
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(RvlinkError::Canceled),
                r = sessions.changed() => {
                    if r.is_err() {
                        return Err(RvlinkError::Canceled);
                    }
                }
            }
        }
    }

    async fn resubscribe(&self, session: &ServerSession) {
        let wanted: Vec<RvId> = self.wanted();
        tracing::debug!(session = session.id(), count = wanted.len(), "resubscribing rendezvous points");
        for rv in wanted {
            if let Err(e) = session.request(Command::Subscribe { rv }).await {
                tracing::warn!(rv = %rv.short(), error = %e, "resubscribe failed");
                return;
            }
        }
    }

    fn wanted(&self) -> Vec<RvId> {
        self.subs
            .lock()
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_subscribed(&self, rv: &RvId) -> bool {
        self.subs.lock().map(|s| s.contains(rv)).unwrap_or(false)
    }

    /// Subscribes to `rv`. While offline the subscription is recorded and
    /// applied when the next session comes up.
    pub async fn subscribe(&self, rv: RvId) -> Result<()> {
        let added = self
            .subs
            .lock()
            .map_err(|_| RvlinkError::Network {
                reason: "subscription set poisoned".into(),
            })?
            .insert(rv);
        if !added {
            return Ok(());
        }
        match self.keeper.current_session() {
            Some(session) => session.request(Command::Subscribe { rv }).await.map(|_| ()),
            None => Ok(()),
        }
    }

    pub async fn unsubscribe(&self, rv: RvId) -> Result<()> {
        let removed = self.subs.lock().map(|mut s| s.remove(&rv)).unwrap_or(false);
        if !removed {
            return Ok(());
        }
        match self.keeper.current_session() {
            Some(session) => session.request(Command::Unsubscribe { rv }).await.map(|_| ()),
            None => Ok(()),
        }
    }

    async fn session(&self, cancel: &CancellationToken) -> Result<ServerSession> {
        match self.keeper.next_session(cancel).await {
            Some(s) => Ok(s),
            None if cancel.is_cancelled() => Err(RvlinkError::Canceled),
            None => Err(RvlinkError::Network {
                reason: "relay connection is offline".into(),
            }),
        }
    }

    /// Pushes `payload` to `rv`, waiting for a session if needed.
    pub async fn push(&self, cancel: &CancellationToken, rv: RvId, payload: Vec<u8>) -> Result<()> {
        self.session(cancel).await?.push(rv, payload).await
    }

    /// Stores a prepaid invite blob at `rv`.
    pub async fn push_prepaid(&self, cancel: &CancellationToken, rv: RvId, payload: Vec<u8>) -> Result<()> {
        self.session(cancel)
            .await?
            .request(Command::PushPrepaid { rv, payload })
            .await
            .map(|_| ())
    }

    /// Fetches and consumes the prepaid invite blob at `rv`.
    ///
    /// # Errors
    ///
    /// [`RvlinkError::NotFound`] when nothing is stored at `rv`.
    pub async fn fetch_prepaid(&self, cancel: &CancellationToken, rv: RvId) -> Result<Vec<u8>> {
        self.session(cancel)
            .await?
            .request(Command::FetchPrepaid { rv })
            .await?
            .ok_or_else(|| RvlinkError::not_found(format!("prepaid invite at {}", rv.short())))
    }
}
