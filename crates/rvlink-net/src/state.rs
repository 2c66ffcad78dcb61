//! Connection state machine.
//!
//! The keeper's loop is driven entirely by [`ConnState::next`]. States
//! and events are plain enums so the transition table can be tested
//! without any I/O.

use serde::{Deserialize, Serialize};

use rvlink_types::{RvlinkError, ServerPolicy};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnState {
    /// The user asked to stay offline.
    Offline,
    /// Opening the transport and confirming the relay certificate.
    Dialing,
    /// Running the session KX.
    ServerKx,
    /// Waiting for and negotiating the welcome.
    Welcoming,
    /// A session is established and published.
    Online,
    /// Waiting before the next attempt.
    Backoff,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnEvent {
    GoOnline,
    GoOffline,
    Dialed,
    ServerKxDone,
    Welcomed,
    AttemptFailed,
    SessionClosed,
    BackoffElapsed,
}

impl ConnState {
    /// Applies `event`. Events that make no sense in the current state
    /// leave it unchanged.
    pub fn next(self, event: ConnEvent) -> ConnState {
        use ConnEvent as E;
        use ConnState as S;
        match (self, event) {
            (_, E::GoOffline) => S::Offline,
            (S::Offline, E::GoOnline) => S::Dialing,
            (S::Dialing, E::Dialed) => S::ServerKx,
            (S::ServerKx, E::ServerKxDone) => S::Welcoming,
            (S::Welcoming, E::Welcomed) => S::Online,
            (S::Dialing | S::ServerKx | S::Welcoming, E::AttemptFailed) => S::Backoff,
            (S::Online, E::SessionClosed) => S::Backoff,
            (S::Backoff, E::BackoffElapsed) => S::Dialing,
            (state, _) => state,
        }
    }

    /// Whether a connection attempt is in progress.
    pub fn is_attempting(self) -> bool {
        matches!(self, ConnState::Dialing | ConnState::ServerKx | ConnState::Welcoming)
    }
}

/// Snapshot published on the keeper's status watch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnStatus {
    pub state: ConnState,
    /// Error of the last failed attempt or closed session.
    pub last_error: Option<RvlinkError>,
    /// Policy of the current session while online.
    pub policy: Option<ServerPolicy>,
    /// Total connection attempts so far.
    pub attempts: u64,
}

impl ConnStatus {
    pub fn is_online(&self) -> bool {
        self.state == ConnState::Online
    }
}

impl Default for ConnStatus {
    fn default() -> Self {
        Self {
            state: ConnState::Offline,
            last_error: None,
            policy: None,
            attempts: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnEvent as E;
    use ConnState as S;

    #[test]
    fn happy_path() {
        let s = S::Offline
            .next(E::GoOnline)
            .next(E::Dialed)
            .next(E::ServerKxDone)
            .next(E::Welcomed);
        assert_eq!(s, S::Online);
        assert_eq!(s.next(E::SessionClosed), S::Backoff);
        assert_eq!(S::Backoff.next(E::BackoffElapsed), S::Dialing);
    }

    #[test]
    fn failures_back_off_from_any_attempt_stage() {
        for s in [S::Dialing, S::ServerKx, S::Welcoming] {
            assert!(s.is_attempting());
            assert_eq!(s.next(E::AttemptFailed), S::Backoff);
        }
    }

    #[test]
    fn go_offline_always_wins() {
        for s in [S::Offline, S::Dialing, S::ServerKx, S::Welcoming, S::Online, S::Backoff] {
            assert_eq!(s.next(E::GoOffline), S::Offline);
        }
    }

    #[test]
    fn nonsense_events_are_ignored() {
        assert_eq!(S::Online.next(E::GoOnline), S::Online);
        assert_eq!(S::Offline.next(E::Welcomed), S::Offline);
        assert_eq!(S::Backoff.next(E::Dialed), S::Backoff);
    }
}
