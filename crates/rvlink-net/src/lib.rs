//! Relay connectivity for rvlink.
//!
//! # Modules
//!
//! - [`config`]: connection keeper settings and backoff policy
//! - [`dialer`]: transport and certificate confirmation seams
//! - [`server_kx`]: session handshake and encrypted message stream
//! - [`welcome`]: welcome negotiation and ping interval clamping
//! - [`session`]: a live relay session with request/reply correlation
//! - [`state`]: connection state machine and status snapshots
//! - [`keeper`]: the reconnecting connection keeper
//! - [`rendezvous`]: subscribe/push/prepaid operations across reconnects

pub mod config;
pub mod dialer;
pub mod keeper;
pub mod rendezvous;
pub mod server_kx;
pub mod session;
pub mod state;
pub mod welcome;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use config::ConnKeeperConfig;
pub use dialer::{BoxStream, CertConfirmer, Dialer, FingerprintConfirmer, TlsState};
pub use keeper::ConnKeeper;
pub use rendezvous::RelayRendezvous;
pub use session::{RoutedMessage, ServerSession};
pub use state::{ConnEvent, ConnState, ConnStatus};
pub use welcome::UnwelcomeHandler;
