//! Peer identity linking on top of the rvlink relay session.
//!
//! [`Client`] ties together the connection keeper's routed payloads, the
//! encrypted client database and a [`PeerRegistry`] of linked peers. It
//! creates and accepts out-of-band invites, runs the three-message KX
//! that links two identities, resets ratchets of linked peers and keeps
//! idle peers in check.
//!
//! # Modules
//!
//! - [`registry`]: one [`RemoteUser`] per linked identity
//! - [`remote_user`]: a linked peer and its ratchet
//! - [`invite`]: invite creation and prepaid invites
//! - [`gate`]: human confirmation gates (certificates, identity, downloads)
//! - [`services`]: collaborator seams driven by the client

mod client;
pub mod gate;
mod idle;
pub mod invite;
mod kx;
mod link;
pub mod registry;
pub mod remote_user;
mod reset;
pub mod services;

pub use client::{Client, ClientParams, UserLastReceived};
pub use gate::{ConfirmationGate, GatedCertConfirmer, GatedIdentityProvider, IdentityRequest};
pub use invite::{prepaid_invite_rv, read_invite};
pub use registry::PeerRegistry;
pub use remote_user::RemoteUser;
pub use reset::ResetReport;
pub use services::{LocalIdentityProvider, NoopServices, PeerServices, Rendezvous};
