//! Notifications emitted by the client to its host application.
//!
//! [`ClientEvent`] is delivered over an unbounded channel returned when
//! the client is constructed. Front ends and other subsystems react to
//! these without reaching into the session layer.

use chrono::{DateTime, Utc};

use crate::{PublicIdentity, RvId, RvlinkError, ServerPolicy, UserId};

// ---------------------------------------------------------------------------
// ClientEvent
// ---------------------------------------------------------------------------

/// Events emitted by the rvlink client.
#[derive(Clone, Debug)]
pub enum ClientEvent {
    /// A peer KX finished and the peer is now linked.
    KxCompleted {
        /// Initial rendezvous the KX was started on (empty for resets).
        initial_rv: RvId,
        /// Linked peer.
        uid: UserId,
        /// Nick the peer is known by locally.
        nick: String,
        /// False when an existing peer had its ratchet replaced.
        is_new: bool,
    },

    /// A pending KX search targeting `target` completed.
    KxSearchCompleted {
        /// Identity that was searched for.
        target: UserId,
    },

    /// A handshake with a peer reached a new stage (`SYN`, `SYN/ACK`, `ACK`).
    HandshakeStage {
        /// Peer being handshaked.
        uid: UserId,
        /// Stage label.
        stage: String,
    },

    /// A peer was blocked and all its local state removed.
    PeerBlocked {
        /// Blocked peer.
        uid: UserId,
    },

    /// An idle peer is about to be unsubscribed and removed from
    /// administered group chats.
    UnsubscribingIdlePeer {
        /// Idle peer.
        uid: UserId,
        /// Last time a message from this peer was decrypted.
        last_decrypted: DateTime<Utc>,
    },

    /// The relay session went up or down.
    ServerSessionChanged {
        /// True when a live session exists.
        connected: bool,
        /// Policy negotiated for the live session, if any.
        policy: Option<ServerPolicy>,
    },

    /// Welcome negotiation with the relay failed.
    Unwelcome {
        /// The negotiation error.
        error: RvlinkError,
    },

    /// Posts subscription status for a peer changed.
    PostsSubscriptionChanged {
        /// Peer whose posts we (un)subscribed from.
        uid: UserId,
        /// New subscription status.
        subscribed: bool,
    },

    /// A peer announced a profile update (currently only the avatar).
    ProfileUpdated {
        /// Peer that updated its profile.
        uid: UserId,
    },

    /// The relay presented a TLS certificate that needs human approval.
    /// Resolve with the request id through the certificate gate.
    ConfirmServerCert {
        /// Gate request id.
        request_id: u64,
        /// Hex fingerprint of the presented certificate.
        cert_fingerprint: String,
        /// Hex of the expected server identity key, if pinned.
        server_identity: Option<String>,
    },

    /// No local identity exists; the host must supply one through the
    /// identity gate.
    LocalIdentityRequired {
        /// Gate request id.
        request_id: u64,
    },

    /// A peer offered a download that needs human approval.
    ConfirmDownload {
        /// Gate request id.
        request_id: u64,
        /// Peer offering the download.
        uid: UserId,
        /// Offered file name.
        name: String,
        /// Offered file size in bytes.
        size: u64,
    },

    /// A plain or prepaid invite was created locally.
    InviteCreated {
        /// Rendezvous the invitee will reply on.
        initial_rv: RvId,
        /// Identity announced in the invite.
        public: Box<PublicIdentity>,
    },
}
