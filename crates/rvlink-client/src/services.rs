//! Collaborator seams of the client.
//!
//! - [`Rendezvous`]: subscribe/push on relay rendezvous points. The
//!   production implementation is [`RelayRendezvous`].
//! - [`PeerServices`]: group chat, post and messaging subsystems the
//!   session layer drives but does not own.
//! - [`LocalIdentityProvider`]: supplies the local identity the first
//!   time the client starts.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use rvlink_crypto::identity::LocalIdentity;
use rvlink_net::RelayRendezvous;
use rvlink_types::{GroupChatId, PostId, Result, RvId, UserId};

#[async_trait]
pub trait Rendezvous: Send + Sync {
    /// Starts listening on `rv`. Subscribing twice is not an error.
    async fn subscribe(&self, rv: RvId) -> Result<()>;
    /// Stops listening on `rv`. Unsubscribing an unknown rv is not an
    /// error.
    async fn unsubscribe(&self, rv: RvId) -> Result<()>;
    async fn push(&self, cancel: &CancellationToken, rv: RvId, payload: Vec<u8>) -> Result<()>;
    async fn push_prepaid(&self, cancel: &CancellationToken, rv: RvId, payload: Vec<u8>) -> Result<()>;
    async fn fetch_prepaid(&self, cancel: &CancellationToken, rv: RvId) -> Result<Vec<u8>>;
}

#[async_trait]
impl Rendezvous for RelayRendezvous {
    async fn subscribe(&self, rv: RvId) -> Result<()> {
        RelayRendezvous::subscribe(self, rv).await
    }

    async fn unsubscribe(&self, rv: RvId) -> Result<()> {
        RelayRendezvous::unsubscribe(self, rv).await
    }

    async fn push(&self, cancel: &CancellationToken, rv: RvId, payload: Vec<u8>) -> Result<()> {
        RelayRendezvous::push(self, cancel, rv, payload).await
    }

    async fn push_prepaid(&self, cancel: &CancellationToken, rv: RvId, payload: Vec<u8>) -> Result<()> {
        RelayRendezvous::push_prepaid(self, cancel, rv, payload).await
    }

    async fn fetch_prepaid(&self, cancel: &CancellationToken, rv: RvId) -> Result<Vec<u8>> {
        RelayRendezvous::fetch_prepaid(self, cancel, rv).await
    }
}

/// Higher level subsystems reached from the session layer.
#[async_trait]
pub trait PeerServices: Send + Sync {
    async fn invite_to_group_chat(&self, uid: UserId, gc: GroupChatId) -> Result<()>;
    async fn fetch_post(&self, uid: UserId, post: PostId) -> Result<()>;
    /// Asks `mediator` to introduce us to `target`.
    async fn request_mediate_kx(&self, mediator: UserId, target: UserId) -> Result<()>;
    /// Subscribes to the posts of `uid`.
    async fn subscribe_to_posts(&self, uid: UserId) -> Result<()>;
    /// Removes `uid` from the subscribers of our own posts.
    async fn unsubscribe_from_local_posts(&self, uid: UserId) -> Result<()>;
    /// Group chats we administer that `uid` is a member of.
    async fn administered_group_chats_with(&self, uid: UserId) -> Result<Vec<GroupChatId>>;
    async fn remove_from_group_chat(&self, gc: GroupChatId, uid: UserId, reason: String) -> Result<()>;
    /// Sends the first message of an application level handshake.
    async fn send_handshake(&self, uid: UserId) -> Result<()>;
}

/// [`PeerServices`] that accepts every request and does nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopServices;

#[async_trait]
impl PeerServices for NoopServices {
    async fn invite_to_group_chat(&self, _uid: UserId, _gc: GroupChatId) -> Result<()> {
        Ok(())
    }

    async fn fetch_post(&self, _uid: UserId, _post: PostId) -> Result<()> {
        Ok(())
    }

    async fn request_mediate_kx(&self, _mediator: UserId, _target: UserId) -> Result<()> {
        Ok(())
    }

    async fn subscribe_to_posts(&self, _uid: UserId) -> Result<()> {
        Ok(())
    }

    async fn unsubscribe_from_local_posts(&self, _uid: UserId) -> Result<()> {
        Ok(())
    }

    async fn administered_group_chats_with(&self, _uid: UserId) -> Result<Vec<GroupChatId>> {
        Ok(Vec::new())
    }

    async fn remove_from_group_chat(&self, _gc: GroupChatId, _uid: UserId, _reason: String) -> Result<()> {
        Ok(())
    }

    async fn send_handshake(&self, _uid: UserId) -> Result<()> {
        Ok(())
    }
}

/// Supplies the local identity when none is stored yet.
#[async_trait]
pub trait LocalIdentityProvider: Send + Sync {
    async fn get(&self, cancel: &CancellationToken) -> Result<LocalIdentity>;
}
