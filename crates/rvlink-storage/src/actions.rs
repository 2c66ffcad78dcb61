//! Deferred post-KX actions.
//!
//! Before a KX completes, actions are attached to the invite's initial
//! rendezvous under `ikxa/<rv>/<id>`. When the peer links they are moved
//! to `pkxa/<uid>/<id>` inside the linking transaction, executed once in
//! the background and then deleted.

use chrono::{DateTime, Utc};
use rvlink_types::{GroupChatId, PostId, Result, RvId, UserId};
use serde::{Deserialize, Serialize};

use crate::engine::Tx;

const INITIAL_PREFIX: &str = "ikxa/";
const PEER_PREFIX: &str = "pkxa/";

/// What to do once the peer is linked.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PostKxActionKind {
    /// Invite the new peer to a group chat we administer.
    InviteToGroupChat { gc: GroupChatId },
    /// Fetch a post relayed by the new peer.
    FetchPost { post: PostId },
    /// Ask the new peer to mediate a KX with `target`.
    KxSearch { target: UserId },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostKxAction {
    pub kind: PostKxActionKind,
    pub date_added: DateTime<Utc>,
}

impl PostKxAction {
    pub fn new(kind: PostKxActionKind) -> Self {
        Self {
            kind,
            date_added: Utc::now(),
        }
    }
}

fn id_suffix(key: &str) -> Option<u64> {
    key.rsplit('/').next().and_then(|s| u64::from_str_radix(s, 16).ok())
}

impl Tx<'_> {
    /// Attaches `action` to the exchange started on `initial_rv`.
    pub fn add_initial_kx_action(&mut self, initial_rv: &RvId, action: &PostKxAction) -> Result<()> {
        let id = self.next_id()?;
        self.put(&format!("{INITIAL_PREFIX}{initial_rv}/{id:016x}"), action)
    }

    pub fn initial_kx_actions(&self, initial_rv: &RvId) -> Result<Vec<PostKxAction>> {
        Ok(self
            .scan(&format!("{INITIAL_PREFIX}{initial_rv}/"))?
            .into_iter()
            .map(|(_, a)| a)
            .collect())
    }

    /// Converts every action attached to `initial_rv` into an action
    /// keyed by `uid`. Returns the moved actions.
    pub fn move_initial_kx_actions(&mut self, initial_rv: &RvId, uid: &UserId) -> Result<Vec<PostKxAction>> {
        let prefix = format!("{INITIAL_PREFIX}{initial_rv}/");
        let entries: Vec<(String, PostKxAction)> = self.scan(&prefix)?;
        let mut moved = Vec::with_capacity(entries.len());
        for (key, action) in entries {
            let id = match id_suffix(&key) {
                Some(id) => id,
                None => self.next_id()?,
            };
            self.delete(&key)?;
            self.put(&format!("{PEER_PREFIX}{uid}/{id:016x}"), &action)?;
            moved.push(action);
        }
        Ok(moved)
    }

    /// Returns `(id, action)` pairs queued for `uid`, oldest first.
    pub fn post_kx_actions(&self, uid: &UserId) -> Result<Vec<(u64, PostKxAction)>> {
        let entries: Vec<(String, PostKxAction)> = self.scan(&format!("{PEER_PREFIX}{uid}/"))?;
        Ok(entries
            .into_iter()
            .filter_map(|(key, action)| id_suffix(&key).map(|id| (id, action)))
            .collect())
    }

    pub fn delete_post_kx_action(&mut self, uid: &UserId, id: u64) -> Result<bool> {
        self.delete(&format!("{PEER_PREFIX}{uid}/{id:016x}"))
    }

    pub fn delete_post_kx_actions(&mut self, uid: &UserId) -> Result<usize> {
        self.delete_prefix(&format!("{PEER_PREFIX}{uid}/"))
    }

    /// Whether a fetch-post action is queued for `uid`.
    pub fn has_fetch_post_action(&self, uid: &UserId) -> Result<bool> {
        Ok(self
            .post_kx_actions(uid)?
            .iter()
            .any(|(_, a)| matches!(a.kind, PostKxActionKind::FetchPost { .. })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ClientDb;
    use rvlink_types::RvlinkError;

    #[test]
    fn actions_move_from_rv_to_peer() -> std::result::Result<(), RvlinkError> {
        let db = ClientDb::open_temporary(&[4; 32])?;
        let rv = RvId::new([1; 32]);
        let uid = UserId::new([2; 32]);
        db.update(|tx| {
            tx.add_initial_kx_action(
                &rv,
                &PostKxAction::new(PostKxActionKind::InviteToGroupChat {
                    gc: GroupChatId::new([3; 32]),
                }),
            )?;
            tx.add_initial_kx_action(
                &rv,
                &PostKxAction::new(PostKxActionKind::FetchPost {
                    post: PostId::new([4; 32]),
                }),
            )
        })?;

        let moved = db.update(|tx| tx.move_initial_kx_actions(&rv, &uid))?;
        assert_eq!(moved.len(), 2);
        assert!(db.view(|tx| tx.initial_kx_actions(&rv))?.is_empty());

        let queued = db.view(|tx| tx.post_kx_actions(&uid))?;
        assert_eq!(queued.len(), 2);
        assert!(matches!(
            queued[0].1.kind,
            PostKxActionKind::InviteToGroupChat { .. }
        ));
        assert!(db.view(|tx| tx.has_fetch_post_action(&uid))?);

        let (first, _) = queued[0].clone();
        assert!(db.update(|tx| tx.delete_post_kx_action(&uid, first))?);
        assert_eq!(db.view(|tx| tx.post_kx_actions(&uid))?.len(), 1);
        Ok(())
    }

    #[test]
    fn moving_nothing_is_fine() -> std::result::Result<(), RvlinkError> {
        let db = ClientDb::open_temporary(&[4; 32])?;
        let moved = db.update(|tx| tx.move_initial_kx_actions(&RvId::new([1; 32]), &UserId::new([2; 32])))?;
        assert!(moved.is_empty());
        Ok(())
    }
}
