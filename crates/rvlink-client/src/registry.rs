//! The peer session registry.
//!
//! Exactly one [`RemoteUser`] exists per identity. [`PeerRegistry::add`]
//! never overwrites: on collision it hands back the existing entry so the
//! caller can swap its ratchet instead. Structural changes are
//! serialized by one registry-wide lock; ratchet swaps use the per-user
//! lock inside [`RemoteUser`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use rvlink_types::{Result, RvlinkError, UserId};

use crate::remote_user::RemoteUser;

struct Inner {
    users: HashMap<UserId, Arc<RemoteUser>>,
    local_nick: String,
}

pub struct PeerRegistry {
    inner: Mutex<Inner>,
}

impl PeerRegistry {
    pub fn new(local_nick: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                users: HashMap::new(),
                local_nick: local_nick.into(),
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| RvlinkError::Storage {
            reason: "peer registry lock poisoned".into(),
        })
    }

    /// Inserts `user` unless its identity is already present.
    ///
    /// Returns the registry's entry and whether it already existed. A new
    /// entry whose nick collides with another peer or with the local nick
    /// is renamed `<nick>_2`, `<nick>_3`, ... before insertion.
    pub fn add(&self, user: Arc<RemoteUser>) -> Result<(Arc<RemoteUser>, bool)> {
        let mut inner = self.lock()?;
        if let Some(existing) = inner.users.get(&user.uid()) {
            return Ok((Arc::clone(existing), true));
        }
        let unique = unique_nick(&inner, &user.uid(), &user.nick());
        if unique != user.nick() {
            tracing::info!(uid = %user.uid().short(), from = %user.nick(), to = %unique, "renaming peer with duplicate nick");
            user.set_nick(unique);
        }
        inner.users.insert(user.uid(), Arc::clone(&user));
        Ok((user, false))
    }

    pub fn remove(&self, uid: &UserId) -> Result<Arc<RemoteUser>> {
        self.lock()?
            .users
            .remove(uid)
            .ok_or_else(|| RvlinkError::not_found(format!("peer {}", uid.short())))
    }

    pub fn by_id(&self, uid: &UserId) -> Result<Arc<RemoteUser>> {
        self.lock()?
            .users
            .get(uid)
            .cloned()
            .ok_or_else(|| RvlinkError::not_found(format!("peer {}", uid.short())))
    }

    pub fn by_nick(&self, nick: &str) -> Result<Arc<RemoteUser>> {
        self.lock()?
            .users
            .values()
            .find(|u| u.nick() == nick)
            .cloned()
            .ok_or_else(|| RvlinkError::not_found(format!("peer with nick {nick}")))
    }

    pub fn list_ids(&self) -> Vec<UserId> {
        self.lock()
            .map(|inner| inner.users.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn users(&self) -> Vec<Arc<RemoteUser>> {
        self.lock()
            .map(|inner| inner.users.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.users.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `nick` or the first free `nick_N` for `uid`.
    pub fn unique_nick(&self, uid: &UserId, nick: &str) -> Result<String> {
        Ok(unique_nick(&*self.lock()?, uid, nick))
    }
}

fn unique_nick(inner: &Inner, uid: &UserId, nick: &str) -> String {
    let taken = |candidate: &str| {
        candidate == inner.local_nick
            || inner
                .users
                .values()
                .any(|u| u.uid() != *uid && u.nick() == candidate)
    };
    if !taken(nick) {
        return nick.to_string();
    }
    let mut n = 2u32;
    loop {
        let candidate = format!("{nick}_{n}");
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvlink_crypto::identity::LocalIdentity;
    use rvlink_crypto::ratchet::RatchetState;

    fn user(nick: &str) -> std::result::Result<Arc<RemoteUser>, RvlinkError> {
        let id = LocalIdentity::generate(nick, nick).public();
        let r = RatchetState::from_shared_secret(&[7; 32], b"t", true)?;
        Ok(Arc::new(RemoteUser::new(id, nick.to_string(), r)))
    }

    #[test]
    fn add_never_overwrites() -> std::result::Result<(), RvlinkError> {
        let reg = PeerRegistry::new("me");
        let bob = user("bob")?;
        let (entry, collision) = reg.add(Arc::clone(&bob))?;
        assert!(!collision);
        assert!(Arc::ptr_eq(&entry, &bob));

        let again = Arc::new(RemoteUser::new(
            bob.public().clone(),
            "robert".into(),
            RatchetState::from_shared_secret(&[8; 32], b"t", true)?,
        ));
        let (entry, collision) = reg.add(again)?;
        assert!(collision);
        assert!(Arc::ptr_eq(&entry, &bob));
        assert_eq!(reg.len(), 1);
        assert_eq!(entry.nick(), "bob");
        Ok(())
    }

    #[test]
    fn duplicate_nicks_get_suffixes() -> std::result::Result<(), RvlinkError> {
        let reg = PeerRegistry::new("me");
        reg.add(user("bob")?)?;
        let (second, _) = reg.add(user("bob")?)?;
        let (third, _) = reg.add(user("bob")?)?;
        let (mine, _) = reg.add(user("me")?)?;
        assert_eq!(second.nick(), "bob_2");
        assert_eq!(third.nick(), "bob_3");
        assert_eq!(mine.nick(), "me_2");
        assert_eq!(reg.by_nick("bob_3")?.uid(), third.uid());
        Ok(())
    }

    #[test]
    fn remove_and_lookup() -> std::result::Result<(), RvlinkError> {
        let reg = PeerRegistry::new("me");
        let bob = user("bob")?;
        reg.add(Arc::clone(&bob))?;
        assert_eq!(reg.list_ids(), vec![bob.uid()]);
        reg.remove(&bob.uid())?;
        assert!(reg.by_id(&bob.uid()).is_err_and(|e| e.is_not_found()));
        assert!(reg.remove(&bob.uid()).is_err_and(|e| e.is_not_found()));
        assert!(reg.is_empty());
        Ok(())
    }
}
