//! Post subscription flags, keyed `postsub/<uid>`.

use chrono::{DateTime, Utc};
use rvlink_types::{Result, UserId};

use crate::engine::Tx;

const POSTSUB_PREFIX: &str = "postsub/";

impl Tx<'_> {
    pub fn is_subscribed_to_posts(&self, uid: &UserId) -> Result<bool> {
        self.exists(&format!("{POSTSUB_PREFIX}{uid}"))
    }

    /// Sets the subscription flag. Returns true when the stored value
    /// changed.
    pub fn set_posts_subscription(&mut self, uid: &UserId, subscribed: bool) -> Result<bool> {
        let key = format!("{POSTSUB_PREFIX}{uid}");
        let current = self.exists(&key)?;
        if current == subscribed {
            return Ok(false);
        }
        if subscribed {
            let since: DateTime<Utc> = Utc::now();
            self.put(&key, &since)?;
        } else {
            self.delete(&key)?;
        }
        Ok(true)
    }
}
