//! The local identity, stored under a single `localid` key.

use rvlink_crypto::identity::{LocalIdentity, LocalIdentitySecrets};
use rvlink_types::{Result, RvlinkError};

use crate::engine::Tx;

const LOCAL_ID_KEY: &str = "localid";

impl Tx<'_> {
    /// Loads the local identity, `None` if none was created yet.
    pub fn local_identity(&self) -> Result<Option<LocalIdentity>> {
        let secrets: Option<LocalIdentitySecrets> = self.get(LOCAL_ID_KEY)?;
        Ok(secrets.as_ref().map(LocalIdentity::from_secrets))
    }

    /// Stores the local identity.
    ///
    /// # Errors
    ///
    /// [`RvlinkError::AlreadyExists`] if an identity is already stored.
    pub fn create_local_identity(&mut self, id: &LocalIdentity) -> Result<()> {
        if self.exists(LOCAL_ID_KEY)? {
            return Err(RvlinkError::already_exists("local identity"));
        }
        self.put(LOCAL_ID_KEY, &id.secrets())
    }
}
