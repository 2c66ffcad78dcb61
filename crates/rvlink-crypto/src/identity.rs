//! Local identity keys, signatures and public identity validation.
//!
//! A local identity pairs an Ed25519 signing key with a long-lived X25519
//! key. Peers seal KX payloads to the X25519 key and verify every KX
//! payload against the Ed25519 key. Both secrets zeroize on drop.

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rvlink_types::{PublicIdentity, Result, RvlinkError, UserId};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as XPublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::hash::compute_user_id;

/// Ed25519 signature length.
pub const SIGNATURE_LEN: usize = 64;

/// Longest accepted nick.
pub const MAX_NICK_LEN: usize = 64;

// ---------------------------------------------------------------------------
// Diffie-Hellman helper
// ---------------------------------------------------------------------------

fn diffie_hellman(secret: &StaticSecret, their_public: &[u8; 32]) -> Result<Zeroizing<[u8; 32]>> {
    let shared = secret.diffie_hellman(&XPublicKey::from(*their_public));
    if !shared.was_contributory() {
        return Err(RvlinkError::Crypto {
            reason: "x25519 exchange produced a non-contributory secret".into(),
        });
    }
    Ok(Zeroizing::new(*shared.as_bytes()))
}

// ---------------------------------------------------------------------------
// LocalIdentity
// ---------------------------------------------------------------------------

/// Serializable secret material of a [`LocalIdentity`], as persisted by
/// the client database.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct LocalIdentitySecrets {
    pub name: String,
    pub nick: String,
    pub sig_seed: [u8; 32],
    pub kx_seed: [u8; 32],
}

/// The identity of the local user.
pub struct LocalIdentity {
    name: String,
    nick: String,
    signing_key: SigningKey,
    kx_secret: StaticSecret,
    uid: UserId,
}

impl LocalIdentity {
    /// Generates a fresh identity from OS entropy.
    pub fn generate(name: &str, nick: &str) -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let kx_secret = StaticSecret::random_from_rng(OsRng);
        Self::assemble(name.to_string(), nick.to_string(), signing_key, kx_secret)
    }

    /// Rebuilds an identity from persisted secrets.
    pub fn from_secrets(secrets: &LocalIdentitySecrets) -> Self {
        Self::assemble(
            secrets.name.clone(),
            secrets.nick.clone(),
            SigningKey::from_bytes(&secrets.sig_seed),
            StaticSecret::from(secrets.kx_seed),
        )
    }

    fn assemble(name: String, nick: String, signing_key: SigningKey, kx_secret: StaticSecret) -> Self {
        let sig_pub = signing_key.verifying_key().to_bytes();
        let kx_pub = XPublicKey::from(&kx_secret).to_bytes();
        let uid = compute_user_id(&sig_pub, &kx_pub);
        Self {
            name,
            nick,
            signing_key,
            kx_secret,
            uid,
        }
    }

    /// Exports the secret material for persistence.
    pub fn secrets(&self) -> LocalIdentitySecrets {
        LocalIdentitySecrets {
            name: self.name.clone(),
            nick: self.nick.clone(),
            sig_seed: self.signing_key.to_bytes(),
            kx_seed: self.kx_secret.to_bytes(),
        }
    }

    pub fn uid(&self) -> UserId {
        self.uid
    }

    pub fn nick(&self) -> &str {
        &self.nick
    }

    /// Returns the public identity announced to peers.
    pub fn public(&self) -> PublicIdentity {
        PublicIdentity {
            name: self.name.clone(),
            nick: self.nick.clone(),
            sig_key: self.signing_key.verifying_key().to_bytes(),
            kx_key: XPublicKey::from(&self.kx_secret).to_bytes(),
            identity: self.uid,
            avatar: None,
        }
    }

    /// Signs `message` with the Ed25519 key.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Computes the X25519 secret shared between the local KX key and
    /// `their_public`.
    pub fn dh(&self, their_public: &[u8; 32]) -> Result<Zeroizing<[u8; 32]>> {
        diffie_hellman(&self.kx_secret, their_public)
    }

    pub(crate) fn kx_secret(&self) -> &StaticSecret {
        &self.kx_secret
    }
}

// LocalIdentity intentionally does not implement Clone or Debug.

// ---------------------------------------------------------------------------
// EphemeralKey
// ---------------------------------------------------------------------------

/// X25519 key used for a single KX. Persisted with the KX record until
/// the exchange finishes, then dropped.
pub struct EphemeralKey(StaticSecret);

impl EphemeralKey {
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(OsRng))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    pub fn to_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.0.to_bytes())
    }

    pub fn public(&self) -> [u8; 32] {
        XPublicKey::from(&self.0).to_bytes()
    }

    pub fn dh(&self, their_public: &[u8; 32]) -> Result<Zeroizing<[u8; 32]>> {
        diffie_hellman(&self.0, their_public)
    }
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Verifies an Ed25519 signature made by `sig_key` over `message`.
///
/// # Errors
///
/// Returns [`RvlinkError::Crypto`] if the key or signature is malformed
/// or the signature does not verify.
pub fn verify_signature(sig_key: &[u8; 32], message: &[u8], signature: &[u8]) -> Result<()> {
    let vk = VerifyingKey::from_bytes(sig_key).map_err(|e| RvlinkError::Crypto {
        reason: format!("invalid signing key: {e}"),
    })?;
    let sig = ed25519_dalek::Signature::from_slice(signature).map_err(|e| RvlinkError::Crypto {
        reason: format!("malformed signature: {e}"),
    })?;
    vk.verify_strict(message, &sig).map_err(|e| RvlinkError::Crypto {
        reason: format!("signature verification failed: {e}"),
    })
}

/// Checks that a public identity received from a peer is well formed:
/// its id matches its keys, the signing key is a valid point, the nick is
/// present and short, and any avatar fits `max_avatar_bytes`.
pub fn validate_public_identity(id: &PublicIdentity, max_avatar_bytes: usize) -> Result<()> {
    if compute_user_id(&id.sig_key, &id.kx_key) != id.identity {
        return Err(RvlinkError::InvalidIdentity {
            reason: "identity does not match its keys".into(),
        });
    }
    if VerifyingKey::from_bytes(&id.sig_key).is_err() {
        return Err(RvlinkError::InvalidIdentity {
            reason: "signing key is not a valid point".into(),
        });
    }
    let nick = id.nick.trim();
    if nick.is_empty() {
        return Err(RvlinkError::InvalidIdentity {
            reason: "empty nick".into(),
        });
    }
    if nick.chars().count() > MAX_NICK_LEN {
        return Err(RvlinkError::InvalidIdentity {
            reason: format!("nick longer than {MAX_NICK_LEN} characters"),
        });
    }
    if let Some(avatar) = &id.avatar {
        if avatar.len() > max_avatar_bytes {
            return Err(RvlinkError::InvalidIdentity {
                reason: format!("avatar of {} bytes exceeds {max_avatar_bytes}", avatar.len()),
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() -> std::result::Result<(), RvlinkError> {
        let id = LocalIdentity::generate("Alice", "alice");
        let sig = id.sign(b"payload");
        verify_signature(&id.public().sig_key, b"payload", &sig)?;
        assert!(verify_signature(&id.public().sig_key, b"other", &sig).is_err());
        Ok(())
    }

    #[test]
    fn secrets_roundtrip_preserves_uid() {
        let id = LocalIdentity::generate("Alice", "alice");
        let restored = LocalIdentity::from_secrets(&id.secrets());
        assert_eq!(id.uid(), restored.uid());
        assert_eq!(id.public(), restored.public());
    }

    #[test]
    fn dh_agrees_between_static_and_ephemeral() -> std::result::Result<(), RvlinkError> {
        let id = LocalIdentity::generate("Bob", "bob");
        let eph = EphemeralKey::generate();
        let a = id.dh(&eph.public())?;
        let b = eph.dh(&id.public().kx_key)?;
        assert_eq!(*a, *b);
        Ok(())
    }

    #[test]
    fn low_order_point_rejected() {
        let eph = EphemeralKey::generate();
        assert!(eph.dh(&[0u8; 32]).is_err());
    }

    #[test]
    fn valid_identity_accepted() -> std::result::Result<(), RvlinkError> {
        let id = LocalIdentity::generate("Alice", "alice");
        validate_public_identity(&id.public(), 1024)
    }

    #[test]
    fn forged_identity_rejected() {
        let mut public = LocalIdentity::generate("Alice", "alice").public();
        public.identity = UserId::new([9u8; 32]);
        assert!(matches!(
            validate_public_identity(&public, 1024),
            Err(RvlinkError::InvalidIdentity { .. })
        ));
    }

    #[test]
    fn oversized_avatar_rejected() {
        let mut public = LocalIdentity::generate("Alice", "alice").public();
        public.avatar = Some(vec![0u8; 2048]);
        assert!(validate_public_identity(&public, 1024).is_err());
    }

    #[test]
    fn empty_nick_rejected() {
        let public = LocalIdentity::generate("Alice", "  ").public();
        assert!(validate_public_identity(&public, 1024).is_err());
    }
}
