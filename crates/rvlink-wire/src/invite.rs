//! Out-of-band identity invites and prepaid invite keys.
//!
//! An invite is a CBOR document handed to a third party outside the
//! relay (file, QR code, chat). A [`PaidInviteKey`] is a separate bech32
//! token that locates and decrypts an invite previously pushed to the
//! relay.

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use bech32::{FromBase32, ToBase32, Variant};
use rvlink_types::{PublicIdentity, Result, RvId, RvlinkError};
use serde::{Deserialize, Serialize};

/// Human-readable prefix of [`PaidInviteKey`] tokens.
pub const PAID_INVITE_KEY_HRP: &str = "rvpik";

// ---------------------------------------------------------------------------
// OobPublicIdentityInvite
// ---------------------------------------------------------------------------

/// Funds escrowed alongside an invite. Carried opaquely by this layer.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct InviteFunds {
    /// Amount in atoms.
    pub amount: u64,
    /// Data the invitee needs to redeem the funds.
    pub redeem_data: Vec<u8>,
}

/// Identity invite handed out of band.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct OobPublicIdentityInvite {
    /// Identity of the inviter.
    pub public: PublicIdentity,
    /// Rendezvous where the inviter waits for the half-KX reply.
    pub initial_rendezvous: RvId,
    /// Optional funds for the invitee.
    pub funds: Option<InviteFunds>,
}

/// Encodes `invite` into `sink`.
pub fn write_invite<W: Write>(sink: W, invite: &OobPublicIdentityInvite) -> Result<()> {
    ciborium::into_writer(invite, sink).map_err(|e| RvlinkError::Protocol {
        reason: format!("failed to encode invite: {e}"),
    })
}

/// Decodes an invite from `source` without acting on it.
pub fn read_invite<R: Read>(source: R) -> Result<OobPublicIdentityInvite> {
    ciborium::de::from_reader(source).map_err(|e| RvlinkError::Protocol {
        reason: format!("failed to decode invite: {e}"),
    })
}

// ---------------------------------------------------------------------------
// PaidInviteKey
// ---------------------------------------------------------------------------

/// Symmetric key for a prepaid invite stored on the relay.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct PaidInviteKey([u8; 32]);

impl PaidInviteKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Encodes the key as a shareable bech32 string.
    pub fn encode(&self) -> Result<String> {
        bech32::encode(PAID_INVITE_KEY_HRP, self.0.to_base32(), Variant::Bech32).map_err(|e| {
            RvlinkError::Protocol {
                reason: format!("bech32 encoding failed: {e}"),
            }
        })
    }

    /// Decodes a token produced by [`PaidInviteKey::encode`].
    pub fn decode(token: &str) -> Result<Self> {
        let (hrp, data, _variant) =
            bech32::decode(token.trim()).map_err(|e| RvlinkError::Protocol {
                reason: format!("bech32 decoding failed: {e}"),
            })?;
        if hrp != PAID_INVITE_KEY_HRP {
            return Err(RvlinkError::Protocol {
                reason: format!("unexpected paid invite key prefix {hrp:?}"),
            });
        }
        let bytes = Vec::<u8>::from_base32(&data).map_err(|e| RvlinkError::Protocol {
            reason: format!("bech32 data conversion failed: {e}"),
        })?;
        if bytes.len() != 32 {
            return Err(RvlinkError::Protocol {
                reason: format!("paid invite key must be 32 bytes, got {}", bytes.len()),
            });
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        Ok(Self(key))
    }
}

impl fmt::Debug for PaidInviteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PaidInviteKey(..)")
    }
}

impl FromStr for PaidInviteKey {
    type Err = RvlinkError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::decode(s)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rvlink_types::UserId;

    fn sample_invite() -> OobPublicIdentityInvite {
        OobPublicIdentityInvite {
            public: PublicIdentity {
                name: "Alice".into(),
                nick: "alice".into(),
                sig_key: [1; 32],
                kx_key: [2; 32],
                identity: UserId::new([3; 32]),
                avatar: None,
            },
            initial_rendezvous: RvId::new([4; 32]),
            funds: Some(InviteFunds {
                amount: 1000,
                redeem_data: vec![5, 6, 7],
            }),
        }
    }

    #[test]
    fn invite_through_byte_sink() -> std::result::Result<(), RvlinkError> {
        let invite = sample_invite();
        let mut buf = Vec::new();
        write_invite(&mut buf, &invite)?;
        let decoded = read_invite(buf.as_slice())?;
        assert_eq!(decoded, invite);
        Ok(())
    }

    #[test]
    fn truncated_invite_rejected() -> std::result::Result<(), RvlinkError> {
        let mut buf = Vec::new();
        write_invite(&mut buf, &sample_invite())?;
        buf.truncate(buf.len() / 2);
        assert!(read_invite(buf.as_slice()).is_err());
        Ok(())
    }

    #[test]
    fn paid_invite_key_token() -> std::result::Result<(), RvlinkError> {
        let key = PaidInviteKey::new([0x42; 32]);
        let token = key.encode()?;
        assert!(token.starts_with("rvpik1"));
        let parsed: PaidInviteKey = token.parse()?;
        assert_eq!(parsed, key);
        Ok(())
    }

    #[test]
    fn paid_invite_key_wrong_prefix_rejected() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let token = bech32::encode("other", [0u8; 32].to_base32(), Variant::Bech32)?;
        assert!(PaidInviteKey::decode(&token).is_err());
        Ok(())
    }

    #[test]
    fn paid_invite_key_debug_is_redacted() {
        let key = PaidInviteKey::new([0x42; 32]);
        assert_eq!(format!("{key:?}"), "PaidInviteKey(..)");
    }
}
