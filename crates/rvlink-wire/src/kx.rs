//! Peer KX payloads.
//!
//! Payloads are CBOR-encoded [`KxPayload`] values sealed to the
//! recipient's X25519 key before being pushed to a rendezvous. Every
//! payload is signed by its sender over [`KxPayload::signing_bytes`],
//! which is the CBOR encoding with the signature field emptied, prefixed
//! by a per-kind domain tag.

use rvlink_types::{PublicIdentity, Result, RvId, UserId};
use serde::{Deserialize, Serialize};

use crate::codec::{decode_cbor, encode_cbor};

/// Reply of the invitee to an invite, pushed to the invite's initial
/// rendezvous.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct HalfKx {
    pub public: PublicIdentity,
    /// Rendezvous the half-KX answers.
    pub initial_rv: RvId,
    /// Invitee ephemeral X25519 key.
    pub ephemeral: [u8; 32],
    /// Rendezvous where the invitee waits for the full-KX.
    pub step3_rv: RvId,
    /// Rendezvous where the invitee listens for future reset requests.
    pub reset_rv: RvId,
    pub sig: Vec<u8>,
}

/// Final message of an exchange, pushed to the step-3 rendezvous.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FullKx {
    pub from: UserId,
    pub ephemeral: [u8; 32],
    /// Echo of the step-3 rendezvous this answers.
    pub step3_rv: RvId,
    /// Rendezvous where the sender listens for future reset requests.
    pub reset_rv: RvId,
    pub sig: Vec<u8>,
}

/// Request to re-KX an already linked peer, pushed to the peer's reset
/// rendezvous.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ResetRequest {
    pub from: UserId,
    pub ephemeral: [u8; 32],
    pub step3_rv: RvId,
    pub reset_rv: RvId,
    pub sig: Vec<u8>,
}

/// Any peer KX payload.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum KxPayload {
    Half(HalfKx),
    Full(FullKx),
    Reset(ResetRequest),
}

impl KxPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            KxPayload::Half(_) => "halfkx",
            KxPayload::Full(_) => "fullkx",
            KxPayload::Reset(_) => "reset",
        }
    }

    pub fn signature(&self) -> &[u8] {
        match self {
            KxPayload::Half(h) => &h.sig,
            KxPayload::Full(f) => &f.sig,
            KxPayload::Reset(r) => &r.sig,
        }
    }

    /// Bytes covered by the sender's signature.
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        let mut unsigned = self.clone();
        match &mut unsigned {
            KxPayload::Half(h) => h.sig.clear(),
            KxPayload::Full(f) => f.sig.clear(),
            KxPayload::Reset(r) => r.sig.clear(),
        }
        let mut out = format!("rvlink-{}-v1:", self.kind()).into_bytes();
        out.extend_from_slice(&encode_cbor(&unsigned)?);
        Ok(out)
    }

    /// Stores `sig` as the payload signature.
    pub fn set_signature(&mut self, sig: Vec<u8>) {
        match self {
            KxPayload::Half(h) => h.sig = sig,
            KxPayload::Full(f) => f.sig = sig,
            KxPayload::Reset(r) => r.sig = sig,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_cbor(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        decode_cbor(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full() -> KxPayload {
        KxPayload::Full(FullKx {
            from: UserId::new([1; 32]),
            ephemeral: [2; 32],
            step3_rv: RvId::new([3; 32]),
            reset_rv: RvId::new([4; 32]),
            sig: Vec::new(),
        })
    }

    #[test]
    fn signing_bytes_ignore_signature() -> std::result::Result<(), rvlink_types::RvlinkError> {
        let unsigned = full();
        let mut signed = full();
        signed.set_signature(vec![9; 64]);
        assert_eq!(unsigned.signing_bytes()?, signed.signing_bytes()?);
        assert_eq!(signed.signature(), &[9u8; 64][..]);
        Ok(())
    }

    #[test]
    fn signing_bytes_are_domain_separated() -> std::result::Result<(), rvlink_types::RvlinkError> {
        let reset = KxPayload::Reset(ResetRequest {
            from: UserId::new([1; 32]),
            ephemeral: [2; 32],
            step3_rv: RvId::new([3; 32]),
            reset_rv: RvId::new([4; 32]),
            sig: Vec::new(),
        });
        assert!(reset.signing_bytes()?.starts_with(b"rvlink-reset-v1:"));
        assert_ne!(reset.signing_bytes()?, full().signing_bytes()?);
        Ok(())
    }

    #[test]
    fn payload_cbor() -> std::result::Result<(), rvlink_types::RvlinkError> {
        let payload = full();
        assert_eq!(KxPayload::decode(&payload.encode()?)?, payload);
        Ok(())
    }
}
