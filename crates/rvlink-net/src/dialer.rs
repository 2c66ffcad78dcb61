//! Transport seams: dialing the relay and confirming its certificate.
//!
//! The keeper never opens sockets itself. A [`Dialer`] produces an
//! established (usually TLS) byte stream together with the TLS state,
//! and a [`CertConfirmer`] decides whether the presented certificate and
//! relay identity are acceptable. Both are trait objects so hosts can
//! plug in their own TLS stack and tests can use in-memory streams.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use rvlink_crypto::hash::sha3_256;
use rvlink_types::{PublicIdentity, Result, RvlinkError};

/// A bidirectional byte stream to the relay.
pub trait RelayStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> RelayStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxStream = Box<dyn RelayStream>;

/// TLS facts about a dialed connection.
#[derive(Clone, Debug, Default)]
pub struct TlsState {
    /// DER certificates presented by the relay, leaf first.
    pub peer_certificates: Vec<Vec<u8>>,
}

impl TlsState {
    /// The relay's leaf certificate.
    ///
    /// # Errors
    ///
    /// [`RvlinkError::Network`] when the relay presented no certificate.
    pub fn leaf(&self) -> Result<&[u8]> {
        self.peer_certificates
            .first()
            .map(Vec::as_slice)
            .ok_or_else(|| RvlinkError::Network {
                reason: "no peer TLS certificate".into(),
            })
    }

    /// Hex SHA3-256 of the leaf certificate.
    pub fn fingerprint(&self) -> Result<String> {
        Ok(hex::encode(sha3_256(self.leaf()?)))
    }
}

/// Opens a stream to the relay.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, cancel: &CancellationToken) -> Result<(BoxStream, TlsState)>;
}

/// Decides whether a relay certificate and identity are trusted.
#[async_trait]
pub trait CertConfirmer: Send + Sync {
    async fn confirm(
        &self,
        cancel: &CancellationToken,
        tls: &TlsState,
        server: &PublicIdentity,
    ) -> Result<()>;
}

/// Accepts only certificates whose fingerprint is in a fixed list.
#[derive(Clone, Debug, Default)]
pub struct FingerprintConfirmer {
    allowed: Vec<String>,
}

impl FingerprintConfirmer {
    pub fn new(allowed: impl IntoIterator<Item = String>) -> Self {
        Self {
            allowed: allowed.into_iter().map(|f| f.to_lowercase()).collect(),
        }
    }
}

#[async_trait]
impl CertConfirmer for FingerprintConfirmer {
    async fn confirm(
        &self,
        _cancel: &CancellationToken,
        tls: &TlsState,
        _server: &PublicIdentity,
    ) -> Result<()> {
        let fingerprint = tls.fingerprint()?;
        if self.allowed.iter().any(|f| *f == fingerprint) {
            Ok(())
        } else {
            Err(RvlinkError::Network {
                reason: format!("untrusted server certificate {fingerprint}"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvlink_types::UserId;

    fn server() -> PublicIdentity {
        PublicIdentity {
            name: "relay".into(),
            nick: "relay".into(),
            sig_key: [0; 32],
            kx_key: [0; 32],
            identity: UserId::new([0; 32]),
            avatar: None,
        }
    }

    #[test]
    fn missing_cert_is_an_error() {
        let tls = TlsState::default();
        assert!(tls.leaf().is_err());
        assert!(tls.fingerprint().is_err());
    }

    #[tokio::test]
    async fn fingerprint_confirmer() -> std::result::Result<(), RvlinkError> {
        let tls = TlsState {
            peer_certificates: vec![b"cert".to_vec()],
        };
        let cancel = CancellationToken::new();
        let ok = FingerprintConfirmer::new([tls.fingerprint()?.to_uppercase()]);
        ok.confirm(&cancel, &tls, &server()).await?;

        let other = FingerprintConfirmer::new(["00".to_string()]);
        assert!(other.confirm(&cancel, &tls, &server()).await.is_err());
        Ok(())
    }
}
