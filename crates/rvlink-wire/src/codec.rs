//! Length-prefixed CBOR framing.
//!
//! Every frame on the relay stream is `len (u32 BE) || payload`. Payloads
//! are CBOR documents produced by [`encode_cbor`]. Frames above the
//! negotiated maximum are rejected before any allocation.

use rvlink_types::{Result, RvlinkError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for any single frame before the welcome negotiated a
/// smaller limit.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Encodes a value as CBOR.
pub fn encode_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| RvlinkError::Protocol {
        reason: format!("CBOR encoding failed: {e}"),
    })?;
    Ok(buf)
}

/// Decodes a CBOR value.
pub fn decode_cbor<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    ciborium::de::from_reader(data).map_err(|e| RvlinkError::Protocol {
        reason: format!("CBOR decoding failed: {e}"),
    })
}

/// Writes one frame and flushes the writer.
///
/// # Errors
///
/// - [`RvlinkError::Protocol`] if `payload` exceeds `max_size`.
/// - [`RvlinkError::Network`] if the underlying write fails.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8], max_size: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > max_size {
        return Err(RvlinkError::Protocol {
            reason: format!("frame of {} bytes exceeds limit {max_size}", payload.len()),
        });
    }
    let len = u32::try_from(payload.len()).map_err(|_| RvlinkError::Protocol {
        reason: "frame length does not fit in u32".into(),
    })?;

    let write = async {
        writer.write_all(&len.to_be_bytes()).await?;
        writer.write_all(payload).await?;
        writer.flush().await
    };
    write.await.map_err(|e| RvlinkError::Network {
        reason: format!("frame write failed: {e}"),
    })
}

/// Reads one frame.
///
/// # Errors
///
/// - [`RvlinkError::Network`] on EOF or read failure.
/// - [`RvlinkError::Protocol`] if the announced length exceeds `max_size`.
pub async fn read_frame<R>(reader: &mut R, max_size: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .await
        .map_err(|e| RvlinkError::Network {
            reason: format!("frame header read failed: {e}"),
        })?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > max_size {
        return Err(RvlinkError::Protocol {
            reason: format!("incoming frame of {len} bytes exceeds limit {max_size}"),
        });
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| RvlinkError::Network {
            reason: format!("frame body read failed: {e}"),
        })?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_survive_a_duplex_pipe() -> std::result::Result<(), RvlinkError> {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"first", 64).await?;
        write_frame(&mut a, b"", 64).await?;
        assert_eq!(read_frame(&mut b, 64).await?, b"first");
        assert!(read_frame(&mut b, 64).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn oversized_outgoing_frame_rejected() {
        let (mut a, _b) = tokio::io::duplex(1024);
        let err = write_frame(&mut a, &[0u8; 65], 64).await;
        assert!(matches!(err, Err(RvlinkError::Protocol { .. })));
    }

    #[tokio::test]
    async fn oversized_incoming_frame_rejected() -> std::result::Result<(), RvlinkError> {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &[0u8; 100], 1024).await?;
        let err = read_frame(&mut b, 64).await;
        assert!(matches!(err, Err(RvlinkError::Protocol { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn closed_stream_is_network_error() {
        let (a, mut b) = tokio::io::duplex(1024);
        drop(a);
        let err = read_frame(&mut b, 64).await;
        assert!(matches!(err, Err(RvlinkError::Network { .. })));
    }

    #[test]
    fn cbor_decode_garbage_fails() {
        let result: Result<String> = decode_cbor(&[0xff, 0x00]);
        assert!(result.is_err());
    }
}
