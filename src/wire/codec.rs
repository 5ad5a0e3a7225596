//! Frame codec for the wire protocol.
//!
//! Frame format:
//! ```text
//! ┌──────────┬────────────────────────┐
//! │ len (4B) │        payload         │
//! │ u32 BE   │                        │
//! └──────────┴────────────────────────┘
//! ```
//! Length counts the payload only, NOT the 4-byte prefix. Payload semantics
//! (login, invocation, response) are owned by [`crate::wire::protocol`]; the
//! codec moves whole messages and nothing else.

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Maximum accepted frame payload, requests and responses alike.
pub const MAX_FRAME_BYTES: u32 = 50 * 1024 * 1024;

/// Read one frame from the stream.
///
/// Returns the payload bytes, or `None` on clean EOF at a frame boundary.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
) -> std::io::Result<Option<Bytes>> {
    // Read 4-byte length prefix
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let frame_len = u32::from_be_bytes(len_buf);
    if frame_len > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Frame too large: {} bytes", frame_len),
        ));
    }

    let mut frame_data = vec![0u8; frame_len as usize];
    reader.read_exact(&mut frame_data).await?;

    Ok(Some(Bytes::from(frame_data)))
}

/// Write one frame to the stream.
///
/// The write is atomic with respect to other writers only when the caller
/// serializes access to `writer`; node connections hold the writer lock.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> std::io::Result<()> {
    if payload.len() as u64 > MAX_FRAME_BYTES as u64 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Frame too large: {} bytes", payload.len()),
        ));
    }
    let frame_len = payload.len() as u32;
    writer.write_all(&frame_len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").await.unwrap();

        let mut reader = std::io::Cursor::new(buf);
        let payload = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(&payload[..], b"hello");
    }

    #[tokio::test]
    async fn test_clean_eof_returns_none() {
        let mut reader = std::io::Cursor::new(Vec::<u8>::new());
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_error() {
        // Prefix promises 10 bytes but only 3 follow.
        let mut data = 10u32.to_be_bytes().to_vec();
        data.extend_from_slice(b"abc");
        let mut reader = std::io::Cursor::new(data);
        assert!(read_frame(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn test_oversize_frame_rejected() {
        let data = (MAX_FRAME_BYTES + 1).to_be_bytes().to_vec();
        let mut reader = std::io::Cursor::new(data);
        let err = read_frame(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_read_assembles_across_split_reads() {
        let mut framed = Vec::new();
        write_frame(&mut framed, b"split me").await.unwrap();

        // The stream yields the prefix and payload in fragments.
        let mut reader = tokio_test::io::Builder::new()
            .read(&framed[..2])
            .read(&framed[2..6])
            .read(&framed[6..])
            .build();
        let payload = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(&payload[..], b"split me");
    }

    #[tokio::test]
    async fn test_empty_payload_round_trip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"").await.unwrap();
        let mut reader = std::io::Cursor::new(buf);
        let payload = read_frame(&mut reader).await.unwrap().unwrap();
        assert!(payload.is_empty());
    }
}
