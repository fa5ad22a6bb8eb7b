//! Handshake message framing.
//!
//! Each handshake message is one length-prefixed token:
//! ```text
//! [4 bytes: token length (big-endian u32)]
//! [N bytes: token]
//! ```
//!
//! Reads accumulate into the connection's buffer, so a token split across
//! several TCP segments is reassembled. Bytes past the end of a frame stay
//! in the buffer; after the final message they are the first application
//! bytes and must be forwarded before relaying.

use super::error::{HandshakeError, HandshakeResult};
use super::state::HandshakeState;
use bytes::{Buf, Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Size of the length prefix.
pub const LEN_PREFIX: usize = 4;

/// Read one frame, waiting at most `deadline` for it to complete.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    buffer: &mut BytesMut,
    max_size: usize,
    deadline: Duration,
    state: HandshakeState,
) -> HandshakeResult<Bytes> {
    match timeout(deadline, fill_frame(reader, buffer, max_size, state)).await {
        Ok(result) => result,
        Err(_) => Err(HandshakeError::Timeout(state)),
    }
}

async fn fill_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    buffer: &mut BytesMut,
    max_size: usize,
    state: HandshakeState,
) -> HandshakeResult<Bytes> {
    loop {
        if let Some(frame) = split_frame(buffer, max_size)? {
            return Ok(frame);
        }
        if reader.read_buf(buffer).await? == 0 {
            return Err(HandshakeError::ConnectionClosed(state));
        }
    }
}

/// Take a complete frame off the front of `buffer`, if one is there.
fn split_frame(buffer: &mut BytesMut, max_size: usize) -> HandshakeResult<Option<Bytes>> {
    if buffer.len() < LEN_PREFIX {
        return Ok(None);
    }

    let mut len_buf = [0u8; LEN_PREFIX];
    len_buf.copy_from_slice(&buffer[..LEN_PREFIX]);
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max_size {
        return Err(HandshakeError::FrameTooLarge {
            size: len,
            max: max_size,
        });
    }
    if buffer.len() < LEN_PREFIX + len {
        buffer.reserve(LEN_PREFIX + len - buffer.len());
        return Ok(None);
    }

    buffer.advance(LEN_PREFIX);
    Ok(Some(buffer.split_to(len).freeze()))
}

/// Write one frame, waiting at most `deadline` for the write to drain.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
    deadline: Duration,
    state: HandshakeState,
) -> HandshakeResult<()> {
    let len = u32::try_from(payload.len()).map_err(|_| HandshakeError::FrameTooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;

    let write = async {
        writer.write_all(&len.to_be_bytes()).await?;
        writer.write_all(payload).await?;
        writer.flush().await?;
        Ok::<_, std::io::Error>(())
    };

    match timeout(deadline, write).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(HandshakeError::Timeout(state)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATE: HandshakeState = HandshakeState::ServerReceivePeerToken;
    const DEADLINE: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_frame_exchange() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, b"hello", DEADLINE, STATE).await.unwrap();

        let mut buffer = BytesMut::new();
        let frame = read_frame(&mut b, &mut buffer, 1024, DEADLINE, STATE)
            .await
            .unwrap();
        assert_eq!(&frame[..], b"hello");
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_partial_reads_reassemble() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            for chunk in [&[0u8, 0][..], &[0, 3, b'a'][..], &[b'b', b'c'][..]] {
                a.write_all(chunk).await.unwrap();
                a.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            a
        });

        let mut buffer = BytesMut::new();
        let frame = read_frame(&mut b, &mut buffer, 1024, DEADLINE, STATE)
            .await
            .unwrap();
        assert_eq!(&frame[..], b"abc");
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_trailing_bytes_stay_buffered() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0, 0, 0, 2, b'o', b'k', b'G', b'E', b'T'])
            .await
            .unwrap();

        let mut buffer = BytesMut::new();
        let frame = read_frame(&mut b, &mut buffer, 1024, DEADLINE, STATE)
            .await
            .unwrap();
        assert_eq!(&frame[..], b"ok");
        assert_eq!(&buffer[..], b"GET");
    }

    #[tokio::test]
    async fn test_oversized_frame() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&1000u32.to_be_bytes()).await.unwrap();

        let mut buffer = BytesMut::new();
        let err = read_frame(&mut b, &mut buffer, 16, DEADLINE, STATE)
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::FrameTooLarge { size: 1000, max: 16 }));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_closed() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0, 0, 0, 10, 1, 2]).await.unwrap();
        drop(a);

        let mut buffer = BytesMut::new();
        let err = read_frame(&mut b, &mut buffer, 1024, DEADLINE, STATE)
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::ConnectionClosed(_)));
    }

    #[tokio::test]
    async fn test_read_deadline() {
        let (_a, mut b) = tokio::io::duplex(64);
        let mut buffer = BytesMut::new();
        let err = read_frame(&mut b, &mut buffer, 1024, Duration::from_millis(20), STATE)
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Timeout(HandshakeState::ServerReceivePeerToken)));
    }
}
