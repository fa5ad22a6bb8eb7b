//! Unmediated byte relay after the handshake.

use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, copy_bidirectional};

/// Copy bytes both ways between `a` and `b` until both sides close.
///
/// `a_to_b` and `b_to_a` are bytes already read off one side during the
/// handshake; they are written to the other side first. Returns the byte
/// counts `(a -> b, b -> a)`, prefixes included.
pub async fn relay<A, B>(a: &mut A, b: &mut B, a_to_b: &[u8], b_to_a: &[u8]) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    if !a_to_b.is_empty() {
        b.write_all(a_to_b).await?;
    }
    if !b_to_a.is_empty() {
        a.write_all(b_to_a).await?;
    }

    let (up, down) = copy_bidirectional(a, b).await?;
    Ok((up + a_to_b.len() as u64, down + b_to_a.len() as u64))
}

/// Whether an I/O error is the peer going away.
pub fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}
