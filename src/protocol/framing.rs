//! Length-prefixed message framing.
//!
//! A frame is a 4-byte big-endian payload length followed by the payload.

use super::Message;
use crate::error::{DfsError, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame unless configured otherwise.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

/// Read one message.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly between frames.
/// An empty or undecodable payload yields [`DfsError::Serialization`]; the
/// frame has been consumed in full, so the stream is still aligned and the
/// caller may keep reading. Any other error leaves the stream unusable.
pub async fn read_message<R>(reader: &mut R, max_frame_size: usize) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_be_bytes(header) as usize;
    if length > max_frame_size {
        return Err(DfsError::FrameTooLarge {
            size: length,
            limit: max_frame_size,
        });
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            DfsError::ConnectionClosed
        } else {
            e.into()
        }
    })?;

    if payload.is_empty() {
        return Err(DfsError::Serialization("empty frame".into()));
    }

    Ok(Some(bincode::deserialize(&payload)?))
}

/// Write one message and flush it.
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = bincode::serialize(msg)?;
    let length = u32::try_from(payload.len()).map_err(|_| DfsError::FrameTooLarge {
        size: payload.len(),
        limit: u32::MAX as usize,
    })?;

    writer.write_all(&length.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}
