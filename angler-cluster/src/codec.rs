//! Length prefixed bincode frames
//!
//! Every frame is a 4 byte big endian length followed by that many bytes of
//! bincode. Readers reject frames above their direction's limit before
//! allocating.

use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{ClusterError, Result};

/// Largest request the controller accepts (1 MiB)
pub const MAX_REQUEST_SIZE: u32 = 1 << 20;

/// Largest response a broker accepts (10 MiB)
pub const MAX_RESPONSE_SIZE: u32 = 10 << 20;

/// Read one frame and decode it.
///
/// # Errors
///
/// Returns [`ClusterError::ConnectionClosed`] if the peer closed the stream
/// between frames, [`ClusterError::FrameTooLarge`] if the frame exceeds `max`,
/// and an I/O or decode error otherwise.
pub async fn read_frame<T, R>(reader: &mut R, max: u32) -> Result<T>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ClusterError::ConnectionClosed
        } else {
            ClusterError::Io(e)
        }
    })?;

    let len = u32::from_be_bytes(len_buf);
    if len > max {
        return Err(ClusterError::FrameTooLarge { len, max });
    }

    let mut bytes = vec![0u8; len as usize];
    reader.read_exact(&mut bytes).await?;

    let (value, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::legacy())?;
    Ok(value)
}

/// Encode `value` and write it as one frame.
///
/// # Errors
///
/// Returns an error if encoding or writing fails, or if the encoded value
/// does not fit in `max`.
pub async fn write_frame<T, W>(writer: &mut W, value: &T, max: u32) -> Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let bytes = bincode::serde::encode_to_vec(value, bincode::config::legacy())?;
    let len = u32::try_from(bytes.len()).unwrap_or(u32::MAX);
    if len > max {
        return Err(ClusterError::FrameTooLarge { len, max });
    }

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;

    Ok(())
}
