//! Length-prefixed JSON framing.
//!
//! Every message is one frame: a 4-byte big-endian length prefix
//! followed by that many bytes of JSON. The prefix is validated
//! against [`MAX_FRAME_SIZE`] before any allocation happens.

use bytes::BytesMut;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::error::{ProtocolError, ProtocolResult, MAX_FRAME_SIZE};

/// Write one framed message.
///
/// # Errors
///
/// [`ProtocolError::Serialization`] if the message does not encode,
/// [`ProtocolError::FrameTooLarge`] if the encoding exceeds the frame
/// limit, or an I/O error from the transport.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> ProtocolResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(message).map_err(|err| ProtocolError::Serialization {
        reason: err.to_string(),
    })?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::frame_too_large(payload.len()));
    }
    let len =
        u32::try_from(payload.len()).map_err(|_| ProtocolError::frame_too_large(payload.len()))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message.
///
/// # Errors
///
/// [`ProtocolError::ConnectionClosed`] on EOF at a frame boundary,
/// [`ProtocolError::FrameTooLarge`] for an oversized prefix,
/// [`ProtocolError::Serialization`] if the payload does not decode,
/// or an I/O error from the transport.
pub async fn read_frame<R, T>(reader: &mut R) -> ProtocolResult<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut prefix = [0u8; 4];
    if let Err(err) = reader.read_exact(&mut prefix).await {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            return Err(ProtocolError::ConnectionClosed);
        }
        return Err(err.into());
    }
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::frame_too_large(len));
    }

    let mut payload = BytesMut::zeroed(len);
    if let Err(err) = reader.read_exact(&mut payload).await {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            // EOF mid-frame is a truncated frame, not a clean close.
            return Err(ProtocolError::invalid_frame("truncated frame"));
        }
        return Err(err.into());
    }
    serde_json::from_slice(&payload).map_err(|err| ProtocolError::Serialization {
        reason: err.to_string(),
    })
}
