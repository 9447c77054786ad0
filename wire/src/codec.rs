//! Framing and serialization for the wire protocol.
//!
//! Every frame on the socket is a 4-byte big-endian length prefix followed by
//! the bincode encoding of one [`AuthenticatedMessage`].

use crate::envelope::AuthenticatedMessage;
use crate::error::WireError;
use crate::message::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum encoded message size in bytes.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16 MiB

/// Encode an envelope into a complete frame (length prefix + body).
pub fn encode_frame(envelope: &AuthenticatedMessage) -> Result<Vec<u8>, WireError> {
    let body = bincode::serialize(envelope).map_err(|e| WireError::Malformed(e.to_string()))?;
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(WireError::Oversized {
            size: body.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode a frame body (without the length prefix) into an envelope.
pub fn decode_envelope(body: &[u8]) -> Result<AuthenticatedMessage, WireError> {
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(WireError::Oversized {
            size: body.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    bincode::deserialize(body).map_err(|e| WireError::Malformed(e.to_string()))
}

/// The encoded size of a bare message body, used as the byte-axis
/// flow-control cost.
pub fn encoded_body_size(message: &Message) -> u64 {
    bincode::serialized_size(message).expect("message is always serializable")
}

/// Read one length-prefixed frame body from the stream.
///
/// Rejects frames larger than [`MAX_MESSAGE_SIZE`] without reading the body.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, WireError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let body_len = u32::from_be_bytes(len_buf) as usize;
    if body_len > MAX_MESSAGE_SIZE {
        return Err(WireError::Oversized {
            size: body_len,
            max: MAX_MESSAGE_SIZE,
        });
    }
    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Write one already-encoded frame to the stream and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &[u8],
) -> Result<(), WireError> {
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}
