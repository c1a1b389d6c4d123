//! Framing: 4-byte little-endian length prefix followed by a bincode payload.

use crate::protocol::Message;

const HEADER_LEN: usize = 4;

/// Upper bound on a single frame's payload. Chunked transfers keep real
/// frames far below this; anything larger is rejected on both directions.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("frame exceeds the size limit")]
    TooLarge,
    #[error("frame is truncated; more bytes needed")]
    Truncated,
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// Encode one message into a complete frame.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, WireError> {
    let body = bincode::serialize(msg)?;
    if body.len() > MAX_FRAME_LEN as usize {
        return Err(WireError::TooLarge);
    }
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode one frame from the front of `bytes`, returning the message and the
/// number of bytes consumed. `Truncated` means the caller should retry once
/// more bytes have arrived; it is not a protocol violation.
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), WireError> {
    let header: [u8; HEADER_LEN] = match bytes.get(..HEADER_LEN).and_then(|h| h.try_into().ok()) {
        Some(h) => h,
        None => return Err(WireError::Truncated),
    };
    let len = u32::from_le_bytes(header);
    if len > MAX_FRAME_LEN {
        return Err(WireError::TooLarge);
    }
    let end = HEADER_LEN + len as usize;
    let body = bytes.get(HEADER_LEN..end).ok_or(WireError::Truncated)?;
    let msg: Message = bincode::deserialize(body)?;
    Ok((msg, end))
}
