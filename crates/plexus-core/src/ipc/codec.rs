//! Length-prefixed JSON framing.
//!
//! ```text
//! [u32 LE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! Decoding distinguishes invalid UTF-8 from malformed JSON; both are
//! transport errors and terminate the session that produced them.

use super::protocol::Envelope;
use crate::config::IpcConfig;
use crate::{Error, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const LEN_PREFIX: usize = 4;

/// Serialize an envelope into a complete frame (prefix included).
pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(envelope)?;
    if payload.len() > IpcConfig::MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge {
            size: payload.len(),
            max: IpcConfig::MAX_FRAME_SIZE,
        });
    }

    let mut frame = Vec::with_capacity(LEN_PREFIX + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Parse a frame payload (prefix already stripped) into an envelope.
pub fn decode_payload(payload: Vec<u8>) -> Result<Envelope> {
    let text = String::from_utf8(payload)?;
    Ok(serde_json::from_str(&text)?)
}

/// Read one frame payload from an async reader.
///
/// Returns `None` on clean EOF at a frame boundary (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; LEN_PREFIX];
    // Only EOF before the first prefix byte is a clean close.
    if reader.read(&mut len_buf[..1]).await? == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut len_buf[1..]).await?;

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > IpcConfig::MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge {
            size: len,
            max: IpcConfig::MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Read and decode one envelope. `None` on clean EOF.
pub async fn read_envelope<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Envelope>> {
    match read_frame(reader).await? {
        Some(payload) => decode_payload(payload).map(Some),
        None => Ok(None),
    }
}

/// Write one envelope as a single frame.
///
/// The prefix and payload go out in one `write_all`, which retries partial
/// writes until the whole frame is on the wire.
pub async fn write_envelope<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
) -> Result<()> {
    let frame = encode_frame(envelope)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
