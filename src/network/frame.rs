//! # Chunk Frame Codec
//!
//! The only binary messages on the channel are chunk frames; everything else
//! travels as UTF-8 JSON. A frame carries one sequence-numbered slice of one
//! transfer:
//!
//! ```text
//! offset  size  field
//! 0       1     frame type tag = 0x01
//! 1       1     id length (L, 1..=255)
//! 2       L     transfer id bytes (UTF-8)
//! 2+L     4     sequence, big-endian u32
//! 6+L     ...   chunk payload (remainder of the buffer)
//! ```
//!
//! Decoding is deliberately forgiving: anything that is not a well-formed
//! frame yields `None` and the caller drops it without tearing anything
//! down. Only encoding can fail, and only for an oversized transfer id —
//! which `send_file` rejects before a frame is ever built.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Leading tag byte identifying a binary message as a chunk frame.
pub const FRAME_TAG: u8 = 0x01;

/// Fixed header bytes: tag + id length + big-endian sequence.
pub const FRAME_HEADER_LEN: usize = 6;

/// A decoded chunk frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    /// The transfer this slice belongs to.
    pub id: String,
    /// Zero-based slice index within the transfer.
    pub sequence: u32,
    /// The slice bytes.
    pub payload: Bytes,
}

/// Encode a chunk frame.
///
/// Fails with [`Error::FrameTooLarge`] when the transfer id exceeds 255
/// bytes and cannot be described by the one-byte length field.
pub fn encode(id: &str, sequence: u32, payload: &[u8]) -> Result<Bytes> {
    let id_bytes = id.as_bytes();
    if id_bytes.len() > u8::MAX as usize {
        return Err(Error::FrameTooLarge(id_bytes.len()));
    }

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + id_bytes.len() + payload.len());
    buf.put_u8(FRAME_TAG);
    buf.put_u8(id_bytes.len() as u8);
    buf.put_slice(id_bytes);
    buf.put_u32(sequence);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Try to decode a binary message as a chunk frame.
///
/// Returns `None` when the buffer is shorter than the fixed header, the tag
/// is not [`FRAME_TAG`], the declared id length overruns the buffer, or the
/// id is not UTF-8. `None` means "not a chunk frame; drop it".
pub fn decode(data: &[u8]) -> Option<ChunkFrame> {
    if data.len() < FRAME_HEADER_LEN {
        return None;
    }
    if data[0] != FRAME_TAG {
        return None;
    }

    let id_len = data[1] as usize;
    if data.len() < 2 + id_len + 4 {
        return None;
    }

    let id = std::str::from_utf8(&data[2..2 + id_len]).ok()?;
    let seq_offset = 2 + id_len;
    let sequence = u32::from_be_bytes(data[seq_offset..seq_offset + 4].try_into().ok()?);

    Some(ChunkFrame {
        id: id.to_string(),
        sequence,
        payload: Bytes::copy_from_slice(&data[seq_offset + 4..]),
    })
}

// ============================================================================
// TESTS
// ============================================================================
