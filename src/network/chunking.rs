//! # Chunk Geometry
//!
//! Pure integer arithmetic shared by both ends of a transfer: pick a chunk
//! size from a file size, count chunks, compute the byte range of one chunk.
//! Every function here is total, and both peers must compute identical
//! values from the same inputs — the receiver's accounting is derived from
//! `file-init` fields alone, never from the actual frames.
//!
//! The protocol constants live here too, since every limit is a function of
//! the channel's buffer budget.

// ============================================================================
// PROTOCOL CONSTANTS
// ============================================================================

/// Maximum base64 characters per CRDT control message; longer envelopes are
/// split into `yjs-update-chunk` slices.
pub const MAX_MESSAGE_CHUNK_SIZE: usize = 15_000;

/// High-water mark for the channel's send buffer: the core stops queuing
/// into the channel once `buffered_amount` reaches this.
pub const DATA_CHANNEL_MAX_BUFFER: usize = 256_000;

/// Low-water threshold configured on the channel; the channel fires
/// `BufferedAmountLow` once its buffer drains below this.
pub const DATA_CHANNEL_RESUME_THRESHOLD: usize = 128_000;

/// Smallest chunk a transfer will use.
pub const MIN_CHUNK_SIZE: usize = 16_384;

/// Largest chunk a transfer will use. Half the buffer budget, so a single
/// frame can never wedge the channel at the high-water mark.
pub const MAX_CHUNK_SIZE: usize = if DATA_CHANNEL_MAX_BUFFER / 2 > MIN_CHUNK_SIZE {
    DATA_CHANNEL_MAX_BUFFER / 2
} else {
    MIN_CHUNK_SIZE
};

/// Chunk sizing aims for about this many chunks per file.
pub const TARGET_CHUNK_COUNT: u64 = 128;

/// Maximum unacknowledged chunks per outgoing transfer.
pub const MAX_IN_FLIGHT_CHUNKS: usize = 16;

/// How long an outgoing transfer waits without an ACK before re-queuing its
/// whole in-flight window.
pub const RETRY_INTERVAL_MS: i64 = 5_000;

/// Coalescing delay for local CRDT updates before they are merged and sent.
pub const UPDATE_COALESCE_MS: i64 = 80;

// ============================================================================
// GEOMETRY
// ============================================================================

/// Clamp an arbitrary chunk size into the protocol's legal range.
fn clamp_chunk_size(chunk_size: usize) -> usize {
    chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
}

/// Choose a chunk size for a file, aiming for [`TARGET_CHUNK_COUNT`] chunks
/// clamped to `[MIN_CHUNK_SIZE, MAX_CHUNK_SIZE]`.
pub fn calculate_chunk_size(file_size: u64) -> usize {
    if file_size == 0 {
        return MIN_CHUNK_SIZE;
    }
    let ideal = file_size.div_ceil(TARGET_CHUNK_COUNT);
    clamp_chunk_size(ideal as usize)
}

/// Number of chunks a file of `file_size` splits into at `chunk_size`.
///
/// Zero for an empty file; otherwise at least one.
pub fn calculate_total_chunks(file_size: u64, chunk_size: usize) -> u32 {
    if file_size == 0 {
        return 0;
    }
    let cs = clamp_chunk_size(chunk_size) as u64;
    file_size.div_ceil(cs).max(1) as u32
}

/// Byte range `[start, end)` of chunk `index`, clamped to `[0, total_size]`.
///
/// The last chunk may be shorter than `chunk_size`; an index past the end
/// yields an empty range at `total_size`.
pub fn chunk_bounds(index: u32, chunk_size: usize, total_size: u64) -> (u64, u64) {
    let cs = clamp_chunk_size(chunk_size) as u64;
    let start = (index as u64).saturating_mul(cs).min(total_size);
    let end = start.saturating_add(cs).min(total_size);
    (start, end)
}

// ============================================================================
// TESTS
// ============================================================================
