//! # File Transfer Engine
//!
//! Per-transfer state machines for both directions of a transfer, sharing
//! one channel with the document sync traffic.
//!
//! ## Transfer Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     FILE TRANSFER PROTOCOL                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Sender                            Receiver                            │
//! │  ──────                            ────────                            │
//! │                                                                         │
//! │  1. file-init ────────────────────►                                    │
//! │     (name, size, geometry)         2. Register incoming state          │
//! │                                                                         │
//! │  3. chunk frames (binary) ────────►                                    │
//! │     window of ≤ 16 in flight       4. Store by sequence, reorder       │
//! │                                                                         │
//! │                          ◄──────── 5. file-ack (selective)             │
//! │                                       + file-resend on observed gaps   │
//! │                                                                         │
//! │  6. Re-send NACKed sequences;      7. On last chunk: assemble,         │
//! │     retry whole window after          deliver bytes, file-complete     │
//! │     5 s of ACK silence                                                 │
//! │                                                                         │
//! │  8. file-complete ◄────────────── (or file-error either way)           │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine is a sans-IO state machine: every method takes `now_ms` and
//! returns the control messages to send and the read jobs to run. The
//! channel controller owns the actual sending and source reads, which keeps
//! this entire module testable without a channel or a clock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use uuid::Uuid;

use crate::network::chunking::{
    calculate_chunk_size, calculate_total_chunks, chunk_bounds, MAX_CHUNK_SIZE,
    MAX_IN_FLIGHT_CHUNKS, MIN_CHUNK_SIZE, RETRY_INTERVAL_MS,
};
use crate::network::events::{TransferDirection, TransferSnapshot, TransferStatus};
use crate::network::protocol::ControlMessage;
use crate::source::{FileMetadata, FileSource};

// ============================================================================
// SPEED TRACKER (rolling average over last N samples)
// ============================================================================

/// Tracks transfer speed using a rolling window of recent byte/time samples.
#[derive(Debug, Clone)]
pub struct SpeedTracker {
    /// Recent samples: (bytes, elapsed_ms).
    samples: Vec<(usize, u64)>,
    /// Maximum number of samples to keep.
    max_samples: usize,
}

impl SpeedTracker {
    /// Create a new speed tracker with a rolling window.
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: Vec::with_capacity(max_samples),
            max_samples,
        }
    }

    /// Record a sample.
    pub fn record(&mut self, bytes: usize, elapsed_ms: u64) {
        if self.samples.len() >= self.max_samples {
            self.samples.remove(0);
        }
        self.samples.push((bytes, elapsed_ms));
    }

    /// Current speed in bytes per second.
    pub fn speed_bps(&self) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        let total_bytes: u64 = self.samples.iter().map(|(b, _)| *b as u64).sum();
        let total_ms: u64 = self.samples.iter().map(|(_, ms)| *ms).sum();
        if total_ms == 0 {
            return 0;
        }
        (total_bytes * 1000) / total_ms
    }
}

impl Default for SpeedTracker {
    fn default() -> Self {
        Self::new(10)
    }
}

// ============================================================================
// OPTIONS / JOBS / OUTCOMES
// ============================================================================

/// Options for `send_file`.
#[derive(Debug, Clone, Default)]
pub struct SendFileOptions {
    /// Display name announced to the peer.
    pub name: String,
    /// MIME type, when known.
    pub mime: Option<String>,
    /// Logical asset path, set when answering a `file-request`.
    pub asset_path: Option<String>,
    /// Chunk size override. Clamped to the protocol range; `None` derives
    /// one from the file size. Embedders on transports with per-message
    /// limits below [`MAX_CHUNK_SIZE`] shrink it here.
    pub chunk_size: Option<usize>,
}

/// A slice the controller must read from the source and frame.
///
/// The job owns an `Arc` to the source so nothing borrows the engine across
/// the read suspension point.
#[derive(Clone)]
pub struct ChunkJob {
    /// Transfer id.
    pub id: String,
    /// Sequence to frame.
    pub sequence: u32,
    /// Start of the byte range.
    pub start: u64,
    /// End of the byte range (exclusive).
    pub end: u64,
    /// The source to read from.
    pub source: Arc<dyn FileSource>,
}

impl std::fmt::Debug for ChunkJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkJob")
            .field("id", &self.id)
            .field("sequence", &self.sequence)
            .field("start", &self.start)
            .field("end", &self.end)
            .finish()
    }
}

/// Result of processing a `file-ack`.
#[derive(Debug)]
pub struct AckOutcome {
    /// Updated view of the transfer.
    pub snapshot: TransferSnapshot,
    /// Sequences the peer flagged as missing in the same message.
    pub resend: Vec<u32>,
}

/// Result of a `file-init`.
#[derive(Debug)]
pub enum InitOutcome {
    /// An entry for this id already exists; the message is ignored.
    AlreadyKnown,
    /// A new incoming transfer was registered.
    Registered {
        /// Initial (Pending) view of the transfer.
        snapshot: TransferSnapshot,
    },
    /// The announced file was empty: finalized on the spot.
    Finalized {
        /// Terminal (Completed) view of the transfer.
        snapshot: TransferSnapshot,
        /// File metadata for delivery.
        metadata: FileMetadata,
        /// The (empty) file contents.
        data: Vec<u8>,
        /// `file-complete` to send back.
        complete: ControlMessage,
    },
}

/// Result of storing an inbound chunk frame.
#[derive(Debug)]
pub enum ChunkReceipt {
    /// No matching transfer (or a failed one); drop the frame.
    Unknown,
    /// The chunk was already present. Re-ACK it so the sender clears its
    /// in-flight entry; re-announce completion if we already finished.
    Duplicate {
        /// ACK covering just this sequence.
        ack: ControlMessage,
        /// `file-complete`, when the transfer already finalized.
        complete: Option<ControlMessage>,
    },
    /// The chunk was stored.
    Stored {
        /// Selective ACK for this sequence, with observed gaps.
        ack: ControlMessage,
        /// Standalone resend request, when gaps were observed.
        resend: Option<ControlMessage>,
        /// Updated view of the transfer.
        snapshot: TransferSnapshot,
        /// Set when this chunk completed the file: metadata, assembled
        /// bytes, and the `file-complete` to send.
        finalized: Option<(FileMetadata, Vec<u8>, ControlMessage)>,
    },
}

// ============================================================================
// OUTGOING TRANSFER
// ============================================================================

/// Sender-side state for one transfer.
pub struct OutgoingTransfer {
    /// Transfer id.
    pub id: String,
    source: Arc<dyn FileSource>,
    size: u64,
    chunk_size: usize,
    total_chunks: u32,
    status: TransferStatus,
    /// Next never-sent sequence.
    next_sequence: u32,
    /// Sent but not yet acknowledged.
    in_flight: HashSet<u32>,
    /// Currently being read from the source; guards duplicate re-reads.
    pending_reads: HashSet<u32>,
    /// Acknowledged sequences. Disjoint from `in_flight`.
    acked: HashSet<u32>,
    bytes_acked: u64,
    last_ack_time: i64,
    cancelled: bool,
    speed: SpeedTracker,
    started_at: i64,
    updated_at: i64,
    completed_at: Option<i64>,
    error: Option<String>,
}

impl std::fmt::Debug for OutgoingTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingTransfer")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("next_sequence", &self.next_sequence)
            .field("in_flight", &self.in_flight.len())
            .field("bytes_acked", &self.bytes_acked)
            .finish()
    }
}

impl OutgoingTransfer {
    fn new(
        source: Arc<dyn FileSource>,
        options: SendFileOptions,
        now_ms: i64,
    ) -> (Self, ControlMessage) {
        let size = source.size();
        let chunk_size = options
            .chunk_size
            .map(|cs| cs.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE))
            .unwrap_or_else(|| calculate_chunk_size(size));
        let total_chunks = calculate_total_chunks(size, chunk_size);
        let id = Uuid::new_v4().to_string();

        let init = ControlMessage::FileInit {
            id: id.clone(),
            name: options.name,
            size,
            mime: options.mime,
            chunk_size: chunk_size as u32,
            total_chunks,
            asset_path: options.asset_path,
        };

        let transfer = Self {
            id,
            source,
            size,
            chunk_size,
            total_chunks,
            status: TransferStatus::Pending,
            next_sequence: 0,
            in_flight: HashSet::new(),
            pending_reads: HashSet::new(),
            acked: HashSet::new(),
            bytes_acked: 0,
            last_ack_time: now_ms,
            cancelled: false,
            speed: SpeedTracker::default(),
            started_at: now_ms,
            updated_at: now_ms,
            completed_at: None,
            error: None,
        };

        (transfer, init)
    }

    fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            id: self.id.clone(),
            direction: TransferDirection::Outgoing,
            status: self.status,
            bytes_transferred: self.bytes_acked,
            total_bytes: self.size,
            progress: progress_of(self.bytes_acked, self.size, self.status),
            speed_bps: self.speed.speed_bps(),
            started_at: self.started_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
            error: self.error.clone(),
        }
    }
}

// ============================================================================
// INCOMING TRANSFER
// ============================================================================

/// Receiver-side state for one transfer.
#[derive(Debug)]
pub struct IncomingTransfer {
    /// Transfer id.
    pub id: String,
    name: String,
    mime: Option<String>,
    size: u64,
    chunk_size: usize,
    total_chunks: u32,
    received_bytes: u64,
    /// Running chunk count; survives the finalize-time buffer release so
    /// late duplicate ACKs still report true totals.
    received_chunks: u32,
    /// Smallest sequence not yet received.
    expected_sequence: u32,
    /// Highest sequence seen; gaps below it drive resend requests.
    highest_seen: Option<u32>,
    /// Gaps already reported to the sender. A gap is NACKed once; frames
    /// lost twice are covered by the sender's retry timer.
    nacked: HashSet<u32>,
    /// Received chunks keyed by sequence. Cleared on finalize.
    chunks: HashMap<u32, Vec<u8>>,
    status: TransferStatus,
    speed: SpeedTracker,
    started_at: i64,
    updated_at: i64,
    completed_at: Option<i64>,
    error: Option<String>,
}

impl IncomingTransfer {
    #[allow(clippy::too_many_arguments)]
    fn new(
        id: String,
        name: String,
        mime: Option<String>,
        size: u64,
        chunk_size: usize,
        total_chunks: u32,
        now_ms: i64,
    ) -> Self {
        Self {
            id,
            name,
            mime,
            size,
            chunk_size,
            total_chunks,
            received_bytes: 0,
            received_chunks: 0,
            expected_sequence: 0,
            highest_seen: None,
            nacked: HashSet::new(),
            chunks: HashMap::new(),
            status: TransferStatus::Pending,
            speed: SpeedTracker::default(),
            started_at: now_ms,
            updated_at: now_ms,
            completed_at: None,
            error: None,
        }
    }

    fn metadata(&self) -> FileMetadata {
        FileMetadata {
            id: self.id.clone(),
            name: self.name.clone(),
            mime: self.mime.clone(),
            size: self.size,
        }
    }

    fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            id: self.id.clone(),
            direction: TransferDirection::Incoming,
            status: self.status,
            bytes_transferred: self.received_bytes,
            total_bytes: self.size,
            progress: progress_of(self.received_bytes, self.size, self.status),
            speed_bps: self.speed.speed_bps(),
            started_at: self.started_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
            error: self.error.clone(),
        }
    }

    /// ACK for one sequence with the current running totals.
    fn ack_for(&self, sequence: u32, missing: Option<Vec<u32>>) -> ControlMessage {
        ControlMessage::FileAck {
            id: self.id.clone(),
            acked: vec![sequence],
            received_bytes: self.received_bytes,
            received_chunks: self.received_chunks,
            missing,
        }
    }
}

fn progress_of(bytes: u64, total: u64, status: TransferStatus) -> f64 {
    if total == 0 {
        if status == TransferStatus::Completed {
            1.0
        } else {
            0.0
        }
    } else {
        bytes as f64 / total as f64
    }
}

// ============================================================================
// TRANSFER ENGINE
// ============================================================================

/// State machines for every transfer on one channel, both directions.
///
/// One engine belongs to one channel controller; constructing a second
/// controller yields fully disjoint transfer state.
#[derive(Debug, Default)]
pub struct TransferEngine {
    outgoing: HashMap<String, OutgoingTransfer>,
    incoming: HashMap<String, IncomingTransfer>,
}

impl TransferEngine {
    /// Create an empty engine.
    pub fn new() -> Self {
        Self::default()
    }

    // ── Outgoing ────────────────────────────────────────────────────────

    /// Register an outgoing transfer and build its `file-init`.
    pub fn register_outgoing(
        &mut self,
        source: Arc<dyn FileSource>,
        options: SendFileOptions,
        now_ms: i64,
    ) -> (String, ControlMessage) {
        let (transfer, init) = OutgoingTransfer::new(source, options, now_ms);
        let id = transfer.id.clone();
        tracing::info!(
            "Registered outgoing transfer {} ({} bytes, {} chunks)",
            id,
            transfer.size,
            transfer.total_chunks
        );
        self.outgoing.insert(id.clone(), transfer);
        (id, init)
    }

    /// Whether an outgoing transfer exists and can still emit frames.
    pub fn is_outgoing_active(&self, id: &str) -> bool {
        self.outgoing
            .get(id)
            .map(|t| !t.status.is_terminal() && !t.cancelled)
            .unwrap_or(false)
    }

    /// Ids of outgoing transfers that can still make progress.
    pub fn pumpable_outgoing(&self) -> Vec<String> {
        self.outgoing
            .values()
            .filter(|t| !t.status.is_terminal() && !t.cancelled)
            .map(|t| t.id.clone())
            .collect()
    }

    /// Claim the next window of never-sent sequences for `id`, marking each
    /// in-flight. Returns the read jobs, at most enough to fill the window.
    pub fn window_jobs(&mut self, id: &str) -> Vec<ChunkJob> {
        let Some(t) = self.outgoing.get_mut(id) else {
            return Vec::new();
        };
        if t.status.is_terminal() || t.cancelled {
            return Vec::new();
        }

        let mut jobs = Vec::new();
        while t.next_sequence < t.total_chunks && t.in_flight.len() < MAX_IN_FLIGHT_CHUNKS {
            let sequence = t.next_sequence;
            t.next_sequence += 1;
            t.in_flight.insert(sequence);
            t.pending_reads.insert(sequence);

            let (start, end) = chunk_bounds(sequence, t.chunk_size, t.size);
            jobs.push(ChunkJob {
                id: t.id.clone(),
                sequence,
                start,
                end,
                source: Arc::clone(&t.source),
            });
        }
        jobs
    }

    /// Claim read jobs for requested retransmissions. Sequences already
    /// being read (the `pending_reads` guard) or already acknowledged are
    /// skipped, which makes concurrent resend requests idempotent.
    pub fn resend_jobs(&mut self, id: &str, missing: &[u32]) -> Vec<ChunkJob> {
        let Some(t) = self.outgoing.get_mut(id) else {
            return Vec::new();
        };
        if t.status.is_terminal() || t.cancelled {
            return Vec::new();
        }

        let mut jobs = Vec::new();
        for &sequence in missing {
            if sequence >= t.total_chunks {
                continue;
            }
            if t.pending_reads.contains(&sequence) || t.acked.contains(&sequence) {
                continue;
            }
            t.in_flight.insert(sequence);
            t.pending_reads.insert(sequence);

            let (start, end) = chunk_bounds(sequence, t.chunk_size, t.size);
            jobs.push(ChunkJob {
                id: t.id.clone(),
                sequence,
                start,
                end,
                source: Arc::clone(&t.source),
            });
        }
        jobs
    }

    /// Release the `pending_reads` guard once a job's read finished (or was
    /// abandoned).
    pub fn finish_read(&mut self, id: &str, sequence: u32) {
        if let Some(t) = self.outgoing.get_mut(id) {
            t.pending_reads.remove(&sequence);
        }
    }

    /// Apply a selective ACK.
    pub fn on_ack(
        &mut self,
        id: &str,
        acked: &[u32],
        missing: Option<&[u32]>,
        now_ms: i64,
    ) -> Option<AckOutcome> {
        let t = self.outgoing.get_mut(id)?;
        if t.status.is_terminal() {
            return None;
        }

        t.last_ack_time = now_ms;
        let elapsed = (now_ms - t.updated_at).max(1) as u64;

        let mut newly_acked_bytes = 0u64;
        let mut intersected = false;
        for &sequence in acked {
            if t.in_flight.remove(&sequence) {
                intersected = true;
                t.pending_reads.remove(&sequence);
                if t.acked.insert(sequence) {
                    let (start, end) = chunk_bounds(sequence, t.chunk_size, t.size);
                    newly_acked_bytes += end - start;
                }
            }
        }

        if intersected && t.status == TransferStatus::Pending {
            t.status = TransferStatus::InProgress;
        }
        if newly_acked_bytes > 0 {
            t.bytes_acked += newly_acked_bytes;
            t.speed.record(newly_acked_bytes as usize, elapsed);
        }
        t.updated_at = now_ms;

        Some(AckOutcome {
            snapshot: t.snapshot(),
            resend: missing.map(|m| m.to_vec()).unwrap_or_default(),
        })
    }

    /// Sequences to retransmit for every transfer whose ACK silence exceeds
    /// the retry interval. Firing counts as an attempt, so a dead peer
    /// triggers one retransmission per interval, not one per poll.
    pub fn retry_due(&mut self, now_ms: i64) -> Vec<(String, Vec<u32>)> {
        let mut due = Vec::new();
        for t in self.outgoing.values_mut() {
            if t.status.is_terminal() || t.cancelled || t.in_flight.is_empty() {
                continue;
            }
            if now_ms - t.last_ack_time > RETRY_INTERVAL_MS {
                t.last_ack_time = now_ms;
                let mut sequences: Vec<u32> = t.in_flight.iter().copied().collect();
                sequences.sort_unstable();
                tracing::debug!(
                    "Transfer {} saw no ACK for {}ms, re-queuing {} in-flight chunks",
                    t.id,
                    RETRY_INTERVAL_MS,
                    sequences.len()
                );
                due.push((t.id.clone(), sequences));
            }
        }
        due
    }

    /// The peer confirmed full receipt.
    pub fn on_complete(&mut self, id: &str, now_ms: i64) -> Option<TransferSnapshot> {
        let t = self.outgoing.get_mut(id)?;
        if t.status.is_terminal() {
            return None;
        }
        t.status = TransferStatus::Completed;
        t.bytes_acked = t.size;
        t.in_flight.clear();
        t.pending_reads.clear();
        t.updated_at = now_ms;
        t.completed_at = Some(now_ms);
        tracing::info!("Outgoing transfer {} completed ({} bytes)", t.id, t.size);
        Some(t.snapshot())
    }

    /// Cancel an outgoing transfer locally. Returns the best-effort
    /// `file-error` to dispatch and the terminal snapshot.
    pub fn cancel_outgoing(
        &mut self,
        id: &str,
        now_ms: i64,
    ) -> Option<(ControlMessage, TransferSnapshot)> {
        let t = self.outgoing.get_mut(id)?;
        if t.status.is_terminal() {
            return None;
        }
        t.cancelled = true;
        t.status = TransferStatus::Cancelled;
        t.error = Some(crate::error::Error::Cancelled.to_string());
        t.in_flight.clear();
        t.pending_reads.clear();
        t.updated_at = now_ms;
        t.completed_at = Some(now_ms);
        tracing::info!("Outgoing transfer {} cancelled", t.id);

        let message = ControlMessage::FileError {
            id: t.id.clone(),
            reason: "cancelled".to_string(),
        };
        Some((message, t.snapshot()))
    }

    /// Mark an outgoing transfer failed (init failure, source read failure).
    pub fn fail_outgoing(
        &mut self,
        id: &str,
        reason: &str,
        now_ms: i64,
    ) -> Option<TransferSnapshot> {
        let t = self.outgoing.get_mut(id)?;
        if t.status.is_terminal() {
            return None;
        }
        t.status = TransferStatus::Failed;
        t.error = Some(reason.to_string());
        t.in_flight.clear();
        t.pending_reads.clear();
        t.updated_at = now_ms;
        t.completed_at = Some(now_ms);
        tracing::warn!("Outgoing transfer {} failed: {}", t.id, reason);
        Some(t.snapshot())
    }

    // ── Incoming ────────────────────────────────────────────────────────

    /// Handle a `file-init`. Idempotent: a repeated id is ignored. An empty
    /// file finalizes immediately.
    #[allow(clippy::too_many_arguments)]
    pub fn register_incoming(
        &mut self,
        id: &str,
        name: String,
        mime: Option<String>,
        size: u64,
        chunk_size: usize,
        total_chunks: u32,
        now_ms: i64,
    ) -> InitOutcome {
        if self.incoming.contains_key(id) {
            return InitOutcome::AlreadyKnown;
        }

        let mut transfer = IncomingTransfer::new(
            id.to_string(),
            name,
            mime,
            size,
            chunk_size,
            total_chunks,
            now_ms,
        );
        tracing::info!(
            "Registered incoming transfer {} ({} bytes, {} chunks)",
            id,
            size,
            total_chunks
        );

        if total_chunks == 0 {
            transfer.status = TransferStatus::Completed;
            transfer.completed_at = Some(now_ms);
            let snapshot = transfer.snapshot();
            let metadata = transfer.metadata();
            let complete = ControlMessage::FileComplete { id: id.to_string() };
            self.incoming.insert(id.to_string(), transfer);
            return InitOutcome::Finalized {
                snapshot,
                metadata,
                data: Vec::new(),
                complete,
            };
        }

        let snapshot = transfer.snapshot();
        self.incoming.insert(id.to_string(), transfer);
        InitOutcome::Registered { snapshot }
    }

    /// Store an inbound chunk and work out what to send back.
    pub fn store_chunk(
        &mut self,
        id: &str,
        sequence: u32,
        data: &[u8],
        now_ms: i64,
    ) -> ChunkReceipt {
        let Some(t) = self.incoming.get_mut(id) else {
            return ChunkReceipt::Unknown;
        };

        // A retransmission can land after we finalized; re-announce so the
        // sender stops retrying.
        if t.status == TransferStatus::Completed {
            return ChunkReceipt::Duplicate {
                ack: t.ack_for(sequence, None),
                complete: Some(ControlMessage::FileComplete { id: t.id.clone() }),
            };
        }
        if t.status.is_terminal() {
            return ChunkReceipt::Unknown;
        }
        if sequence >= t.total_chunks {
            tracing::warn!(
                "Dropping chunk {} outside transfer {} range 0..{}",
                sequence,
                id,
                t.total_chunks
            );
            return ChunkReceipt::Unknown;
        }
        if data.len() > t.chunk_size {
            tracing::warn!(
                "Dropping oversized chunk {} for transfer {} ({} > {} bytes)",
                sequence,
                id,
                data.len(),
                t.chunk_size
            );
            return ChunkReceipt::Unknown;
        }

        if t.chunks.contains_key(&sequence) {
            return ChunkReceipt::Duplicate {
                ack: t.ack_for(sequence, None),
                complete: None,
            };
        }

        let elapsed = (now_ms - t.updated_at).max(1) as u64;
        t.chunks.insert(sequence, data.to_vec());
        t.received_bytes += data.len() as u64;
        t.received_chunks += 1;
        t.highest_seen = Some(t.highest_seen.map_or(sequence, |h| h.max(sequence)));
        while t.chunks.contains_key(&t.expected_sequence) {
            t.expected_sequence += 1;
        }
        if t.status == TransferStatus::Pending {
            t.status = TransferStatus::InProgress;
        }
        t.speed.record(data.len(), elapsed);
        t.updated_at = now_ms;

        // Gaps strictly below the highest sequence seen so far: every one of
        // them was overtaken by a later frame, so it is either lost or badly
        // reordered. Each gap is reported once; anything lost again falls to
        // the sender's retry timer.
        let highest = t.highest_seen.unwrap_or(0);
        let missing: Vec<u32> = (0..highest)
            .filter(|seq| !t.chunks.contains_key(seq) && !t.nacked.contains(seq))
            .collect();
        t.nacked.extend(missing.iter().copied());

        let ack = t.ack_for(
            sequence,
            if missing.is_empty() {
                None
            } else {
                Some(missing.clone())
            },
        );
        let resend = if missing.is_empty() {
            None
        } else {
            Some(ControlMessage::FileResend {
                id: t.id.clone(),
                missing,
            })
        };

        let finalized = if t.chunks.len() as u32 == t.total_chunks {
            let mut assembled = Vec::with_capacity(t.size as usize);
            for seq in 0..t.total_chunks {
                if let Some(chunk) = t.chunks.remove(&seq) {
                    assembled.extend_from_slice(&chunk);
                }
            }
            t.status = TransferStatus::Completed;
            t.completed_at = Some(now_ms);
            tracing::info!(
                "Incoming transfer {} completed ({} bytes)",
                t.id,
                t.received_bytes
            );
            Some((
                t.metadata(),
                assembled,
                ControlMessage::FileComplete { id: t.id.clone() },
            ))
        } else {
            None
        };

        ChunkReceipt::Stored {
            ack,
            resend,
            snapshot: t.snapshot(),
            finalized,
        }
    }

    // ── Either direction ────────────────────────────────────────────────

    /// The peer reported a failure for `id`.
    pub fn on_peer_error(
        &mut self,
        id: &str,
        reason: &str,
        now_ms: i64,
    ) -> Option<TransferSnapshot> {
        if let Some(t) = self.outgoing.get_mut(id) {
            if t.status.is_terminal() {
                return None;
            }
            t.status = TransferStatus::Failed;
            t.error = Some(reason.to_string());
            t.in_flight.clear();
            t.pending_reads.clear();
            t.updated_at = now_ms;
            t.completed_at = Some(now_ms);
            tracing::warn!("Peer reported error on outgoing transfer {}: {}", id, reason);
            return Some(t.snapshot());
        }
        if let Some(t) = self.incoming.get_mut(id) {
            if t.status.is_terminal() {
                return None;
            }
            t.status = TransferStatus::Failed;
            t.error = Some(reason.to_string());
            t.chunks.clear();
            t.updated_at = now_ms;
            t.completed_at = Some(now_ms);
            tracing::warn!("Peer reported error on incoming transfer {}: {}", id, reason);
            return Some(t.snapshot());
        }
        None
    }

    /// Channel teardown: fail every non-completed transfer and clear both
    /// maps. Returns the terminal snapshots to surface.
    pub fn fail_all(&mut self, reason: &str, now_ms: i64) -> Vec<TransferSnapshot> {
        let mut snapshots = Vec::new();

        for t in self.outgoing.values_mut() {
            if !t.status.is_terminal() {
                t.status = TransferStatus::Failed;
                t.error = Some(reason.to_string());
                t.in_flight.clear();
                t.pending_reads.clear();
                t.updated_at = now_ms;
                t.completed_at = Some(now_ms);
                snapshots.push(t.snapshot());
            }
        }
        for t in self.incoming.values_mut() {
            if !t.status.is_terminal() {
                t.status = TransferStatus::Failed;
                t.error = Some(reason.to_string());
                t.chunks.clear();
                t.updated_at = now_ms;
                t.completed_at = Some(now_ms);
                snapshots.push(t.snapshot());
            }
        }

        self.outgoing.clear();
        self.incoming.clear();
        snapshots
    }

    // ── Views / housekeeping ────────────────────────────────────────────

    /// Snapshot of one transfer, either direction.
    pub fn snapshot(&self, id: &str) -> Option<TransferSnapshot> {
        self.outgoing
            .get(id)
            .map(OutgoingTransfer::snapshot)
            .or_else(|| self.incoming.get(id).map(IncomingTransfer::snapshot))
    }

    /// Snapshots of every known transfer.
    pub fn snapshots(&self) -> Vec<TransferSnapshot> {
        self.outgoing
            .values()
            .map(OutgoingTransfer::snapshot)
            .chain(self.incoming.values().map(IncomingTransfer::snapshot))
            .collect()
    }

    /// Drop terminal transfer records.
    pub fn clear_completed(&mut self) {
        self.outgoing.retain(|_, t| !t.status.is_terminal());
        self.incoming.retain(|_, t| !t.status.is_terminal());
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::BytesSource;

    fn source_of(len: usize) -> Arc<dyn FileSource> {
        Arc::new(BytesSource::new(vec![0xAB; len]))
    }

    fn options(name: &str) -> SendFileOptions {
        SendFileOptions {
            name: name.to_string(),
            ..SendFileOptions::default()
        }
    }

    fn register(engine: &mut TransferEngine, len: usize) -> String {
        let (id, init) = engine.register_outgoing(source_of(len), options("f.bin"), 1_000);
        match init {
            ControlMessage::FileInit { total_chunks, .. } => {
                assert_eq!(
                    total_chunks,
                    calculate_total_chunks(len as u64, calculate_chunk_size(len as u64))
                );
            }
            other => panic!("Expected FileInit, got {:?}", other),
        }
        id
    }

    #[test]
    fn test_window_fills_to_limit() {
        let mut engine = TransferEngine::new();
        // 64 chunks at MIN_CHUNK_SIZE
        let id = register(&mut engine, MIN_CHUNK_SIZE * 64);

        let jobs = engine.window_jobs(&id);
        assert_eq!(jobs.len(), MAX_IN_FLIGHT_CHUNKS);
        assert_eq!(jobs[0].sequence, 0);
        assert_eq!(jobs[15].sequence, 15);

        // window is full until something is acked
        assert!(engine.window_jobs(&id).is_empty());
    }

    #[test]
    fn test_window_bounds_cover_short_last_chunk() {
        let mut engine = TransferEngine::new();
        let len = MIN_CHUNK_SIZE + 100;
        let id = register(&mut engine, len);

        let jobs = engine.window_jobs(&id);
        assert_eq!(jobs.len(), 2);
        assert_eq!((jobs[0].start, jobs[0].end), (0, MIN_CHUNK_SIZE as u64));
        assert_eq!(
            (jobs[1].start, jobs[1].end),
            (MIN_CHUNK_SIZE as u64, len as u64)
        );
    }

    #[test]
    fn test_ack_opens_window_and_counts_bytes_once() {
        let mut engine = TransferEngine::new();
        let id = register(&mut engine, MIN_CHUNK_SIZE * 64);
        let jobs = engine.window_jobs(&id);
        for job in &jobs {
            engine.finish_read(&id, job.sequence);
        }

        let outcome = engine.on_ack(&id, &[0, 1], None, 2_000).unwrap();
        assert_eq!(outcome.snapshot.status, TransferStatus::InProgress);
        assert_eq!(
            outcome.snapshot.bytes_transferred,
            MIN_CHUNK_SIZE as u64 * 2
        );

        // duplicate ack of the same sequences adds nothing
        let outcome = engine.on_ack(&id, &[0, 1], None, 2_100).unwrap();
        assert_eq!(
            outcome.snapshot.bytes_transferred,
            MIN_CHUNK_SIZE as u64 * 2
        );

        // two slots opened
        let jobs = engine.window_jobs(&id);
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].sequence, 16);
        assert_eq!(jobs[1].sequence, 17);
    }

    #[test]
    fn test_in_flight_never_exceeds_limit() {
        let mut engine = TransferEngine::new();
        let id = register(&mut engine, MIN_CHUNK_SIZE * 64);

        for round in 0..10 {
            let jobs = engine.window_jobs(&id);
            for job in &jobs {
                engine.finish_read(&id, job.sequence);
                assert!(job.sequence < 64);
            }
            let t = engine.outgoing.get(&id).unwrap();
            assert!(t.in_flight.len() <= MAX_IN_FLIGHT_CHUNKS);

            // ack one chunk per round
            let _ = engine.on_ack(&id, &[round], None, 2_000 + round as i64);
        }
    }

    #[test]
    fn test_ack_with_missing_reports_resend_list() {
        let mut engine = TransferEngine::new();
        let id = register(&mut engine, MIN_CHUNK_SIZE * 64);
        for job in engine.window_jobs(&id) {
            engine.finish_read(&id, job.sequence);
        }

        let outcome = engine.on_ack(&id, &[8], Some(&[7]), 2_000).unwrap();
        assert_eq!(outcome.resend, vec![7]);

        let jobs = engine.resend_jobs(&id, &outcome.resend);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].sequence, 7);
    }

    #[test]
    fn test_resend_guards() {
        let mut engine = TransferEngine::new();
        let id = register(&mut engine, MIN_CHUNK_SIZE * 64);
        for job in engine.window_jobs(&id) {
            engine.finish_read(&id, job.sequence);
        }
        let _ = engine.on_ack(&id, &[3], None, 2_000);

        // acked sequences are not re-read
        assert!(engine.resend_jobs(&id, &[3]).is_empty());
        // out-of-range sequences are ignored
        assert!(engine.resend_jobs(&id, &[999]).is_empty());

        // a sequence mid-read is guarded against double reads
        let jobs = engine.resend_jobs(&id, &[5]);
        assert_eq!(jobs.len(), 1);
        assert!(engine.resend_jobs(&id, &[5]).is_empty());
        engine.finish_read(&id, 5);
        assert_eq!(engine.resend_jobs(&id, &[5]).len(), 1);
    }

    #[test]
    fn test_retry_after_ack_silence() {
        let mut engine = TransferEngine::new();
        let id = register(&mut engine, MIN_CHUNK_SIZE * 4);
        for job in engine.window_jobs(&id) {
            engine.finish_read(&id, job.sequence);
        }

        // not due yet
        assert!(engine.retry_due(1_000 + RETRY_INTERVAL_MS).is_empty());

        let due = engine.retry_due(1_001 + RETRY_INTERVAL_MS);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, id);
        assert_eq!(due[0].1, vec![0, 1, 2, 3]);

        // firing counts as an attempt: not due again immediately
        assert!(engine.retry_due(1_002 + RETRY_INTERVAL_MS).is_empty());
    }

    #[test]
    fn test_complete_clears_window_and_fills_bytes() {
        let mut engine = TransferEngine::new();
        let id = register(&mut engine, MIN_CHUNK_SIZE * 4);
        for job in engine.window_jobs(&id) {
            engine.finish_read(&id, job.sequence);
        }

        let snapshot = engine.on_complete(&id, 9_000).unwrap();
        assert_eq!(snapshot.status, TransferStatus::Completed);
        assert_eq!(snapshot.bytes_transferred, MIN_CHUNK_SIZE as u64 * 4);
        assert_eq!(snapshot.progress, 1.0);
        assert_eq!(snapshot.completed_at, Some(9_000));

        // terminal: later messages are no-ops
        assert!(engine.on_complete(&id, 9_100).is_none());
        assert!(engine.on_ack(&id, &[0], None, 9_100).is_none());
    }

    #[test]
    fn test_cancel_emits_wire_error_and_terminal_snapshot() {
        let mut engine = TransferEngine::new();
        let id = register(&mut engine, MIN_CHUNK_SIZE * 4);
        engine.window_jobs(&id);

        let (message, snapshot) = engine.cancel_outgoing(&id, 2_000).unwrap();
        match message {
            ControlMessage::FileError { reason, .. } => assert_eq!(reason, "cancelled"),
            other => panic!("Expected FileError, got {:?}", other),
        }
        assert_eq!(snapshot.status, TransferStatus::Cancelled);
        assert_eq!(snapshot.error.as_deref(), Some("Cancelled by user"));

        // no further frames for a cancelled transfer
        assert!(engine.window_jobs(&id).is_empty());
        assert!(engine.resend_jobs(&id, &[0]).is_empty());
        assert!(engine.retry_due(100_000).is_empty());
    }

    #[test]
    fn test_incoming_reorder_and_gap_detection() {
        let mut engine = TransferEngine::new();
        engine.register_incoming("t-in", "f".into(), None, 300, MIN_CHUNK_SIZE, 3, 1_000);

        // chunk 1 arrives before chunk 0: gap below highest
        let receipt = engine.store_chunk("t-in", 1, &[1u8; 100], 1_100);
        match receipt {
            ChunkReceipt::Stored { ack, resend, .. } => {
                match ack {
                    ControlMessage::FileAck { acked, missing, .. } => {
                        assert_eq!(acked, vec![1]);
                        assert_eq!(missing, Some(vec![0]));
                    }
                    other => panic!("Expected FileAck, got {:?}", other),
                }
                match resend {
                    Some(ControlMessage::FileResend { missing, .. }) => {
                        assert_eq!(missing, vec![0]);
                    }
                    other => panic!("Expected FileResend, got {:?}", other),
                }
            }
            other => panic!("Expected Stored, got {:?}", other),
        }

        // chunk 0 fills the gap: contiguous again, no resend
        let receipt = engine.store_chunk("t-in", 0, &[0u8; 100], 1_200);
        match receipt {
            ChunkReceipt::Stored { resend, snapshot, .. } => {
                assert!(resend.is_none());
                assert_eq!(snapshot.bytes_transferred, 200);
            }
            other => panic!("Expected Stored, got {:?}", other),
        }
    }

    #[test]
    fn test_incoming_duplicate_is_acked_not_double_counted() {
        let mut engine = TransferEngine::new();
        engine.register_incoming("t-in", "f".into(), None, 200, MIN_CHUNK_SIZE, 2, 1_000);

        engine.store_chunk("t-in", 0, &[0u8; 100], 1_100);
        let receipt = engine.store_chunk("t-in", 0, &[0u8; 100], 1_200);
        match receipt {
            ChunkReceipt::Duplicate { ack, complete } => {
                assert!(complete.is_none());
                match ack {
                    ControlMessage::FileAck {
                        acked,
                        received_bytes,
                        received_chunks,
                        missing,
                        ..
                    } => {
                        assert_eq!(acked, vec![0]);
                        assert_eq!(received_bytes, 100);
                        assert_eq!(received_chunks, 1);
                        assert!(missing.is_none());
                    }
                    other => panic!("Expected FileAck, got {:?}", other),
                }
            }
            other => panic!("Expected Duplicate, got {:?}", other),
        }
    }

    #[test]
    fn test_incoming_finalizes_in_sequence_order() {
        let mut engine = TransferEngine::new();
        engine.register_incoming("t-in", "f".into(), None, 6, MIN_CHUNK_SIZE, 3, 1_000);

        // deliver out of order
        engine.store_chunk("t-in", 2, b"ef", 1_100);
        engine.store_chunk("t-in", 0, b"ab", 1_200);
        let receipt = engine.store_chunk("t-in", 1, b"cd", 1_300);

        match receipt {
            ChunkReceipt::Stored { finalized, snapshot, .. } => {
                let (metadata, data, complete) = finalized.expect("should finalize");
                assert_eq!(data, b"abcdef");
                assert_eq!(metadata.size, 6);
                assert!(matches!(complete, ControlMessage::FileComplete { .. }));
                assert_eq!(snapshot.status, TransferStatus::Completed);
                assert_eq!(snapshot.progress, 1.0);
            }
            other => panic!("Expected Stored, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_after_finalize_reannounces_completion() {
        let mut engine = TransferEngine::new();
        engine.register_incoming("t-in", "f".into(), None, 2, MIN_CHUNK_SIZE, 1, 1_000);
        engine.store_chunk("t-in", 0, b"ok", 1_100);

        let receipt = engine.store_chunk("t-in", 0, b"ok", 9_000);
        match receipt {
            ChunkReceipt::Duplicate { complete, .. } => {
                assert!(matches!(
                    complete,
                    Some(ControlMessage::FileComplete { .. })
                ));
            }
            other => panic!("Expected Duplicate, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_file_finalizes_on_init() {
        let mut engine = TransferEngine::new();
        let outcome =
            engine.register_incoming("t-empty", "e".into(), None, 0, MIN_CHUNK_SIZE, 0, 1_000);
        match outcome {
            InitOutcome::Finalized { data, snapshot, .. } => {
                assert!(data.is_empty());
                assert_eq!(snapshot.status, TransferStatus::Completed);
                assert_eq!(snapshot.progress, 1.0);
            }
            other => panic!("Expected Finalized, got {:?}", other),
        }

        // a repeated init for the same id is ignored
        let outcome =
            engine.register_incoming("t-empty", "e".into(), None, 0, MIN_CHUNK_SIZE, 0, 1_100);
        assert!(matches!(outcome, InitOutcome::AlreadyKnown));
    }

    #[test]
    fn test_chunk_for_unknown_transfer_is_dropped() {
        let mut engine = TransferEngine::new();
        assert!(matches!(
            engine.store_chunk("nope", 0, b"x", 1_000),
            ChunkReceipt::Unknown
        ));
    }

    #[test]
    fn test_chunk_out_of_range_is_dropped() {
        let mut engine = TransferEngine::new();
        engine.register_incoming("t-in", "f".into(), None, 10, MIN_CHUNK_SIZE, 1, 1_000);
        assert!(matches!(
            engine.store_chunk("t-in", 5, b"x", 1_100),
            ChunkReceipt::Unknown
        ));
    }

    #[test]
    fn test_peer_error_fails_either_direction() {
        let mut engine = TransferEngine::new();
        let out_id = register(&mut engine, MIN_CHUNK_SIZE);
        engine.register_incoming("t-in", "f".into(), None, 10, MIN_CHUNK_SIZE, 1, 1_000);

        let snapshot = engine.on_peer_error(&out_id, "disk full", 2_000).unwrap();
        assert_eq!(snapshot.status, TransferStatus::Failed);
        assert_eq!(snapshot.error.as_deref(), Some("disk full"));

        let snapshot = engine.on_peer_error("t-in", "cancelled", 2_000).unwrap();
        assert_eq!(snapshot.direction, TransferDirection::Incoming);
        assert_eq!(snapshot.status, TransferStatus::Failed);

        assert!(engine.on_peer_error("missing", "x", 2_000).is_none());
    }

    #[test]
    fn test_fail_all_clears_everything_but_skips_terminal() {
        let mut engine = TransferEngine::new();
        let a = register(&mut engine, MIN_CHUNK_SIZE);
        let b = register(&mut engine, MIN_CHUNK_SIZE);
        engine.register_incoming("t-in", "f".into(), None, 10, MIN_CHUNK_SIZE, 1, 1_000);
        let _ = engine.on_complete(&a, 1_500);

        let snapshots = engine.fail_all("Data channel closed unexpectedly", 2_000);
        // the completed transfer is not re-failed
        assert_eq!(snapshots.len(), 2);
        assert!(snapshots.iter().all(|s| s.status == TransferStatus::Failed));
        assert!(snapshots
            .iter()
            .all(|s| s.error.as_deref() == Some("Data channel closed unexpectedly")));
        assert!(snapshots.iter().any(|s| s.id == b));

        // both maps cleared
        assert!(engine.snapshot(&a).is_none());
        assert!(engine.snapshot(&b).is_none());
        assert!(engine.snapshot("t-in").is_none());
    }

    #[test]
    fn test_clear_completed_retains_active() {
        let mut engine = TransferEngine::new();
        let a = register(&mut engine, MIN_CHUNK_SIZE);
        let b = register(&mut engine, MIN_CHUNK_SIZE);
        let _ = engine.on_complete(&a, 1_500);

        engine.clear_completed();
        assert!(engine.snapshot(&a).is_none());
        assert!(engine.snapshot(&b).is_some());
    }

    #[test]
    fn test_speed_tracker_rolls() {
        let mut tracker = SpeedTracker::new(3);
        assert_eq!(tracker.speed_bps(), 0);

        tracker.record(1000, 100);
        assert_eq!(tracker.speed_bps(), 10_000);

        // window evicts the oldest sample
        tracker.record(1000, 100);
        tracker.record(1000, 100);
        tracker.record(3000, 100);
        assert_eq!(tracker.speed_bps(), (5000 * 1000) / 300);
    }

    #[test]
    fn test_chunk_size_override_is_clamped() {
        let mut engine = TransferEngine::new();
        let (_, init) = engine.register_outgoing(
            source_of(MIN_CHUNK_SIZE * 4),
            SendFileOptions {
                name: "f".into(),
                chunk_size: Some(1),
                ..SendFileOptions::default()
            },
            1_000,
        );
        match init {
            ControlMessage::FileInit { chunk_size, .. } => {
                assert_eq!(chunk_size as usize, MIN_CHUNK_SIZE);
            }
            other => panic!("Expected FileInit, got {:?}", other),
        }
    }
}
