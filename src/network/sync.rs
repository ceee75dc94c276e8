//! # CRDT Sync Engine
//!
//! Keeps two replicas of the shared document converging over the channel.
//!
//! ## Sync Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         DOCUMENT SYNC                                   │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Peer A                            Peer B                              │
//! │  ──────                            ──────                              │
//! │                                                                         │
//! │  channel open:                                                         │
//! │  yjs-sync(vector A) ──────────────►                                    │
//! │                          ◄──────── yjs-update(diff for A)              │
//! │                          ◄──────── yjs-sync(vector B)                  │
//! │  yjs-update(diff for B) ──────────►                                    │
//! │                                                                         │
//! │  local edits: coalesce 80 ms → merge → one base64 envelope             │
//! │    ≤ 15,000 chars  → one yjs-update                                    │
//! │    >  15,000 chars → yjs-update-chunk × ⌈len/15,000⌉, reassembled      │
//! │                       deterministically on the far side                │
//! │                                                                         │
//! │  backpressure / closed channel → pending queue, flushed on open,       │
//! │  low-water, and after answering a yjs-sync                             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Reassembly state is bounded: at most [`MAX_REASSEMBLY_ENTRIES`] chunk
//! sets are held at once and the oldest is evicted beyond that, so a buggy
//! peer that never finishes a set cannot grow memory without limit. An
//! evicted or replaced set is simply never applied; the sender's
//! whole-update re-enqueue on failure means the next flush carries the data
//! again.

use std::collections::VecDeque;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::crdt::{CrdtHandle, UpdateOrigin};
use crate::network::chunking::{MAX_MESSAGE_CHUNK_SIZE, UPDATE_COALESCE_MS};
use crate::network::protocol::ControlMessage;

/// Maximum outstanding chunk-set reassemblies held at once.
pub const MAX_REASSEMBLY_ENTRIES: usize = 32;

/// Maximum slices a single chunk set may declare (a ~15 MB envelope).
/// Larger declarations are dropped rather than allocated.
pub const MAX_UPDATE_SLICES: u32 = 1_024;

/// Partial reassembly of one oversized update.
#[derive(Debug)]
struct ReassemblyEntry {
    total: u32,
    received: u32,
    parts: Vec<Option<String>>,
}

/// State machine for document sync over one channel.
pub struct SyncEngine {
    crdt: Arc<dyn CrdtHandle>,
    /// Local updates awaiting the coalescing flush.
    flush_queue: Vec<Vec<u8>>,
    /// When the coalescing timer expires, if armed.
    flush_due: Option<i64>,
    /// Updates that could not be sent (closed channel, backpressure);
    /// retained across channel teardown and flushed on the next open.
    pending: VecDeque<Vec<u8>>,
    /// Outstanding chunk-set reassemblies, oldest first.
    reassembly: Vec<(String, ReassemblyEntry)>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("flush_queue", &self.flush_queue.len())
            .field("pending", &self.pending.len())
            .field("reassembly", &self.reassembly.len())
            .finish()
    }
}

impl SyncEngine {
    /// Create an engine over the collaborator's CRDT handle.
    pub fn new(crdt: Arc<dyn CrdtHandle>) -> Self {
        Self {
            crdt,
            flush_queue: Vec::new(),
            flush_due: None,
            pending: VecDeque::new(),
            reassembly: Vec::new(),
        }
    }

    // ── Outbound ────────────────────────────────────────────────────────

    /// The handshake message for a freshly opened channel.
    pub fn handshake_message(&self) -> ControlMessage {
        ControlMessage::YjsSync {
            vector: STANDARD.encode(self.crdt.state_vector()),
        }
    }

    /// Queue a local update and arm the coalescing timer if idle.
    pub fn queue_local(&mut self, update: &[u8], now_ms: i64) {
        self.flush_queue.push(update.to_vec());
        if self.flush_due.is_none() {
            self.flush_due = Some(now_ms + UPDATE_COALESCE_MS);
        }
    }

    /// When the coalescing timer expires, if armed.
    pub fn flush_due_at(&self) -> Option<i64> {
        self.flush_due
    }

    /// Take the merged flush payload once the coalescing window elapsed.
    pub fn take_flush(&mut self, now_ms: i64) -> Option<Vec<u8>> {
        let due = self.flush_due?;
        if now_ms < due {
            return None;
        }
        self.flush_due = None;
        if self.flush_queue.is_empty() {
            return None;
        }
        let queued = std::mem::take(&mut self.flush_queue);
        Some(self.crdt.merge_updates(&queued))
    }

    /// Park an update that could not be sent.
    pub fn push_pending(&mut self, update: Vec<u8>) {
        self.pending.push_back(update);
    }

    /// Take the pending queue, oldest first. Callers re-park what they
    /// still cannot send, preserving order.
    pub fn take_pending(&mut self) -> Vec<Vec<u8>> {
        self.pending.drain(..).collect()
    }

    /// Number of parked updates.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    // ── Inbound ─────────────────────────────────────────────────────────

    /// Answer a `yjs-sync`: the update the peer is missing, if any.
    pub fn diff_for(&self, vector_b64: &str) -> Option<Vec<u8>> {
        let vector = match STANDARD.decode(vector_b64) {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!("Dropping yjs-sync with invalid base64 vector: {}", err);
                return None;
            }
        };
        let diff = self.crdt.encode_diff(&vector);
        if diff.is_empty() {
            None
        } else {
            Some(diff)
        }
    }

    /// Apply a single-message `yjs-update`.
    pub fn apply_remote(&self, update_b64: &str) {
        let update = match STANDARD.decode(update_b64) {
            Ok(u) => u,
            Err(err) => {
                tracing::warn!("Dropping yjs-update with invalid base64: {}", err);
                return;
            }
        };
        if let Err(err) = self.crdt.apply_update(&update, UpdateOrigin::Peer) {
            tracing::warn!("CRDT rejected remote update: {}", err);
        }
    }

    /// Store one `yjs-update-chunk` slice; applies the update when the set
    /// completes. Idempotent per slice, tolerant of reordering.
    pub fn store_chunk(&mut self, id: &str, index: u32, total: u32, chunk: String) {
        if total == 0 || total > MAX_UPDATE_SLICES || index >= total {
            tracing::warn!(
                "Dropping yjs-update-chunk {} with index {} of total {}",
                id,
                index,
                total
            );
            return;
        }

        // A chunk set whose declared total changed is a new set: replace it.
        if let Some(pos) = self.reassembly.iter().position(|(key, _)| key == id) {
            if self.reassembly[pos].1.total != total {
                tracing::debug!("Replacing chunk set {} with mismatched total", id);
                self.reassembly.remove(pos);
            }
        }

        let entry_pos = match self.reassembly.iter().position(|(key, _)| key == id) {
            Some(pos) => pos,
            None => {
                if self.reassembly.len() >= MAX_REASSEMBLY_ENTRIES {
                    let (evicted, _) = self.reassembly.remove(0);
                    tracing::warn!(
                        "Evicting oldest chunk set {} (over {} outstanding)",
                        evicted,
                        MAX_REASSEMBLY_ENTRIES
                    );
                }
                self.reassembly.push((
                    id.to_string(),
                    ReassemblyEntry {
                        total,
                        received: 0,
                        parts: vec![None; total as usize],
                    },
                ));
                self.reassembly.len() - 1
            }
        };

        let entry = &mut self.reassembly[entry_pos].1;
        if entry.parts[index as usize].is_some() {
            return;
        }
        entry.parts[index as usize] = Some(chunk);
        entry.received += 1;

        if entry.received < entry.total {
            return;
        }

        let (_, entry) = self.reassembly.remove(entry_pos);
        let envelope: String = entry
            .parts
            .into_iter()
            .map(|part| part.unwrap_or_default())
            .collect();
        match STANDARD.decode(&envelope) {
            Ok(update) => {
                if let Err(err) = self.crdt.apply_update(&update, UpdateOrigin::Peer) {
                    tracing::warn!("CRDT rejected reassembled update: {}", err);
                }
            }
            Err(err) => {
                tracing::warn!("Dropping reassembled update with invalid base64: {}", err);
            }
        }
    }
}

/// Split a base64 envelope into wire-sized slices.
///
/// Base64 is pure ASCII, so byte windows are character windows.
pub fn split_envelope(encoded: &str) -> Vec<&str> {
    encoded
        .as_bytes()
        .chunks(MAX_MESSAGE_CHUNK_SIZE)
        .map(|window| std::str::from_utf8(window).expect("base64 is ASCII"))
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================
