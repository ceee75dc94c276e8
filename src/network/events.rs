//! # Collaboration Events
//!
//! Everything the core surfaces to the application layer flows through one
//! event stream: transfer progress snapshots, completed files, pull
//! requests, chat passthrough, and queue telemetry. The controller buffers
//! events; the embedder (or the session driver) drains them after each
//! operation.

use serde::{Deserialize, Serialize};

use crate::source::FileMetadata;

// ============================================================================
// TRANSFER SNAPSHOTS
// ============================================================================

/// Direction of a transfer relative to us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferDirection {
    /// We are sending the file.
    Outgoing,
    /// We are receiving the file.
    Incoming,
}

/// Lifecycle state of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    /// Announced but no chunk acknowledged / received yet.
    Pending,
    /// Chunks are moving.
    InProgress,
    /// All bytes delivered and confirmed.
    Completed,
    /// The transfer failed (peer error, channel loss, init failure).
    Failed,
    /// Cancelled locally.
    Cancelled,
}

impl TransferStatus {
    /// Whether the transfer is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Point-in-time view of one transfer, surfaced on every state transition,
/// on ACK receipt (outgoing), and on chunk receipt (incoming).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferSnapshot {
    /// Transfer id.
    pub id: String,
    /// Outgoing or incoming.
    pub direction: TransferDirection,
    /// Current lifecycle state.
    pub status: TransferStatus,
    /// Bytes confirmed (acked for outgoing, received for incoming).
    pub bytes_transferred: u64,
    /// Total size of the file.
    pub total_bytes: u64,
    /// `bytes_transferred / total_bytes`, in `[0, 1]`.
    pub progress: f64,
    /// Rolling transfer speed in bytes per second.
    pub speed_bps: u64,
    /// Unix timestamp (ms) when the transfer was registered.
    pub started_at: i64,
    /// Unix timestamp (ms) of the last state change.
    pub updated_at: i64,
    /// Unix timestamp (ms) when the transfer reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    /// Failure or cancellation reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ============================================================================
// EVENTS
// ============================================================================

/// Events emitted by the channel controller for the application layer.
#[derive(Debug, Clone)]
pub enum CollabEvent {
    /// A transfer changed state or made progress.
    TransferUpdated(TransferSnapshot),

    /// An incoming transfer finalized; here are the assembled bytes.
    FileReceived {
        /// Name, MIME, size, and transfer id.
        metadata: FileMetadata,
        /// The reassembled file.
        data: Vec<u8>,
    },

    /// The peer asked us to send an asset (`file-request`). Answering it —
    /// typically by calling `send_file` — is the application's decision.
    FileRequested {
        /// Logical path of the requested asset.
        asset_path: String,
        /// Optional display name supplied by the peer.
        display_name: Option<String>,
    },

    /// Chat passthrough.
    Chat {
        /// Opaque chat payload.
        data: String,
        /// Sender-side Unix timestamp in milliseconds.
        timestamp: i64,
    },

    /// Telemetry: send-queue depth and channel buffer after a drain.
    QueueStats {
        /// Frames still waiting in the send queue.
        queued_packets: usize,
        /// Bytes across those frames.
        queued_bytes: usize,
        /// The channel's `buffered_amount` at sampling time.
        buffered_amount: usize,
    },
}

impl CollabEvent {
    /// The transfer id this event concerns, if any.
    pub fn transfer_id(&self) -> Option<&str> {
        match self {
            Self::TransferUpdated(snapshot) => Some(&snapshot.id),
            Self::FileReceived { metadata, .. } => Some(&metadata.id),
            _ => None,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
