//! # Control Messages
//!
//! Every non-binary message on the channel is one JSON object with a `type`
//! discriminator. Two families share the pipe:
//!
//! - `yjs-*` and `chat` — document sync traffic, handled by the sync engine.
//! - `file-*` — file transfer control, handled by the transfer engine.
//!
//! The wire shape is frozen: kebab-case type tags, snake_case fields,
//! optional fields omitted entirely when absent. Unknown types parse as an
//! error here and are dropped by the dispatcher, never bounced to the peer.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A control message, as serialized to one UTF-8 text datagram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// "Here is my state vector; send me what I'm missing."
    YjsSync {
        /// Base64-encoded state vector.
        vector: String,
    },

    /// A document update small enough for a single message.
    YjsUpdate {
        /// Base64-encoded update payload.
        update: String,
    },

    /// One slice of an oversized document update.
    YjsUpdateChunk {
        /// Chunk-set id; all slices of one update share it.
        id: String,
        /// Zero-based slice index.
        index: u32,
        /// Total slices in this chunk set.
        total: u32,
        /// This slice of the base64 envelope.
        chunk: String,
    },

    /// Opaque chat message, passed through to the collaborator.
    Chat {
        /// Chat payload (the core does not interpret it).
        data: String,
        /// Sender-side Unix timestamp in milliseconds.
        timestamp: i64,
    },

    /// Announces an outgoing transfer and its chunk geometry.
    FileInit {
        /// Transfer id.
        id: String,
        /// Display name of the file.
        name: String,
        /// Total file size in bytes.
        size: u64,
        /// MIME type, when known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime: Option<String>,
        /// Chunk size the sender will slice with.
        chunk_size: u32,
        /// Total number of chunk frames to expect.
        total_chunks: u32,
        /// Logical asset path, for transfers answering a `file-request`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        asset_path: Option<String>,
    },

    /// Selective acknowledgment from the receiver.
    FileAck {
        /// Transfer id.
        id: String,
        /// Sequences acknowledged by this message.
        acked: Vec<u32>,
        /// Receiver's running byte count.
        received_bytes: u64,
        /// Receiver's running chunk count.
        received_chunks: u32,
        /// Gaps observed below the highest received sequence.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        missing: Option<Vec<u32>>,
    },

    /// Standalone retransmission request from the receiver.
    FileResend {
        /// Transfer id.
        id: String,
        /// Sequences to re-send.
        missing: Vec<u32>,
    },

    /// Receiver has assembled the whole file.
    FileComplete {
        /// Transfer id.
        id: String,
    },

    /// Transfer failure, sent by either side.
    FileError {
        /// Transfer id.
        id: String,
        /// Human-readable reason (`"cancelled"` for local cancellation).
        reason: String,
    },

    /// Out-of-band pull request: "please send me this asset."
    FileRequest {
        /// Logical path of the requested asset.
        asset_path: String,
        /// Optional display name for the receiving UI.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },
}

impl ControlMessage {
    /// The transfer id, for `file-*` messages that carry one.
    pub fn transfer_id(&self) -> Option<&str> {
        match self {
            Self::FileInit { id, .. }
            | Self::FileAck { id, .. }
            | Self::FileResend { id, .. }
            | Self::FileComplete { id }
            | Self::FileError { id, .. } => Some(id),
            _ => None,
        }
    }

    /// Whether this message belongs to the sync engine (`yjs-*` / `chat`).
    pub fn is_sync_traffic(&self) -> bool {
        matches!(
            self,
            Self::YjsSync { .. }
                | Self::YjsUpdate { .. }
                | Self::YjsUpdateChunk { .. }
                | Self::Chat { .. }
        )
    }

    /// Serialize to the wire text form.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a wire text message.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

// ============================================================================
// TESTS
// ============================================================================
