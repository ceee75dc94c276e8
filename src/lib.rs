//! # Slate Core
//!
//! The peer-to-peer collaboration core of Slate, a cross-platform
//! collaborative whiteboard. Two subsystems share one flow-controlled data
//! channel: replicated-document sync (opaque CRDT payloads with a
//! state-vector handshake) and reliable bulk file transfer (sliding
//! windows, selective ACK, retransmission, cancellation).
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         SLATE CORE MODULES                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  collaborator seams                 transport core                      │
//! │  ┌─────────────┐                    ┌─────────────────────────────────┐ │
//! │  │ crdt        │  opaque updates    │ network                         │ │
//! │  │             │◄──────────────────►│                                 │ │
//! │  │ - vectors   │                    │ - ChannelController (routing)   │ │
//! │  │ - diffs     │                    │ - SyncEngine (coalesce, chunk)  │ │
//! │  └─────────────┘                    │ - TransferEngine (windows, ACK) │ │
//! │  ┌─────────────┐   datagrams        │ - SendQueue (buffer budget)     │ │
//! │  │ channel     │◄──────────────────►│ - frame / protocol (wire)       │ │
//! │  │  (embedder  │                    │ - CollabSession (actor driver)  │ │
//! │  │   WebRTC)   │                    └─────────────────────────────────┘ │
//! │  └─────────────┘                                                        │
//! │  ┌─────────────┐   random-access reads                                  │
//! │  │ source      │──────────────────────► outgoing transfers              │
//! │  └─────────────┘                                                        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`error`] - Error types for the entire library
//! - [`crdt`] - The opaque CRDT seam (state vectors, diffs, updates)
//! - [`channel`] - The data-channel seam (send, buffer budget, events)
//! - [`source`] - Random-access file sources for outgoing transfers
//! - [`network`] - The transport core (sync, transfer, queue, controller)
//! - [`time`] - Platform-aware clock sampling
//!
//! ## What the core does NOT do
//!
//! Signaling and session establishment (a connected channel is handed in),
//! rendering, persistence of CRDT state, and cryptography all live with the
//! embedding application. The core is parameterized over its seams and owns
//! only the protocol.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod channel;
pub mod crdt;
pub mod error;
pub mod network;
pub mod source;
/// Platform-aware time utilities for native and WASM targets.
pub mod time;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use channel::{ChannelEvent, ChannelState, DataChannel};
pub use crdt::{CrdtHandle, UpdateOrigin};
pub use error::{Error, Result};
pub use network::{
    ChannelController, CollabEvent, ControlMessage, SendFileOptions, TransferDirection,
    TransferSnapshot, TransferStatus,
};
pub use source::{BytesSource, FileMetadata, FileSource};

#[cfg(not(target_arch = "wasm32"))]
pub use network::CollabSession;
#[cfg(not(target_arch = "wasm32"))]
pub use source::FsSource;
