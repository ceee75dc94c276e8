//! # Data Channel Seam
//!
//! The core is handed an already-connected, browser-style data channel:
//! a bidirectional datagram pipe that accepts text or binary messages,
//! exposes how many bytes sit unsent in its buffer, and fires a low-water
//! callback when that buffer drains below a configurable threshold.
//!
//! Signaling and session establishment are the embedder's problem; the core
//! only sends, reads `buffered_amount`, and reacts to [`ChannelEvent`]s the
//! embedder feeds in.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  embedder (WebRTC / in-memory / test double)                │
//! │       │ events: open / close / error / low-water / message  │
//! │       ▼                                                     │
//! │  ChannelController ──send_text / send_binary──► channel     │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use crate::error::Result;

/// Ready state of the underlying data channel.
///
/// Mirrors the browser data-channel states, with `NotInitiated` for a
/// handle that was constructed but never connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// The channel is being established.
    Connecting,
    /// The channel is open and can send.
    Open,
    /// The channel is shutting down.
    Closing,
    /// The channel is closed.
    Closed,
    /// No channel was ever established.
    NotInitiated,
}

impl ChannelState {
    /// Whether sends are currently possible.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

/// Events the embedder feeds into the controller as they occur on the
/// underlying channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The channel transitioned to open.
    Open,
    /// The channel closed.
    Closed,
    /// The channel errored. Treated like a close for transfer state.
    Error(String),
    /// The send buffer drained below the configured low-water threshold.
    BufferedAmountLow,
    /// An inbound UTF-8 text message (control JSON).
    Text(String),
    /// An inbound binary message (chunk frame, or noise to be dropped).
    Binary(Vec<u8>),
}

impl ChannelEvent {
    /// Whether this event changes the channel lifecycle (as opposed to
    /// carrying a message or a flow-control hint).
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Self::Open | Self::Closed | Self::Error(_))
    }
}

/// Handle to the underlying data channel.
///
/// Implementations must be cheap to call from the controller's single task;
/// `send_*` are synchronous and report failure via `Result` (the browser
/// `send()` throws on an invalid state, native stacks return an error).
pub trait DataChannel: Send + Sync {
    /// Send a UTF-8 text message (control JSON).
    fn send_text(&self, text: &str) -> Result<()>;

    /// Send a binary message (an encoded chunk frame).
    fn send_binary(&self, data: &[u8]) -> Result<()>;

    /// Bytes accepted by `send_*` but not yet handed to the transport.
    fn buffered_amount(&self) -> usize;

    /// Current ready state.
    fn ready_state(&self) -> ChannelState;

    /// Configure the threshold below which the channel fires
    /// [`ChannelEvent::BufferedAmountLow`].
    fn set_buffered_amount_low_threshold(&self, bytes: usize);
}
