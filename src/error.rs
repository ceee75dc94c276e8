//! # Error Handling
//!
//! Error types for Slate Core.
//!
//! ## Error Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level)                                                     │
//! │  │                                                                      │
//! │  ├── Channel Errors                                                    │
//! │  │   ├── ChannelClosed      - Channel closed with work outstanding     │
//! │  │   ├── ChannelNotOpen     - Send attempted before the channel opened │
//! │  │   ├── Backpressure       - Send buffer at or above the high-water   │
//! │  │   └── SendFailed         - The underlying channel rejected a send   │
//! │  │                                                                      │
//! │  ├── Transfer Errors                                                   │
//! │  │   ├── InitFailed         - file-init could not be delivered         │
//! │  │   ├── PeerReported       - The remote peer reported a failure       │
//! │  │   ├── Cancelled          - Transfer cancelled locally               │
//! │  │   ├── TransferNotFound   - Unknown transfer id                      │
//! │  │   └── SourceRead         - Reading the file source failed           │
//! │  │                                                                      │
//! │  └── Protocol Errors                                                   │
//! │      ├── FrameTooLarge      - Transfer id exceeds the frame header     │
//! │      └── Serialization      - Control message (de)serialization failed │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Parse errors of *inbound* traffic are deliberately not part of this
//! surface: malformed peer messages are logged and dropped so a buggy peer
//! cannot tear down the session.

use thiserror::Error;

/// Result type alias for Slate Core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Slate Core
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Channel Errors
    // ========================================================================

    /// The data channel closed while transfers were still in a non-terminal state
    #[error("Data channel closed unexpectedly")]
    ChannelClosed,

    /// A send was attempted while the channel was not open
    #[error("Data channel is not open")]
    ChannelNotOpen,

    /// The channel's send buffer is at or above the high-water mark
    #[error("Data channel send buffer is full")]
    Backpressure,

    /// The underlying channel rejected a send
    #[error("Channel send failed: {0}")]
    SendFailed(String),

    // ========================================================================
    // Transfer Errors
    // ========================================================================

    /// The file-init control message could not be delivered
    #[error("Failed to initiate transfer: {0}")]
    InitFailed(String),

    /// The remote peer reported a transfer failure
    #[error("Peer reported transfer error: {0}")]
    PeerReported(String),

    /// The transfer was cancelled locally
    #[error("Cancelled by user")]
    Cancelled,

    /// No transfer with the given id is known
    #[error("Transfer not found: {0}")]
    TransferNotFound(String),

    /// Reading a slice from the file source failed
    #[error("Failed to read file source: {0}")]
    SourceRead(String),

    // ========================================================================
    // Protocol Errors
    // ========================================================================

    /// A transfer id longer than 255 bytes cannot fit the frame header
    #[error("Transfer id too long for chunk frame: {0} bytes (max 255)")]
    FrameTooLarge(usize),

    /// A control message could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Check if this error is recoverable
    ///
    /// Recoverable errors resolve on their own once the channel drains or
    /// reopens; the work that hit them is re-queued rather than lost.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Backpressure | Error::ChannelNotOpen | Error::SendFailed(_)
        )
    }
}

// ============================================================================
// ERROR CONVERSIONS
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::SourceRead(err.to_string())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_errors() {
        assert!(Error::Backpressure.is_recoverable());
        assert!(Error::ChannelNotOpen.is_recoverable());
        assert!(Error::SendFailed("socket gone".into()).is_recoverable());
        assert!(!Error::ChannelClosed.is_recoverable());
        assert!(!Error::Cancelled.is_recoverable());
        assert!(!Error::FrameTooLarge(300).is_recoverable());
    }

    #[test]
    fn test_channel_closed_message_is_exact() {
        // Surfaced verbatim as the failure reason on channel teardown.
        assert_eq!(
            Error::ChannelClosed.to_string(),
            "Data channel closed unexpectedly"
        );
    }

    #[test]
    fn test_cancelled_message_is_exact() {
        assert_eq!(Error::Cancelled.to_string(), "Cancelled by user");
    }

    #[test]
    fn test_serde_json_conversion() {
        let bad: std::result::Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: Error = bad.unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
