//! Admin protocol error types.

/// Maximum admin frame size. Admin payloads are small; anything larger
/// is a broken or hostile client.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Errors produced by the framing and dispatch layers.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Frame length prefix exceeds the cap.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Declared frame size.
        size: usize,
        /// Allowed maximum.
        max: usize,
    },

    /// Transport failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload failed to decode as the tagged message type.
    #[error("message decode failed: {0}")]
    Decode(String),

    /// Unknown message-type tag.
    #[error("unknown message type tag {0}")]
    UnknownMessageType(u8),

    /// The frame was empty (no tag byte).
    #[error("empty frame")]
    EmptyFrame,
}

impl ProtocolError {
    /// Builds a `FrameTooLarge` error.
    #[must_use]
    pub const fn frame_too_large(size: usize, max: usize) -> Self {
        Self::FrameTooLarge { size, max }
    }
}

/// Result alias for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
