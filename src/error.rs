//! Error handling module
//!
//! Defines the error types used across the gateway core.

use std::io;

use thiserror::Error;

/// Main error type for the gateway
#[derive(Error, Debug)]
pub enum GateError {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Wire-protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Binary codec errors
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Network-specific errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Send queue full")]
    SendQueueFull,

    #[error("Read error: {0}")]
    ReadError(String),

    #[error("Write error: {0}")]
    WriteError(String),
}

/// Wire-protocol errors. All of these are fatal to the connection that
/// produced them; none of them surface to the application beyond the
/// close event.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Reserved bits set in frame header")]
    ReservedBits,

    #[error("Invalid opcode: {0:#x}")]
    InvalidOpcode(u8),

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: u64, max: u32 },

    #[error("Malformed handshake: {0}")]
    MalformedHandshake(String),

    #[error("Handshake is not a websocket upgrade")]
    NotAnUpgrade,

    #[error("Unsupported websocket version: {0:?}")]
    UnsupportedVersion(Option<String>),

    #[error("Handshake key missing")]
    MissingKey,

    #[error("Accept token mismatch")]
    AcceptMismatch,

    #[error("Handler already registered for message id {0}")]
    DuplicateHandler(u32),
}

/// Binary codec errors. Truncated input and type mismatch are distinct
/// conditions and must never be conflated.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    #[error("Truncated input")]
    Truncated,

    #[error("Type mismatch: tag {tag:#x} does not satisfy {requested}")]
    TypeMismatch { tag: u8, requested: &'static str },

    #[error("Unsupported tag: {0:#x}")]
    Unsupported(u8),
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NetworkError::ConnectionClosed;
        assert_eq!(err.to_string(), "Connection closed");

        let err = ProtocolError::InvalidOpcode(0x7);
        assert_eq!(err.to_string(), "Invalid opcode: 0x7");

        let err = ProtocolError::MessageTooLarge {
            size: 70000,
            max: 65536,
        };
        assert_eq!(
            err.to_string(),
            "Message too large: 70000 bytes (max: 65536)"
        );
    }

    #[test]
    fn test_codec_error_distinct() {
        let truncated = CodecError::Truncated;
        let mismatch = CodecError::TypeMismatch {
            tag: 0xc2,
            requested: "u32",
        };
        assert_ne!(truncated, mismatch);
    }

    #[test]
    fn test_error_wrapping() {
        let err: GateError = NetworkError::SendQueueFull.into();
        assert!(matches!(err, GateError::Network(_)));

        let err: GateError = CodecError::Truncated.into();
        assert!(matches!(err, GateError::Codec(_)));
    }
}
