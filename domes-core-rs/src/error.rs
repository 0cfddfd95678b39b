//! Error types for the DOMES pod protocol

use thiserror::Error;

/// Frame decoding/encoding failures. Inbound frames that fail to decode are
/// counted and dropped, never propagated further.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Frame too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("Frame too large: {0} bytes exceeds the medium MTU")]
    TooLarge(usize),

    #[error("Unsupported wire version: {0}")]
    BadVersion(u8),

    #[error("Unknown message type: 0x{0:02x}")]
    UnknownType(u8),

    #[error("Payload length mismatch for {msg_type}: expected {expected}, got {actual}")]
    PayloadLength {
        msg_type: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// Transport failures. Sends never block; a failed send is reported back to
/// the coordinator as data, not as a fatal error.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No link-layer route to pod {0}")]
    UnknownPeer(String),

    #[error("Frame of {0} bytes exceeds the medium MTU")]
    FrameTooLarge(usize),

    #[error("Transport is closed")]
    Closed,
}

/// Requests the session layer refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("This pod is not the master")]
    NotMaster,

    #[error("A drill is already running")]
    DrillAlreadyRunning,

    #[error("No drill is running")]
    NoDrillRunning,

    #[error("Invalid drill program: {0}")]
    InvalidProgram(String),

    #[error("Coordinator has stopped")]
    Stopped,
}

/// Configuration loading failures
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
