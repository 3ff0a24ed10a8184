//! Error types for tether.

use thiserror::Error;

/// Main error type for all tether operations.
#[derive(Debug, Error)]
pub enum TetherError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error (default payload serializer
    /// and handshake bodies).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Protocol error (invalid block kind, malformed envelope, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration value.
    #[error("Config error: {0}")]
    Config(String),

    /// Connection closed; the operation can no longer complete.
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Result type alias using TetherError.
pub type Result<T> = std::result::Result<T, TetherError>;
