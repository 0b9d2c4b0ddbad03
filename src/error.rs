//! Error types shared across the broker

use thiserror::Error;

/// Errors surfaced by transports, endpoints and the coordinator registry
#[derive(Debug, Error)]
pub enum Error {
    #[error("transport closed ({0})")]
    Transport(String),

    #[error("timeout waiting for ({0})")]
    Timeout(String),

    #[error("received unknown message response type ({0})")]
    Protocol(u32),

    #[error("the object ({0}) isn't registered")]
    ObjectNotFound(String),

    #[error("failed to find source ({0})")]
    SourceNotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("object ({0}) is read-only")]
    ReadOnly(String),

    #[error("{0}")]
    Nack(String),

    #[error("frame too large: max {max} got {got}")]
    FrameTooLarge { max: usize, got: usize },

    #[error("frame crc mismatch: expected {expected} got {got}")]
    FrameCrcMismatch { expected: u32, got: u32 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl Error {
    /// Check whether this error is a request deadline expiry
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// Check whether this error came back as a peer Nack
    pub fn is_nack(&self) -> bool {
        matches!(self, Error::Nack(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
