//! Error types for telestar

use crate::node::fsm::FatalCondition;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Wire Errors ===
    #[error("Malformed frame: {0}")]
    Malformed(String),

    // === Storage Errors ===
    #[error("Corrupted artifact: {0}")]
    Corrupted(String),

    #[error("Checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("Replica transport failed: {0}")]
    Transport(String),

    // === Failover Errors ===
    #[error("Fatal failover condition: {0}")]
    Fatal(#[from] FatalCondition),

    // === Network Errors ===
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Config loader error: {0}")]
    ConfigLoader(#[from] config::ConfigError),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Timeout(_) | Error::ConnectionFailed(_) | Error::Transport(_)
        )
    }

    /// Fatal errors end the server loop; everything else is handled locally.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }
}
