//! Error types for the sop bridge
//!
//! Everything that can go wrong between process start-up and a running
//! sequencer: runtime creation, settings files, log directories, and
//! rejections coming back from the sequencer itself.

use sop_sequencer::SopError;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum BridgeError {
    // =========================================================================
    // Start-up
    // =========================================================================

    #[error("Runtime initialization failed: {0}")]
    RuntimeInitFailed(String),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Sequencer not started")]
    NotStarted,

    // =========================================================================
    // Sequencer
    // =========================================================================

    #[error("Sequencer error: {0}")]
    Sequencer(#[from] SopError),

    // =========================================================================
    // System
    // =========================================================================

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// A user request the sequencer refused, rather than a fault
    pub fn is_rejection(&self) -> bool {
        matches!(self, BridgeError::Sequencer(e) if e.is_rejection())
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(e: std::io::Error) -> Self {
        BridgeError::IoError(e.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Serialization(e.to_string())
    }
}

impl From<tokio::task::JoinError> for BridgeError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_panic() {
            BridgeError::Internal("Task panicked".to_string())
        } else {
            BridgeError::Internal(format!("Task join error: {}", e))
        }
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
