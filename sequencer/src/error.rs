//! Error types for the sop sequencer
//!
//! Operational failures (a device replying `success=false`, a batch timing
//! out) are not errors at this level: they surface as `false` from
//! [`MultiCommand::run`](crate::coordinator::MultiCommand::run) and are
//! recorded in the command state. The variants here are for requests that
//! must be refused and for contract violations that should fail loudly.

use crate::cmd_state::StageState;
use crate::message::Device;
use thiserror::Error;

/// Main error type for the sequencer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SopError {
    // =========================================================================
    // Command State Errors
    // =========================================================================

    /// Stage name is not declared by the command
    #[error("{command} has no stage named '{stage}'")]
    InvalidStage { command: String, stage: String },

    /// Stage would move backwards, or out of off or a terminal state
    #[error("{command} stage '{stage}' cannot go from {from} to {to}")]
    InvalidStageTransition {
        command: String,
        stage: String,
        from: StageState,
        to: StageState,
    },

    /// Stage state string does not name a legal state
    #[error("Invalid stage state: {0}")]
    InvalidStageState(String),

    /// Command status string does not name a legal status
    #[error("Invalid command status: {0}")]
    InvalidCommandStatus(String),

    // =========================================================================
    // Messaging Errors
    // =========================================================================

    /// No worker channel is registered for this device
    #[error("No channel registered for {0}")]
    ChannelUnavailable(Device),

    /// The reply channel was closed before the message was sent
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// A worker received a message kind it does not implement
    #[error("{device} cannot handle {kind} messages")]
    UnhandledMessage { device: Device, kind: String },

    // =========================================================================
    // Device State Errors
    // =========================================================================

    /// Device status is contradictory or missing where it must be known
    #[error("Indeterminate state for {device}: {detail}")]
    IndeterminateState { device: Device, detail: String },

    /// Precondition was built with a message kind that does not fit the device
    #[error("Precondition on {device} does not understand {kind}")]
    InvalidPrecondition { device: Device, kind: String },

    // =========================================================================
    // Request Errors
    // =========================================================================

    /// User request refused before anything was queued
    #[error("{0}")]
    Rejected(String),

    /// Bypass name is not known
    #[error("{0} is not a recognised and bypassable subSystem")]
    UnknownBypass(String),

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

impl SopError {
    /// Check whether the error is a refused user request rather than a bug
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            SopError::Rejected(_) | SopError::UnknownBypass(_) | SopError::InvalidParameter(_)
        )
    }
}

/// Result type for sequencer operations
pub type SopResult<T> = Result<T, SopError>;
