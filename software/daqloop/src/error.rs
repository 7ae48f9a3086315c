//! Failure modes of a control session.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::peripheral::PortError;

/// Errors surfaced by the control loop and its configuration.
#[derive(Error, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum LoopError {
    /// Invalid channel, non-positive rate, or device unavailable at start.
    /// The loop never enters `Running`.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// `start` was called while a session was already active.
    #[error("Control loop is already running")]
    AlreadyRunning,

    /// A read or write failed for a reason other than a buffer overrun.
    /// Fatal for the session.
    #[error("Hardware error: {0}")]
    Hardware(String),

    /// The input buffer filled before the loop drained it.
    /// Recovered inside the loop by lowering the sampling rate.
    #[error("Input buffer overflow")]
    Overflow,
}

impl From<PortError> for LoopError {
    fn from(e: PortError) -> Self {
        match e {
            PortError::Overflow => Self::Overflow,
            PortError::Hardware(msg) => Self::Hardware(msg),
            PortError::Configuration(msg) => Self::Configuration(msg),
        }
    }
}
