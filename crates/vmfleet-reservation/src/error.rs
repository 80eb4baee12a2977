//! Reservation error types.

use thiserror::Error;

/// Errors surfaced by the reservation transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("submission rejected: {0}")]
    Rejected(String),

    #[error("scheduler unreachable: {0}")]
    Unreachable(String),

    #[error("no job handle returned")]
    NoHandle,

    #[error("unknown job: {0}")]
    UnknownJob(String),
}

/// Errors that can occur while reserving capacity.
#[derive(Debug, Error)]
pub enum ReservationError {
    /// Carries the command an operator can run by hand.
    #[error("reservation failed: {reason}\nsubmit it manually with:\n{command}")]
    ReservationFailed { reason: String, command: String },

    #[error("invalid job spec: {0}")]
    InvalidSpec(String),

    #[error("cancellation failed: {0}")]
    Cancel(#[from] TransportError),
}

pub type ReservationResult<T> = Result<T, ReservationError>;
