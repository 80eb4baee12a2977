//! Planner error types.

use thiserror::Error;

/// Errors that can occur while planning a reservation.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("unknown pool: {0} is not a site or cluster")]
    UnknownPool(String),

    #[error("no slot found: {0}")]
    NoSlotFound(String),

    #[error("capacity service error: {0}")]
    Capacity(String),
}

pub type PlanResult<T> = Result<T, PlanError>;
