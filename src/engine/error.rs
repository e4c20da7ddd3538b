use thiserror::Error;
use ulid::Ulid;

use crate::model::ReservationStatus;

#[derive(Debug, Error)]
pub enum EngineError {
    /// There is no active server at all.
    #[error("no active GPU server available")]
    NoResourceAvailable,
    /// Creation could not be committed; nothing was applied.
    #[error("reservation intake failed: {0}")]
    IntakeFailure(String),
    /// Missing, owned by someone else, or not in a state the operation accepts.
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: Ulid,
        from: ReservationStatus,
        to: ReservationStatus,
    },
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// Restoring a reservation would overlap this confirmed reservation.
    #[error("conflict with confirmed reservation: {0}")]
    Conflict(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    /// Storage failures during intake surface as `IntakeFailure`.
    pub(crate) fn into_intake(self) -> Self {
        match self {
            EngineError::WalError(e) => EngineError::IntakeFailure(e),
            other => other,
        }
    }
}
