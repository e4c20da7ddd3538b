//! Reservation status state machine.
//!
//! ```text
//! PENDING            -> CONFIRMED | REJECTED | PENDING_REJECTION | CANCELLED
//! CONFIRMED          -> PENDING_REJECTION | CANCELLED
//! PENDING_REJECTION  -> CONFIRMED | CANCELLED
//! REJECTED, CANCELLED   terminal
//! ```
//!
//! The contest cascade is the one path allowed to bypass the table: a
//! displacing reservation is forced to `REJECTED` from any status through
//! [`override_to_rejected`].

use ulid::Ulid;

use crate::model::{Ms, Reservation, ReservationStatus};

use super::EngineError;

use ReservationStatus::*;

/// Statuses that block a new booking.
pub const ACTIVE_STATUSES: [ReservationStatus; 2] = [Pending, Confirmed];

impl ReservationStatus {
    pub fn can_transition_to(self, next: ReservationStatus) -> bool {
        matches!(
            (self, next),
            (Pending, Confirmed | Rejected | PendingRejection | Cancelled)
                | (Confirmed, PendingRejection | Cancelled)
                | (PendingRejection, Confirmed | Cancelled)
        )
    }
}

pub fn check_transition(
    id: Ulid,
    from: ReservationStatus,
    to: ReservationStatus,
) -> Result<(), EngineError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition { id, from, to })
    }
}

/// Validate and apply a transition to a working copy.
pub fn transition(
    reservation: &mut Reservation,
    to: ReservationStatus,
    at: Ms,
) -> Result<(), EngineError> {
    check_transition(reservation.id, reservation.status, to)?;
    reservation.status = to;
    reservation.updated_at = at;
    Ok(())
}

/// Contest cascade: the displacing side loses whatever its status.
pub fn override_to_rejected(reservation: &mut Reservation, reason: &str, at: Ms) {
    reservation.status = Rejected;
    reservation.rejection_reason = Some(reason.to_string());
    reservation.updated_at = at;
}
