use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::MAX_REASON_LEN;
use crate::model::*;
use crate::observability::CONFIRMATIONS_TOTAL;
use crate::wal::Txn;

use super::conflict::{confirmed_overlap, now_ms};
use super::lifecycle::{override_to_rejected, transition};
use super::{Engine, EngineError, status_changed};

pub(crate) const ACCEPTED_REASON: &str = "displacement accepted by requester";
pub(crate) const PREVAILED_REASON: &str = "incumbent reservation prevailed";
pub(crate) const CANCELLED_REASON: &str = "cancelled by requester";

impl Engine {
    /// Settle a pending-rejection notice.
    ///
    /// `confirm = true` accepts the displacement: the reservation is
    /// cancelled and the reservations that displaced it are confirmed where
    /// the schedule allows. `confirm = false` contests it: the reservation is
    /// restored to `CONFIRMED` and every displacer is rejected.
    pub async fn resolve_confirmation(
        &self,
        reservation_id: Ulid,
        requester_id: &str,
        confirm: bool,
        reason: Option<&str>,
    ) -> Result<Reservation, EngineError> {
        check_reason(reason)?;
        let (server_id, mut guard) = self.resolve_reservation_write(&reservation_id).await?;
        let target = guard
            .reservation(&reservation_id)
            .filter(|r| r.requester_id == requester_id)
            .filter(|r| r.status == ReservationStatus::PendingRejection)
            .cloned()
            .ok_or(EngineError::NotFound(reservation_id))?;

        let now = now_ms();
        let (txn, updated) = if confirm {
            accept_displacement(&guard, target, reason, now)?
        } else {
            contest_displacement(&guard, target, now)?
        };
        self.persist_and_apply(server_id, &mut guard, &txn).await?;

        let decision = if confirm { "accepted" } else { "contested" };
        metrics::counter!(CONFIRMATIONS_TOTAL, "decision" => decision).increment(1);
        info!(
            reservation_id = %reservation_id,
            server_id = %server_id,
            decision,
            reason = reason.unwrap_or_default(),
            status = %updated.status,
            "confirmation resolved"
        );
        Ok(updated)
    }

    /// Withdraw a reservation. A reservation that is waiting on a
    /// displacement notice is cancelled as if the displacement were accepted.
    pub async fn cancel_reservation(
        &self,
        reservation_id: Ulid,
        requester_id: &str,
        reason: Option<&str>,
    ) -> Result<Reservation, EngineError> {
        check_reason(reason)?;
        let (server_id, mut guard) = self.resolve_reservation_write(&reservation_id).await?;
        let target = guard
            .reservation(&reservation_id)
            .filter(|r| r.requester_id == requester_id)
            .cloned()
            .ok_or(EngineError::NotFound(reservation_id))?;

        let now = now_ms();
        let (txn, updated) = if target.status == ReservationStatus::PendingRejection {
            accept_displacement(&guard, target, reason, now)?
        } else {
            let mut target = target;
            transition(&mut target, ReservationStatus::Cancelled, now)?;
            target.rejection_reason = Some(reason.unwrap_or(CANCELLED_REASON).to_string());
            (vec![status_changed(&target)], target)
        };
        self.persist_and_apply(server_id, &mut guard, &txn).await?;

        info!(
            reservation_id = %reservation_id,
            server_id = %server_id,
            "reservation cancelled"
        );
        Ok(updated)
    }
}

fn check_reason(reason: Option<&str>) -> Result<(), EngineError> {
    match reason {
        Some(r) if r.len() > MAX_REASON_LEN => Err(EngineError::LimitExceeded("reason too long")),
        _ => Ok(()),
    }
}

/// Unresolved conflict records in which `incumbent` was the existing side.
fn open_records(state: &ServerState, incumbent: Ulid) -> Vec<Conflict> {
    state
        .conflicts
        .iter()
        .filter(|c| !c.resolved && c.existing_reservation_id == incumbent)
        .cloned()
        .collect()
}

/// Cancel `target` and promote its still-pending displacers.
fn accept_displacement(
    state: &ServerState,
    mut target: Reservation,
    reason: Option<&str>,
    now: Ms,
) -> Result<(Txn, Reservation), EngineError> {
    transition(&mut target, ReservationStatus::Cancelled, now)?;
    target.rejection_reason = Some(reason.unwrap_or(ACCEPTED_REASON).to_string());
    let mut txn = vec![status_changed(&target)];

    let mut promoted: Vec<Reservation> = Vec::new();
    for record in open_records(state, target.id) {
        txn.push(Event::ConflictResolved {
            id: record.id,
            server_id: record.server_id,
            resolution: Resolution::UserConfirmed,
        });

        let Some(displacer) = state.reservation(&record.new_reservation_id) else {
            continue;
        };
        if displacer.status != ReservationStatus::Pending {
            continue;
        }
        let blocked = confirmed_overlap(state, &displacer.span, &[target.id, displacer.id])
            .or_else(|| {
                promoted
                    .iter()
                    .find(|p| p.span.overlaps(&displacer.span))
                    .map(|p| p.id)
            });
        if let Some(blocker) = blocked {
            warn!(
                reservation_id = %displacer.id,
                blocked_by = %blocker,
                "skipping promotion: window overlaps a confirmed reservation"
            );
            continue;
        }

        let mut displacer = displacer.clone();
        transition(&mut displacer, ReservationStatus::Confirmed, now)?;
        txn.push(status_changed(&displacer));
        promoted.push(displacer);
    }

    Ok((txn, target))
}

/// Restore `target` and reject every reservation that displaced it.
fn contest_displacement(
    state: &ServerState,
    mut target: Reservation,
    now: Ms,
) -> Result<(Txn, Reservation), EngineError> {
    let records = open_records(state, target.id);
    let mut ignore: Vec<Ulid> = records.iter().map(|c| c.new_reservation_id).collect();
    ignore.push(target.id);
    if let Some(blocker) = confirmed_overlap(state, &target.span, &ignore) {
        return Err(EngineError::Conflict(blocker));
    }

    transition(&mut target, ReservationStatus::Confirmed, now)?;
    let mut txn = vec![status_changed(&target)];

    for record in records {
        txn.push(Event::ConflictResolved {
            id: record.id,
            server_id: record.server_id,
            resolution: Resolution::UserRejected,
        });
        if let Some(displacer) = state.reservation(&record.new_reservation_id) {
            let mut displacer = displacer.clone();
            override_to_rejected(&mut displacer, PREVAILED_REASON, now);
            txn.push(status_changed(&displacer));
        }
    }

    Ok((txn, target))
}
