use std::collections::HashMap;

use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{ARBITRATIONS_TOTAL, RESERVATIONS_TOTAL};
use crate::oracle::{Judgment, fallback_judgment};
use crate::wal::Txn;

use super::conflict::{find_conflicts, now_ms, validate_span};
use super::lifecycle::transition;
use super::{ACTIVE_STATUSES, Engine, EngineError, status_changed};

pub(crate) const LOWER_PRIORITY_REASON: &str = "lower priority than an existing reservation";

impl Engine {
    /// Turn a natural-language request into a reservation, arbitrating
    /// against whatever it overlaps. "Now" is the reference time.
    pub async fn create_reservation(
        &self,
        requester_id: &str,
        request_text: &str,
    ) -> Result<Reservation, EngineError> {
        self.create_reservation_at(requester_id, request_text, now_ms())
            .await
    }

    /// Like [`Engine::create_reservation`], resolving relative times
    /// ("tomorrow at 9") against `reference`.
    pub async fn create_reservation_at(
        &self,
        requester_id: &str,
        request_text: &str,
        reference: Ms,
    ) -> Result<Reservation, EngineError> {
        let result = self.intake(requester_id, request_text, reference).await;
        let outcome = match &result {
            Ok(r) => match r.status {
                ReservationStatus::Confirmed => "confirmed",
                ReservationStatus::Rejected => "rejected",
                _ => "pending",
            },
            Err(_) => "failed",
        };
        metrics::counter!(RESERVATIONS_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    async fn intake(
        &self,
        requester_id: &str,
        request_text: &str,
        reference: Ms,
    ) -> Result<Reservation, EngineError> {
        if request_text.len() > MAX_REQUEST_TEXT_LEN {
            return Err(EngineError::LimitExceeded("request text too long"));
        }
        if requester_id.is_empty() || requester_id.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("requester id must be 1-128 bytes"));
        }
        if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&reference) {
            return Err(EngineError::LimitExceeded("timestamp out of range"));
        }

        let intent = self.oracle.parse_intent(request_text, reference).await;
        validate_span(&intent.span)?;
        let server_id = self
            .select_for(intent.preference.as_deref(), &intent.span)
            .await?;
        let priority = self
            .oracle
            .score_priority(&intent.purpose, intent.span.duration_hours())
            .await;

        let lock = self.arbitration_lock(server_id);
        let _arbitration = lock.lock().await;
        let ss = self
            .get_server_state(&server_id)
            .ok_or(EngineError::NotFound(server_id))?;

        let now = now_ms();
        let candidate = Reservation {
            id: Ulid::new(),
            requester_id: requester_id.to_string(),
            server_id,
            request_text: request_text.to_string(),
            purpose: intent.purpose,
            span: intent.span,
            priority,
            status: ReservationStatus::Pending,
            rejection_reason: None,
            judgment_reason: None,
            created_at: now,
            updated_at: now,
        };

        let incumbents = {
            let guard = ss.read().await;
            if guard.reservations.len() >= MAX_RESERVATIONS_PER_SERVER {
                return Err(EngineError::LimitExceeded("too many reservations on server"));
            }
            find_conflicts(&guard, &candidate.span, &ACTIVE_STATUSES, None)
        };
        debug!(
            reservation_id = %candidate.id,
            server_id = %server_id,
            conflicts = incumbents.len(),
            "detected conflicts"
        );

        // Judge against the snapshot with no state lock held.
        let mut judgments = HashMap::new();
        for incumbent in &incumbents {
            let judgment = self.oracle.judge_conflict(&candidate, incumbent).await;
            let stop = !judgment.prefer_new;
            judgments.insert(incumbent.id, judgment);
            if stop {
                break;
            }
        }

        let mut guard = ss.write().await;
        let current = find_conflicts(&guard, &candidate.span, &ACTIVE_STATUSES, None);
        let (txn, created) = arbitrate(candidate, &current, &judgments, now)?;
        self.persist_and_apply(server_id, &mut guard, &txn)
            .await
            .map_err(EngineError::into_intake)?;

        info!(
            reservation_id = %created.id,
            server_id = %server_id,
            status = %created.status,
            priority = created.priority,
            conflicts = current.len(),
            "reservation created"
        );
        Ok(created)
    }
}

/// Build the creation transaction for `candidate` against the incumbents
/// currently overlapping it, in detection order.
///
/// Judgments missing from `judged` (incumbents that appeared after the
/// snapshot) are decided by priority. The first incumbent that prevails
/// rejects the candidate and ends arbitration; displacements decided before
/// that point are dropped and the records examined so far are stored as
/// system-arbitrated.
pub(super) fn arbitrate(
    mut candidate: Reservation,
    incumbents: &[Reservation],
    judged: &HashMap<Ulid, Judgment>,
    now: Ms,
) -> Result<(Txn, Reservation), EngineError> {
    let mut txn = vec![Event::ReservationCreated {
        reservation: candidate.clone(),
    }];

    if incumbents.is_empty() {
        transition(&mut candidate, ReservationStatus::Confirmed, now)?;
        txn.push(status_changed(&candidate));
        return Ok((txn, candidate));
    }

    let mut records = Vec::new();
    let mut displaced = Vec::new();
    let mut halted = false;

    for incumbent in incumbents {
        let judgment = judged
            .get(&incumbent.id)
            .cloned()
            .unwrap_or_else(|| fallback_judgment(candidate.priority, incumbent.priority));
        let winner = if judgment.prefer_new { "new" } else { "existing" };
        metrics::counter!(ARBITRATIONS_TOTAL, "winner" => winner).increment(1);

        records.push(Conflict {
            id: Ulid::new(),
            server_id: candidate.server_id,
            new_reservation_id: candidate.id,
            existing_reservation_id: incumbent.id,
            resolved: false,
            resolution: Resolution::None,
            created_at: now,
        });

        if judgment.prefer_new {
            let mut loser = incumbent.clone();
            transition(&mut loser, ReservationStatus::PendingRejection, now)?;
            loser.judgment_reason = Some(judgment.reason);
            displaced.push(loser);
        } else {
            debug!(
                reservation_id = %candidate.id,
                incumbent_id = %incumbent.id,
                reason = %judgment.reason,
                "incumbent prevailed"
            );
            transition(&mut candidate, ReservationStatus::Rejected, now)?;
            candidate.rejection_reason = Some(LOWER_PRIORITY_REASON.to_string());
            candidate.judgment_reason = Some(judgment.reason);
            halted = true;
            break;
        }
    }

    if halted {
        for record in &mut records {
            record.resolved = true;
            record.resolution = Resolution::SystemArbitrated;
        }
        displaced.clear();
    }

    txn.extend(
        records
            .into_iter()
            .map(|conflict| Event::ConflictRecorded { conflict }),
    );
    txn.extend(displaced.iter().map(status_changed));
    if halted {
        txn.push(status_changed(&candidate));
    }
    Ok((txn, candidate))
}
