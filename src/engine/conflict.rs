use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or_default()
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start >= span.end {
        return Err(EngineError::LimitExceeded("window must end after it starts"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// Reservations on `state` whose window overlaps `window` and whose status is
/// in `statuses`, optionally skipping `exclude`.
///
/// Ordered by ascending start; equal starts keep creation order.
pub fn find_conflicts(
    state: &ServerState,
    window: &Span,
    statuses: &[ReservationStatus],
    exclude: Option<Ulid>,
) -> Vec<Reservation> {
    state
        .overlapping(window)
        .filter(|r| statuses.contains(&r.status))
        .filter(|r| Some(r.id) != exclude)
        .cloned()
        .collect()
}

/// First `CONFIRMED` reservation overlapping `window` that is not in `ignore`.
pub fn confirmed_overlap(state: &ServerState, window: &Span, ignore: &[Ulid]) -> Option<Ulid> {
    state
        .overlapping(window)
        .find(|r| r.status == ReservationStatus::Confirmed && !ignore.contains(&r.id))
        .map(|r| r.id)
}
