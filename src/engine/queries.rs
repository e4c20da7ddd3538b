use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

/// Reservation listing criteria. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationFilter {
    pub requester_id: Option<RequesterId>,
    pub status: Option<ReservationStatus>,
    pub server_id: Option<Ulid>,
    /// Shorthand for `status = PENDING_REJECTION`.
    pub pending_rejection: bool,
}

impl ReservationFilter {
    pub fn matches(&self, r: &Reservation) -> bool {
        self.requester_id
            .as_ref()
            .is_none_or(|id| *id == r.requester_id)
            && self.status.is_none_or(|s| s == r.status)
            && self.server_id.is_none_or(|s| s == r.server_id)
            && (!self.pending_rejection || r.status == ReservationStatus::PendingRejection)
    }
}

impl Engine {
    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let server_id = self
            .get_server_for_reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        let ss = self
            .get_server_state(&server_id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = ss.read().await;
        guard.reservation(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Matching reservations, newest first.
    pub async fn list_reservations(&self, filter: &ReservationFilter) -> Vec<Reservation> {
        let servers: Vec<_> = match filter.server_id {
            Some(id) => self.get_server_state(&id).into_iter().collect(),
            None => self.state.iter().map(|e| e.value().clone()).collect(),
        };

        let mut out = Vec::new();
        for ss in servers {
            let guard = ss.read().await;
            out.extend(guard.reservations.iter().filter(|r| filter.matches(r)).cloned());
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        out
    }

    /// Conflict records in which the reservation took part on either side,
    /// oldest first.
    pub async fn get_conflicts(&self, reservation_id: Ulid) -> Result<Vec<Conflict>, EngineError> {
        let server_id = self
            .get_server_for_reservation(&reservation_id)
            .ok_or(EngineError::NotFound(reservation_id))?;
        let ss = self
            .get_server_state(&server_id)
            .ok_or(EngineError::NotFound(reservation_id))?;
        let guard = ss.read().await;
        Ok(guard
            .conflicts
            .iter()
            .filter(|c| {
                c.new_reservation_id == reservation_id || c.existing_reservation_id == reservation_id
            })
            .cloned()
            .collect())
    }

    pub async fn get_server(&self, id: Ulid) -> Result<GpuServer, EngineError> {
        let ss = self.get_server_state(&id).ok_or(EngineError::NotFound(id))?;
        let guard = ss.read().await;
        Ok(guard.info.clone())
    }

    /// Servers in name order.
    pub async fn list_servers(&self, include_inactive: bool) -> Vec<GpuServer> {
        let servers: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(servers.len());
        for ss in servers {
            let guard = ss.read().await;
            if include_inactive || guard.info.active {
                out.push(guard.info.clone());
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub(crate) fn find_server_by_name(&self, name: &str) -> Option<Ulid> {
        self.server_names.get(name).map(|e| *e.value())
    }
}
