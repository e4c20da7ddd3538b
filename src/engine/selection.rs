use ulid::Ulid;

use crate::model::Span;

use super::conflict::find_conflicts;
use super::{ACTIVE_STATUSES, Engine, EngineError};

/// An active server as seen by the selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCandidate {
    pub id: Ulid,
    pub name: String,
    /// Active reservations overlapping the requested window.
    pub conflicts: usize,
}

/// Pick the server for a request.
///
/// Candidates are considered in name order. A preference naming exactly one
/// server wins outright, even a busy one; a hint contained in several names
/// only counts if it is one of those names exactly. Otherwise the first free
/// server wins, and failing that the first server.
pub fn select_server(candidates: &[ServerCandidate], preference: Option<&str>) -> Option<Ulid> {
    let mut ordered: Vec<&ServerCandidate> = candidates.iter().collect();
    ordered.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));

    if let Some(hint) = preference.map(str::trim).filter(|h| !h.is_empty()) {
        let hint = hint.to_lowercase();
        let matches: Vec<&ServerCandidate> = ordered
            .iter()
            .copied()
            .filter(|c| c.name.to_lowercase().contains(&hint))
            .collect();
        match matches.as_slice() {
            [only] => return Some(only.id),
            [] => {}
            several => {
                if let Some(exact) = several.iter().find(|c| c.name.to_lowercase() == hint) {
                    return Some(exact.id);
                }
            }
        }
    }

    ordered
        .iter()
        .find(|c| c.conflicts == 0)
        .or_else(|| ordered.first())
        .map(|c| c.id)
}

impl Engine {
    /// Snapshot every active server's load over `window` and run the selector.
    pub(super) async fn select_for(
        &self,
        preference: Option<&str>,
        window: &Span,
    ) -> Result<Ulid, EngineError> {
        let servers: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut candidates = Vec::with_capacity(servers.len());
        for ss in servers {
            let guard = ss.read().await;
            if !guard.info.active {
                continue;
            }
            candidates.push(ServerCandidate {
                id: guard.info.id,
                name: guard.info.name.clone(),
                conflicts: find_conflicts(&guard, window, &ACTIVE_STATUSES, None).len(),
            });
        }
        select_server(&candidates, preference).ok_or(EngineError::NoResourceAvailable)
    }
}
