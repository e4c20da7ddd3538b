use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const HOUR_MS: Ms = 3_600_000;

/// Opaque identity of whoever asked for a reservation.
pub type RequesterId = String;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Like `new`, but for untrusted input.
    pub fn checked(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn duration_hours(&self) -> f64 {
        self.duration_ms() as f64 / HOUR_MS as f64
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    PendingRejection,
    Rejected,
    Cancelled,
}

impl ReservationStatus {
    pub const ALL: [ReservationStatus; 5] = [
        ReservationStatus::Pending,
        ReservationStatus::Confirmed,
        ReservationStatus::PendingRejection,
        ReservationStatus::Rejected,
        ReservationStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Pending => "PENDING",
            ReservationStatus::Confirmed => "CONFIRMED",
            ReservationStatus::PendingRejection => "PENDING_REJECTION",
            ReservationStatus::Rejected => "REJECTED",
            ReservationStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ReservationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = s.trim().to_ascii_uppercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|st| st.as_str() == norm)
            .ok_or_else(|| format!("unknown reservation status: {s}"))
    }
}

/// How a conflict record was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    None,
    SystemArbitrated,
    UserConfirmed,
    UserRejected,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Resolution::None => "none",
            Resolution::SystemArbitrated => "system_arbitrated",
            Resolution::UserConfirmed => "user_confirmed",
            Resolution::UserRejected => "user_rejected",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuServer {
    pub id: Ulid,
    pub name: String,
    pub description: Option<String>,
    pub gpu_type: Option<String>,
    pub gpu_count: u32,
    pub active: bool,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub requester_id: RequesterId,
    pub server_id: Ulid,
    /// Natural-language text as submitted. Never rewritten.
    pub request_text: String,
    pub purpose: String,
    pub span: Span,
    pub priority: u8,
    pub status: ReservationStatus,
    pub rejection_reason: Option<String>,
    pub judgment_reason: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: Ulid,
    pub server_id: Ulid,
    pub new_reservation_id: Ulid,
    pub existing_reservation_id: Ulid,
    pub resolved: bool,
    pub resolution: Resolution,
    pub created_at: Ms,
}

/// Everything the engine knows about one server. Guarded by a per-server lock.
#[derive(Debug, Clone)]
pub struct ServerState {
    pub info: GpuServer,
    /// Sorted by `span.start`; equal starts keep insertion order.
    pub reservations: Vec<Reservation>,
    /// Append-only audit trail of arbitration decisions on this server.
    pub conflicts: Vec<Conflict>,
}

impl ServerState {
    pub fn new(info: GpuServer) -> Self {
        Self {
            info,
            reservations: Vec::new(),
            conflicts: Vec::new(),
        }
    }

    /// Insert maintaining sort order; lands after any reservation with the same start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.span.start <= reservation.span.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn reservation(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    pub fn reservation_mut(&mut self, id: &Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == *id)
    }

    pub fn conflict_mut(&mut self, id: &Ulid) -> Option<&mut Conflict> {
        self.conflicts.iter_mut().find(|c| c.id == *id)
    }

    /// Return only reservations whose span overlaps the query window.
    /// Uses binary search to skip reservations starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }
}

/// WAL record payload. A committed transaction is a `Vec<Event>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ServerCreated {
        server: GpuServer,
    },
    ServerUpdated {
        id: Ulid,
        name: String,
        description: Option<String>,
        gpu_type: Option<String>,
        gpu_count: u32,
    },
    ServerDeactivated {
        id: Ulid,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    StatusChanged {
        id: Ulid,
        server_id: Ulid,
        status: ReservationStatus,
        rejection_reason: Option<String>,
        judgment_reason: Option<String>,
        at: Ms,
    },
    ConflictRecorded {
        conflict: Conflict,
    },
    ConflictResolved {
        id: Ulid,
        server_id: Ulid,
        resolution: Resolution,
    },
}

impl Event {
    /// The server whose state this event mutates.
    pub fn server_id(&self) -> Ulid {
        match self {
            Event::ServerCreated { server } => server.id,
            Event::ServerUpdated { id, .. } | Event::ServerDeactivated { id } => *id,
            Event::ReservationCreated { reservation } => reservation.server_id,
            Event::StatusChanged { server_id, .. } | Event::ConflictResolved { server_id, .. } => {
                *server_id
            }
            Event::ConflictRecorded { conflict } => conflict.server_id,
        }
    }
}
