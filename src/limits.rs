use crate::model::{HOUR_MS, Ms};

pub const MAX_SERVERS: usize = 1_000;
pub const MAX_NAME_LEN: usize = 128;
pub const MAX_DESCRIPTION_LEN: usize = 1_024;
pub const MAX_REQUEST_TEXT_LEN: usize = 4_096;
pub const MAX_REASON_LEN: usize = 1_024;
pub const MAX_RESERVATIONS_PER_SERVER: usize = 100_000;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// One booking may hold a server for at most 31 days.
pub const MAX_SPAN_DURATION_MS: Ms = 31 * 24 * HOUR_MS;
