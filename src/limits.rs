use crate::model::Ms;

pub const MAX_ROOMS: usize = 10_000;
pub const MAX_USERS: usize = 100_000;
pub const MAX_BOOKINGS_PER_ROOM: usize = 100_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_LOCATION_LEN: usize = 256;
pub const MAX_PURPOSE_LEN: usize = 1024;
pub const MAX_AMENITIES: usize = 64;
pub const MAX_PARTICIPANTS: usize = 256;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Widest window accepted by read queries (one year).
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 24 * 3_600_000;
