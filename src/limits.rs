use crate::model::Ms;

pub const MAX_OFFICES: usize = 10_000;
pub const MAX_ROOMS: usize = 100_000;
pub const MAX_BOOKINGS_PER_ROOM: usize = 100_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_LOCATION_LEN: usize = 512;
/// Postgres NAMEDATALEN - 1; the login user name is the caller id.
pub const MAX_CALLER_ID_LEN: usize = 63;

/// 1970-01-01 .. 2100-01-01.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// One leap year.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * 24 * 3_600_000;

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 100;
