use crate::model::Ms;

pub const MAX_HOLDER_LEN: usize = 256;
/// Seats per all-or-nothing group booking.
pub const MAX_GROUP_BOOKING_SIZE: usize = 64;

pub const MIN_HOLD_TIMEOUT_MS: Ms = 1;
/// One week, enough for a locker pickup window.
pub const MAX_HOLD_TIMEOUT_MS: Ms = 604_800_000;

pub const MAX_ENDPOINTS: usize = 4096;
pub const MAX_ENDPOINT_LEN: usize = 512;
