//! Hard bounds on caller-supplied input.

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: i64 = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: i64 = 4_102_444_800_000;

/// No single session or class runs longer than a day.
pub const MAX_SPAN_DURATION_MS: i64 = 24 * 3_600_000;
/// Free-slot and conflict queries cover at most 90 days.
pub const MAX_QUERY_WINDOW_MS: i64 = 90 * 24 * 3_600_000;

pub const MAX_NAME_LEN: usize = 200;
pub const MAX_TEXT_LEN: usize = 2_000;
pub const MAX_CAPACITY: u32 = 1_000;
pub const MAX_SLOTS_PER_DAY: usize = 48;
/// Entries that have not ended yet, per trainer or member ledger.
pub const MAX_ENTRIES_PER_LEDGER: usize = 50_000;

/// Attempts at a class cancellation cascade before giving up on a roster
/// that keeps changing underneath it.
pub const MAX_LOCK_RETRIES: usize = 8;
