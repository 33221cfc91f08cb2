use crate::model::Ms;

/// Longest bookable appointment. Also bounds the availability lookback window.
pub const MAX_DURATION_MINUTES: i64 = 24 * 60;

/// Service label and location.
pub const MAX_LABEL_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 4096;
pub const MAX_NAME_LEN: usize = 256;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// Smallest bucket accepted by interval grouping queries.
pub const MIN_BUCKET_MS: Ms = 60_000;
/// Upper bound on buckets returned by one grouping query.
pub const MAX_BUCKETS: usize = 10_000;

/// Attempts at locking an appointment whose resources change while we wait.
pub const MAX_LOCK_ATTEMPTS: usize = 4;
