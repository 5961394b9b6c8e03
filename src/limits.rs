//! Static caps protecting a tenant from unbounded growth. Violations surface
//! as `LimitExceeded` or `InvalidInput` before anything reaches the WAL.

use crate::model::Ms;

pub const MAX_BUSINESSES_PER_TENANT: usize = 10_000;
pub const MAX_USERS_PER_TENANT: usize = 100_000;
pub const MAX_SERVICES_PER_BUSINESS: usize = 1_000;
pub const MAX_WINDOWS_PER_BUSINESS: usize = 64;
pub const MAX_EMPLOYEES_PER_BUSINESS: usize = 1_000;
pub const MAX_BOOKINGS_PER_EMPLOYEE: usize = 100_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TIMEZONE_LEN: usize = 64;

/// Longest bookable service: a full day. Anything longer can never fit inside
/// a single schedule window anyway.
pub const MAX_SERVICE_DURATION_MIN: i64 = 1_440;
pub const MAX_PRICE_CENTS: i64 = 1_000_000_000_000;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Widest admin-list date range: one year.
pub const MAX_QUERY_WINDOW_MS: Ms = 31_536_000_000;

pub const MAX_TENANT_NAME_LEN: usize = 64;
pub const MAX_TENANTS: usize = 1_024;
