//! Hard limits enforced by the engine and the wire layer.

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_SCHEDULES_PER_TENANT: usize = 50_000;
pub const MAX_ITEMS_PER_SCHEDULE: usize = 20_000;
pub const MAX_DEPENDENCIES_PER_SCHEDULE: usize = 100_000;
pub const MAX_BASELINES_PER_SCHEDULE: usize = 500;
pub const MAX_WBS_DEPTH: usize = 32;

pub const MAX_RESOURCES_PER_TENANT: usize = 100_000;
pub const MAX_RECORDS_PER_RESOURCE: usize = 50_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTE_LEN: usize = 4096;

/// Absolute lag bound in days.
pub const MAX_LAG_DAYS: i32 = 3650;
/// Longest single window (item, allocation, blackout), in days.
pub const MAX_WINDOW_DAYS: i64 = 36_500;
/// Widest read window (free windows, utilization), in days.
pub const MAX_QUERY_WINDOW_DAYS: i64 = 36_500;

pub const MIN_VALID_YEAR: i32 = 1900;
pub const MAX_VALID_YEAR: i32 = 2200;

pub const MAX_DAILY_HOURS: f64 = 24.0;
pub const MAX_BATCH_IDS: usize = 10_000;
