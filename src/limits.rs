use crate::model::{DAY_MS, Ms};

// ── Time ─────────────────────────────────────────────────────────

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;

/// 9999-12-31T23:59:59.999Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;

/// A single reservation may not block the machine for longer than this.
pub const MAX_RESERVATION_DURATION_MS: Ms = 2 * DAY_MS;

/// Default widest window a listing query may cover.
pub const DEFAULT_MAX_QUERY_WINDOW_MS: Ms = 366 * DAY_MS;

/// Default booking horizon (the calendar allowed two months ahead).
pub const DEFAULT_BOOKING_HORIZON_MS: Ms = 61 * DAY_MS;

// ── Per-tenant sizes ─────────────────────────────────────────────

pub const MAX_RESERVATIONS_PER_TENANT: usize = 1_000_000;
pub const MAX_PROFILES_PER_TENANT: usize = 100_000;

pub const MAX_IDENTITY_LEN: usize = 256;
pub const MAX_DISPLAY_NAME_LEN: usize = 128;

// ── Server ───────────────────────────────────────────────────────

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;
