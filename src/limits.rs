use crate::model::Ms;

// ── Entity sizes ─────────────────────────────────────────────────

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_CONTACT_LEN: usize = 128;
pub const MAX_SKILL_CODE_LEN: usize = 64;
pub const MAX_SKILLS_PER_PROVIDER: usize = 64;
pub const MAX_BREAKS_PER_PROVIDER: usize = 64;
pub const MAX_ADMIN_CONTACTS: usize = 16;
pub const MAX_REQUIRED_SKILLS: usize = 16;

// ── Engine-wide counts ───────────────────────────────────────────

pub const MAX_BUSINESSES: usize = 1_000;
pub const MAX_PROVIDERS: usize = 10_000;
pub const MAX_APPOINTMENTS_PER_PROVIDER: usize = 100_000;
pub const MAX_PENDING_TRANSFERS_PER_APPOINTMENT: usize = 32;

// ── Time ─────────────────────────────────────────────────────────

pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
pub const MAX_APPOINTMENT_MINUTES: u32 = 12 * 60;
pub const MAX_BUFFER_MINUTES: u16 = 240;
pub const MAX_UTC_OFFSET_MINUTES: i32 = 14 * 60;

// ── Queries ──────────────────────────────────────────────────────

pub const MAX_BATCH_SIZE: usize = 1_000;
pub const MAX_SEARCH_DAYS: u32 = 60;
pub const MAX_QUERY_WINDOW_MS: Ms = 31 * 24 * 3_600_000;
