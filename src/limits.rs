use crate::model::{HOUR_MS, Ms};

/// Slots generated per bucket: one per hour of the day.
pub const SLOTS_PER_DAY: usize = 24;
pub const SLOT_DURATION_MS: Ms = HOUR_MS;

pub const MAX_BUCKETS: usize = 1_000_000;
pub const MAX_GAMES: usize = 1_000_000;
pub const MAX_ACTIVITIES_PER_SLOT: usize = 32;
pub const MAX_ACTIVITY_LEN: usize = 64;
pub const MAX_PLAYERS_PER_GAME: u32 = 64;
pub const MAX_PENDING_JOIN_REQUESTS: usize = 256;

/// Optimistic game commits give up after this many version mismatches in a row.
pub const MAX_CAS_RETRIES: usize = 16;
