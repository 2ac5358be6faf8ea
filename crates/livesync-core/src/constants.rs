//! Engine-wide constants
//!
//! Centralized location for defaults and well-known reaction names
//! shared by the engine, the in-memory backend and the CLI.

/// Page size used by the initial query and every follow-up page.
pub const DEFAULT_PAGE_SIZE: usize = 10;

/// Resubscription attempts after a dropped realtime channel before the
/// scope is reported as failed.
pub const DEFAULT_MAX_RESUBSCRIBE_ATTEMPTS: u32 = 5;

/// Base delay between resubscription attempts; attempt N waits N times this.
pub const DEFAULT_RESUBSCRIBE_BACKOFF_MS: u64 = 250;

/// Well-known reaction types
pub mod reactions {
    pub const LIKE: &str = "like";
    pub const LOVE: &str = "love";
}
