//! Crash point injection for testing durability
//!
//! A crash point is enabled through the `PERSISTENCY_CRASH_POINT`
//! environment variable. When the running code reaches the named point the
//! process terminates via `std::process::abort()`: no cleanup, no unwinding,
//! no catching.
//!
//! ```bash
//! PERSISTENCY_CRASH_POINT=kvs_after_journal_write perctl --config per.json update
//! ```

use std::sync::OnceLock;

static CRASH_POINT: OnceLock<Option<String>> = OnceLock::new();

#[inline]
fn get_crash_point() -> Option<&'static str> {
    CRASH_POINT
        .get_or_init(|| std::env::var("PERSISTENCY_CRASH_POINT").ok())
        .as_deref()
}

/// Check if a specific crash point is enabled
#[inline]
pub fn crash_point_enabled(name: &str) -> bool {
    get_crash_point().map(|p| p == name).unwrap_or(false)
}

/// Abort the process if the named crash point is enabled
#[inline]
pub fn maybe_crash(name: &str) {
    if crash_point_enabled(name) {
        eprintln!("[CRASH] Triggering crash at point: {}", name);
        std::process::abort();
    }
}

/// All defined crash point names
pub mod points {
    // Key-value commit
    pub const KVS_AFTER_JOURNAL_WRITE: &str = "kvs_after_journal_write";
    pub const KVS_MID_APPLY: &str = "kvs_mid_apply";
    pub const KVS_BEFORE_JOURNAL_REMOVE: &str = "kvs_before_journal_remove";

    // Redundant copies
    pub const COPY_AFTER_FIRST_WRITE: &str = "copy_after_first_write";
    pub const FILE_AFTER_FIRST_COPY: &str = "file_after_first_copy";

    /// Get all crash point names
    pub fn all() -> &'static [&'static str] {
        &[
            KVS_AFTER_JOURNAL_WRITE,
            KVS_MID_APPLY,
            KVS_BEFORE_JOURNAL_REMOVE,
            COPY_AFTER_FIRST_WRITE,
            FILE_AFTER_FIRST_COPY,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crash_point_disabled_by_default() {
        assert!(!crash_point_enabled("test_point"));
    }

    #[test]
    fn test_crash_point_names_are_lowercase_with_underscores() {
        for point in points::all() {
            assert!(
                point.chars().all(|c| c.is_lowercase() || c == '_'),
                "Crash point '{}' should be lowercase with underscores",
                point
            );
        }
    }
}
