//! Observable persistency events
//!
//! Events are explicit and typed. Each carries the severity it is logged at.

use std::fmt;

use super::Severity;

/// Observable events of the persistency engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Lifecycle
    /// Catalog initialized from a deployment manifest
    CatalogInit,
    /// Storage instance created
    StorageOpen,
    /// Last handle to a storage released
    StorageClose,
    /// Storage installed from deployment defaults
    StorageInstall,

    // Key-value
    /// Pending changes committed
    KvsSync,
    /// Interrupted commit rolled forward
    JournalReplay,
    /// Invalid commit journal thrown away
    JournalDiscarded,

    // Files
    /// File content committed to its copies
    FileSync,
    /// Best-effort write dropped an error
    BestEffortWriteDropped,

    // Redundancy
    /// A copy failed validation
    CorruptionDetected,
    /// Recovery started
    RecoveryStart,
    /// Recovery repaired at least one unit
    RecoveryComplete,
    /// Recovery could not establish a quorum
    RecoveryFailed,
    /// Reset to deployment defaults complete
    ResetComplete,

    // Versioning
    /// Application version mismatch detected
    MigrationStart,
    /// Migration callback finished, stamp updated
    MigrationComplete,
    /// Update pass installed missing defaults
    UpdateInstall,
    /// All storages discarded
    PersistencyReset,
}

impl Event {
    /// Returns the string representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::CatalogInit => "PER_CATALOG_INIT",
            Event::StorageOpen => "STORAGE_OPEN",
            Event::StorageClose => "STORAGE_CLOSE",
            Event::StorageInstall => "STORAGE_INSTALL",

            Event::KvsSync => "KVS_SYNC",
            Event::JournalReplay => "JOURNAL_REPLAY",
            Event::JournalDiscarded => "JOURNAL_DISCARDED",

            Event::FileSync => "FILE_SYNC",
            Event::BestEffortWriteDropped => "BEST_EFFORT_WRITE_DROPPED",

            Event::CorruptionDetected => "CORRUPTION_DETECTED",
            Event::RecoveryStart => "RECOVERY_BEGIN",
            Event::RecoveryComplete => "RECOVERY_COMPLETE",
            Event::RecoveryFailed => "RECOVERY_FAILED",
            Event::ResetComplete => "RESET_COMPLETE",

            Event::MigrationStart => "MIGRATION_BEGIN",
            Event::MigrationComplete => "MIGRATION_COMPLETE",
            Event::UpdateInstall => "UPDATE_INSTALL",
            Event::PersistencyReset => "PERSISTENCY_RESET",
        }
    }

    /// Severity the event is logged at.
    pub fn severity(&self) -> Severity {
        match self {
            Event::KvsSync | Event::FileSync | Event::StorageOpen | Event::StorageClose => {
                Severity::Trace
            }
            Event::CorruptionDetected
            | Event::JournalDiscarded
            | Event::BestEffortWriteDropped
            | Event::RecoveryComplete => Severity::Warn,
            Event::RecoveryFailed => Severity::Error,
            _ => Severity::Info,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_events_have_string_representation() {
        let events = [
            Event::CatalogInit,
            Event::StorageOpen,
            Event::StorageClose,
            Event::StorageInstall,
            Event::KvsSync,
            Event::JournalReplay,
            Event::JournalDiscarded,
            Event::FileSync,
            Event::BestEffortWriteDropped,
            Event::CorruptionDetected,
            Event::RecoveryStart,
            Event::RecoveryComplete,
            Event::RecoveryFailed,
            Event::ResetComplete,
            Event::MigrationStart,
            Event::MigrationComplete,
            Event::UpdateInstall,
            Event::PersistencyReset,
        ];

        for event in events {
            let s = event.as_str();
            assert!(!s.is_empty());
            assert!(s.chars().all(|c| c.is_uppercase() || c == '_'));
        }
    }

    #[test]
    fn test_corruption_is_at_least_warn() {
        assert!(Event::CorruptionDetected.severity() >= Severity::Warn);
        assert_eq!(Event::RecoveryFailed.severity(), Severity::Error);
        assert_eq!(Event::KvsSync.severity(), Severity::Trace);
    }
}
