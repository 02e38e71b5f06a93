//! Recovery reports
//!
//! Every corrective action of the redundancy layer is announced to the
//! registered recovery-report callback.

use std::fmt;

/// Kind of a recovery report. Numeric values are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RecoveryReportKind {
    KeyValueStorageRecoveryFailed = 1,
    KeyValueStorageRecovered = 2,
    KeyRecoveryFailed = 3,
    KeyRecovered = 4,
    FileStorageRecoveryFailed = 5,
    FileStorageRecovered = 6,
    FileRecoveryFailed = 7,
    FileRecovered = 8,
}

impl RecoveryReportKind {
    pub fn value(&self) -> u32 {
        *self as u32
    }

    pub fn is_failure(&self) -> bool {
        self.value() % 2 == 1
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryReportKind::KeyValueStorageRecoveryFailed => "KVS_RECOVERY_FAILED",
            RecoveryReportKind::KeyValueStorageRecovered => "KVS_RECOVERED",
            RecoveryReportKind::KeyRecoveryFailed => "KEY_RECOVERY_FAILED",
            RecoveryReportKind::KeyRecovered => "KEY_RECOVERED",
            RecoveryReportKind::FileStorageRecoveryFailed => "FILE_STORAGE_RECOVERY_FAILED",
            RecoveryReportKind::FileStorageRecovered => "FILE_STORAGE_RECOVERED",
            RecoveryReportKind::FileRecoveryFailed => "FILE_RECOVERY_FAILED",
            RecoveryReportKind::FileRecovered => "FILE_RECOVERED",
        }
    }
}

impl fmt::Display for RecoveryReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Level at which a repair happened. Picks the report kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportScope {
    Key,
    File,
    KeyValueStorage,
    FileStorage,
}

impl ReportScope {
    pub fn recovered(&self) -> RecoveryReportKind {
        match self {
            ReportScope::Key => RecoveryReportKind::KeyRecovered,
            ReportScope::File => RecoveryReportKind::FileRecovered,
            ReportScope::KeyValueStorage => RecoveryReportKind::KeyValueStorageRecovered,
            ReportScope::FileStorage => RecoveryReportKind::FileStorageRecovered,
        }
    }

    pub fn failed(&self) -> RecoveryReportKind {
        match self {
            ReportScope::Key => RecoveryReportKind::KeyRecoveryFailed,
            ReportScope::File => RecoveryReportKind::FileRecoveryFailed,
            ReportScope::KeyValueStorage => RecoveryReportKind::KeyValueStorageRecoveryFailed,
            ReportScope::FileStorage => RecoveryReportKind::FileStorageRecoveryFailed,
        }
    }
}

/// Element names paired one-to-one with broken copy indices.
///
/// The nth element belongs to the nth copy index, so an element with
/// several broken copies is listed once per copy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyReport {
    pub elements: Vec<String>,
    pub copies: Vec<u8>,
}

impl CopyReport {
    /// Storage-level copies, reported without elements.
    pub fn instances(copies: &[u8]) -> Self {
        Self {
            elements: Vec::new(),
            copies: copies.to_vec(),
        }
    }

    pub fn single(name: &str, copies: &[u8]) -> Self {
        let mut report = Self::default();
        report.add(name, copies);
        report
    }

    pub fn add(&mut self, name: &str, copies: &[u8]) {
        for &copy in copies {
            self.elements.push(name.to_string());
            self.copies.push(copy);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.copies.is_empty()
    }
}

/// Result of repairing one element's copy set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairOutcome {
    /// Every copy already agreed
    Clean,
    /// The listed copies were rewritten from the majority
    Repaired { copies: Vec<u8> },
    /// No quorum; the listed copies were invalid
    Unrecoverable { copies: Vec<u8> },
}
