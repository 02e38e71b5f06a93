//! File metadata
//!
//! Stored next to the content as redundant JSON copies in
//! `files/info_<i>/`:
//!
//! ```json
//! {
//!   "creation_time": 1767225600000000000,
//!   "modification_time": 1767225600000000000,
//!   "access_time": 1767312000000000000,
//!   "creation_state": "created_by_application",
//!   "modification_state": "modified_by_application"
//! }
//! ```

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{PerError, PerResult};

/// How and when a file was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum FileCreationState {
    /// Installed from deployment defaults, or recreated after a full reset
    CreatedDuringInstallation = 1,
    CreatedDuringUpdate = 2,
    /// Recreated by `reset_file` / `reset_all_files`
    CreatedDuringReset = 3,
    /// Recreated after a corruption was detected
    CreatedDuringRecovery = 4,
    CreatedByApplication = 5,
}

/// How and when a file was last modified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum FileModificationState {
    /// Not modified since it was installed
    ModifiedDuringInstallation = 1,
    ModifiedDuringUpdate = 2,
    ModifiedDuringReset = 3,
    ModifiedDuringRecovery = 4,
    ModifiedByApplication = 5,
}

impl FileCreationState {
    pub fn value(self) -> u32 {
        self as u32
    }

    /// Modification state of a file that was just created this way.
    pub fn as_modification(self) -> FileModificationState {
        match self {
            FileCreationState::CreatedDuringInstallation => FileModificationState::ModifiedDuringInstallation,
            FileCreationState::CreatedDuringUpdate => FileModificationState::ModifiedDuringUpdate,
            FileCreationState::CreatedDuringReset => FileModificationState::ModifiedDuringReset,
            FileCreationState::CreatedDuringRecovery => FileModificationState::ModifiedDuringRecovery,
            FileCreationState::CreatedByApplication => FileModificationState::ModifiedByApplication,
        }
    }
}

impl FileModificationState {
    pub fn value(self) -> u32 {
        self as u32
    }
}

/// Nanoseconds since the Unix epoch.
pub fn now_nanos() -> u64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(0).max(0) as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub creation_time: u64,
    pub modification_time: u64,
    pub access_time: u64,
    pub creation_state: FileCreationState,
    pub modification_state: FileModificationState,
}

impl FileInfo {
    pub fn created(state: FileCreationState) -> Self {
        let now = now_nanos();
        Self {
            creation_time: now,
            modification_time: now,
            access_time: now,
            creation_state: state,
            modification_state: state.as_modification(),
        }
    }

    pub fn modified(self, state: FileModificationState) -> Self {
        let now = now_nanos();
        Self {
            modification_time: now,
            access_time: now,
            modification_state: state,
            ..self
        }
    }

    pub fn accessed(self) -> Self {
        Self {
            access_time: now_nanos(),
            ..self
        }
    }

    pub fn to_json(&self) -> PerResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| PerError::integrity_corrupted(format!("failed to serialize file info: {}", e)))
    }

    pub fn from_json(name: &str, bytes: &[u8]) -> PerResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| PerError::validation_failed(name, format!("undecodable file info: {}", e)))
    }
}
