//! Storage header
//!
//! Each storage directory carries a redundantly stored header describing what
//! the directory holds and which application version touched it last.
//!
//! Format (frame body):
//! ```json
//! {
//!   "format_version": 1,
//!   "kind": "key_value",
//!   "copies": 3,
//!   "application_version": "2.1.0",
//!   "installed_at": "2026-02-04T11:30:00Z",
//!   "updated_at": "2026-03-01T08:00:00Z"
//! }
//! ```
//!
//! A header without a quorum, or one that does not parse or names another
//! storage kind, makes the whole storage `IntegrityCorrupted`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{CopyLayout, FrameKind, RedundantStore, RepairOutcome};
use crate::config::StorageKind;
use crate::context::StorageContext;
use crate::error::{PerError, PerResult};

pub const HEADER_FORMAT_VERSION: u32 = 1;

const HEADER_ELEMENT: &str = "header";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageHeader {
    pub format_version: u32,
    pub kind: StorageKind,
    pub copies: u8,
    /// Application version of the last open
    pub application_version: String,
    pub installed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StorageHeader {
    pub fn new(kind: StorageKind, copies: u8, application_version: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            format_version: HEADER_FORMAT_VERSION,
            kind,
            copies,
            application_version: application_version.into(),
            installed_at: now,
            updated_at: now,
        }
    }

    /// Re-stamp with the current application version.
    pub fn stamped(&self, application_version: &str) -> Self {
        Self {
            application_version: application_version.to_string(),
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    pub fn to_json(&self) -> PerResult<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| PerError::integrity_corrupted(format!("failed to serialize header: {}", e)))
    }

    pub fn from_json(bytes: &[u8]) -> PerResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| PerError::integrity_corrupted(format!("failed to parse header: {}", e)))
    }
}

/// The header copies of one storage, in `<storage>/meta/copy_<i>/`.
pub struct HeaderStore {
    ctx: Arc<StorageContext>,
    store: RedundantStore,
}

impl HeaderStore {
    pub fn new(ctx: Arc<StorageContext>) -> Self {
        let layout = CopyLayout::new(&ctx.dir.join("meta"), "copy", ctx.copies());
        let store = RedundantStore::new(ctx.clone(), layout, FrameKind::Header, false);
        Self { ctx, store }
    }

    pub fn prepare(&self) -> PerResult<()> {
        self.store.prepare()
    }

    /// Agreed header, or `None` for a storage that was never installed.
    pub fn load(&self) -> PerResult<Option<StorageHeader>> {
        let body = match self.store.read(HEADER_ELEMENT)? {
            Some(body) => body,
            None => return Ok(None),
        };
        let header = StorageHeader::from_json(&body)?;
        if header.format_version > HEADER_FORMAT_VERSION {
            return Err(PerError::integrity_corrupted(format!(
                "header format {} is newer than supported {}",
                header.format_version, HEADER_FORMAT_VERSION
            )));
        }
        if header.kind != self.ctx.kind {
            return Err(PerError::integrity_corrupted(format!(
                "storage {} holds {} data, configured as {}",
                self.ctx.id,
                header.kind.as_str(),
                self.ctx.kind.as_str()
            )));
        }
        Ok(Some(header))
    }

    pub fn store(&self, header: &StorageHeader) -> PerResult<()> {
        self.store.write(HEADER_ELEMENT, &header.to_json()?)
    }

    pub fn repair(&self) -> PerResult<RepairOutcome> {
        self.store.repair(HEADER_ELEMENT)
    }

    pub fn usage(&self) -> PerResult<u64> {
        self.store.usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PerErrc;
    use crate::redundancy::test_support::context;
    use tempfile::TempDir;

    #[test]
    fn test_missing_header_is_none() {
        let dir = TempDir::new().unwrap();
        let headers = HeaderStore::new(context(dir.path(), 3));
        headers.prepare().unwrap();
        assert_eq!(headers.load().unwrap(), None);
    }

    #[test]
    fn test_store_and_load() {
        let dir = TempDir::new().unwrap();
        let headers = HeaderStore::new(context(dir.path(), 3));
        let header = StorageHeader::new(StorageKind::KeyValue, 3, "1.0.0");
        headers.store(&header).unwrap();
        assert_eq!(headers.load().unwrap(), Some(header.clone()));

        let stamped = header.stamped("2.0.0");
        assert_eq!(stamped.installed_at, header.installed_at);
        assert_eq!(stamped.application_version, "2.0.0");
    }

    #[test]
    fn test_kind_mismatch_is_integrity_corrupted() {
        let dir = TempDir::new().unwrap();
        let headers = HeaderStore::new(context(dir.path(), 3));
        headers.store(&StorageHeader::new(StorageKind::File, 3, "1.0.0")).unwrap();
        assert_eq!(headers.load().unwrap_err().code(), PerErrc::IntegrityCorrupted);
    }

    #[test]
    fn test_no_quorum_is_integrity_corrupted() {
        let dir = TempDir::new().unwrap();
        let headers = HeaderStore::new(context(dir.path(), 3));
        headers.store(&StorageHeader::new(StorageKind::KeyValue, 3, "1.0.0")).unwrap();
        for copy in [0, 1] {
            let path = dir.path().join("meta").join(format!("copy_{}", copy)).join(crate::id::encode_name("header"));
            std::fs::write(&path, b"garbage").unwrap();
        }
        assert_eq!(headers.load().unwrap_err().code(), PerErrc::IntegrityCorrupted);
    }
}
