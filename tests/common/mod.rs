//! Shared helpers for the integration tests
//!
//! Copy `i` of element `name` lives under `<storage>/<area>/<prefix>_<i>/`
//! as `x` + hex(name). The helpers below poke at those files directly to
//! simulate media corruption.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use persistency::collaborator::{CollaboratorSink, LifecycleState, SecurityEvent};
use persistency::protection::{DataProtection, ProtectionError, ProtectionScope};
use persistency::redundancy::RecoveryReportKind;
use persistency::{DeploymentConfig, FileStorageConfig, InitialFile, KvsConfig, StorageCatalog, StorageId};
use tempfile::TempDir;

pub const KVS_ID: &str = "app/settings";
pub const FILES_ID: &str = "app/files";

pub fn create_temp_root() -> TempDir {
    TempDir::new().expect("Failed to create temp dir")
}

pub fn kvs_id() -> StorageId {
    StorageId::parse(KVS_ID).unwrap()
}

pub fn files_id() -> StorageId {
    StorageId::parse(FILES_ID).unwrap()
}

/// One KVS with three defaults and one file storage with one initial file.
pub fn manifest(root: &Path) -> DeploymentConfig {
    DeploymentConfig::new(root)
        .with_kvs(
            KvsConfig::new(kvs_id())
                .with_initial_value("volume", 5u8)
                .with_initial_value("name", "device")
                .with_initial_value("ratio", 0.5f64),
        )
        .with_file_storage(
            FileStorageConfig::new(files_id())
                .with_initial_file("readme.txt", InitialFile::Text("first line\nsecond line\n".into())),
        )
}

pub fn catalog(root: &Path) -> StorageCatalog {
    StorageCatalog::new(manifest(root)).unwrap()
}

fn encoded(name: &str) -> String {
    let mut out = String::from("x");
    for b in name.as_bytes() {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

pub fn copy_path(root: &Path, id: &str, area: &str, prefix: &str, copy: usize, name: &str) -> PathBuf {
    let mut dir = root.to_path_buf();
    for seg in id.split('/') {
        dir = dir.join(seg);
    }
    dir.join(area).join(format!("{}_{}", prefix, copy)).join(encoded(name))
}

pub fn key_copy(root: &Path, copy: usize, key: &str) -> PathBuf {
    copy_path(root, KVS_ID, "kvs", "copy", copy, key)
}

pub fn file_copy(root: &Path, copy: usize, name: &str) -> PathBuf {
    copy_path(root, FILES_ID, "files", "copy", copy, name)
}

pub fn file_info_copy(root: &Path, copy: usize, name: &str) -> PathBuf {
    copy_path(root, FILES_ID, "files", "info", copy, name)
}

pub fn header_copy(root: &Path, id: &str, copy: usize) -> PathBuf {
    copy_path(root, id, "meta", "copy", copy, "header")
}

/// Flip the last byte of a copy, which breaks its checksum.
pub fn corrupt(path: &Path) {
    let mut contents = fs::read(path).unwrap();
    let last = contents.len() - 1;
    contents[last] ^= 0xFF;
    fs::write(path, contents).unwrap();
}

pub type Reports = Arc<Mutex<Vec<(RecoveryReportKind, Vec<String>, Vec<u8>)>>>;

/// Record every recovery report the catalog emits.
pub fn collect_reports(catalog: &StorageCatalog) -> Reports {
    let reports: Reports = Arc::new(Mutex::new(Vec::new()));
    let sink = reports.clone();
    catalog.register_recovery_report_callback(move |_, kind, names, copies| {
        sink.lock().unwrap().push((kind, names.to_vec(), copies.to_vec()));
    });
    reports
}

/// XOR cipher with a trailing CRC32 tag over the plain text.
pub struct XorTagProtection {
    pub key: u8,
}

impl DataProtection for XorTagProtection {
    fn seal(&self, _scope: &ProtectionScope<'_>, plain: &[u8]) -> Result<Vec<u8>, ProtectionError> {
        let mut out: Vec<u8> = plain.iter().map(|b| b ^ self.key).collect();
        out.extend_from_slice(&crc32fast::hash(plain).to_le_bytes());
        Ok(out)
    }

    fn unseal(&self, _scope: &ProtectionScope<'_>, sealed: &[u8]) -> Result<Vec<u8>, ProtectionError> {
        if sealed.len() < 4 {
            return Err(ProtectionError::Authentication("missing tag".into()));
        }
        let (body, tag) = sealed.split_at(sealed.len() - 4);
        let plain: Vec<u8> = body.iter().map(|b| b ^ self.key).collect();
        if crc32fast::hash(&plain).to_le_bytes() != tag {
            return Err(ProtectionError::Authentication("tag mismatch".into()));
        }
        Ok(plain)
    }
}

/// Protection whose cipher is unavailable.
pub struct BrokenCipher;

impl DataProtection for BrokenCipher {
    fn seal(&self, _scope: &ProtectionScope<'_>, _plain: &[u8]) -> Result<Vec<u8>, ProtectionError> {
        Err(ProtectionError::Encryption("no key material".into()))
    }

    fn unseal(&self, _scope: &ProtectionScope<'_>, _sealed: &[u8]) -> Result<Vec<u8>, ProtectionError> {
        Err(ProtectionError::Encryption("no key material".into()))
    }
}

/// Collaborator that records what it is told.
#[derive(Default)]
pub struct RecordingCollaborator {
    pub states: Mutex<Vec<(StorageId, LifecycleState)>>,
    pub security: Mutex<Vec<SecurityEvent>>,
}

impl CollaboratorSink for RecordingCollaborator {
    fn report_state(&self, storage: &StorageId, state: LifecycleState) {
        self.states.lock().unwrap().push((storage.clone(), state));
    }

    fn report_security_event(&self, event: &SecurityEvent) {
        self.security.lock().unwrap().push(event.clone());
    }
}
