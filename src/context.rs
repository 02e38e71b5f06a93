//! Per-storage runtime context shared by every layer of one open storage.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use crate::callbacks::CallbackRegistry;
use crate::collaborator::SecurityEvent;
use crate::config::{StorageKind, StorageSettings};
use crate::error::{PerErrc, PerError, PerResult};
use crate::id::StorageId;
use crate::observability::{log_event, Event};
use crate::protection::{DataProtection, ProtectionError, ProtectionScope};
use crate::redundancy::{CopyReport, RecoveryReportKind, ReportScope};

pub struct StorageContext {
    pub id: StorageId,
    pub kind: StorageKind,
    pub dir: PathBuf,
    pub settings: StorageSettings,
    pub application_version: String,
    pub protection: Arc<dyn DataProtection>,
    pub callbacks: Arc<CallbackRegistry>,
}

impl StorageContext {
    pub fn copies(&self) -> usize {
        self.settings.redundancy.copies()
    }

    pub fn quorum(&self) -> usize {
        self.settings.redundancy.quorum()
    }

    pub fn is_read_only(&self) -> bool {
        self.settings.read_only
    }

    pub fn is_protected(&self) -> bool {
        self.settings.is_protected()
    }

    fn scope<'a>(&'a self, element: &'a str) -> ProtectionScope<'a> {
        ProtectionScope {
            storage: &self.id,
            element,
            encryption: self.settings.encryption,
            authentication: self.settings.authentication,
        }
    }

    /// Delete everything the storage holds on disk.
    pub fn remove_dir(&self) -> PerResult<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PerError::io(format!("failed to remove {}", self.id), e)),
        }
    }

    pub fn seal(&self, element: &str, plain: &[u8]) -> PerResult<Vec<u8>> {
        if !self.is_protected() {
            return Ok(plain.to_vec());
        }
        Ok(self.protection.seal(&self.scope(element), plain)?)
    }

    pub fn unseal(&self, element: &str, sealed: &[u8]) -> Result<Vec<u8>, ProtectionError> {
        if !self.is_protected() {
            return Ok(sealed.to_vec());
        }
        self.protection.unseal(&self.scope(element), sealed)
    }

    pub fn report(&self, kind: RecoveryReportKind, elements: &[String], copies: &[u8]) {
        self.callbacks.report_recovery(&self.id, kind, elements, copies);
    }

    pub fn report_scope(&self, scope: ReportScope, ok: bool, report: &CopyReport) {
        if report.is_empty() {
            return;
        }
        let kind = if ok { scope.recovered() } else { scope.failed() };
        self.report(kind, &report.elements, &report.copies);
    }

    /// Log a bad copy and forward integrity or MAC failures to telemetry.
    pub fn corruption_detected(&self, element: &str, code: PerErrc, copies: &[u8]) {
        let copy_list = copies.iter().map(|c| c.to_string()).collect::<Vec<_>>().join(",");
        log_event(
            Event::CorruptionDetected,
            &[
                ("storage", self.id.as_str()),
                ("element", element),
                ("code", code.code()),
                ("copies", &copy_list),
            ],
        );
        if matches!(code, PerErrc::IntegrityCorrupted | PerErrc::AuthenticationFailed) {
            self.callbacks.report_security_event(&SecurityEvent {
                storage: self.id.clone(),
                element: element.to_string(),
                code,
                copies: copies.to_vec(),
            });
        }
    }
}
