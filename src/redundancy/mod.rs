//! Redundant copy management
//!
//! Every logical element (key record, file content, file info, storage
//! header) is stored as N framed copies. Reads vote over the copies
//! ([`quorum::vote`]); writes replace every copy atomically; repair rewrites
//! dissenting copies from the majority.
//!
//! A [`RedundantStore`] manages one element set (for example all key records
//! of one storage) and knows nothing about what the bytes mean.

mod copies;
mod frame;
mod header;
mod quorum;
mod report;

pub use copies::{dir_size, fsync_dir, write_atomic_with, CopyLayout};
pub use frame::{compute_checksum, ContentDigest, FrameError, FrameKind, FrameWriter, HEADER_LEN, OVERHEAD};
pub use header::{HeaderStore, StorageHeader, HEADER_FORMAT_VERSION};
pub use quorum::{vote, Agreement, Invalidity, Opinion, Verdict};
pub use report::{CopyReport, RecoveryReportKind, RepairOutcome, ReportScope};

pub(crate) use frame::{decode as decode_frame, encode as encode_frame};

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

use crate::context::StorageContext;
use crate::crash_point::{maybe_crash, points};
use crate::error::{PerErrc, PerError, PerResult};

pub struct RedundantStore {
    ctx: Arc<StorageContext>,
    layout: CopyLayout,
    kind: FrameKind,
    sealed: bool,
}

impl RedundantStore {
    /// `sealed` stores pass their payloads through the storage's protection.
    pub fn new(ctx: Arc<StorageContext>, layout: CopyLayout, kind: FrameKind, sealed: bool) -> Self {
        Self {
            ctx,
            layout,
            kind,
            sealed,
        }
    }

    pub fn layout(&self) -> &CopyLayout {
        &self.layout
    }

    pub fn copies(&self) -> usize {
        self.layout.copies()
    }

    pub fn copy_path(&self, copy: usize, name: &str) -> PathBuf {
        self.layout.path(copy, name)
    }

    /// Whether payloads are transformed by protection on the way to disk.
    pub fn is_sealed(&self) -> bool {
        self.sealed && self.ctx.is_protected()
    }

    fn no_quorum_code(&self) -> PerErrc {
        match self.kind {
            FrameKind::Header => PerErrc::IntegrityCorrupted,
            _ => PerErrc::ValidationFailed,
        }
    }

    fn io_err(&self, what: &str, copy: usize, name: &str, e: std::io::Error) -> PerError {
        PerError::io(format!("failed to {} copy {} of '{}'", what, copy, name), e)
            .with_details(format!("storage: {}", self.ctx.id))
    }

    /// Create the copy directories and drop leftovers of interrupted writes.
    pub fn prepare(&self) -> PerResult<()> {
        self.layout
            .ensure_dirs()
            .and_then(|_| self.layout.clean_temp_files())
            .map(|_| ())
            .map_err(|e| PerError::io(format!("failed to prepare copies of {}", self.ctx.id), e))
    }

    fn opinion(&self, copy: usize, name: &str) -> Opinion<Vec<u8>> {
        let raw = match self.layout.read(copy, name) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Opinion::Absent,
            Err(e) => return Opinion::Invalid(Invalidity::Unreadable(e.to_string())),
        };
        let body = match frame::decode(self.kind, &raw) {
            Ok(body) => body,
            Err(e) => return Opinion::Invalid(Invalidity::Corrupted(e.to_string())),
        };
        if !self.is_sealed() {
            return Opinion::Present(body.to_vec());
        }
        match self.ctx.unseal(name, body) {
            Ok(plain) => Opinion::Present(plain),
            Err(e) => Opinion::Invalid(Invalidity::Protection(e.code())),
        }
    }

    /// Opinion of every copy on the element's plain payload.
    pub fn opinions(&self, name: &str) -> Vec<Opinion<Vec<u8>>> {
        (0..self.copies()).map(|c| self.opinion(c, name)).collect()
    }

    /// Opinion of every copy on the element's payload digest.
    ///
    /// Unsealed copies are verified by streaming, without loading them.
    pub fn digest_opinions(&self, name: &str) -> Vec<Opinion<ContentDigest>> {
        if self.is_sealed() {
            return self
                .opinions(name)
                .into_iter()
                .map(|o| o.map(|body| ContentDigest::of(&body)))
                .collect();
        }
        (0..self.copies())
            .map(|c| match frame::digest_file(&self.layout.path(c, name), self.kind) {
                Ok(None) => Opinion::Absent,
                Ok(Some(Ok(digest))) => Opinion::Present(digest),
                Ok(Some(Err(e))) => Opinion::Invalid(Invalidity::Corrupted(e.to_string())),
                Err(e) => Opinion::Invalid(Invalidity::Unreadable(e.to_string())),
            })
            .collect()
    }

    fn dissent_code<T>(&self, opinions: &[Opinion<T>], copies: &[usize]) -> PerErrc {
        copies
            .iter()
            .find_map(|&c| match &opinions[c] {
                Opinion::Invalid(Invalidity::Protection(code)) => Some(*code),
                _ => None,
            })
            .unwrap_or_else(|| self.no_quorum_code())
    }

    /// Vote over `opinions`, logging dissent and failing without a quorum.
    pub fn decide<T: PartialEq + Clone>(&self, name: &str, opinions: &[Opinion<T>]) -> PerResult<Agreement<T>> {
        match vote(opinions, self.ctx.quorum()) {
            Verdict::Agreed(agreement) => {
                if !agreement.is_unanimous() {
                    let code = self.dissent_code(opinions, &agreement.dissenting);
                    self.ctx.corruption_detected(name, code, &to_u8(&agreement.dissenting));
                }
                Ok(agreement)
            }
            Verdict::NoQuorum { invalid, protection } => {
                let code = protection.unwrap_or_else(|| self.no_quorum_code());
                self.ctx.corruption_detected(name, code, &to_u8(&invalid));
                Err(PerError::new(
                    code,
                    format!("no quorum of {} valid copies for '{}'", self.ctx.quorum(), name),
                )
                .with_details(format!("storage: {}", self.ctx.id)))
            }
        }
    }

    /// Read the agreed plain payload. `Ok(None)` if the element is absent.
    pub fn read(&self, name: &str) -> PerResult<Option<Vec<u8>>> {
        let opinions = self.opinions(name);
        Ok(self.decide(name, &opinions)?.value)
    }

    /// Replace every copy with `plain`.
    pub fn write(&self, name: &str, plain: &[u8]) -> PerResult<()> {
        let body = if self.is_sealed() {
            self.ctx.seal(name, plain)?
        } else {
            plain.to_vec()
        };
        let framed = frame::encode(self.kind, &body);
        for copy in 0..self.copies() {
            self.layout
                .write(copy, name, &framed)
                .map_err(|e| self.io_err("write", copy, name, e))?;
            if copy == 0 {
                maybe_crash(points::COPY_AFTER_FIRST_WRITE);
            }
        }
        Ok(())
    }

    /// Replace every copy with the first `len` bytes of `src`.
    pub fn write_from(&self, name: &str, src: &mut File, len: u64) -> PerResult<()> {
        if self.is_sealed() {
            let mut plain = Vec::with_capacity(len as usize);
            let result = src
                .seek(SeekFrom::Start(0))
                .and_then(|_| Read::take(&mut *src, len).read_to_end(&mut plain));
            result.map_err(|e| PerError::io(format!("failed to read working image of '{}'", name), e))?;
            return self.write(name, &plain);
        }

        for copy in 0..self.copies() {
            let result = (|| {
                std::fs::create_dir_all(self.layout.dir(copy))?;
                src.seek(SeekFrom::Start(0))?;
                write_atomic_with(&self.layout.path(copy, name), |f| {
                    let mut writer = FrameWriter::new(BufWriter::new(f), self.kind, len)?;
                    writer.copy_body_from(&mut *src)?;
                    writer.finish()?.flush()
                })
            })();
            result.map_err(|e| self.io_err("write", copy, name, e))?;
            if copy == 0 {
                maybe_crash(points::FILE_AFTER_FIRST_COPY);
            }
        }
        Ok(())
    }

    /// Remove every copy.
    pub fn remove(&self, name: &str) -> PerResult<()> {
        for copy in 0..self.copies() {
            self.layout
                .remove(copy, name)
                .map_err(|e| self.io_err("remove", copy, name, e))?;
        }
        Ok(())
    }

    /// Bring the dissenting copies of an agreement in line with the winner.
    pub fn restore_from<T>(&self, name: &str, agreement: &Agreement<T>) -> PerResult<Vec<u8>> {
        for &copy in &agreement.dissenting {
            let result = match agreement.value {
                Some(_) => self.layout.clone_copy(agreement.winner(), copy, name),
                None => self.layout.remove(copy, name),
            };
            result.map_err(|e| self.io_err("repair", copy, name, e))?;
        }
        Ok(to_u8(&agreement.dissenting))
    }

    fn repair_with<T: PartialEq + Clone>(&self, name: &str, opinions: Vec<Opinion<T>>) -> PerResult<RepairOutcome> {
        match vote(&opinions, self.ctx.quorum()) {
            Verdict::Agreed(agreement) if agreement.is_unanimous() => Ok(RepairOutcome::Clean),
            Verdict::Agreed(agreement) => {
                let code = self.dissent_code(&opinions, &agreement.dissenting);
                self.ctx.corruption_detected(name, code, &to_u8(&agreement.dissenting));
                let copies = self.restore_from(name, &agreement)?;
                Ok(RepairOutcome::Repaired { copies })
            }
            Verdict::NoQuorum { invalid, protection } => {
                let code = protection.unwrap_or_else(|| self.no_quorum_code());
                self.ctx.corruption_detected(name, code, &to_u8(&invalid));
                Ok(RepairOutcome::Unrecoverable { copies: to_u8(&invalid) })
            }
        }
    }

    /// Repair an element by comparing full payloads.
    pub fn repair(&self, name: &str) -> PerResult<RepairOutcome> {
        self.repair_with(name, self.opinions(name))
    }

    /// Repair an element by comparing payload digests.
    pub fn repair_by_digest(&self, name: &str) -> PerResult<RepairOutcome> {
        self.repair_with(name, self.digest_opinions(name))
    }

    /// Element names listed by at least a quorum of copies.
    pub fn names(&self) -> BTreeSet<String> {
        self.layout.names_with_quorum(self.ctx.quorum())
    }

    /// Element names listed by any copy.
    pub fn all_names(&self) -> BTreeSet<String> {
        self.layout.union_names()
    }

    pub fn usage(&self) -> PerResult<u64> {
        self.layout
            .disk_usage()
            .map_err(|e| PerError::io(format!("failed to measure {}", self.ctx.id), e))
    }

    pub fn element_usage(&self, name: &str) -> u64 {
        self.layout.element_usage(name)
    }
}

pub(crate) fn to_u8(copies: &[usize]) -> Vec<u8> {
    copies.iter().map(|&c| c as u8).collect()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::callbacks::CallbackRegistry;
    use crate::config::{StorageKind, StorageSettings};
    use crate::id::StorageId;
    use crate::protection::{DataProtection, NoProtection};
    use std::path::Path;

    pub fn context(dir: &Path, copies: u8) -> Arc<StorageContext> {
        context_with(dir, copies, false, Arc::new(NoProtection), Arc::new(CallbackRegistry::new()))
    }

    pub fn context_with(
        dir: &Path,
        copies: u8,
        protected: bool,
        protection: Arc<dyn DataProtection>,
        callbacks: Arc<CallbackRegistry>,
    ) -> Arc<StorageContext> {
        let id = StorageId::parse("test/store").unwrap();
        let mut settings = StorageSettings::new(id.clone());
        settings.redundancy.copies = copies;
        settings.authentication = protected;
        Arc::new(StorageContext {
            id,
            kind: StorageKind::KeyValue,
            dir: dir.to_path_buf(),
            settings,
            application_version: "1.0.0".into(),
            protection,
            callbacks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::context;
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> RedundantStore {
        let ctx = context(dir.path(), 3);
        let layout = CopyLayout::new(dir.path(), "copy", 3);
        let store = RedundantStore::new(ctx, layout, FrameKind::Record, true);
        store.prepare().unwrap();
        store
    }

    fn corrupt(store: &RedundantStore, copy: usize, name: &str) {
        let path = store.copy_path(copy, name);
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();
    }

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert_eq!(store.read("k").unwrap(), None);
        store.write("k", b"value").unwrap();
        assert_eq!(store.read("k").unwrap(), Some(b"value".to_vec()));
        assert_eq!(store.names().into_iter().collect::<Vec<_>>(), vec!["k".to_string()]);
    }

    #[test]
    fn test_read_survives_one_corrupt_copy() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.write("k", b"value").unwrap();
        corrupt(&store, 1, "k");
        assert_eq!(store.read("k").unwrap(), Some(b"value".to_vec()));
    }

    #[test]
    fn test_read_fails_with_two_corrupt_copies() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.write("k", b"value").unwrap();
        corrupt(&store, 0, "k");
        corrupt(&store, 2, "k");
        let err = store.read("k").unwrap_err();
        assert_eq!(err.code(), PerErrc::ValidationFailed);
    }

    #[test]
    fn test_repair_rewrites_dissenting_copy() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.write("k", b"value").unwrap();
        corrupt(&store, 2, "k");

        assert_eq!(store.repair("k").unwrap(), RepairOutcome::Repaired { copies: vec![2] });
        assert_eq!(store.repair("k").unwrap(), RepairOutcome::Clean);
        assert!(store.opinions("k").iter().all(|o| *o == Opinion::Present(b"value".to_vec())));
    }

    #[test]
    fn test_repair_removes_stray_copy() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.layout().write(0, "k", &frame::encode(FrameKind::Record, b"half")).unwrap();

        assert_eq!(store.read("k").unwrap(), None);
        assert_eq!(store.repair_by_digest("k").unwrap(), RepairOutcome::Repaired { copies: vec![0] });
        assert!(store.all_names().is_empty());
    }

    #[test]
    fn test_repair_without_quorum() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.write("k", b"value").unwrap();
        corrupt(&store, 0, "k");
        corrupt(&store, 1, "k");
        assert_eq!(
            store.repair("k").unwrap(),
            RepairOutcome::Unrecoverable { copies: vec![0, 1] }
        );
    }

    #[test]
    fn test_streaming_write_and_digest() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let src_path = dir.path().join("src");
        std::fs::write(&src_path, b"streamed content plus tail").unwrap();
        let mut src = File::open(&src_path).unwrap();

        store.write_from("f", &mut src, 16).unwrap();
        assert_eq!(store.read("f").unwrap(), Some(b"streamed content".to_vec()));

        let opinions = store.digest_opinions("f");
        let expected = ContentDigest::of(b"streamed content");
        assert!(opinions.iter().all(|o| *o == Opinion::Present(expected)));
        assert_eq!(store.element_usage("f"), 3 * (16 + OVERHEAD));
    }

    #[test]
    fn test_sealed_write_from_reads_only_len_bytes() {
        use crate::callbacks::CallbackRegistry;
        use crate::protection::NoProtection;

        let dir = TempDir::new().unwrap();
        let ctx = super::test_support::context_with(
            dir.path(),
            3,
            true,
            Arc::new(NoProtection),
            Arc::new(CallbackRegistry::new()),
        );
        let store = RedundantStore::new(ctx, CopyLayout::new(dir.path(), "copy", 3), FrameKind::FileContent, true);
        store.prepare().unwrap();
        assert!(store.is_sealed());

        let src_path = dir.path().join("image");
        std::fs::write(&src_path, b"sealed body and more").unwrap();
        let mut src = File::options().read(true).write(true).open(&src_path).unwrap();
        src.seek(SeekFrom::End(0)).unwrap();

        store.write_from("f", &mut src, 11).unwrap();
        assert_eq!(store.read("f").unwrap(), Some(b"sealed body".to_vec()));
    }
}
