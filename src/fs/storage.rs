//! File Storage
//!
//! One logical filename → file namespace. Each file is two redundant
//! element sets:
//!
//! - content copies in `files/copy_<i>/`, protected like key records
//! - [`FileInfo`] copies in `files/info_<i>/`
//!
//! Content is written before its info is updated, and info is written
//! before content on creation, so a file with content always has info.
//!
//! At most one accessor per file exists at a time. The accessor holds an
//! [`OpenLease`], which also keeps the storage itself open.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::accessor::{ReadAccessor, ReadWriteAccessor};
use super::info::{FileCreationState, FileInfo, FileModificationState};
use super::open_mode::{Access, OpenMode};
use super::stream::BlockStream;
use crate::config::FileStorageConfig;
use crate::context::StorageContext;
use crate::error::{PerError, PerResult};
use crate::handle::UniqueHandle;
use crate::id::{encode_name, StorageId};
use crate::locks;
use crate::observability::{log_event, Event};
use crate::redundancy::{
    ContentDigest, CopyLayout, CopyReport, FrameKind, HeaderStore, RedundantStore, RepairOutcome,
    ReportScope, StorageHeader, HEADER_LEN, OVERHEAD,
};
use crate::sections::Sections;
use crate::update::{self, HeaderState};

/// Largest content a file may grow to under the storage quota.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WriteBudget {
    pub max_len: u64,
    pub quota: u64,
}

/// Outcome of repairing one file.
enum FileRecovery {
    Clean,
    Repaired(Vec<u8>),
    Lost(Vec<u8>),
}

/// Exclusive open claim on one file name.
pub(crate) struct OpenLease {
    core: Arc<FileStorageCore>,
    name: String,
}

impl OpenLease {
    fn claim(core: &Arc<FileStorageCore>, name: &str) -> PerResult<Self> {
        let mut open = locks::lock(&core.open_files);
        if !open.insert(name.to_string()) {
            return Err(PerError::resource_busy(format!("file '{}' is open", name))
                .with_details(format!("storage: {}", core.ctx.id)));
        }
        Ok(Self {
            core: core.clone(),
            name: name.to_string(),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn core(&self) -> &FileStorageCore {
        &self.core
    }
}

impl Drop for OpenLease {
    fn drop(&mut self) {
        locks::lock(&self.core.open_files).remove(&self.name);
    }
}

pub(crate) struct FileStorageCore {
    ctx: Arc<StorageContext>,
    headers: HeaderStore,
    contents: RedundantStore,
    infos: RedundantStore,
    work_dir: PathBuf,
    initial: BTreeMap<String, Vec<u8>>,
    max_files: Option<u32>,
    open_files: Mutex<HashSet<String>>,
    sections: Sections,
    /// The application data update callback is running
    migrating: AtomicBool,
}

impl FileStorageCore {
    pub(crate) fn attach(ctx: Arc<StorageContext>, config: &FileStorageConfig) -> PerResult<Self> {
        let mut initial = BTreeMap::new();
        for (name, content) in &config.initial_files {
            let bytes = content
                .bytes()
                .map_err(|e| PerError::validation_failed(name, e.to_string()))?;
            initial.insert(name.clone(), bytes);
        }
        let files = ctx.dir.join("files");
        Ok(Self {
            headers: HeaderStore::new(ctx.clone()),
            contents: RedundantStore::new(
                ctx.clone(),
                CopyLayout::new(&files, "copy", ctx.copies()),
                FrameKind::FileContent,
                true,
            ),
            infos: RedundantStore::new(
                ctx.clone(),
                CopyLayout::new(&files, "info", ctx.copies()),
                FrameKind::FileInfo,
                false,
            ),
            work_dir: files.join("work"),
            initial,
            max_files: config.max_files,
            open_files: Mutex::new(HashSet::new()),
            sections: Sections::default(),
            migrating: AtomicBool::new(false),
            ctx,
        })
    }

    fn prepare(&self) -> PerResult<()> {
        self.contents.prepare()?;
        self.infos.prepare()?;
        // working images of a previous process are stale
        let result = match fs::remove_dir_all(&self.work_dir) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => fs::create_dir_all(&self.work_dir),
        };
        result.map_err(|e| PerError::io(format!("failed to prepare working area of {}", self.ctx.id), e))
    }

    pub(crate) fn open(ctx: Arc<StorageContext>, config: &FileStorageConfig) -> PerResult<(Self, HeaderState)> {
        let core = Self::attach(ctx, config)?;
        core.prepare()?;
        let state = update::ensure_header(&core.ctx, &core.headers, || {
            core.install_initial(FileCreationState::CreatedDuringInstallation, false)
                .map(|_| ())
        })?;
        log_event(
            Event::StorageOpen,
            &[("storage", core.ctx.id.as_str()), ("kind", "file")],
        );
        Ok((core, state))
    }

    pub(crate) fn migrate(&self, previous: &str) -> PerResult<()> {
        self.migrating.store(true, Ordering::SeqCst);
        let result = update::run_migration(&self.ctx, &self.headers, previous);
        self.migrating.store(false, Ordering::SeqCst);
        result
    }

    fn ensure_writable(&self) -> PerResult<()> {
        if self.ctx.is_read_only() {
            return Err(PerError::illegal_write_access(self.ctx.id.as_str()));
        }
        Ok(())
    }

    fn io_err(&self, what: &str, name: &str, e: io::Error) -> PerError {
        PerError::io(format!("failed to {} '{}'", what, name), e)
            .with_details(format!("storage: {}", self.ctx.id))
    }

    fn work_path(&self, name: &str) -> PathBuf {
        self.work_dir.join(encode_name(name))
    }

    /// Agreed content digest and the lowest copy holding it.
    /// Callers hold the file's section.
    fn digest_of(&self, name: &str) -> PerResult<Option<(ContentDigest, usize)>> {
        let opinions = self.contents.digest_opinions(name);
        let agreement = self.contents.decide(name, &opinions)?;
        let winner = agreement.agreeing.first().copied().unwrap_or(0);
        Ok(agreement.value.map(|digest| (digest, winner)))
    }

    fn load_info(&self, name: &str) -> PerResult<Option<FileInfo>> {
        match self.infos.read(name)? {
            Some(body) => FileInfo::from_json(name, &body).map(Some),
            None => Ok(None),
        }
    }

    fn store_info(&self, name: &str, info: &FileInfo) -> PerResult<()> {
        self.infos.write(name, &info.to_json()?)
    }

    fn creation_state(&self) -> FileCreationState {
        if self.migrating.load(Ordering::SeqCst) {
            FileCreationState::CreatedDuringUpdate
        } else {
            FileCreationState::CreatedByApplication
        }
    }

    fn modification_state(&self) -> FileModificationState {
        if self.migrating.load(Ordering::SeqCst) {
            FileModificationState::ModifiedDuringUpdate
        } else {
            FileModificationState::ModifiedByApplication
        }
    }

    /// Write content and a fresh info for `name`.
    fn create(&self, name: &str, content: &[u8], state: FileCreationState) -> PerResult<()> {
        self.store_info(name, &FileInfo::created(state))?;
        self.contents.write(name, content)
    }

    /// Install deployment files. With `only_missing`, existing files are
    /// left alone. Returns the installed names.
    fn install_initial(&self, state: FileCreationState, only_missing: bool) -> PerResult<Vec<String>> {
        let mut installed = Vec::new();
        for (name, content) in &self.initial {
            let section = self.sections.get(name);
            let _guard = section.write();
            if only_missing && self.digest_of(name)?.is_some() {
                continue;
            }
            self.create(name, content, state)?;
            installed.push(name.clone());
        }
        Ok(installed)
    }

    pub(crate) fn install_missing_defaults(&self) -> PerResult<Vec<String>> {
        self.install_initial(FileCreationState::CreatedDuringUpdate, true)
    }

    /// Commit a working image of `len` bytes.
    pub(crate) fn commit(&self, name: &str, image: &mut File, len: u64) -> PerResult<()> {
        let section = self.sections.get(name);
        let _guard = section.write();
        self.contents.write_from(name, image, len)?;

        let state = self.modification_state();
        let info = match self.load_info(name) {
            Ok(Some(info)) => info.modified(state),
            _ => FileInfo::created(self.creation_state()).modified(state),
        };
        self.store_info(name, &info)?;

        log_event(
            Event::FileSync,
            &[
                ("storage", self.ctx.id.as_str()),
                ("file", name),
                ("bytes", &len.to_string()),
            ],
        );
        Ok(())
    }

    /// Physical bytes without working images.
    pub(crate) fn usage(&self) -> PerResult<u64> {
        Ok(self.headers.usage()? + self.contents.usage()? + self.infos.usage()?)
    }

    pub(crate) fn write_budget(&self, name: &str) -> PerResult<Option<WriteBudget>> {
        let quota = match self.ctx.settings.quota_bytes {
            Some(quota) => quota,
            None => return Ok(None),
        };
        let others = self
            .usage()?
            .saturating_sub(self.contents.element_usage(name));
        let per_copy = quota.saturating_sub(others) / self.ctx.copies() as u64;
        Ok(Some(WriteBudget {
            max_len: per_copy.saturating_sub(OVERHEAD),
            quota,
        }))
    }

    /// Copy the agreed content into a fresh working image.
    fn fill_image(&self, name: &str, winner: usize, len: u64, image: &mut File) -> PerResult<u64> {
        if self.contents.is_sealed() {
            let plain = self.contents.read(name)?.unwrap_or_default();
            image
                .write_all(&plain)
                .map_err(|e| self.io_err("stage", name, e))?;
            return Ok(plain.len() as u64);
        }
        let result = (|| {
            let mut src = File::open(self.contents.copy_path(winner, name))?;
            src.seek(SeekFrom::Start(HEADER_LEN as u64))?;
            io::copy(&mut src.take(len), image)
        })();
        let copied = result.map_err(|e| self.io_err("stage", name, e))?;
        if copied != len {
            return Err(PerError::validation_failed(name, "content copy shrank while staging"));
        }
        Ok(len)
    }

    /// Repair content and info of one file. Callers hold its open lease.
    fn recover_element(&self, name: &str) -> PerResult<FileRecovery> {
        let section = self.sections.get(name);
        let _guard = section.write();

        let mut copies = BTreeSet::new();
        let mut content_repaired = false;
        match self.contents.repair_by_digest(name)? {
            RepairOutcome::Clean => {}
            RepairOutcome::Repaired { copies: c } => {
                copies.extend(c);
                content_repaired = true;
            }
            RepairOutcome::Unrecoverable { copies: c } => {
                self.restore_initial(name, FileCreationState::CreatedDuringRecovery)?;
                return Ok(FileRecovery::Lost(c));
            }
        }

        let info_lost = match self.infos.repair(name)? {
            RepairOutcome::Clean => false,
            RepairOutcome::Repaired { copies: c } => {
                copies.extend(c);
                false
            }
            RepairOutcome::Unrecoverable { copies: c } => {
                copies.extend(c);
                true
            }
        };

        if self.digest_of(name)?.is_none() {
            // content agreed absent, drop stray info
            self.infos.remove(name)?;
        } else if info_lost {
            let info = FileInfo::created(FileCreationState::CreatedDuringRecovery);
            self.store_info(name, &info)?;
        } else if content_repaired {
            if let Some(info) = self.load_info(name)? {
                self.store_info(name, &info.modified(FileModificationState::ModifiedDuringRecovery))?;
            }
        }

        if copies.is_empty() {
            Ok(FileRecovery::Clean)
        } else {
            Ok(FileRecovery::Repaired(copies.into_iter().collect()))
        }
    }

    /// Put the deployment content back, or remove the file without one.
    fn restore_initial(&self, name: &str, state: FileCreationState) -> PerResult<()> {
        match self.initial.get(name) {
            Some(content) => self.create(name, content, state),
            None => {
                self.contents.remove(name)?;
                self.infos.remove(name)
            }
        }
    }

    /// Repair the header and every file of a closed storage.
    ///
    /// Header copies are reported with the storage kinds and no elements;
    /// files are reported with the file kinds, one entry per broken copy.
    pub(crate) fn recover_storage(self: &Arc<Self>) -> PerResult<()> {
        self.prepare()?;
        self.headers.prepare()?;
        log_event(Event::RecoveryStart, &[("storage", self.ctx.id.as_str())]);

        let header_lost = match self.headers.repair()? {
            RepairOutcome::Clean => false,
            RepairOutcome::Repaired { copies } => {
                self.ctx
                    .report_scope(ReportScope::FileStorage, true, &CopyReport::instances(&copies));
                false
            }
            RepairOutcome::Unrecoverable { copies } => {
                self.headers.store(&StorageHeader::new(
                    self.ctx.kind,
                    self.ctx.copies() as u8,
                    self.ctx.application_version.as_str(),
                ))?;
                self.ctx
                    .report_scope(ReportScope::FileStorage, false, &CopyReport::instances(&copies));
                true
            }
        };

        let mut repaired = CopyReport::default();
        let mut lost = CopyReport::default();
        let mut names = self.contents.all_names();
        names.extend(self.infos.all_names());
        for name in names {
            let _lease = OpenLease::claim(self, &name)?;
            match self.recover_element(&name)? {
                FileRecovery::Clean => {}
                FileRecovery::Repaired(copies) => repaired.add(&name, &copies),
                FileRecovery::Lost(copies) => lost.add(&name, &copies),
            }
        }
        self.ctx.report_scope(ReportScope::File, true, &repaired);
        self.ctx.report_scope(ReportScope::File, false, &lost);

        log_event(
            Event::RecoveryComplete,
            &[
                ("storage", self.ctx.id.as_str()),
                ("repaired", &repaired.copies.len().to_string()),
                ("lost", &lost.copies.len().to_string()),
            ],
        );
        if (header_lost || !lost.is_empty()) && repaired.is_empty() {
            return Err(PerError::validation_failed(
                self.ctx.id.as_str(),
                "no quorum of valid copies, content reset to its initial state",
            ));
        }
        Ok(())
    }

    /// Drop all content of a closed storage and recreate the deployment
    /// files.
    pub(crate) fn reset_storage(&self) -> PerResult<()> {
        self.ctx.remove_dir()?;
        self.prepare()?;
        self.install_initial(FileCreationState::CreatedDuringReset, false)?;
        self.headers.prepare()?;
        self.headers.store(&StorageHeader::new(
            self.ctx.kind,
            self.ctx.copies() as u8,
            self.ctx.application_version.as_str(),
        ))?;
        log_event(Event::ResetComplete, &[("storage", self.ctx.id.as_str())]);
        Ok(())
    }

    /// Claim, vote and stage `name` for an accessor.
    fn open_accessor(
        self: &Arc<Self>,
        name: &str,
        access: Access,
        mode: OpenMode,
        buffer: Vec<u8>,
    ) -> PerResult<(ReadAccessor, bool)> {
        mode.validate(access)?;
        if access.can_write() {
            self.ensure_writable()?;
        }
        let lease = OpenLease::claim(self, name)?;
        let section = self.sections.get(name);
        let _guard = section.write();

        let (digest, winner) = match self.digest_of(name)? {
            Some(found) => found,
            None if !access.can_write() => return Err(PerError::file_not_found(name)),
            None => {
                if let Some(max) = self.max_files {
                    if self.contents.names().len() >= max as usize {
                        return Err(PerError::too_many_files(max));
                    }
                }
                self.create(name, &[], self.creation_state())?;
                (ContentDigest::of(&[]), 0)
            }
        };

        if !self.ctx.is_read_only() {
            if let Some(info) = self.load_info(name)? {
                self.store_info(name, &info.accessed())?;
            }
        }

        let truncate = mode.contains(OpenMode::TRUNCATE);
        let (stream, work) = if access == Access::ReadOnly && !self.contents.is_sealed() {
            // read the winning copy in place
            let file = File::open(self.contents.copy_path(winner, name)).map_err(|e| self.io_err("open", name, e))?;
            (BlockStream::new(file, HEADER_LEN as u64, digest.len, buffer), None)
        } else {
            let path = self.work_path(name);
            let mut image = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)
                .map_err(|e| self.io_err("stage", name, e))?;
            let staged = if truncate {
                Ok(0)
            } else {
                self.fill_image(name, winner, digest.len, &mut image)
            };
            let len = match staged {
                Ok(len) => len,
                Err(e) => {
                    let _ = fs::remove_file(&path);
                    return Err(e);
                }
            };
            (BlockStream::new(image, 0, len, buffer), Some(path))
        };

        let position = if mode.contains(OpenMode::AT_THE_END) {
            stream.size()
        } else {
            0
        };
        let dirty = truncate && digest.len > 0;
        Ok((ReadAccessor::new(stream, position, work, lease), dirty))
    }
}

impl Drop for FileStorageCore {
    fn drop(&mut self) {
        log_event(
            Event::StorageClose,
            &[("storage", self.ctx.id.as_str()), ("kind", "file")],
        );
    }
}

/// Public face of an open file storage.
pub struct FileStorage {
    core: Arc<FileStorageCore>,
}

impl FileStorage {
    pub(crate) fn from_core(core: Arc<FileStorageCore>) -> Self {
        Self { core }
    }

    pub(crate) fn core(&self) -> &Arc<FileStorageCore> {
        &self.core
    }

    pub fn storage_id(&self) -> &StorageId {
        &self.core.ctx.id
    }

    pub fn is_read_only(&self) -> bool {
        self.core.ctx.is_read_only()
    }

    /// Names of all files, sorted.
    pub fn get_all_file_names(&self) -> PerResult<Vec<String>> {
        Ok(self.core.contents.names().into_iter().collect())
    }

    pub fn file_exists(&self, name: &str) -> PerResult<bool> {
        let section = self.core.sections.get(name);
        let _guard = section.read();
        Ok(self.core.digest_of(name)?.is_some())
    }

    pub fn delete_file(&self, name: &str) -> PerResult<()> {
        self.core.ensure_writable()?;
        let _lease = OpenLease::claim(&self.core, name)?;
        let section = self.core.sections.get(name);
        let _guard = section.write();
        if self.core.digest_of(name)?.is_none() {
            return Err(PerError::file_not_found(name));
        }
        self.core.contents.remove(name)?;
        self.core.infos.remove(name)
    }

    /// Committed content size in bytes.
    pub fn get_current_file_size(&self, name: &str) -> PerResult<u64> {
        let section = self.core.sections.get(name);
        let _guard = section.read();
        match self.core.digest_of(name)? {
            Some((digest, _)) => Ok(digest.len),
            None => Err(PerError::file_not_found(name)),
        }
    }

    pub fn get_file_info(&self, name: &str) -> PerResult<FileInfo> {
        let section = self.core.sections.get(name);
        let _guard = section.read();
        if self.core.digest_of(name)?.is_none() {
            return Err(PerError::file_not_found(name));
        }
        self.core
            .load_info(name)?
            .ok_or_else(|| PerError::validation_failed(name, "file has no info"))
    }

    /// Repair the copies of one closed file.
    ///
    /// Without a quorum the file falls back to its initial content (or is
    /// removed) and the call fails `ValidationFailed`. Like key recovery it
    /// is allowed on read-only storages, since it only restores content
    /// that was already committed or deployed.
    pub fn recover_file(&self, name: &str) -> PerResult<()> {
        let lease = OpenLease::claim(&self.core, name)?;
        let outcome = self.core.recover_element(name)?;
        drop(lease);

        match outcome {
            FileRecovery::Clean => Ok(()),
            FileRecovery::Repaired(copies) => {
                self.core
                    .ctx
                    .report_scope(ReportScope::File, true, &CopyReport::single(name, &copies));
                Ok(())
            }
            FileRecovery::Lost(copies) => {
                self.core
                    .ctx
                    .report_scope(ReportScope::File, false, &CopyReport::single(name, &copies));
                Err(PerError::validation_failed(
                    name,
                    "no quorum of valid copies, file reset to its initial state",
                ))
            }
        }
    }

    /// Replace a closed file with its deployment content.
    pub fn reset_file(&self, name: &str) -> PerResult<()> {
        self.core.ensure_writable()?;
        let content = self
            .core
            .initial
            .get(name)
            .ok_or_else(|| PerError::init_value_not_available(name))?;
        let _lease = OpenLease::claim(&self.core, name)?;
        let section = self.core.sections.get(name);
        let _guard = section.write();

        let info = match self.core.load_info(name) {
            Ok(Some(info)) if self.core.digest_of(name).ok().flatten().is_some() => {
                info.modified(FileModificationState::ModifiedDuringReset)
            }
            _ => FileInfo::created(FileCreationState::CreatedDuringReset),
        };
        self.core.store_info(name, &info)?;
        self.core.contents.write(name, content)?;

        log_event(
            Event::ResetComplete,
            &[("storage", self.core.ctx.id.as_str()), ("file", name)],
        );
        Ok(())
    }

    fn open_read(&self, name: &str, mode: OpenMode, buffer: Vec<u8>) -> PerResult<UniqueHandle<ReadAccessor>> {
        let (reader, _) = self.core.open_accessor(name, Access::ReadOnly, mode, buffer)?;
        Ok(UniqueHandle::new(reader))
    }

    fn open_write(
        &self,
        name: &str,
        access: Access,
        mode: OpenMode,
        buffer: Vec<u8>,
    ) -> PerResult<UniqueHandle<ReadWriteAccessor>> {
        let (reader, dirty) = self.core.open_accessor(name, access, mode, buffer)?;
        Ok(UniqueHandle::new(ReadWriteAccessor::new(reader, mode, dirty)))
    }

    pub fn open_file_read_only(&self, name: &str) -> PerResult<UniqueHandle<ReadAccessor>> {
        self.open_read(name, OpenMode::AT_THE_BEGINNING, Vec::new())
    }

    pub fn open_file_read_only_with_mode(&self, name: &str, mode: OpenMode) -> PerResult<UniqueHandle<ReadAccessor>> {
        self.open_read(name, mode, Vec::new())
    }

    /// `buffer` becomes the read cache; its length is the block size.
    pub fn open_file_read_only_with_buffer(
        &self,
        name: &str,
        mode: OpenMode,
        buffer: Vec<u8>,
    ) -> PerResult<UniqueHandle<ReadAccessor>> {
        self.open_read(name, mode, buffer)
    }

    /// Opens with `TRUNCATE`, creating the file if needed.
    pub fn open_file_write_only(&self, name: &str) -> PerResult<UniqueHandle<ReadWriteAccessor>> {
        self.open_write(name, Access::WriteOnly, OpenMode::TRUNCATE, Vec::new())
    }

    pub fn open_file_write_only_with_mode(
        &self,
        name: &str,
        mode: OpenMode,
    ) -> PerResult<UniqueHandle<ReadWriteAccessor>> {
        self.open_write(name, Access::WriteOnly, mode, Vec::new())
    }

    pub fn open_file_write_only_with_buffer(
        &self,
        name: &str,
        mode: OpenMode,
        buffer: Vec<u8>,
    ) -> PerResult<UniqueHandle<ReadWriteAccessor>> {
        self.open_write(name, Access::WriteOnly, mode, buffer)
    }

    /// Opens at the beginning, creating the file if needed.
    pub fn open_file_read_write(&self, name: &str) -> PerResult<UniqueHandle<ReadWriteAccessor>> {
        self.open_write(name, Access::ReadWrite, OpenMode::AT_THE_BEGINNING, Vec::new())
    }

    pub fn open_file_read_write_with_mode(
        &self,
        name: &str,
        mode: OpenMode,
    ) -> PerResult<UniqueHandle<ReadWriteAccessor>> {
        self.open_write(name, Access::ReadWrite, mode, Vec::new())
    }

    pub fn open_file_read_write_with_buffer(
        &self,
        name: &str,
        mode: OpenMode,
        buffer: Vec<u8>,
    ) -> PerResult<UniqueHandle<ReadWriteAccessor>> {
        self.open_write(name, Access::ReadWrite, mode, buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::CallbackRegistry;
    use crate::config::{InitialFile, StorageKind, StorageSettings};
    use crate::error::PerErrc;
    use crate::protection::NoProtection;
    use tempfile::TempDir;

    fn config() -> FileStorageConfig {
        FileStorageConfig::new(StorageId::parse("test/files").unwrap())
            .with_initial_file("readme.txt", InitialFile::Text("hello\nworld".into()))
    }

    fn ctx_for(dir: &TempDir, config: &FileStorageConfig) -> Arc<StorageContext> {
        let mut settings: StorageSettings = config.settings.clone();
        settings.id = StorageId::parse("test/files").unwrap();
        Arc::new(StorageContext {
            id: settings.id.clone(),
            kind: StorageKind::File,
            dir: dir.path().to_path_buf(),
            settings,
            application_version: "1.0.0".into(),
            protection: Arc::new(NoProtection),
            callbacks: Arc::new(CallbackRegistry::new()),
        })
    }

    fn open_with(dir: &TempDir, config: &FileStorageConfig) -> FileStorage {
        let (core, _) = FileStorageCore::open(ctx_for(dir, config), config).unwrap();
        FileStorage::from_core(Arc::new(core))
    }

    fn open(dir: &TempDir) -> FileStorage {
        open_with(dir, &config())
    }

    #[test]
    fn test_install_and_read() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir);
        assert_eq!(storage.get_all_file_names().unwrap(), vec!["readme.txt"]);
        assert_eq!(storage.get_current_file_size("readme.txt").unwrap(), 11);

        let info = storage.get_file_info("readme.txt").unwrap();
        assert_eq!(info.creation_state, FileCreationState::CreatedDuringInstallation);

        let mut reader = storage.open_file_read_only("readme.txt").unwrap();
        assert_eq!(reader.read_line(b'\n').unwrap(), "hello");
        assert_eq!(reader.read_text_to_end().unwrap(), "world");
        assert!(reader.is_eof());
    }

    #[test]
    fn test_second_open_is_busy() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir);
        let reader = storage.open_file_read_only("readme.txt").unwrap();
        let err = storage.open_file_read_write("readme.txt").unwrap_err();
        assert_eq!(err.code(), PerErrc::ResourceBusy);
        assert_eq!(storage.delete_file("readme.txt").unwrap_err().code(), PerErrc::ResourceBusy);
        drop(reader);
        storage.delete_file("readme.txt").unwrap();
        assert!(!storage.file_exists("readme.txt").unwrap());
    }

    #[test]
    fn test_write_visible_after_close() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir);
        {
            let mut writer = storage.open_file_write_only("new.bin").unwrap();
            writer.write_binary(&[1, 2, 3]).unwrap();
            assert_eq!(storage.get_current_file_size("new.bin").unwrap(), 0);
        }
        assert_eq!(storage.get_current_file_size("new.bin").unwrap(), 3);
        let info = storage.get_file_info("new.bin").unwrap();
        assert_eq!(info.creation_state, FileCreationState::CreatedByApplication);
        assert_eq!(info.modification_state, FileModificationState::ModifiedByApplication);
        assert!(dir.path().join("files/work").read_dir().unwrap().next().is_none());
    }

    #[test]
    fn test_read_only_open_of_missing_file() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir);
        let err = storage.open_file_read_only("missing").unwrap_err();
        assert_eq!(err.code(), PerErrc::FileNotFound);
        assert!(!storage.file_exists("missing").unwrap());
    }

    #[test]
    fn test_max_files() {
        let dir = TempDir::new().unwrap();
        let config = config().with_max_files(2);
        let storage = open_with(&dir, &config);
        storage.open_file_write_only("second").unwrap();
        let err = storage.open_file_write_only("third").unwrap_err();
        assert_eq!(err.code(), PerErrc::TooManyFiles);
    }

    #[test]
    fn test_reset_file() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir);
        {
            let mut writer = storage.open_file_write_only("readme.txt").unwrap();
            writer.write_text("changed").unwrap();
        }
        storage.reset_file("readme.txt").unwrap();
        let mut reader = storage.open_file_read_only("readme.txt").unwrap();
        assert_eq!(reader.read_text_to_end().unwrap(), "hello\nworld");
        drop(reader);

        let info = storage.get_file_info("readme.txt").unwrap();
        assert_eq!(info.modification_state, FileModificationState::ModifiedDuringReset);
        assert_eq!(storage.reset_file("other").unwrap_err().code(), PerErrc::InitValueNotAvailable);
    }

    #[test]
    fn test_recover_file_repairs_one_copy() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir);
        let path = storage.core.contents.copy_path(1, "readme.txt");
        std::fs::write(&path, b"garbage").unwrap();

        assert_eq!(storage.get_current_file_size("readme.txt").unwrap(), 11);
        storage.recover_file("readme.txt").unwrap();
        assert!(storage
            .core
            .contents
            .digest_opinions("readme.txt")
            .iter()
            .all(|o| o.is_valid()));
        let info = storage.get_file_info("readme.txt").unwrap();
        assert_eq!(info.modification_state, FileModificationState::ModifiedDuringRecovery);
    }
}
