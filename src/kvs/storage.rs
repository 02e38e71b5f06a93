//! Key-Value Storage
//!
//! One logical key → value namespace. Committed records live as redundant
//! copies under `kvs/copy_<i>/`; changes made through the API are buffered
//! in a pending change set and become durable only through
//! [`KeyValueStorage::sync_to_storage`].
//!
//! Lock order: pending change set, then per-key section. Callbacks are never
//! invoked while a key section is held.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::journal::{Journal, JournalOp, JournalState};
use super::record::{GenerationClock, KvsRecord};
use super::value::{KvsType, KvsValue, ValueType};
use crate::config::KvsConfig;
use crate::context::StorageContext;
use crate::crash_point::{maybe_crash, points};
use crate::error::{PerError, PerResult};
use crate::id::StorageId;
use crate::locks;
use crate::observability::{log_event, Event};
use crate::redundancy::{
    dir_size, CopyLayout, CopyReport, FrameKind, HeaderStore, RedundantStore, RepairOutcome,
    ReportScope, StorageHeader, OVERHEAD,
};
use crate::sections::Sections;
use crate::update::{self, HeaderState};

#[derive(Debug, Default)]
struct PendingChanges {
    /// `remove_all_keys` was called since the last commit
    cleared: bool,
    /// `None` is a removal
    changes: BTreeMap<String, Option<KvsValue>>,
}

impl PendingChanges {
    fn is_empty(&self) -> bool {
        !self.cleared && self.changes.is_empty()
    }
}

pub struct KeyValueStorage {
    ctx: Arc<StorageContext>,
    headers: HeaderStore,
    records: RedundantStore,
    journal: Journal,
    defaults: BTreeMap<String, KvsValue>,
    pending: Mutex<PendingChanges>,
    sections: Sections,
    clock: GenerationClock,
}

impl KeyValueStorage {
    /// Bind to the storage directory without touching it.
    pub(crate) fn attach(ctx: Arc<StorageContext>, config: &KvsConfig) -> Self {
        let layout = CopyLayout::new(&ctx.dir.join("kvs"), "copy", ctx.copies());
        Self {
            headers: HeaderStore::new(ctx.clone()),
            records: RedundantStore::new(ctx.clone(), layout, FrameKind::Record, true),
            journal: Journal::new(ctx.clone()),
            defaults: config.initial_values.clone(),
            pending: Mutex::new(PendingChanges::default()),
            sections: Sections::default(),
            clock: GenerationClock::default(),
            ctx,
        }
    }

    /// Attach, install on first use and finish an interrupted commit.
    ///
    /// The returned state tells the caller whether a migration is due.
    pub(crate) fn open(ctx: Arc<StorageContext>, config: &KvsConfig) -> PerResult<(Self, HeaderState)> {
        let storage = Self::attach(ctx, config);
        storage.records.prepare()?;
        storage.replay_journal()?;
        let state = update::ensure_header(&storage.ctx, &storage.headers, || storage.install_defaults())?;
        log_event(
            Event::StorageOpen,
            &[("storage", storage.ctx.id.as_str()), ("kind", "key_value")],
        );
        Ok((storage, state))
    }

    pub(crate) fn migrate(&self, previous: &str) -> PerResult<()> {
        update::run_migration(&self.ctx, &self.headers, previous)
    }

    pub fn storage_id(&self) -> &StorageId {
        &self.ctx.id
    }

    pub fn is_read_only(&self) -> bool {
        self.ctx.is_read_only()
    }

    fn ensure_writable(&self) -> PerResult<()> {
        if self.ctx.is_read_only() {
            return Err(PerError::illegal_write_access(self.ctx.id.as_str()));
        }
        Ok(())
    }

    // ==================
    // Reads
    // ==================

    /// Committed value of `key`, voted over its copies.
    fn read_committed(&self, key: &str) -> PerResult<Option<KvsValue>> {
        let section = self.sections.get(key);
        let _guard = section.read();
        let body = match self.records.read(key)? {
            Some(body) => body,
            None => return Ok(None),
        };
        let record = KvsRecord::decode(&body)
            .map_err(|e| PerError::validation_failed(key, format!("undecodable record: {}", e)))?;
        if record.key != key {
            return Err(PerError::validation_failed(
                key,
                format!("record belongs to key '{}'", record.key),
            ));
        }
        self.clock.observe(record.generation);
        Ok(Some(record.value))
    }

    /// Pending value if there is one, otherwise `None` when the committed
    /// value has to be consulted.
    fn pending_value(&self, key: &str) -> Option<PerResult<KvsValue>> {
        let pending = locks::lock(&self.pending);
        match pending.changes.get(key) {
            Some(Some(value)) => Some(Ok(value.clone())),
            Some(None) => Some(Err(PerError::key_not_found(key))),
            None if pending.cleared => Some(Err(PerError::key_not_found(key))),
            None => None,
        }
    }

    pub fn get_raw_value(&self, key: &str) -> PerResult<KvsValue> {
        if let Some(result) = self.pending_value(key) {
            return result;
        }
        self.read_committed(key)?
            .ok_or_else(|| PerError::key_not_found(key))
    }

    pub fn get_value<T: KvsType>(&self, key: &str) -> PerResult<T> {
        let value = self.get_raw_value(key)?;
        let found = value.value_type();
        T::from_value(value).ok_or_else(|| PerError::data_type_mismatch(key, T::TYPE, found))
    }

    /// Read a serde value stored with [`set_structured`](Self::set_structured).
    pub fn get_structured<T: DeserializeOwned>(&self, key: &str) -> PerResult<T> {
        match self.get_raw_value(key)? {
            KvsValue::Json(json) => serde_json::from_value(json)
                .map_err(|e| PerError::data_type_mismatch(key, std::any::type_name::<T>(), e)),
            other => Err(PerError::data_type_mismatch(key, ValueType::Json, other.value_type())),
        }
    }

    pub fn key_exists(&self, key: &str) -> PerResult<bool> {
        match self.pending_value(key) {
            Some(Ok(_)) => Ok(true),
            Some(Err(_)) => Ok(false),
            None => Ok(self.read_committed(key)?.is_some()),
        }
    }

    /// Committed keys overlaid with pending changes, sorted.
    pub fn get_all_keys(&self) -> PerResult<Vec<String>> {
        let pending = locks::lock(&self.pending);
        let mut keys: BTreeSet<String> = if pending.cleared {
            BTreeSet::new()
        } else {
            self.records.names()
        };
        for (key, change) in &pending.changes {
            match change {
                Some(_) => keys.insert(key.clone()),
                None => keys.remove(key),
            };
        }
        Ok(keys.into_iter().collect())
    }

    /// Payload size of the value in bytes.
    pub fn get_current_value_size(&self, key: &str) -> PerResult<u64> {
        Ok(self.get_raw_value(key)?.payload_size())
    }

    // ==================
    // Pending changes
    // ==================

    pub fn set_value(&self, key: &str, value: impl Into<KvsValue>) -> PerResult<()> {
        self.ensure_writable()?;
        locks::lock(&self.pending)
            .changes
            .insert(key.to_string(), Some(value.into()));
        Ok(())
    }

    /// Store any serde value as JSON.
    pub fn set_structured<T: Serialize>(&self, key: &str, value: &T) -> PerResult<()> {
        let json = serde_json::to_value(value)
            .map_err(|e| PerError::data_type_mismatch(key, ValueType::Json, e))?;
        self.set_value(key, KvsValue::Json(json))
    }

    pub fn remove_key(&self, key: &str) -> PerResult<()> {
        self.ensure_writable()?;
        if !self.key_exists(key)? {
            return Err(PerError::key_not_found(key));
        }
        locks::lock(&self.pending).changes.insert(key.to_string(), None);
        Ok(())
    }

    pub fn remove_all_keys(&self) -> PerResult<()> {
        self.ensure_writable()?;
        let mut pending = locks::lock(&self.pending);
        pending.cleared = true;
        pending.changes.clear();
        Ok(())
    }

    pub fn discard_pending_changes(&self) -> PerResult<()> {
        *locks::lock(&self.pending) = PendingChanges::default();
        Ok(())
    }

    // ==================
    // Commit
    // ==================

    /// Commit every pending change, or none of them.
    pub fn sync_to_storage(&self) -> PerResult<()> {
        self.ensure_writable()?;
        let mut pending = locks::lock(&self.pending);
        if pending.is_empty() {
            return Ok(());
        }

        let ops = self.build_ops(&pending);
        self.check_quota(&ops)?;

        self.journal.write(&ops)?;
        maybe_crash(points::KVS_AFTER_JOURNAL_WRITE);

        for (i, op) in ops.iter().enumerate() {
            self.apply(op)?;
            if i == 0 {
                maybe_crash(points::KVS_MID_APPLY);
            }
        }

        maybe_crash(points::KVS_BEFORE_JOURNAL_REMOVE);
        self.journal.remove()?;
        *pending = PendingChanges::default();

        log_event(
            Event::KvsSync,
            &[("storage", self.ctx.id.as_str()), ("ops", &ops.len().to_string())],
        );
        Ok(())
    }

    fn build_ops(&self, pending: &PendingChanges) -> Vec<JournalOp> {
        let mut ops = Vec::new();
        if pending.cleared {
            for key in self.records.all_names() {
                if !matches!(pending.changes.get(&key), Some(Some(_))) {
                    ops.push(JournalOp::Remove(key));
                }
            }
        }
        for (key, change) in &pending.changes {
            match change {
                Some(value) => ops.push(JournalOp::Put(KvsRecord::new(key.as_str(), self.clock.next(), value.clone()))),
                None if pending.cleared => {} // already removed above
                None => ops.push(JournalOp::Remove(key.clone())),
            }
        }
        ops
    }

    /// Physical size after applying `ops`, checked against the quota.
    fn check_quota(&self, ops: &[JournalOp]) -> PerResult<()> {
        let quota = match self.ctx.settings.quota_bytes {
            Some(quota) => quota,
            None => return Ok(()),
        };
        let current = dir_size(&self.ctx.dir)
            .map_err(|e| PerError::io(format!("failed to measure {}", self.ctx.id), e))?;
        let copies = self.ctx.copies() as u64;

        let mut after = current;
        for op in ops {
            after = after.saturating_sub(self.records.element_usage(op.key()));
            if let JournalOp::Put(record) = op {
                after += (record.encode().len() as u64 + OVERHEAD) * copies;
            }
        }
        if after > quota {
            return Err(PerError::quota_exceeded(quota)
                .with_details(format!("storage {} would use {} bytes", self.ctx.id, after)));
        }
        Ok(())
    }

    fn apply(&self, op: &JournalOp) -> PerResult<()> {
        let section = self.sections.get(op.key());
        let _guard = section.write();
        match op {
            JournalOp::Put(record) => self.records.write(&record.key, &record.encode()),
            JournalOp::Remove(key) => self.records.remove(key),
        }
    }

    /// Roll an interrupted commit forward, or drop a torn journal.
    fn replay_journal(&self) -> PerResult<()> {
        match self.journal.read()? {
            JournalState::Empty => return Ok(()),
            JournalState::Valid(ops) => {
                for op in &ops {
                    if let JournalOp::Put(record) = op {
                        self.clock.observe(record.generation);
                    }
                    self.apply(op)?;
                }
                log_event(
                    Event::JournalReplay,
                    &[("storage", self.ctx.id.as_str()), ("ops", &ops.len().to_string())],
                );
            }
            JournalState::Invalid(reason) => {
                log_event(
                    Event::JournalDiscarded,
                    &[("storage", self.ctx.id.as_str()), ("reason", &reason)],
                );
            }
        }
        self.journal.remove()
    }

    // ==================
    // Per-key maintenance
    // ==================

    /// Put the deployment value back, or remove the key without one.
    fn restore_default(&self, key: &str) -> PerResult<()> {
        match self.defaults.get(key) {
            Some(value) => {
                let record = KvsRecord::new(key, self.clock.next(), value.clone());
                self.records.write(key, &record.encode())
            }
            None => self.records.remove(key),
        }
    }

    /// Repair the copies of one key.
    ///
    /// Without a quorum the key falls back to its initial value (or is
    /// removed) and the call fails `ValidationFailed`.
    ///
    /// Allowed on read-only storages: repair rewrites copies to the content
    /// that was already committed (or deployed), never to new content.
    pub fn recover_key(&self, key: &str) -> PerResult<()> {
        let section = self.sections.get(key);
        let (recovered, report) = {
            let _guard = section.write();
            match self.records.repair(key)? {
                RepairOutcome::Clean => return Ok(()),
                RepairOutcome::Repaired { copies } => (true, CopyReport::single(key, &copies)),
                RepairOutcome::Unrecoverable { copies } => {
                    self.restore_default(key)?;
                    (false, CopyReport::single(key, &copies))
                }
            }
        };

        self.ctx.report_scope(ReportScope::Key, recovered, &report);
        if recovered {
            Ok(())
        } else {
            Err(PerError::validation_failed(
                key,
                "no quorum of valid copies, key reset to its initial state",
            ))
        }
    }

    /// Persist the deployment value of `key` right away.
    pub fn reset_key(&self, key: &str) -> PerResult<()> {
        self.ensure_writable()?;
        let value = self
            .defaults
            .get(key)
            .cloned()
            .ok_or_else(|| PerError::init_value_not_available(key))?;

        let mut pending = locks::lock(&self.pending);
        {
            let section = self.sections.get(key);
            let _guard = section.write();
            let record = KvsRecord::new(key, self.clock.next(), value.clone());
            self.records.write(key, &record.encode())?;
        }
        if pending.cleared {
            // keep it alive across the pending clear
            pending.changes.insert(key.to_string(), Some(value));
        } else {
            pending.changes.remove(key);
        }
        drop(pending);

        log_event(
            Event::ResetComplete,
            &[("storage", self.ctx.id.as_str()), ("key", key)],
        );
        Ok(())
    }

    // ==================
    // Storage-wide maintenance
    // ==================

    /// Write deployment values for keys that have no committed value.
    ///
    /// Returns the installed keys.
    pub(crate) fn install_missing_defaults(&self) -> PerResult<Vec<String>> {
        let mut installed = Vec::new();
        for (key, value) in &self.defaults {
            let section = self.sections.get(key);
            let _guard = section.write();
            if self.records.read(key)?.is_none() {
                let record = KvsRecord::new(key.as_str(), self.clock.next(), value.clone());
                self.records.write(key, &record.encode())?;
                installed.push(key.clone());
            }
        }
        Ok(installed)
    }

    fn install_defaults(&self) -> PerResult<()> {
        for (key, value) in &self.defaults {
            let record = KvsRecord::new(key.as_str(), self.clock.next(), value.clone());
            self.records.write(key, &record.encode())?;
        }
        Ok(())
    }

    /// Repair the header and every key of a closed storage.
    ///
    /// Header copies are reported with the storage kinds and no elements;
    /// keys are reported with the key kinds, one entry per broken copy.
    pub(crate) fn recover_storage(&self) -> PerResult<()> {
        self.records.prepare()?;
        self.headers.prepare()?;
        log_event(Event::RecoveryStart, &[("storage", self.ctx.id.as_str())]);

        let header_lost = match self.headers.repair()? {
            RepairOutcome::Clean => false,
            RepairOutcome::Repaired { copies } => {
                self.ctx
                    .report_scope(ReportScope::KeyValueStorage, true, &CopyReport::instances(&copies));
                false
            }
            RepairOutcome::Unrecoverable { copies } => {
                self.headers.store(&StorageHeader::new(
                    self.ctx.kind,
                    self.ctx.copies() as u8,
                    self.ctx.application_version.as_str(),
                ))?;
                self.ctx
                    .report_scope(ReportScope::KeyValueStorage, false, &CopyReport::instances(&copies));
                true
            }
        };

        self.replay_journal()?;

        let mut repaired = CopyReport::default();
        let mut lost = CopyReport::default();
        for key in self.records.all_names() {
            match self.records.repair(&key)? {
                RepairOutcome::Clean => {}
                RepairOutcome::Repaired { copies } => repaired.add(&key, &copies),
                RepairOutcome::Unrecoverable { copies } => {
                    self.restore_default(&key)?;
                    lost.add(&key, &copies);
                }
            }
        }
        self.ctx.report_scope(ReportScope::Key, true, &repaired);
        self.ctx.report_scope(ReportScope::Key, false, &lost);

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

    /// Drop all content of a closed storage and install it afresh.
    pub(crate) fn reset_storage(&self) -> PerResult<()> {
        self.ctx.remove_dir()?;
        self.records.prepare()?;
        self.install_defaults()?;
        self.headers.prepare()?;
        self.headers.store(&StorageHeader::new(
            self.ctx.kind,
            self.ctx.copies() as u8,
            self.ctx.application_version.as_str(),
        ))?;
        log_event(Event::ResetComplete, &[("storage", self.ctx.id.as_str())]);
        Ok(())
    }

    /// Physical bytes of the storage including header and all copies.
    pub(crate) fn usage(&self) -> PerResult<u64> {
        dir_size(&self.ctx.dir).map_err(|e| PerError::io(format!("failed to measure {}", self.ctx.id), e))
    }
}

impl Drop for KeyValueStorage {
    fn drop(&mut self) {
        let dropped = locks::lock(&self.pending).changes.len();
        log_event(
            Event::StorageClose,
            &[
                ("storage", self.ctx.id.as_str()),
                ("discarded", &dropped.to_string()),
            ],
        );
    }
}
