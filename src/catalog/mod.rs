//! Storage catalog
//!
//! Maps configured storage ids to their open instances and hosts every
//! storage-level entry point.
//!
//! Each id is in exactly one state:
//!
//! - closed
//! - open: a live instance, shared by every handle
//! - migrating: a version migration or update runs on one thread; only that
//!   thread (and the callbacks it runs) may reach the instance
//! - maintenance: a recover, reset, update or size query is running
//!
//! Conflicts never wait: opening an id that is migrating or under
//! maintenance, or starting maintenance on an open id, fails `ResourceBusy`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, ThreadId};

use crate::callbacks::CallbackRegistry;
use crate::collaborator::{CollaboratorSink, LifecycleState};
use crate::config::{ConfigError, DeploymentConfig, FileStorageConfig, KvsConfig, StorageKind, StorageSettings};
use crate::context::StorageContext;
use crate::error::{PerError, PerResult};
use crate::fs::{FileStorage, FileStorageCore};
use crate::handle::SharedHandle;
use crate::id::StorageId;
use crate::kvs::KeyValueStorage;
use crate::locks;
use crate::observability::{log_event, Event, Logger};
use crate::protection::{DataProtection, NoProtection};
use crate::redundancy::RecoveryReportKind;
use crate::update::HeaderState;

enum Instance {
    Kvs(Weak<KeyValueStorage>),
    Files(Weak<FileStorageCore>),
}

impl Instance {
    fn is_alive(&self) -> bool {
        match self {
            Instance::Kvs(weak) => weak.strong_count() > 0,
            Instance::Files(weak) => weak.strong_count() > 0,
        }
    }
}

enum Slot {
    Closed,
    Open(Instance),
    Migrating { instance: Instance, owner: ThreadId },
    Maintenance,
}

impl Slot {
    /// Whether maintenance must keep away.
    fn is_busy(&self) -> bool {
        match self {
            Slot::Open(instance) => instance.is_alive(),
            Slot::Migrating { .. } | Slot::Maintenance => true,
            Slot::Closed => false,
        }
    }

    /// The instance the calling thread may share, if any.
    fn shared(&self, id: &StorageId) -> PerResult<Option<&Instance>> {
        match self {
            Slot::Closed => Ok(None),
            Slot::Open(instance) => Ok(Some(instance)),
            Slot::Migrating { instance, owner } if *owner == thread::current().id() => Ok(Some(instance)),
            Slot::Migrating { .. } | Slot::Maintenance => Err(StorageCatalog::busy(id)),
        }
    }

    /// State after migration or maintenance on this slot ends.
    fn settled(self) -> Slot {
        match self {
            Slot::Migrating { instance, .. } if instance.is_alive() => Slot::Open(instance),
            Slot::Migrating { .. } | Slot::Maintenance | Slot::Closed => Slot::Closed,
            open @ Slot::Open(_) => open,
        }
    }
}

/// Marks an id as under maintenance until dropped.
struct MaintenanceGuard<'a> {
    catalog: &'a StorageCatalog,
    id: StorageId,
}

impl Drop for MaintenanceGuard<'_> {
    fn drop(&mut self) {
        if let Some(slot) = self.catalog.slots.get(&self.id) {
            let mut slot = locks::lock(slot);
            let state = std::mem::replace(&mut *slot, Slot::Closed);
            *slot = state.settled();
        }
        self.catalog
            .callbacks
            .report_state(&self.id, LifecycleState::MaintenanceDone);
    }
}

pub struct StorageCatalog {
    config: DeploymentConfig,
    protection: Arc<dyn DataProtection>,
    callbacks: Arc<CallbackRegistry>,
    slots: BTreeMap<StorageId, Mutex<Slot>>,
}

impl StorageCatalog {
    /// Validate the manifest and set up an empty catalog.
    pub fn new(config: DeploymentConfig) -> Result<Self, ConfigError> {
        Self::with_protection(config, Arc::new(NoProtection))
    }

    /// Like [`new`](Self::new), with a protection provider for storages
    /// configured with encryption or authentication.
    pub fn with_protection(config: DeploymentConfig, protection: Arc<dyn DataProtection>) -> Result<Self, ConfigError> {
        config.validate()?;
        Logger::set_min_severity(config.severity()?);

        let slots = config
            .key_value_storages
            .iter()
            .map(|c| &c.settings.id)
            .chain(config.file_storages.iter().map(|c| &c.settings.id))
            .map(|id| (id.clone(), Mutex::new(Slot::Closed)))
            .collect();

        log_event(
            Event::CatalogInit,
            &[
                ("root", &config.root_dir.display().to_string()),
                ("version", &config.application_version),
                ("kvs", &config.key_value_storages.len().to_string()),
                ("files", &config.file_storages.len().to_string()),
            ],
        );

        Ok(Self {
            config,
            protection,
            callbacks: Arc::new(CallbackRegistry::new()),
            slots,
        })
    }

    pub fn config(&self) -> &DeploymentConfig {
        &self.config
    }

    // ==================
    // Callbacks
    // ==================

    /// Replaces any earlier registration.
    pub fn register_recovery_report_callback<F>(&self, f: F)
    where
        F: Fn(&StorageId, RecoveryReportKind, &[String], &[u8]) + Send + Sync + 'static,
    {
        self.callbacks.register_recovery_report_callback(f);
    }

    /// Replaces any earlier registration.
    pub fn register_application_data_update_callback<F>(&self, f: F)
    where
        F: Fn(&StorageId, &str) + Send + Sync + 'static,
    {
        self.callbacks.register_application_data_update_callback(f);
    }

    pub fn set_collaborator(&self, sink: Arc<dyn CollaboratorSink>) {
        self.callbacks.set_collaborator(sink);
    }

    pub fn clear_callbacks(&self) {
        self.callbacks.clear();
    }

    // ==================
    // Internals
    // ==================

    fn slot(&self, id: &StorageId) -> PerResult<&Mutex<Slot>> {
        self.slots
            .get(id)
            .ok_or_else(|| PerError::storage_not_found(id.as_str()))
    }

    fn context(&self, settings: &StorageSettings, kind: StorageKind) -> Arc<StorageContext> {
        Arc::new(StorageContext {
            id: settings.id.clone(),
            kind,
            dir: settings.id.dir_under(&self.config.root_dir),
            settings: settings.clone(),
            application_version: self.config.application_version.clone(),
            protection: self.protection.clone(),
            callbacks: self.callbacks.clone(),
        })
    }

    fn busy(id: &StorageId) -> PerError {
        PerError::resource_busy(format!("storage {} is open or under maintenance", id))
    }

    /// Claim `id` for maintenance. Fails if it is open or already claimed.
    fn begin_maintenance(&self, id: &StorageId) -> PerResult<MaintenanceGuard<'_>> {
        let slot = self.slot(id)?;
        {
            let mut slot = locks::lock(slot);
            if slot.is_busy() {
                return Err(Self::busy(id));
            }
            *slot = Slot::Maintenance;
        }
        self.callbacks
            .report_state(id, LifecycleState::MaintenanceRunning);
        Ok(MaintenanceGuard {
            catalog: self,
            id: id.clone(),
        })
    }

    /// Give the calling thread sole access to `instance` while it migrates.
    fn begin_migration(&self, id: &StorageId, instance: Instance) -> PerResult<()> {
        *locks::lock(self.slot(id)?) = Slot::Migrating {
            instance,
            owner: thread::current().id(),
        };
        Ok(())
    }

    fn end_migration(&self, id: &StorageId) -> PerResult<()> {
        let mut slot = locks::lock(self.slot(id)?);
        let state = std::mem::replace(&mut *slot, Slot::Closed);
        *slot = state.settled();
        Ok(())
    }

    fn kvs_context(&self, id: &StorageId) -> PerResult<(Arc<StorageContext>, &KvsConfig)> {
        let config = self
            .config
            .find_kvs(id)
            .ok_or_else(|| PerError::storage_not_found(id.as_str()))?;
        Ok((self.context(&config.settings, StorageKind::KeyValue), config))
    }

    fn file_context(&self, id: &StorageId) -> PerResult<(Arc<StorageContext>, &FileStorageConfig)> {
        let config = self
            .config
            .find_file_storage(id)
            .ok_or_else(|| PerError::storage_not_found(id.as_str()))?;
        Ok((self.context(&config.settings, StorageKind::File), config))
    }

    // ==================
    // Open
    // ==================

    /// Open a Key-Value Storage, or get another handle to the open instance.
    ///
    /// A version change runs the application data update callback before
    /// this returns. Until it has finished, only the opening thread can get
    /// the instance; other threads fail `ResourceBusy`.
    pub fn open_key_value_storage(&self, id: &StorageId) -> PerResult<SharedHandle<KeyValueStorage>> {
        let (ctx, config) = self.kvs_context(id)?;
        let slot = self.slot(id)?;

        let (storage, state) = {
            let mut slot = locks::lock(slot);
            if let Some(Instance::Kvs(weak)) = slot.shared(id)? {
                if let Some(storage) = weak.upgrade() {
                    return Ok(SharedHandle::new(storage));
                }
            }
            let (storage, state) = KeyValueStorage::open(ctx, config)?;
            let storage = Arc::new(storage);
            let instance = Instance::Kvs(Arc::downgrade(&storage));
            *slot = match state {
                HeaderState::Outdated { .. } => Slot::Migrating {
                    instance,
                    owner: thread::current().id(),
                },
                _ => Slot::Open(instance),
            };
            (storage, state)
        };

        // outside the slot lock, so the callback can open this storage
        if let HeaderState::Outdated { previous } = state {
            let migrated = storage.migrate(&previous);
            self.end_migration(id)?;
            migrated?;
        }
        Ok(SharedHandle::new(storage))
    }

    /// Open a File Storage, or get another handle to the open instance.
    ///
    /// Version changes are handled as for Key-Value Storages.
    pub fn open_file_storage(&self, id: &StorageId) -> PerResult<SharedHandle<FileStorage>> {
        let (ctx, config) = self.file_context(id)?;
        let slot = self.slot(id)?;

        let (core, state) = {
            let mut slot = locks::lock(slot);
            if let Some(Instance::Files(weak)) = slot.shared(id)? {
                if let Some(core) = weak.upgrade() {
                    return Ok(SharedHandle::new(Arc::new(FileStorage::from_core(core))));
                }
            }
            let (core, state) = FileStorageCore::open(ctx, config)?;
            let core = Arc::new(core);
            let instance = Instance::Files(Arc::downgrade(&core));
            *slot = match state {
                HeaderState::Outdated { .. } => Slot::Migrating {
                    instance,
                    owner: thread::current().id(),
                },
                _ => Slot::Open(instance),
            };
            (core, state)
        };

        if let HeaderState::Outdated { previous } = state {
            let migrated = core.migrate(&previous);
            self.end_migration(id)?;
            migrated?;
        }
        Ok(SharedHandle::new(Arc::new(FileStorage::from_core(core))))
    }

    // ==================
    // Maintenance
    // ==================

    pub fn recover_key_value_storage(&self, id: &StorageId) -> PerResult<()> {
        let (ctx, config) = self.kvs_context(id)?;
        let _guard = self.begin_maintenance(id)?;
        KeyValueStorage::attach(ctx, config).recover_storage()
    }

    pub fn reset_key_value_storage(&self, id: &StorageId) -> PerResult<()> {
        let (ctx, config) = self.kvs_context(id)?;
        let _guard = self.begin_maintenance(id)?;
        KeyValueStorage::attach(ctx, config).reset_storage()
    }

    pub fn recover_all_files(&self, id: &StorageId) -> PerResult<()> {
        let (ctx, config) = self.file_context(id)?;
        let _guard = self.begin_maintenance(id)?;
        Arc::new(FileStorageCore::attach(ctx, config)?).recover_storage()
    }

    pub fn reset_all_files(&self, id: &StorageId) -> PerResult<()> {
        let (ctx, config) = self.file_context(id)?;
        let _guard = self.begin_maintenance(id)?;
        FileStorageCore::attach(ctx, config)?.reset_storage()
    }

    /// Physical bytes of the storage, including metadata and all copies.
    pub fn get_current_key_value_storage_size(&self, id: &StorageId) -> PerResult<u64> {
        let (ctx, config) = self.kvs_context(id)?;
        let _guard = self.begin_maintenance(id)?;
        KeyValueStorage::attach(ctx, config).usage()
    }

    /// Physical bytes of the storage, including metadata and all copies.
    pub fn get_current_file_storage_size(&self, id: &StorageId) -> PerResult<u64> {
        let (ctx, config) = self.file_context(id)?;
        let _guard = self.begin_maintenance(id)?;
        FileStorageCore::attach(ctx, config)?.usage()
    }

    /// Bring every configured storage up to the deployed version.
    ///
    /// Missing storages are installed, missing deployment values and files
    /// are added, and outdated storages run the update callback. Every id is
    /// claimed first, so the call fails `ResourceBusy` if any storage is
    /// open, and other threads cannot open one until the update is done.
    pub fn update_persistency(&self) -> PerResult<()> {
        let mut guards = Vec::with_capacity(self.slots.len());
        for id in self.slots.keys() {
            guards.push(self.begin_maintenance(id)?);
        }

        for config in &self.config.key_value_storages {
            let id = &config.settings.id;
            let ctx = self.context(&config.settings, StorageKind::KeyValue);
            let (storage, state) = KeyValueStorage::open(ctx, config)?;
            let storage = Arc::new(storage);
            self.begin_migration(id, Instance::Kvs(Arc::downgrade(&storage)))?;
            if let HeaderState::Outdated { previous } = state {
                storage.migrate(&previous)?;
            }
            let installed = storage.install_missing_defaults()?;
            log_update(id, &installed);
        }
        for config in &self.config.file_storages {
            let id = &config.settings.id;
            let ctx = self.context(&config.settings, StorageKind::File);
            let (core, state) = FileStorageCore::open(ctx, config)?;
            let core = Arc::new(core);
            self.begin_migration(id, Instance::Files(Arc::downgrade(&core)))?;
            if let HeaderState::Outdated { previous } = state {
                core.migrate(&previous)?;
            }
            let installed = core.install_missing_defaults()?;
            log_update(id, &installed);
        }
        Ok(())
    }

    /// Remove the content of every configured storage. The next open
    /// installs them again from deployment defaults.
    pub fn reset_persistency(&self) -> PerResult<()> {
        let mut guards = Vec::with_capacity(self.slots.len());
        for id in self.slots.keys() {
            guards.push(self.begin_maintenance(id)?);
        }

        for config in &self.config.key_value_storages {
            self.context(&config.settings, StorageKind::KeyValue).remove_dir()?;
        }
        for config in &self.config.file_storages {
            self.context(&config.settings, StorageKind::File).remove_dir()?;
        }

        log_event(
            Event::PersistencyReset,
            &[("storages", &self.slots.len().to_string())],
        );
        Ok(())
    }
}

fn log_update(id: &StorageId, installed: &[String]) {
    if installed.is_empty() {
        return;
    }
    log_event(
        Event::UpdateInstall,
        &[("storage", id.as_str()), ("installed", &installed.join(","))],
    );
}
