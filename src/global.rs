//! Process-wide catalog
//!
//! For applications that prefer free functions over passing a
//! [`StorageCatalog`] around. [`init`] installs the catalog, [`deinit`]
//! removes it. Every other function fails `StorageNotFound` in between.
//!
//! Handles obtained before [`deinit`] stay usable; the storages close when
//! the last of them is dropped.

use std::sync::{Arc, OnceLock, RwLock};

use crate::catalog::StorageCatalog;
use crate::config::{ConfigError, DeploymentConfig};
use crate::error::{PerError, PerResult};
use crate::fs::FileStorage;
use crate::handle::SharedHandle;
use crate::id::StorageId;
use crate::kvs::KeyValueStorage;
use crate::locks;
use crate::redundancy::RecoveryReportKind;

fn slot() -> &'static RwLock<Option<Arc<StorageCatalog>>> {
    static CATALOG: OnceLock<RwLock<Option<Arc<StorageCatalog>>>> = OnceLock::new();
    CATALOG.get_or_init(|| RwLock::new(None))
}

fn current() -> PerResult<Arc<StorageCatalog>> {
    locks::read(slot())
        .clone()
        .ok_or_else(|| PerError::storage_not_found("<persistency not initialized>"))
}

/// Install the process-wide catalog, replacing any earlier one.
pub fn init(config: DeploymentConfig) -> Result<(), ConfigError> {
    let catalog = StorageCatalog::new(config)?;
    *locks::write(slot()) = Some(Arc::new(catalog));
    Ok(())
}

pub fn deinit() {
    *locks::write(slot()) = None;
}

pub fn is_initialized() -> bool {
    locks::read(slot()).is_some()
}

pub fn open_key_value_storage(id: &StorageId) -> PerResult<SharedHandle<KeyValueStorage>> {
    current()?.open_key_value_storage(id)
}

pub fn open_file_storage(id: &StorageId) -> PerResult<SharedHandle<FileStorage>> {
    current()?.open_file_storage(id)
}

pub fn recover_key_value_storage(id: &StorageId) -> PerResult<()> {
    current()?.recover_key_value_storage(id)
}

pub fn reset_key_value_storage(id: &StorageId) -> PerResult<()> {
    current()?.reset_key_value_storage(id)
}

pub fn recover_all_files(id: &StorageId) -> PerResult<()> {
    current()?.recover_all_files(id)
}

pub fn reset_all_files(id: &StorageId) -> PerResult<()> {
    current()?.reset_all_files(id)
}

pub fn get_current_key_value_storage_size(id: &StorageId) -> PerResult<u64> {
    current()?.get_current_key_value_storage_size(id)
}

pub fn get_current_file_storage_size(id: &StorageId) -> PerResult<u64> {
    current()?.get_current_file_storage_size(id)
}

pub fn update_persistency() -> PerResult<()> {
    current()?.update_persistency()
}

pub fn reset_persistency() -> PerResult<()> {
    current()?.reset_persistency()
}

pub fn register_recovery_report_callback<F>(f: F) -> PerResult<()>
where
    F: Fn(&StorageId, RecoveryReportKind, &[String], &[u8]) + Send + Sync + 'static,
{
    current()?.register_recovery_report_callback(f);
    Ok(())
}

pub fn register_application_data_update_callback<F>(f: F) -> PerResult<()>
where
    F: Fn(&StorageId, &str) + Send + Sync + 'static,
{
    current()?.register_application_data_update_callback(f);
    Ok(())
}
