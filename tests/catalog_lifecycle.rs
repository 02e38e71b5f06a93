//! Catalog lifecycle tests
//!
//! - maintenance needs a closed storage and never waits
//! - version changes run the application data update callback
//! - protection failures surface as their own error codes
//! - manifests are validated before anything touches the disk

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::path::Path;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use common::*;
use persistency::collaborator::LifecycleState;
use persistency::kvs::KvsValue;
use persistency::{
    ConfigError, DeploymentConfig, FileStorageConfig, InitialFile, KvsConfig, PerErrc, StorageCatalog, StorageId,
};

// =============================================================================
// Maintenance exclusion
// =============================================================================

#[test]
fn test_concurrent_resets_one_wins() {
    let root = create_temp_root();
    let catalog = Arc::new(catalog(root.path()));
    drop(catalog.open_key_value_storage(&kvs_id()).unwrap());

    // a slow collaborator keeps the first reset inside maintenance
    struct Slow(Barrier, Barrier);
    impl persistency::collaborator::CollaboratorSink for Slow {
        fn report_state(&self, _: &StorageId, state: LifecycleState) {
            if state == LifecycleState::MaintenanceRunning {
                self.0.wait();
                self.1.wait();
            }
        }
        fn report_security_event(&self, _: &persistency::collaborator::SecurityEvent) {}
    }
    let slow = Arc::new(Slow(Barrier::new(2), Barrier::new(2)));
    catalog.set_collaborator(slow.clone());

    let first = {
        let catalog = catalog.clone();
        thread::spawn(move || catalog.reset_key_value_storage(&kvs_id()))
    };
    slow.0.wait();

    // first reset is now between claiming the id and doing the work
    assert_eq!(
        catalog.reset_key_value_storage(&kvs_id()).unwrap_err().code(),
        PerErrc::ResourceBusy
    );
    assert_eq!(
        catalog.open_key_value_storage(&kvs_id()).unwrap_err().code(),
        PerErrc::ResourceBusy
    );
    // unrelated ids are unaffected
    drop(catalog.open_file_storage(&files_id()).unwrap());

    slow.1.wait();
    first.join().unwrap().unwrap();
    catalog.clear_callbacks();
    drop(catalog.open_key_value_storage(&kvs_id()).unwrap());
}

#[test]
fn test_reset_after_last_handle_released() {
    let root = create_temp_root();
    let catalog = catalog(root.path());
    let mut a = catalog.open_key_value_storage(&kvs_id()).unwrap();
    let b = a.clone();
    a.set_value("volume", 1u8).unwrap();
    a.sync_to_storage().unwrap();

    a.release();
    assert_eq!(b.use_count(), 1);
    assert_eq!(
        catalog.reset_key_value_storage(&kvs_id()).unwrap_err().code(),
        PerErrc::ResourceBusy
    );

    drop(b);
    catalog.reset_key_value_storage(&kvs_id()).unwrap();
    let kvs = catalog.open_key_value_storage(&kvs_id()).unwrap();
    assert_eq!(kvs.get_value::<u8>("volume").unwrap(), 5);
}

#[test]
fn test_maintenance_states_reported_to_collaborator() {
    let root = create_temp_root();
    let catalog = catalog(root.path());
    let sink = Arc::new(RecordingCollaborator::default());
    catalog.set_collaborator(sink.clone());

    catalog.get_current_file_storage_size(&files_id()).unwrap();
    assert_eq!(
        *sink.states.lock().unwrap(),
        vec![
            (files_id(), LifecycleState::MaintenanceRunning),
            (files_id(), LifecycleState::MaintenanceDone),
        ]
    );
}

#[test]
fn test_reset_persistency_wipes_everything() {
    let root = create_temp_root();
    let catalog = catalog(root.path());
    {
        let kvs = catalog.open_key_value_storage(&kvs_id()).unwrap();
        kvs.set_value("extra", 1u8).unwrap();
        kvs.sync_to_storage().unwrap();
        let files = catalog.open_file_storage(&files_id()).unwrap();
        drop(files.open_file_write_only("scratch").unwrap());
    }

    catalog.reset_persistency().unwrap();
    assert!(!root.path().join("app").join("settings").exists());
    assert!(!root.path().join("app").join("files").exists());

    let kvs = catalog.open_key_value_storage(&kvs_id()).unwrap();
    assert!(!kvs.key_exists("extra").unwrap());
    let files = catalog.open_file_storage(&files_id()).unwrap();
    assert_eq!(files.get_all_file_names().unwrap(), vec!["readme.txt"]);
}

// =============================================================================
// Updates
// =============================================================================

#[test]
fn test_version_change_runs_update_callback_once() {
    let root = create_temp_root();
    drop(catalog(root.path()).open_key_value_storage(&kvs_id()).unwrap());

    let catalog = StorageCatalog::new(manifest(root.path()).with_version("2.0.0")).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    catalog.register_application_data_update_callback(move |id, previous| {
        sink.lock().unwrap().push((id.clone(), previous.to_string()));
    });

    drop(catalog.open_key_value_storage(&kvs_id()).unwrap());
    drop(catalog.open_key_value_storage(&kvs_id()).unwrap());
    assert_eq!(*seen.lock().unwrap(), vec![(kvs_id(), "1.0.0".to_string())]);
}

#[test]
fn test_update_callback_can_use_the_storage() {
    let root = create_temp_root();
    drop(catalog(root.path()).open_key_value_storage(&kvs_id()).unwrap());

    let catalog = Arc::new(StorageCatalog::new(manifest(root.path()).with_version("1.1.0")).unwrap());
    let weak = Arc::downgrade(&catalog);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    catalog.register_application_data_update_callback(move |id, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        if let Some(catalog) = weak.upgrade() {
            let kvs = catalog.open_key_value_storage(id).unwrap();
            kvs.set_value("migrated", true).unwrap();
            kvs.sync_to_storage().unwrap();
        }
    });

    let kvs = catalog.open_key_value_storage(&kvs_id()).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(kvs.get_value::<bool>("migrated").unwrap());
}

#[test]
fn test_update_persistency_installs_new_defaults() {
    let root = create_temp_root();
    drop(catalog(root.path()).open_file_storage(&files_id()).unwrap());
    drop(catalog(root.path()).open_key_value_storage(&kvs_id()).unwrap());

    let mut next = manifest(root.path()).with_version("1.1.0");
    next.key_value_storages[0] = next.key_value_storages[0].clone().with_initial_value("added", 1u32);
    next.file_storages[0] = next.file_storages[0]
        .clone()
        .with_initial_file("added.bin", InitialFile::Base64("3q2+7w==".into()));
    let catalog = StorageCatalog::new(next).unwrap();

    catalog.update_persistency().unwrap();
    let kvs = catalog.open_key_value_storage(&kvs_id()).unwrap();
    assert_eq!(kvs.get_value::<u32>("added").unwrap(), 1);
    let files = catalog.open_file_storage(&files_id()).unwrap();
    assert_eq!(files.get_current_file_size("added.bin").unwrap(), 4);

    // open storages block the update
    assert_eq!(catalog.update_persistency().unwrap_err().code(), PerErrc::ResourceBusy);
}

type OpenOutcomes = Arc<Mutex<Vec<(Result<(), PerErrc>, Result<(), PerErrc>)>>>;

/// Catalog at 2.0.0 over storages stamped 1.0.0. Its update callback opens
/// the storage once from its own thread and once from a second thread.
fn outdated_catalog(root: &Path) -> (Arc<StorageCatalog>, OpenOutcomes) {
    drop(catalog(root).open_key_value_storage(&kvs_id()).unwrap());

    let catalog = Arc::new(StorageCatalog::new(manifest(root).with_version("2.0.0")).unwrap());
    let weak = Arc::downgrade(&catalog);
    let outcomes: OpenOutcomes = Arc::new(Mutex::new(Vec::new()));
    let sink = outcomes.clone();
    catalog.register_application_data_update_callback(move |id, _| {
        let catalog = match weak.upgrade() {
            Some(catalog) => catalog,
            None => return,
        };
        let own = catalog.open_key_value_storage(id).map(drop).map_err(|e| e.code());
        let other = {
            let catalog = catalog.clone();
            let id = id.clone();
            thread::spawn(move || catalog.open_key_value_storage(&id).map(drop).map_err(|e| e.code()))
                .join()
                .unwrap()
        };
        sink.lock().unwrap().push((own, other));
    });
    (catalog, outcomes)
}

#[test]
fn test_migration_on_open_excludes_other_threads() {
    let root = create_temp_root();
    let (catalog, outcomes) = outdated_catalog(root.path());

    let kvs = catalog.open_key_value_storage(&kvs_id()).unwrap();
    assert_eq!(*outcomes.lock().unwrap(), vec![(Ok(()), Err(PerErrc::ResourceBusy))]);

    // once migrated, other threads share the instance
    let shared = {
        let catalog = catalog.clone();
        thread::spawn(move || catalog.open_key_value_storage(&kvs_id()).unwrap())
            .join()
            .unwrap()
    };
    assert!(kvs.ptr_eq(&shared));
}

#[test]
fn test_update_persistency_excludes_other_threads() {
    let root = create_temp_root();
    let (catalog, outcomes) = outdated_catalog(root.path());

    catalog.update_persistency().unwrap();
    assert_eq!(*outcomes.lock().unwrap(), vec![(Ok(()), Err(PerErrc::ResourceBusy))]);

    // the update left every storage closed and stamped
    catalog.reset_key_value_storage(&kvs_id()).unwrap();
    drop(catalog.open_key_value_storage(&kvs_id()).unwrap());
    assert_eq!(outcomes.lock().unwrap().len(), 1);
}

#[test]
fn test_update_persistency_blocks_opens_and_maintenance() {
    let root = create_temp_root();
    drop(catalog(root.path()).open_key_value_storage(&kvs_id()).unwrap());
    let catalog = Arc::new(catalog(root.path()));

    // a slow collaborator holds the update inside its claim
    struct Slow(Barrier, Barrier);
    impl persistency::collaborator::CollaboratorSink for Slow {
        fn report_state(&self, id: &StorageId, state: LifecycleState) {
            if state == LifecycleState::MaintenanceRunning && id.as_str() == KVS_ID {
                self.0.wait();
                self.1.wait();
            }
        }
        fn report_security_event(&self, _: &persistency::collaborator::SecurityEvent) {}
    }
    let slow = Arc::new(Slow(Barrier::new(2), Barrier::new(2)));
    catalog.set_collaborator(slow.clone());

    let update = {
        let catalog = catalog.clone();
        thread::spawn(move || catalog.update_persistency())
    };
    slow.0.wait();

    assert_eq!(
        catalog.open_key_value_storage(&kvs_id()).unwrap_err().code(),
        PerErrc::ResourceBusy
    );
    assert_eq!(
        catalog.open_file_storage(&files_id()).unwrap_err().code(),
        PerErrc::ResourceBusy
    );
    assert_eq!(catalog.update_persistency().unwrap_err().code(), PerErrc::ResourceBusy);

    slow.1.wait();
    update.join().unwrap().unwrap();
    catalog.clear_callbacks();
    drop(catalog.open_key_value_storage(&kvs_id()).unwrap());
}

// =============================================================================
// Reentrancy
// =============================================================================

#[test]
fn test_concurrent_operations_on_one_store() {
    const WORKERS: usize = 4;
    const ROUNDS: u32 = 20;

    let root = create_temp_root();
    {
        let catalog = catalog(root.path());
        let kvs = catalog.open_key_value_storage(&kvs_id()).unwrap();
        let barrier = Arc::new(Barrier::new(WORKERS));

        let workers: Vec<_> = (0..WORKERS)
            .map(|w| {
                let kvs = kvs.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let own = format!("worker-{}", w);
                    barrier.wait();
                    for round in 0..ROUNDS {
                        // same key for everyone, plus one key per worker
                        kvs.set_value("shared", w as u32 * 100 + round).unwrap();
                        kvs.set_value(&own, round).unwrap();
                        assert!(kvs.get_value::<u32>("shared").unwrap() % 100 < ROUNDS);
                        assert_eq!(kvs.get_value::<u32>(&own).unwrap(), round);
                        if round % 5 == 0 {
                            kvs.sync_to_storage().unwrap();
                            kvs.recover_key("shared").unwrap();
                            kvs.recover_key(&own).unwrap();
                        }
                        assert_eq!(kvs.get_value::<u8>("volume").unwrap(), 5);
                    }
                    kvs.sync_to_storage().unwrap();
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
    }

    let catalog = catalog(root.path());
    let kvs = catalog.open_key_value_storage(&kvs_id()).unwrap();
    for w in 0..WORKERS {
        assert_eq!(kvs.get_value::<u32>(&format!("worker-{}", w)).unwrap(), ROUNDS - 1);
    }
    assert_eq!(kvs.get_value::<u32>("shared").unwrap() % 100, ROUNDS - 1);
}

// =============================================================================
// Protection
// =============================================================================

fn protected_manifest(root: &std::path::Path) -> DeploymentConfig {
    DeploymentConfig::new(root).with_kvs(
        KvsConfig::new(kvs_id())
            .with_protection(true, true)
            .with_initial_value("secret", "s3cr3t"),
    )
}

#[test]
fn test_protected_values_are_sealed_on_disk() {
    let root = create_temp_root();
    let catalog =
        StorageCatalog::with_protection(protected_manifest(root.path()), Arc::new(XorTagProtection { key: 0x5A })).unwrap();
    let kvs = catalog.open_key_value_storage(&kvs_id()).unwrap();
    assert_eq!(kvs.get_value::<String>("secret").unwrap(), "s3cr3t");

    let raw = std::fs::read(key_copy(root.path(), 0, "secret")).unwrap();
    assert!(!raw.windows(6).any(|w| w == b"s3cr3t"));
}

#[test]
fn test_wrong_key_is_authentication_failure() {
    let root = create_temp_root();
    {
        let catalog = StorageCatalog::with_protection(
            protected_manifest(root.path()),
            Arc::new(XorTagProtection { key: 0x5A }),
        )
        .unwrap();
        drop(catalog.open_key_value_storage(&kvs_id()).unwrap());
    }

    let catalog =
        StorageCatalog::with_protection(protected_manifest(root.path()), Arc::new(XorTagProtection { key: 0x33 })).unwrap();
    let sink = Arc::new(RecordingCollaborator::default());
    catalog.set_collaborator(sink.clone());
    let kvs = catalog.open_key_value_storage(&kvs_id()).unwrap();

    assert_eq!(
        kvs.get_value::<String>("secret").unwrap_err().code(),
        PerErrc::AuthenticationFailed
    );
    let security = sink.security.lock().unwrap();
    assert_eq!(security.len(), 1);
    assert_eq!(security[0].code, PerErrc::AuthenticationFailed);
    assert_eq!(security[0].element, "secret");
    assert_eq!(security[0].copies, vec![0, 1, 2]);
}

#[test]
fn test_unavailable_cipher_is_encryption_failure() {
    let root = create_temp_root();
    let config = DeploymentConfig::new(root.path()).with_kvs(KvsConfig::new(kvs_id()).with_protection(true, false));
    let catalog = StorageCatalog::with_protection(config, Arc::new(BrokenCipher)).unwrap();
    let kvs = catalog.open_key_value_storage(&kvs_id()).unwrap();

    kvs.set_value("k", KvsValue::I64(-1)).unwrap();
    assert_eq!(kvs.sync_to_storage().unwrap_err().code(), PerErrc::EncryptionFailed);
    // still pending, nothing committed
    assert_eq!(kvs.get_value::<i64>("k").unwrap(), -1);
    kvs.discard_pending_changes().unwrap();
    assert_eq!(kvs.get_value::<i64>("k").unwrap_err().code(), PerErrc::KeyNotFound);
}

// =============================================================================
// Manifest validation
// =============================================================================

#[test]
fn test_invalid_manifests_are_rejected() {
    let root = create_temp_root();
    let id = kvs_id();

    let duplicate = DeploymentConfig::new(root.path())
        .with_kvs(KvsConfig::new(id.clone()))
        .with_file_storage(FileStorageConfig::new(id.clone()));
    assert!(matches!(StorageCatalog::new(duplicate), Err(ConfigError::Invalid(_))));

    let no_copies = DeploymentConfig::new(root.path()).with_kvs(KvsConfig::new(id.clone()).with_redundancy(0, None));
    assert!(matches!(StorageCatalog::new(no_copies), Err(ConfigError::Invalid(_))));

    let quorum_too_big = DeploymentConfig::new(root.path()).with_kvs(KvsConfig::new(id).with_redundancy(3, Some(4)));
    assert!(matches!(StorageCatalog::new(quorum_too_big), Err(ConfigError::Invalid(_))));

    assert!(matches!(
        DeploymentConfig::from_json(r#"{"root_dir": "/x", "key_value_storages": [{"id": "../up"}]}"#),
        Err(ConfigError::Parse(_))
    ));
    assert!(!root.path().join("app").exists());
}

#[test]
fn test_manifest_from_json() {
    let root = create_temp_root();
    let json = format!(
        r#"{{
            "root_dir": {:?},
            "application_version": "3.1.0",
            "key_value_storages": [
                {{"id": "cfg", "redundancy": {{"copies": 5}},
                  "initial_values": {{"retries": {{"type": "u16", "value": 3}}}}}}
            ]
        }}"#,
        root.path().display().to_string()
    );
    let config = DeploymentConfig::from_json(&json).unwrap();
    let catalog = StorageCatalog::new(config).unwrap();
    let kvs = catalog.open_key_value_storage(&StorageId::parse("cfg").unwrap()).unwrap();
    assert_eq!(kvs.get_value::<u16>("retries").unwrap(), 3);
    assert!(key_copy_for(root.path(), "cfg", 4, "retries").exists());
}

fn key_copy_for(root: &std::path::Path, id: &str, copy: usize, key: &str) -> std::path::PathBuf {
    copy_path(root, id, "kvs", "copy", copy, key)
}
