//! persistency - redundant, crash-safe key-value and file storage
//!
//! Every key record and file is kept as several checksummed copies and read
//! by majority vote. A [`StorageCatalog`] opens the storages a
//! [`DeploymentConfig`] declares and runs their maintenance: recovery,
//! reset, size queries and version updates.
//!
//! ```no_run
//! use persistency::{DeploymentConfig, KvsConfig, StorageCatalog, StorageId};
//!
//! let id = StorageId::parse("app/settings").unwrap();
//! let config = DeploymentConfig::new("/var/lib/app")
//!     .with_kvs(KvsConfig::new(id.clone()).with_initial_value("volume", 3u8));
//! let catalog = StorageCatalog::new(config).unwrap();
//!
//! let kvs = catalog.open_key_value_storage(&id).unwrap();
//! kvs.set_value("volume", 7u8).unwrap();
//! kvs.sync_to_storage().unwrap();
//! ```

pub mod callbacks;
pub mod catalog;
pub mod cli;
pub mod collaborator;
pub mod config;
pub mod context;
pub mod crash_point;
pub mod error;
pub mod fs;
pub mod global;
pub mod handle;
pub mod id;
pub mod kvs;
pub mod observability;
pub mod protection;
pub mod redundancy;

mod locks;
mod sections;
mod update;

pub use catalog::StorageCatalog;
pub use config::{ConfigError, DeploymentConfig, FileStorageConfig, InitialFile, KvsConfig, StorageKind};
pub use error::{PerErrc, PerError, PerException, PerResult, ResultExt};
pub use global::{deinit, init};
pub use handle::{SharedHandle, UniqueHandle};
pub use id::StorageId;
