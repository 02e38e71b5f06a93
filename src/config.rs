//! Deployment manifest
//!
//! The manifest is a JSON document naming every storage the application may
//! open, together with its redundancy, limits and initial content:
//!
//! ```json
//! {
//!   "root_dir": "/var/lib/app/per",
//!   "application_version": "2.1.0",
//!   "key_value_storages": [
//!     { "id": "app/settings", "redundancy": { "copies": 3 },
//!       "initial_values": { "volume": { "type": "u8", "value": 5 } } }
//!   ],
//!   "file_storages": [
//!     { "id": "app/files", "max_files": 16, "quota_bytes": 1048576,
//!       "initial_files": { "motd.txt": { "text": "hello" } } }
//!   ]
//! }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::id::StorageId;
use crate::kvs::KvsValue;
use crate::observability::Severity;

/// Upper bound on physical copies per element.
pub const MAX_COPIES: u8 = 8;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid manifest JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid manifest: {0}")]
    Invalid(String),
}

impl ConfigError {
    fn invalid(msg: impl Into<String>) -> Self {
        ConfigError::Invalid(msg.into())
    }
}

/// Which storage abstraction a manifest entry configures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    KeyValue,
    File,
}

impl StorageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::KeyValue => "key_value",
            StorageKind::File => "file",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedundancyConfig {
    /// Physical copies per element (default 3)
    #[serde(default = "default_copies")]
    pub copies: u8,

    /// Agreeing copies needed for a read (default: majority)
    #[serde(default)]
    pub quorum: Option<u8>,
}

fn default_copies() -> u8 {
    3
}

impl Default for RedundancyConfig {
    fn default() -> Self {
        Self {
            copies: default_copies(),
            quorum: None,
        }
    }
}

impl RedundancyConfig {
    pub fn copies(&self) -> usize {
        self.copies as usize
    }

    pub fn quorum(&self) -> usize {
        match self.quorum {
            Some(q) => q as usize,
            None => self.copies() / 2 + 1,
        }
    }
}

/// Settings shared by both storage kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSettings {
    pub id: StorageId,

    #[serde(default)]
    pub redundancy: RedundancyConfig,

    #[serde(default)]
    pub read_only: bool,

    /// Physical byte budget including metadata and redundancy
    #[serde(default)]
    pub quota_bytes: Option<u64>,

    #[serde(default)]
    pub encryption: bool,

    #[serde(default)]
    pub authentication: bool,
}

impl StorageSettings {
    pub fn new(id: StorageId) -> Self {
        Self {
            id,
            redundancy: RedundancyConfig::default(),
            read_only: false,
            quota_bytes: None,
            encryption: false,
            authentication: false,
        }
    }

    pub fn is_protected(&self) -> bool {
        self.encryption || self.authentication
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvsConfig {
    #[serde(flatten)]
    pub settings: StorageSettings,

    #[serde(default)]
    pub initial_values: BTreeMap<String, KvsValue>,
}

impl KvsConfig {
    pub fn new(id: StorageId) -> Self {
        Self {
            settings: StorageSettings::new(id),
            initial_values: BTreeMap::new(),
        }
    }

    pub fn with_initial_value(mut self, key: impl Into<String>, value: impl Into<KvsValue>) -> Self {
        self.initial_values.insert(key.into(), value.into());
        self
    }

    pub fn with_redundancy(mut self, copies: u8, quorum: Option<u8>) -> Self {
        self.settings.redundancy = RedundancyConfig { copies, quorum };
        self
    }

    pub fn read_only(mut self) -> Self {
        self.settings.read_only = true;
        self
    }

    pub fn with_quota(mut self, bytes: u64) -> Self {
        self.settings.quota_bytes = Some(bytes);
        self
    }

    pub fn with_protection(mut self, encryption: bool, authentication: bool) -> Self {
        self.settings.encryption = encryption;
        self.settings.authentication = authentication;
        self
    }
}

/// Deployment content of an initial file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialFile {
    Text(String),
    Base64(String),
}

impl InitialFile {
    pub fn bytes(&self) -> Result<Vec<u8>, ConfigError> {
        match self {
            InitialFile::Text(t) => Ok(t.as_bytes().to_vec()),
            InitialFile::Base64(b) => BASE64
                .decode(b.as_bytes())
                .map_err(|e| ConfigError::invalid(format!("initial file is not base64: {}", e))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStorageConfig {
    #[serde(flatten)]
    pub settings: StorageSettings,

    #[serde(default)]
    pub max_files: Option<u32>,

    #[serde(default)]
    pub initial_files: BTreeMap<String, InitialFile>,
}

impl FileStorageConfig {
    pub fn new(id: StorageId) -> Self {
        Self {
            settings: StorageSettings::new(id),
            max_files: None,
            initial_files: BTreeMap::new(),
        }
    }

    pub fn with_initial_file(mut self, name: impl Into<String>, content: InitialFile) -> Self {
        self.initial_files.insert(name.into(), content);
        self
    }

    pub fn with_redundancy(mut self, copies: u8, quorum: Option<u8>) -> Self {
        self.settings.redundancy = RedundancyConfig { copies, quorum };
        self
    }

    pub fn with_max_files(mut self, max: u32) -> Self {
        self.max_files = Some(max);
        self
    }

    pub fn with_quota(mut self, bytes: u64) -> Self {
        self.settings.quota_bytes = Some(bytes);
        self
    }

    pub fn read_only(mut self) -> Self {
        self.settings.read_only = true;
        self
    }

    pub fn with_protection(mut self, encryption: bool, authentication: bool) -> Self {
        self.settings.encryption = encryption;
        self.settings.authentication = authentication;
        self
    }
}

/// Deployment manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Directory holding every storage (required)
    pub root_dir: PathBuf,

    /// Current application version (default "1.0.0")
    #[serde(default = "default_application_version")]
    pub application_version: String,

    /// Minimum log severity (default "WARN")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub key_value_storages: Vec<KvsConfig>,

    #[serde(default)]
    pub file_storages: Vec<FileStorageConfig>,
}

fn default_application_version() -> String {
    "1.0.0".to_string()
}

fn default_log_level() -> String {
    "WARN".to_string()
}

impl DeploymentConfig {
    /// An empty manifest rooted at `root_dir`.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            application_version: default_application_version(),
            log_level: default_log_level(),
            key_value_storages: Vec::new(),
            file_storages: Vec::new(),
        }
    }

    /// Load and validate a manifest file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content)
    }

    /// Parse and validate manifest text.
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: DeploymentConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.application_version = version.into();
        self
    }

    pub fn with_kvs(mut self, kvs: KvsConfig) -> Self {
        self.key_value_storages.push(kvs);
        self
    }

    pub fn with_file_storage(mut self, fs: FileStorageConfig) -> Self {
        self.file_storages.push(fs);
        self
    }

    /// Parsed minimum log severity.
    pub fn severity(&self) -> Result<Severity, ConfigError> {
        Severity::parse(&self.log_level)
            .ok_or_else(|| ConfigError::invalid(format!("unknown log_level '{}'", self.log_level)))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.root_dir.as_os_str().is_empty() {
            return Err(ConfigError::invalid("root_dir must not be empty"));
        }
        if self.application_version.trim().is_empty() {
            return Err(ConfigError::invalid("application_version must not be empty"));
        }
        self.severity()?;

        let mut ids: Vec<&StorageId> = Vec::new();
        let mut seen = HashSet::new();
        for settings in self.all_settings() {
            validate_settings(settings)?;
            if !seen.insert(settings.id.as_str()) {
                return Err(ConfigError::invalid(format!(
                    "storage id '{}' is configured more than once",
                    settings.id
                )));
            }
            ids.push(&settings.id);
        }

        // storage directories must not nest
        for a in &ids {
            for b in &ids {
                if a != b && b.as_str().starts_with(&format!("{}/", a.as_str())) {
                    return Err(ConfigError::invalid(format!(
                        "storage '{}' is nested inside storage '{}'",
                        b, a
                    )));
                }
            }
        }

        for kvs in &self.key_value_storages {
            if kvs.initial_values.keys().any(|k| k.is_empty()) {
                return Err(ConfigError::invalid(format!(
                    "storage '{}' has an empty initial key",
                    kvs.settings.id
                )));
            }
        }

        for fs in &self.file_storages {
            if let Some(max) = fs.max_files {
                if fs.initial_files.len() > max as usize {
                    return Err(ConfigError::invalid(format!(
                        "storage '{}' has {} initial files but max_files is {}",
                        fs.settings.id,
                        fs.initial_files.len(),
                        max
                    )));
                }
            }
            for (name, content) in &fs.initial_files {
                if name.is_empty() {
                    return Err(ConfigError::invalid(format!(
                        "storage '{}' has an empty initial file name",
                        fs.settings.id
                    )));
                }
                content.bytes()?;
            }
        }

        Ok(())
    }

    fn all_settings(&self) -> impl Iterator<Item = &StorageSettings> {
        self.key_value_storages
            .iter()
            .map(|k| &k.settings)
            .chain(self.file_storages.iter().map(|f| &f.settings))
    }

    pub fn find_kvs(&self, id: &StorageId) -> Option<&KvsConfig> {
        self.key_value_storages.iter().find(|k| &k.settings.id == id)
    }

    pub fn find_file_storage(&self, id: &StorageId) -> Option<&FileStorageConfig> {
        self.file_storages.iter().find(|f| &f.settings.id == id)
    }
}

fn validate_settings(settings: &StorageSettings) -> Result<(), ConfigError> {
    let r = &settings.redundancy;
    if r.copies == 0 || r.copies > MAX_COPIES {
        return Err(ConfigError::invalid(format!(
            "storage '{}': copies must be within 1..={}",
            settings.id, MAX_COPIES
        )));
    }
    if let Some(q) = r.quorum {
        if q == 0 || q > r.copies {
            return Err(ConfigError::invalid(format!(
                "storage '{}': quorum must be within 1..={}",
                settings.id, r.copies
            )));
        }
    }
    Ok(())
}
