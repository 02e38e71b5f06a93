//! Storage identifiers
//!
//! A `StorageId` is a `/`-separated path naming one configured storage. Each
//! segment is restricted to `[A-Za-z0-9_.-]` and may not be `.` or `..`, so an
//! id always maps onto a directory strictly below the configured root.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{PerError, PerResult};

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_.\-]+(/[A-Za-z0-9_.\-]+)*$").expect("storage id pattern is valid")
    })
}

/// Validated identifier of a configured storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorageId(String);

impl StorageId {
    /// Parse and validate an id.
    ///
    /// Invalid ids can never name a configured storage, so they are reported
    /// as `StorageNotFound`.
    pub fn parse(raw: &str) -> PerResult<Self> {
        if !Self::is_valid(raw) {
            return Err(PerError::storage_not_found(raw).with_details("malformed storage id"));
        }
        Ok(Self(raw.to_string()))
    }

    /// Returns whether `raw` is a well-formed id.
    pub fn is_valid(raw: &str) -> bool {
        id_pattern().is_match(raw) && raw.split('/').all(|seg| seg != "." && seg != "..")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Directory of this storage below `root`.
    pub fn dir_under(&self, root: &Path) -> PathBuf {
        self.0.split('/').fold(root.to_path_buf(), |p, seg| p.join(seg))
    }
}

impl fmt::Display for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for StorageId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if StorageId::is_valid(&value) {
            Ok(StorageId(value))
        } else {
            Err(format!("invalid storage id: {:?}", value))
        }
    }
}

impl From<StorageId> for String {
    fn from(id: StorageId) -> String {
        id.0
    }
}

impl AsRef<str> for StorageId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Encodes an element name for use as a file name: `x` followed by the hex
/// bytes of the name, so that the empty name is representable too.
pub(crate) fn encode_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len() * 2 + 1);
    out.push('x');
    for b in name.as_bytes() {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Inverse of [`encode_name`]. Returns `None` for foreign file names.
pub(crate) fn decode_name(encoded: &str) -> Option<String> {
    let encoded = encoded.strip_prefix('x')?;
    if encoded.len() % 2 != 0 {
        return None;
    }
    let bytes: Option<Vec<u8>> = (0..encoded.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(encoded.get(i..i + 2)?, 16).ok())
        .collect();
    String::from_utf8(bytes?).ok()
}
