//! Payload protection hook
//!
//! Storages configured with `encryption` or `authentication` pass every key
//! payload and every file content through a [`DataProtection`] before it hits
//! a copy, and back through it when a copy is read. The algorithms belong to
//! the integrator; the engine only maps their failures onto
//! `EncryptionFailed` and `AuthenticationFailed`.

use thiserror::Error;

use crate::error::{PerErrc, PerError};
use crate::id::StorageId;

/// What is being protected.
#[derive(Debug, Clone, Copy)]
pub struct ProtectionScope<'a> {
    pub storage: &'a StorageId,
    pub element: &'a str,
    pub encryption: bool,
    pub authentication: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtectionError {
    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("authentication failed: {0}")]
    Authentication(String),
}

impl ProtectionError {
    pub fn code(&self) -> PerErrc {
        match self {
            ProtectionError::Encryption(_) => PerErrc::EncryptionFailed,
            ProtectionError::Authentication(_) => PerErrc::AuthenticationFailed,
        }
    }
}

impl From<ProtectionError> for PerError {
    fn from(e: ProtectionError) -> Self {
        PerError::new(e.code(), e.to_string())
    }
}

pub trait DataProtection: Send + Sync {
    /// Encrypt and/or tag a payload before it is written.
    fn seal(&self, scope: &ProtectionScope<'_>, plain: &[u8]) -> Result<Vec<u8>, ProtectionError>;

    /// Verify and/or decrypt a payload after it is read.
    fn unseal(&self, scope: &ProtectionScope<'_>, sealed: &[u8]) -> Result<Vec<u8>, ProtectionError>;
}

/// Pass-through protection.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProtection;

impl DataProtection for NoProtection {
    fn seal(&self, _scope: &ProtectionScope<'_>, plain: &[u8]) -> Result<Vec<u8>, ProtectionError> {
        Ok(plain.to_vec())
    }

    fn unseal(&self, _scope: &ProtectionScope<'_>, sealed: &[u8]) -> Result<Vec<u8>, ProtectionError> {
        Ok(sealed.to_vec())
    }
}
