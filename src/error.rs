//! Persistency error domain
//!
//! Every engine operation reports failures through [`PerResult`]. The error
//! codes keep the numeric values of the persistency error domain so that they
//! can be forwarded across process boundaries unchanged.
//!
//! Error codes:
//! - PER_STORAGE_NOT_FOUND ... PER_AUTHENTICATION_FAILED (see [`PerErrc`])
//!
//! Callers that prefer unwinding over results can convert any error into a
//! [`PerException`] with [`ResultExt::or_throw`].

use std::fmt;
use std::io;

use thiserror::Error;

/// Unique identifier of the persistency error domain.
pub const PER_ERROR_DOMAIN_ID: u64 = 0x8000_0000_0000_0101;

/// Name of the persistency error domain.
pub const PER_ERROR_DOMAIN_NAME: &str = "Per";

/// Error codes of the persistency error domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PerErrc {
    /// The storage is not configured in the deployment manifest.
    StorageNotFound = 1,
    /// The key does not exist in the Key-Value Storage.
    KeyNotFound = 2,
    /// The storage is configured read-only.
    IllegalWriteAccess = 3,
    /// The physical storage failed; the state of the element is unknown.
    PhysicalStorageFailure = 4,
    /// The structural integrity of the storage could not be established.
    IntegrityCorrupted = 5,
    /// Redundancy validation failed for a key, a file, or a whole storage.
    ValidationFailed = 6,
    /// Encryption or decryption failed.
    EncryptionFailed = 7,
    /// The requested data type does not match the stored data type.
    DataTypeMismatch = 8,
    /// No initial value is available for the key or file.
    InitValueNotAvailable = 9,
    /// The resource is currently busy.
    ResourceBusy = 10,
    /// The physical storage space was exceeded.
    OutOfStorageSpace = 12,
    /// The file does not exist in the File Storage.
    FileNotFound = 13,
    /// The requested position is outside of the file.
    InvalidPosition = 15,
    /// Read attempted at the end of the file.
    IsEof = 16,
    /// The combination of open modes is invalid.
    InvalidOpenMode = 17,
    /// The requested size is bigger than the current file size.
    InvalidSize = 18,
    /// The maximum number of files was exceeded.
    TooManyFiles = 19,
    /// The allocated storage quota was exceeded.
    QuotaExceeded = 20,
    /// Calculating or checking the MAC failed.
    AuthenticationFailed = 21,
}

impl PerErrc {
    const ALL: [PerErrc; 19] = [
        PerErrc::StorageNotFound,
        PerErrc::KeyNotFound,
        PerErrc::IllegalWriteAccess,
        PerErrc::PhysicalStorageFailure,
        PerErrc::IntegrityCorrupted,
        PerErrc::ValidationFailed,
        PerErrc::EncryptionFailed,
        PerErrc::DataTypeMismatch,
        PerErrc::InitValueNotAvailable,
        PerErrc::ResourceBusy,
        PerErrc::OutOfStorageSpace,
        PerErrc::FileNotFound,
        PerErrc::InvalidPosition,
        PerErrc::IsEof,
        PerErrc::InvalidOpenMode,
        PerErrc::InvalidSize,
        PerErrc::TooManyFiles,
        PerErrc::QuotaExceeded,
        PerErrc::AuthenticationFailed,
    ];

    /// Returns the stable string code.
    pub fn code(&self) -> &'static str {
        match self {
            PerErrc::StorageNotFound => "PER_STORAGE_NOT_FOUND",
            PerErrc::KeyNotFound => "PER_KEY_NOT_FOUND",
            PerErrc::IllegalWriteAccess => "PER_ILLEGAL_WRITE_ACCESS",
            PerErrc::PhysicalStorageFailure => "PER_PHYSICAL_STORAGE_FAILURE",
            PerErrc::IntegrityCorrupted => "PER_INTEGRITY_CORRUPTED",
            PerErrc::ValidationFailed => "PER_VALIDATION_FAILED",
            PerErrc::EncryptionFailed => "PER_ENCRYPTION_FAILED",
            PerErrc::DataTypeMismatch => "PER_DATA_TYPE_MISMATCH",
            PerErrc::InitValueNotAvailable => "PER_INIT_VALUE_NOT_AVAILABLE",
            PerErrc::ResourceBusy => "PER_RESOURCE_BUSY",
            PerErrc::OutOfStorageSpace => "PER_OUT_OF_STORAGE_SPACE",
            PerErrc::FileNotFound => "PER_FILE_NOT_FOUND",
            PerErrc::InvalidPosition => "PER_INVALID_POSITION",
            PerErrc::IsEof => "PER_IS_EOF",
            PerErrc::InvalidOpenMode => "PER_INVALID_OPEN_MODE",
            PerErrc::InvalidSize => "PER_INVALID_SIZE",
            PerErrc::TooManyFiles => "PER_TOO_MANY_FILES",
            PerErrc::QuotaExceeded => "PER_QUOTA_EXCEEDED",
            PerErrc::AuthenticationFailed => "PER_AUTHENTICATION_FAILED",
        }
    }

    /// Returns the numeric value of the code.
    pub fn value(&self) -> u32 {
        *self as u32
    }

    /// Looks up a code by its numeric value.
    pub fn from_value(value: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.value() == value)
    }

    /// Returns the domain message for the code.
    pub fn message(&self) -> &'static str {
        match self {
            PerErrc::StorageNotFound => "storage is not configured",
            PerErrc::KeyNotFound => "key not found",
            PerErrc::IllegalWriteAccess => "storage is configured read-only",
            PerErrc::PhysicalStorageFailure => "physical storage failure",
            PerErrc::IntegrityCorrupted => "structural integrity corrupted",
            PerErrc::ValidationFailed => "redundancy validation failed",
            PerErrc::EncryptionFailed => "encryption or decryption failed",
            PerErrc::DataTypeMismatch => "data type mismatch",
            PerErrc::InitValueNotAvailable => "no initial value available",
            PerErrc::ResourceBusy => "resource busy",
            PerErrc::OutOfStorageSpace => "out of storage space",
            PerErrc::FileNotFound => "file not found",
            PerErrc::InvalidPosition => "invalid position",
            PerErrc::IsEof => "end of file",
            PerErrc::InvalidOpenMode => "invalid open mode",
            PerErrc::InvalidSize => "invalid size",
            PerErrc::TooManyFiles => "too many files",
            PerErrc::QuotaExceeded => "quota exceeded",
            PerErrc::AuthenticationFailed => "authentication failed",
        }
    }
}

impl fmt::Display for PerErrc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

fn details_suffix(details: &Option<String>) -> String {
    match details {
        Some(d) => format!(" ({})", d),
        None => String::new(),
    }
}

/// Persistency error with code, context and optional I/O source.
#[derive(Debug, Error)]
#[error("[{code}] {message}{}", details_suffix(.details))]
pub struct PerError {
    code: PerErrc,
    message: String,
    details: Option<String>,
    vendor_data: u64,
    #[source]
    source: Option<io::Error>,
}

impl PerError {
    /// Create an error with the given code and message.
    pub fn new(code: PerErrc, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            vendor_data: 0,
            source: None,
        }
    }

    /// Attach detail text.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Attach vendor-defined support data.
    pub fn with_vendor_data(mut self, data: u64) -> Self {
        self.vendor_data = data;
        self
    }

    /// Map an I/O failure.
    ///
    /// A full device becomes `OutOfStorageSpace`, everything else is a
    /// `PhysicalStorageFailure`.
    pub fn io(message: impl Into<String>, source: io::Error) -> Self {
        let code = if is_out_of_space(&source) {
            PerErrc::OutOfStorageSpace
        } else {
            PerErrc::PhysicalStorageFailure
        };
        let vendor_data = source.raw_os_error().map(|e| e as u64).unwrap_or(0);
        Self {
            code,
            message: message.into(),
            details: None,
            vendor_data,
            source: Some(source),
        }
    }

    pub fn storage_not_found(id: &str) -> Self {
        Self::new(PerErrc::StorageNotFound, format!("storage not configured: {}", id))
    }

    pub fn key_not_found(key: &str) -> Self {
        Self::new(PerErrc::KeyNotFound, format!("key not found: {}", key))
    }

    pub fn file_not_found(name: &str) -> Self {
        Self::new(PerErrc::FileNotFound, format!("file not found: {}", name))
    }

    pub fn illegal_write_access(id: &str) -> Self {
        Self::new(
            PerErrc::IllegalWriteAccess,
            format!("storage is read-only: {}", id),
        )
    }

    pub fn resource_busy(what: impl Into<String>) -> Self {
        Self::new(PerErrc::ResourceBusy, what)
    }

    pub fn validation_failed(element: &str, reason: impl Into<String>) -> Self {
        Self::new(PerErrc::ValidationFailed, reason).with_details(format!("element: {}", element))
    }

    pub fn integrity_corrupted(reason: impl Into<String>) -> Self {
        Self::new(PerErrc::IntegrityCorrupted, reason)
    }

    pub fn data_type_mismatch(key: &str, expected: impl fmt::Display, found: impl fmt::Display) -> Self {
        Self::new(
            PerErrc::DataTypeMismatch,
            format!("key {} holds {}, requested {}", key, found, expected),
        )
    }

    pub fn init_value_not_available(element: &str) -> Self {
        Self::new(
            PerErrc::InitValueNotAvailable,
            format!("no initial value for: {}", element),
        )
    }

    pub fn invalid_position(requested: i128, size: u64) -> Self {
        Self::new(
            PerErrc::InvalidPosition,
            format!("position {} outside of [0, {}]", requested, size),
        )
    }

    pub fn is_eof() -> Self {
        Self::new(PerErrc::IsEof, "read at end of file")
    }

    pub fn invalid_open_mode(mode: impl fmt::Display) -> Self {
        Self::new(PerErrc::InvalidOpenMode, format!("invalid open mode: {}", mode))
    }

    pub fn invalid_size(requested: u64, size: u64) -> Self {
        Self::new(
            PerErrc::InvalidSize,
            format!("requested size {} exceeds current size {}", requested, size),
        )
    }

    pub fn too_many_files(max: u32) -> Self {
        Self::new(PerErrc::TooManyFiles, format!("file limit of {} reached", max))
    }

    pub fn quota_exceeded(quota: u64) -> Self {
        Self::new(PerErrc::QuotaExceeded, format!("quota of {} bytes exceeded", quota))
    }

    /// Returns the error code.
    pub fn code(&self) -> PerErrc {
        self.code
    }

    /// Returns whether this error carries the given code.
    pub fn is(&self, code: PerErrc) -> bool {
        self.code == code
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns additional error details.
    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    /// Returns the vendor-defined support data (0 when unset).
    pub fn vendor_data(&self) -> u64 {
        self.vendor_data
    }

    /// Converts the error into its exception form.
    pub fn into_exception(self) -> PerException {
        PerException {
            code: self.code,
            vendor_data: self.vendor_data,
            message: self.to_string(),
        }
    }
}

#[cfg(unix)]
fn is_out_of_space(e: &io::Error) -> bool {
    // ENOSPC / EDQUOT
    matches!(e.raw_os_error(), Some(28) | Some(122))
}

#[cfg(windows)]
fn is_out_of_space(e: &io::Error) -> bool {
    // ERROR_HANDLE_DISK_FULL / ERROR_DISK_FULL
    matches!(e.raw_os_error(), Some(39) | Some(112))
}

#[cfg(not(any(unix, windows)))]
fn is_out_of_space(_e: &io::Error) -> bool {
    false
}

/// Result type for persistency operations
pub type PerResult<T> = Result<T, PerError>;

/// Exception form of a [`PerError`], used as a panic payload by
/// [`ResultExt::or_throw`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct PerException {
    code: PerErrc,
    vendor_data: u64,
    message: String,
}

impl PerException {
    pub fn code(&self) -> PerErrc {
        self.code
    }

    pub fn vendor_data(&self) -> u64 {
        self.vendor_data
    }

    pub fn domain(&self) -> &'static str {
        PER_ERROR_DOMAIN_NAME
    }
}

/// Adapter for callers that prefer exceptions over results.
pub trait ResultExt<T> {
    /// Returns the value, or unwinds with a [`PerException`] payload.
    ///
    /// The payload can be recovered with `std::panic::catch_unwind` and
    /// `downcast_ref::<PerException>()`.
    fn or_throw(self) -> T;
}

impl<T> ResultExt<T> for PerResult<T> {
    fn or_throw(self) -> T {
        match self {
            Ok(v) => v,
            Err(e) => std::panic::panic_any(e.into_exception()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_values_are_stable() {
        assert_eq!(PerErrc::StorageNotFound.value(), 1);
        assert_eq!(PerErrc::ResourceBusy.value(), 10);
        assert_eq!(PerErrc::OutOfStorageSpace.value(), 12);
        assert_eq!(PerErrc::FileNotFound.value(), 13);
        assert_eq!(PerErrc::AuthenticationFailed.value(), 21);
    }

    #[test]
    fn test_from_value_roundtrips_every_code() {
        for code in PerErrc::ALL {
            assert_eq!(PerErrc::from_value(code.value()), Some(code));
        }
        assert_eq!(PerErrc::from_value(11), None);
        assert_eq!(PerErrc::from_value(14), None);
    }

    #[test]
    fn test_display_contains_code_and_details() {
        let err = PerError::validation_failed("volume", "no quorum");
        let display = err.to_string();
        assert!(display.contains("PER_VALIDATION_FAILED"));
        assert!(display.contains("no quorum"));
        assert!(display.contains("element: volume"));
    }

    #[test]
    fn test_io_error_maps_to_physical_failure() {
        let err = PerError::io(
            "write failed",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(err.code(), PerErrc::PhysicalStorageFailure);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[cfg(unix)]
    #[test]
    fn test_enospc_maps_to_out_of_storage_space() {
        let err = PerError::io("write failed", io::Error::from_raw_os_error(28));
        assert_eq!(err.code(), PerErrc::OutOfStorageSpace);
        assert_eq!(err.vendor_data(), 28);
    }

    #[test]
    fn test_or_throw_unwinds_with_exception() {
        let result: PerResult<u32> = Err(PerError::key_not_found("missing").with_vendor_data(7));
        let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| result.or_throw())).unwrap_err();
        let exception = caught.downcast_ref::<PerException>().unwrap();
        assert_eq!(exception.code(), PerErrc::KeyNotFound);
        assert_eq!(exception.vendor_data(), 7);
        assert_eq!(exception.domain(), "Per");
    }

    #[test]
    fn test_or_throw_passes_value() {
        let result: PerResult<u32> = Ok(5);
        assert_eq!(result.or_throw(), 5);
    }
}
