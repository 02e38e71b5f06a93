//! Open modes for file accessors.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::error::{PerError, PerResult};

/// How a file is accessed once opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl Access {
    pub fn can_write(&self) -> bool {
        !matches!(self, Access::ReadOnly)
    }
}

/// Flag set selecting the initial position and content handling of an open.
///
/// Flags combine with `|` as long as they do not contradict each other, see
/// [`OpenMode::validate`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OpenMode(u32);

impl OpenMode {
    /// Position at the first byte
    pub const AT_THE_BEGINNING: OpenMode = OpenMode(1 << 0);
    /// Position after the last byte
    pub const AT_THE_END: OpenMode = OpenMode(1 << 1);
    /// Drop the existing content
    pub const TRUNCATE: OpenMode = OpenMode(1 << 2);
    /// Seek to the end before every write
    pub const APPEND: OpenMode = OpenMode(1 << 3);

    const ALL: u32 = 0b1111;

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// `None` if `bits` carries unknown flags.
    pub const fn from_bits(bits: u32) -> Option<OpenMode> {
        if bits & !Self::ALL != 0 {
            None
        } else {
            Some(OpenMode(bits))
        }
    }

    pub const fn contains(self, other: OpenMode) -> bool {
        self.0 & other.0 == other.0
    }

    /// Reject contradicting combinations.
    ///
    /// `AT_THE_END` excludes `AT_THE_BEGINNING` and `TRUNCATE`. Read-only
    /// opens cannot truncate or append.
    pub fn validate(self, access: Access) -> PerResult<()> {
        let contradicting = self.contains(Self::AT_THE_END)
            && (self.contains(Self::AT_THE_BEGINNING) || self.contains(Self::TRUNCATE));
        let writes = self.contains(Self::TRUNCATE) || self.contains(Self::APPEND);
        if contradicting || (access == Access::ReadOnly && writes) {
            return Err(PerError::invalid_open_mode(self));
        }
        Ok(())
    }
}

impl BitOr for OpenMode {
    type Output = OpenMode;

    fn bitor(self, rhs: OpenMode) -> OpenMode {
        OpenMode(self.0 | rhs.0)
    }
}

impl BitOrAssign for OpenMode {
    fn bitor_assign(&mut self, rhs: OpenMode) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(OpenMode, &str); 4] = [
            (OpenMode::AT_THE_BEGINNING, "AT_THE_BEGINNING"),
            (OpenMode::AT_THE_END, "AT_THE_END"),
            (OpenMode::TRUNCATE, "TRUNCATE"),
            (OpenMode::APPEND, "APPEND"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            f.write_str("(none)")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

impl fmt::Debug for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpenMode({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PerErrc;

    #[test]
    fn test_contradicting_modes() {
        for mode in [
            OpenMode::AT_THE_BEGINNING | OpenMode::AT_THE_END,
            OpenMode::TRUNCATE | OpenMode::AT_THE_END,
        ] {
            for access in [Access::ReadOnly, Access::WriteOnly, Access::ReadWrite] {
                assert_eq!(mode.validate(access).unwrap_err().code(), PerErrc::InvalidOpenMode);
            }
        }
    }

    #[test]
    fn test_read_only_rejects_writing_flags() {
        assert!(OpenMode::TRUNCATE.validate(Access::ReadOnly).is_err());
        assert!(OpenMode::APPEND.validate(Access::ReadOnly).is_err());
        assert!(OpenMode::AT_THE_END.validate(Access::ReadOnly).is_ok());
        assert!((OpenMode::APPEND | OpenMode::AT_THE_END)
            .validate(Access::ReadWrite)
            .is_ok());
        assert!((OpenMode::TRUNCATE | OpenMode::APPEND)
            .validate(Access::WriteOnly)
            .is_ok());
    }

    #[test]
    fn test_bits_and_display() {
        let mut mode = OpenMode::AT_THE_BEGINNING;
        mode |= OpenMode::APPEND;
        assert_eq!(mode.bits(), 9);
        assert_eq!(mode.to_string(), "AT_THE_BEGINNING|APPEND");
        assert_eq!(OpenMode::from_bits(9), Some(mode));
        assert_eq!(OpenMode::from_bits(16), None);
        assert_eq!(OpenMode::default().to_string(), "(none)");
    }
}
