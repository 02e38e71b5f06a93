//! Read and read-write accessors over one open file.
//!
//! An accessor owns the open claim on its file: while it lives, nobody else
//! can open, delete, recover or reset that file, and the file storage stays
//! open. A read-write accessor works on a private working image; its content
//! reaches the redundant copies on [`ReadWriteAccessor::sync_to_file`] and
//! when the accessor is dropped.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;

use super::open_mode::OpenMode;
use super::storage::{OpenLease, WriteBudget};
use super::stream::BlockStream;
use crate::error::{PerError, PerResult};
use crate::observability::{log_event, Event};

/// Reference point of [`ReadAccessor::move_position`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Beginning,
    Current,
    End,
}

pub struct ReadAccessor {
    stream: BlockStream,
    position: u64,
    /// Working image removed on drop
    work: Option<PathBuf>,
    lease: OpenLease,
}

impl ReadAccessor {
    pub(crate) fn new(stream: BlockStream, position: u64, work: Option<PathBuf>, lease: OpenLease) -> Self {
        Self {
            stream,
            position,
            work,
            lease,
        }
    }

    pub fn file_name(&self) -> &str {
        self.lease.name()
    }

    fn io_err(&self, what: &str, e: std::io::Error) -> PerError {
        PerError::io(format!("failed to {} '{}'", what, self.lease.name()), e)
    }

    /// Block size of the read cache.
    pub fn block_size(&self) -> usize {
        self.stream.block_size()
    }

    pub fn peek_byte(&mut self) -> PerResult<u8> {
        match self.stream.byte_at(self.position) {
            Ok(Some(b)) => Ok(b),
            Ok(None) => Err(PerError::is_eof()),
            Err(e) => Err(self.io_err("read", e)),
        }
    }

    /// The byte at the current position as a character (one code unit).
    pub fn peek_char(&mut self) -> PerResult<char> {
        self.peek_byte().map(char::from)
    }

    pub fn get_byte(&mut self) -> PerResult<u8> {
        let b = self.peek_byte()?;
        self.position += 1;
        Ok(b)
    }

    pub fn get_char(&mut self) -> PerResult<char> {
        self.get_byte().map(char::from)
    }

    /// Up to `n` bytes. Fewer are returned at the end of the file.
    pub fn read_binary(&mut self, n: u64) -> PerResult<Vec<u8>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        if self.is_eof() {
            return Err(PerError::is_eof());
        }
        let mut out = Vec::with_capacity(n.min(self.stream.size() - self.position) as usize);
        let read = self
            .stream
            .read_at(self.position, n, &mut out)
            .map_err(|e| self.io_err("read", e))?;
        self.position += read;
        Ok(out)
    }

    pub fn read_binary_to_end(&mut self) -> PerResult<Vec<u8>> {
        let remaining = self.stream.size() - self.position;
        if remaining == 0 {
            return Err(PerError::is_eof());
        }
        self.read_binary(remaining)
    }

    /// Up to `n` characters. Invalid UTF-8, such as a code point cut at
    /// either end, is replaced with U+FFFD.
    pub fn read_text(&mut self, n: u64) -> PerResult<String> {
        self.read_binary(n).map(lossy)
    }

    pub fn read_text_to_end(&mut self) -> PerResult<String> {
        self.read_binary_to_end().map(lossy)
    }

    /// Text up to `delimiter` (excluded) or the end of the file. The position
    /// moves past the delimiter.
    pub fn read_line(&mut self, delimiter: u8) -> PerResult<String> {
        if self.is_eof() {
            return Err(PerError::is_eof());
        }
        let found = self
            .stream
            .find(self.position, delimiter)
            .map_err(|e| self.io_err("read", e))?;
        let end = found.unwrap_or(self.stream.size());
        let mut out = Vec::new();
        self.stream
            .read_at(self.position, end - self.position, &mut out)
            .map_err(|e| self.io_err("read", e))?;
        self.position = match found {
            Some(at) => at + 1,
            None => end,
        };
        Ok(lossy(out))
    }

    pub fn get_size(&self) -> u64 {
        self.stream.size()
    }

    pub fn get_position(&self) -> u64 {
        self.position
    }

    pub fn is_eof(&self) -> bool {
        self.position >= self.stream.size()
    }

    pub fn set_position(&mut self, position: u64) -> PerResult<()> {
        if position > self.stream.size() {
            return Err(PerError::invalid_position(position as i128, self.stream.size()));
        }
        self.position = position;
        Ok(())
    }

    /// Move relative to `origin`. Returns the new position.
    pub fn move_position(&mut self, origin: Origin, offset: i64) -> PerResult<u64> {
        let base = match origin {
            Origin::Beginning => 0,
            Origin::Current => self.position,
            Origin::End => self.stream.size(),
        };
        let target = base as i128 + offset as i128;
        if target < 0 || target > self.stream.size() as i128 {
            return Err(PerError::invalid_position(target, self.stream.size()));
        }
        self.position = target as u64;
        Ok(self.position)
    }
}

impl Drop for ReadAccessor {
    fn drop(&mut self) {
        if let Some(work) = self.work.take() {
            let _ = std::fs::remove_file(work);
        }
    }
}

impl fmt::Debug for ReadAccessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadAccessor")
            .field("file", &self.lease.name())
            .field("position", &self.position)
            .field("size", &self.stream.size())
            .finish()
    }
}

fn lossy(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

/// Accessor of a file opened for writing.
///
/// Reading works as on a [`ReadAccessor`], through `Deref`.
pub struct ReadWriteAccessor {
    reader: ReadAccessor,
    mode: OpenMode,
    /// Content differs from the synced copies
    dirty: bool,
    /// Quota limit of this file, worked out on the first write after open
    /// or sync. `Some(None)` means no quota.
    budget: Option<Option<WriteBudget>>,
}

impl ReadWriteAccessor {
    pub(crate) fn new(reader: ReadAccessor, mode: OpenMode, dirty: bool) -> Self {
        Self {
            reader,
            mode,
            dirty,
            budget: None,
        }
    }

    fn budget(&mut self) -> PerResult<Option<WriteBudget>> {
        if let Some(budget) = self.budget {
            return Ok(budget);
        }
        let budget = self.reader.lease.core().write_budget(self.reader.lease.name())?;
        self.budget = Some(budget);
        Ok(budget)
    }

    pub fn write_binary(&mut self, data: &[u8]) -> PerResult<()> {
        if self.mode.contains(OpenMode::APPEND) {
            self.reader.position = self.reader.stream.size();
        }
        let pos = self.reader.position;
        let end = pos + data.len() as u64;

        let (allowed, exceeded) = match self.budget()? {
            Some(budget) if end.max(self.reader.stream.size()) > budget.max_len => {
                let allowed = budget.max_len.saturating_sub(pos).min(data.len() as u64) as usize;
                (allowed, Some(budget.quota))
            }
            _ => (data.len(), None),
        };

        if allowed > 0 {
            self.reader
                .stream
                .write_at(pos, &data[..allowed])
                .map_err(|e| self.reader.io_err("write", e))?;
            self.reader.position = pos + allowed as u64;
            self.dirty = true;
        }
        match exceeded {
            Some(quota) => Err(PerError::quota_exceeded(quota)
                .with_details(format!("file: {}, written: {} of {}", self.file_name(), allowed, data.len()))),
            None => Ok(()),
        }
    }

    pub fn write_text(&mut self, text: &str) -> PerResult<()> {
        self.write_binary(text.as_bytes())
    }

    /// Write without reporting errors.
    ///
    /// Failed writes are only logged, so this is not suited for content
    /// that must not get lost. Use [`write_text`](Self::write_text) there.
    pub fn append(&mut self, text: &str) -> &mut Self {
        if let Err(e) = self.write_text(text) {
            log_event(
                Event::BestEffortWriteDropped,
                &[("file", self.file_name()), ("code", e.code().code())],
            );
        }
        self
    }

    /// Commit the content to the redundant copies.
    pub fn sync_to_file(&mut self) -> PerResult<()> {
        if !self.dirty {
            return Ok(());
        }
        let reader = &mut self.reader;
        let size = reader.stream.size();
        reader.stream.sync().map_err(|e| reader.io_err("sync", e))?;
        reader
            .lease
            .core()
            .commit(reader.lease.name(), reader.stream.file_mut(), size)?;
        self.dirty = false;
        // other files may have grown meanwhile
        self.budget = None;
        Ok(())
    }

    /// Cut the file to `size` bytes. Growing a file is not supported.
    pub fn set_file_size(&mut self, size: u64) -> PerResult<()> {
        let current = self.reader.stream.size();
        if size > current {
            return Err(PerError::invalid_size(size, current));
        }
        if size == current {
            return Ok(());
        }
        self.reader
            .stream
            .set_len(size)
            .map_err(|e| self.reader.io_err("truncate", e))?;
        self.reader.position = self.reader.position.min(size);
        self.dirty = true;
        Ok(())
    }
}

impl Deref for ReadWriteAccessor {
    type Target = ReadAccessor;

    fn deref(&self) -> &ReadAccessor {
        &self.reader
    }
}

impl DerefMut for ReadWriteAccessor {
    fn deref_mut(&mut self) -> &mut ReadAccessor {
        &mut self.reader
    }
}

impl fmt::Write for ReadWriteAccessor {
    /// Best effort, see [`ReadWriteAccessor::append`].
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.append(s);
        Ok(())
    }
}

impl Drop for ReadWriteAccessor {
    fn drop(&mut self) {
        if let Err(e) = self.sync_to_file() {
            log_event(
                Event::BestEffortWriteDropped,
                &[
                    ("file", self.file_name()),
                    ("code", e.code().code()),
                    ("on", "close"),
                ],
            );
        }
    }
}

impl fmt::Debug for ReadWriteAccessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadWriteAccessor")
            .field("reader", &self.reader)
            .field("mode", &self.mode)
            .field("dirty", &self.dirty)
            .finish()
    }
}
