//! Block-cached positional stream
//!
//! Accessors read and write through a single cached block. The block size is
//! the length of the buffer handed in at open time (4 KiB without one).
//! Writes land in the cached block and reach the file as one write when
//! another block is needed, on `set_len` and on `sync`, so many small writes
//! cost one file write per block.
//!
//! The stream content starts at `base` within the file, which lets a
//! read-only accessor read a content copy in place, past its frame header.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

pub const DEFAULT_BLOCK_SIZE: usize = 4096;

pub(crate) struct BlockStream {
    file: File,
    base: u64,
    /// Logical size, including unflushed bytes of the cached block
    size: u64,
    cache: Vec<u8>,
    /// Start offset and valid length of the cached block
    cached: Option<(u64, usize)>,
    /// The cached block holds bytes the file does not have yet
    dirty: bool,
}

impl BlockStream {
    pub(crate) fn new(file: File, base: u64, size: u64, buffer: Vec<u8>) -> Self {
        let cache = if buffer.is_empty() {
            vec![0; DEFAULT_BLOCK_SIZE]
        } else {
            buffer
        };
        Self {
            file,
            base,
            size,
            cache,
            cached: None,
            dirty: false,
        }
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn block_size(&self) -> usize {
        self.cache.len()
    }

    #[cfg(test)]
    pub(crate) fn cached_block(&self) -> Option<(u64, usize)> {
        self.cached
    }

    /// The underlying file. Only complete after [`sync`](Self::sync).
    pub(crate) fn file_mut(&mut self) -> &mut File {
        debug_assert!(!self.dirty, "file taken with an unflushed block");
        &mut self.file
    }

    /// Write the cached block back if it holds unflushed bytes.
    fn flush(&mut self) -> io::Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if let Some((start, valid)) = self.cached {
            self.file.seek(SeekFrom::Start(self.base + start))?;
            self.file.write_all(&self.cache[..valid])?;
        }
        self.dirty = false;
        Ok(())
    }

    /// Make the block holding `pos` the cached one. `pos <= size`.
    ///
    /// Only the cached block can be ahead of the file, so every other block
    /// is read back from disk as it is.
    fn load(&mut self, pos: u64) -> io::Result<(u64, usize)> {
        let block = self.cache.len() as u64;
        let start = pos - pos % block;
        if let Some((cached_start, valid)) = self.cached {
            if cached_start == start {
                return Ok((cached_start, valid));
            }
        }
        self.flush()?;
        let want = (self.size - start).min(block) as usize;
        self.cached = None;
        if want > 0 {
            self.file.seek(SeekFrom::Start(self.base + start))?;
            self.file.read_exact(&mut self.cache[..want])?;
        }
        self.cached = Some((start, want));
        Ok((start, want))
    }

    pub(crate) fn byte_at(&mut self, pos: u64) -> io::Result<Option<u8>> {
        if pos >= self.size {
            return Ok(None);
        }
        let (start, _) = self.load(pos)?;
        Ok(Some(self.cache[(pos - start) as usize]))
    }

    /// Append up to `n` bytes starting at `pos` to `out`. Returns the count.
    pub(crate) fn read_at(&mut self, mut pos: u64, n: u64, out: &mut Vec<u8>) -> io::Result<u64> {
        let mut remaining = n.min(self.size.saturating_sub(pos));
        let total = remaining;
        while remaining > 0 {
            let (start, valid) = self.load(pos)?;
            let offset = (pos - start) as usize;
            let take = ((valid - offset) as u64).min(remaining) as usize;
            out.extend_from_slice(&self.cache[offset..offset + take]);
            pos += take as u64;
            remaining -= take as u64;
        }
        Ok(total)
    }

    /// Offset of the first `byte` at or after `pos`.
    pub(crate) fn find(&mut self, mut pos: u64, byte: u8) -> io::Result<Option<u64>> {
        while pos < self.size {
            let (start, valid) = self.load(pos)?;
            let offset = (pos - start) as usize;
            if let Some(i) = self.cache[offset..valid].iter().position(|&b| b == byte) {
                return Ok(Some(pos + i as u64));
            }
            pos = start + valid as u64;
        }
        Ok(None)
    }

    /// Write `data` at `pos` (at most `size`) into the cached blocks.
    pub(crate) fn write_at(&mut self, mut pos: u64, mut data: &[u8]) -> io::Result<()> {
        debug_assert!(pos <= self.size);
        while !data.is_empty() {
            let (start, valid) = self.load(pos)?;
            let offset = (pos - start) as usize;
            let take = (self.cache.len() - offset).min(data.len());
            self.cache[offset..offset + take].copy_from_slice(&data[..take]);
            self.cached = Some((start, valid.max(offset + take)));
            self.dirty = true;

            pos += take as u64;
            data = &data[take..];
            self.size = self.size.max(pos);
        }
        Ok(())
    }

    pub(crate) fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.flush()?;
        self.file.set_len(self.base + len)?;
        self.size = len;
        self.cached = match self.cached {
            Some((start, _)) if start >= len => None,
            Some((start, valid)) => Some((start, valid.min((len - start) as usize))),
            None => None,
        };
        Ok(())
    }

    /// Flush the cached block and make the file durable.
    pub(crate) fn sync(&mut self) -> io::Result<()> {
        self.flush()?;
        self.file.sync_data()
    }
}
