//! Commit journal
//!
//! `sync_to_storage` first writes the complete change set to `kvs/journal`,
//! then applies it key by key, then removes the journal. A journal found on
//! open belongs to an interrupted commit:
//!
//! - valid frame: the commit is rolled forward (applied again, idempotently)
//! - invalid frame: the commit never became durable and is dropped
//!
//! Journal body:
//!
//! ```text
//! | Op Count (u32 LE) | Op* |
//! Op = 1 (u8) | Record Length (u32 LE) | Record Body     -- put
//!    | 2 (u8) | Key Length (u32 LE)    | Key (UTF-8)     -- remove
//! ```

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use super::record::KvsRecord;
use crate::context::StorageContext;
use crate::error::{PerError, PerResult};
use crate::redundancy::{decode_frame, encode_frame, fsync_dir, write_atomic_with, FrameKind};

const OP_PUT: u8 = 1;
const OP_REMOVE: u8 = 2;
const JOURNAL_ELEMENT: &str = "journal";

#[derive(Debug, Clone, PartialEq)]
pub enum JournalOp {
    Put(KvsRecord),
    Remove(String),
}

impl JournalOp {
    pub fn key(&self) -> &str {
        match self {
            JournalOp::Put(record) => &record.key,
            JournalOp::Remove(key) => key,
        }
    }
}

/// What was found on disk.
#[derive(Debug)]
pub enum JournalState {
    Empty,
    Valid(Vec<JournalOp>),
    Invalid(String),
}

pub struct Journal {
    ctx: Arc<StorageContext>,
    path: PathBuf,
}

impl Journal {
    pub fn new(ctx: Arc<StorageContext>) -> Self {
        let path = ctx.dir.join("kvs").join("journal");
        Self { ctx, path }
    }

    fn io_err(&self, what: &str, e: io::Error) -> PerError {
        PerError::io(format!("failed to {} journal of {}", what, self.ctx.id), e)
    }

    pub fn write(&self, ops: &[JournalOp]) -> PerResult<()> {
        let body = self.ctx.seal(JOURNAL_ELEMENT, &encode_ops(ops))?;
        let framed = encode_frame(FrameKind::Journal, &body);
        write_atomic_with(&self.path, |f| io::Write::write_all(f, &framed))
            .map_err(|e| self.io_err("write", e))
    }

    pub fn read(&self) -> PerResult<JournalState> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(JournalState::Empty),
            Err(e) => return Err(self.io_err("read", e)),
        };
        let body = match decode_frame(FrameKind::Journal, &raw) {
            Ok(body) => body,
            Err(e) => return Ok(JournalState::Invalid(e.to_string())),
        };
        let plain = match self.ctx.unseal(JOURNAL_ELEMENT, body) {
            Ok(plain) => plain,
            Err(e) => return Ok(JournalState::Invalid(e.to_string())),
        };
        Ok(match decode_ops(&plain) {
            Ok(ops) => JournalState::Valid(ops),
            Err(e) => JournalState::Invalid(e),
        })
    }

    pub fn remove(&self) -> PerResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(self.io_err("remove", e)),
        }
        match self.path.parent() {
            Some(dir) => fsync_dir(dir).map_err(|e| self.io_err("sync", e)),
            None => Ok(()),
        }
    }

    pub fn size(&self) -> u64 {
        fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }
}

fn encode_ops(ops: &[JournalOp]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(ops.len() as u32).to_le_bytes());
    for op in ops {
        match op {
            JournalOp::Put(record) => {
                let body = record.encode();
                buf.push(OP_PUT);
                buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
                buf.extend_from_slice(&body);
            }
            JournalOp::Remove(key) => {
                buf.push(OP_REMOVE);
                buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
                buf.extend_from_slice(key.as_bytes());
            }
        }
    }
    buf
}

fn decode_ops(data: &[u8]) -> Result<Vec<JournalOp>, String> {
    fn chunk<'a>(data: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8], String> {
        let end = pos
            .checked_add(n)
            .filter(|&e| e <= data.len())
            .ok_or_else(|| format!("journal truncated at offset {}", pos))?;
        let out = &data[*pos..end];
        *pos = end;
        Ok(out)
    }
    fn len(data: &[u8], pos: &mut usize) -> Result<usize, String> {
        let mut b = [0u8; 4];
        b.copy_from_slice(chunk(data, pos, 4)?);
        Ok(u32::from_le_bytes(b) as usize)
    }

    let mut pos = 0;
    let count = len(data, &mut pos)?;
    let mut ops = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let tag = chunk(data, &mut pos, 1)?[0];
        let n = len(data, &mut pos)?;
        let bytes = chunk(data, &mut pos, n)?;
        ops.push(match tag {
            OP_PUT => JournalOp::Put(KvsRecord::decode(bytes)?),
            OP_REMOVE => JournalOp::Remove(
                String::from_utf8(bytes.to_vec()).map_err(|e| format!("key is not utf-8: {}", e))?,
            ),
            other => return Err(format!("unknown journal op {}", other)),
        });
    }
    if pos != data.len() {
        return Err(format!("{} trailing journal bytes", data.len() - pos));
    }
    Ok(ops)
}
