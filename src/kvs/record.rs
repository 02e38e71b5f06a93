//! Key record body
//!
//! ```text
//! +------------------+
//! | Key              | (u32 LE length + UTF-8)
//! +------------------+
//! | Generation       | (u64 LE)
//! +------------------+
//! | Value Type       | (u8)
//! +------------------+
//! | Payload          | (u32 LE length + bytes)
//! +------------------+
//! ```
//!
//! The body is wrapped in a checksummed copy frame before it is stored.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use super::value::{KvsValue, ValueType};

#[derive(Debug, Clone, PartialEq)]
pub struct KvsRecord {
    pub key: String,
    /// Commit generation, strictly increasing per storage instance
    pub generation: u64,
    pub value: KvsValue,
}

impl KvsRecord {
    pub fn new(key: impl Into<String>, generation: u64, value: KvsValue) -> Self {
        Self {
            key: key.into(),
            generation,
            value,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let payload = self.value.encode_payload();
        let mut buf = Vec::with_capacity(4 + self.key.len() + 8 + 1 + 4 + payload.len());

        buf.extend_from_slice(&(self.key.len() as u32).to_le_bytes());
        buf.extend_from_slice(self.key.as_bytes());

        buf.extend_from_slice(&self.generation.to_le_bytes());

        buf.push(self.value.value_type().code());

        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);

        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, String> {
        let mut cursor = Cursor { data, pos: 0 };

        let key_len = cursor.u32()? as usize;
        let key = String::from_utf8(cursor.take(key_len)?.to_vec())
            .map_err(|e| format!("key is not utf-8: {}", e))?;
        let generation = cursor.u64()?;
        let type_code = cursor.take(1)?[0];
        let ty = ValueType::from_code(type_code).ok_or_else(|| format!("unknown value type {}", type_code))?;
        let payload_len = cursor.u32()? as usize;
        let payload = cursor.take(payload_len)?;
        if cursor.pos != data.len() {
            return Err(format!("{} trailing bytes", data.len() - cursor.pos));
        }

        Ok(Self {
            key,
            generation,
            value: KvsValue::decode_payload(ty, payload)?,
        })
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], String> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.data.len());
        match end {
            Some(end) => {
                let out = &self.data[self.pos..end];
                self.pos = end;
                Ok(out)
            }
            None => Err(format!("record truncated at offset {}", self.pos)),
        }
    }

    fn u32(&mut self) -> Result<u32, String> {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(b))
    }

    fn u64(&mut self) -> Result<u64, String> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(b))
    }
}

/// Hands out commit generations: wall-clock nanoseconds, bumped so that they
/// never repeat or go backwards.
#[derive(Debug, Default)]
pub struct GenerationClock {
    last: AtomicU64,
}

impl GenerationClock {
    pub fn next(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(prev.saturating_add(1));
            match self
                .last
                .compare_exchange_weak(prev, candidate, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => return candidate,
                Err(actual) => prev = actual,
            }
        }
    }

    /// Never hand out a generation at or below `seen`.
    pub fn observe(&self, seen: u64) {
        self.last.fetch_max(seen, Ordering::SeqCst);
    }
}
