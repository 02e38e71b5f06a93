//! Checksummed copy frame
//!
//! Every physical copy (record, file content, file info, header, journal) is
//! stored as one frame:
//!
//! ```text
//! +------------------+
//! | Magic "PERS"     | (4 bytes)
//! +------------------+
//! | Format Version   | (u8)
//! +------------------+
//! | Frame Kind       | (u8)
//! +------------------+
//! | Body Length      | (u64 LE)
//! +------------------+
//! | Body             | (Body Length bytes)
//! +------------------+
//! | Checksum         | (u32 LE, CRC32 over everything before it)
//! +------------------+
//! ```
//!
//! A copy is valid only if the whole frame parses and the checksum matches.
//! Large bodies can be written and verified without holding them in memory.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use crc32fast::Hasher;
use thiserror::Error;

pub const MAGIC: [u8; 4] = *b"PERS";
pub const FORMAT_VERSION: u8 = 1;
/// Bytes before the body.
pub const HEADER_LEN: u64 = 14;
/// Bytes after the body.
pub const TRAILER_LEN: u64 = 4;
/// Frame bytes added to every body.
pub const OVERHEAD: u64 = HEADER_LEN + TRAILER_LEN;

const CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Header = 1,
    Record = 2,
    FileContent = 3,
    FileInfo = 4,
    Journal = 5,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame truncated at {0} bytes")]
    Truncated(u64),

    #[error("bad frame magic")]
    BadMagic,

    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u8),

    #[error("expected {expected:?} frame, found kind {found}")]
    WrongKind { expected: FrameKind, found: u8 },

    #[error("frame length mismatch: declared {declared}, actual {actual}")]
    LengthMismatch { declared: u64, actual: u64 },

    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },
}

/// Computes a CRC32 (IEEE) checksum.
pub fn compute_checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

fn header_bytes(kind: FrameKind, body_len: u64) -> [u8; HEADER_LEN as usize] {
    let mut hdr = [0u8; HEADER_LEN as usize];
    hdr[..4].copy_from_slice(&MAGIC);
    hdr[4] = FORMAT_VERSION;
    hdr[5] = kind as u8;
    hdr[6..].copy_from_slice(&body_len.to_le_bytes());
    hdr
}

fn parse_header(kind: FrameKind, hdr: &[u8]) -> Result<u64, FrameError> {
    if hdr.len() < HEADER_LEN as usize {
        return Err(FrameError::Truncated(hdr.len() as u64));
    }
    if hdr[..4] != MAGIC {
        return Err(FrameError::BadMagic);
    }
    if hdr[4] != FORMAT_VERSION {
        return Err(FrameError::UnsupportedVersion(hdr[4]));
    }
    if hdr[5] != kind as u8 {
        return Err(FrameError::WrongKind {
            expected: kind,
            found: hdr[5],
        });
    }
    let mut len = [0u8; 8];
    len.copy_from_slice(&hdr[6..14]);
    Ok(u64::from_le_bytes(len))
}

/// Frame a body in memory.
pub fn encode(kind: FrameKind, body: &[u8]) -> Vec<u8> {
    let hdr = header_bytes(kind, body.len() as u64);
    let mut out = Vec::with_capacity(body.len() + OVERHEAD as usize);
    out.extend_from_slice(&hdr);
    out.extend_from_slice(body);
    let checksum = compute_checksum(&out);
    out.extend_from_slice(&checksum.to_le_bytes());
    out
}

/// Verify a frame and return its body.
pub fn decode(kind: FrameKind, data: &[u8]) -> Result<&[u8], FrameError> {
    let declared = parse_header(kind, data)?;
    let actual = (data.len() as u64).saturating_sub(OVERHEAD);
    if data.len() < OVERHEAD as usize || declared != actual {
        return Err(FrameError::LengthMismatch { declared, actual });
    }
    let split = data.len() - TRAILER_LEN as usize;
    let mut stored = [0u8; 4];
    stored.copy_from_slice(&data[split..]);
    let stored = u32::from_le_bytes(stored);
    let computed = compute_checksum(&data[..split]);
    if stored != computed {
        return Err(FrameError::ChecksumMismatch { stored, computed });
    }
    Ok(&data[HEADER_LEN as usize..split])
}

/// Writes a frame whose body arrives in pieces.
pub struct FrameWriter<W: Write> {
    inner: W,
    hasher: Hasher,
    remaining: u64,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(mut inner: W, kind: FrameKind, body_len: u64) -> io::Result<Self> {
        let hdr = header_bytes(kind, body_len);
        inner.write_all(&hdr)?;
        let mut hasher = Hasher::new();
        hasher.update(&hdr);
        Ok(Self {
            inner,
            hasher,
            remaining: body_len,
        })
    }

    pub fn write_body(&mut self, buf: &[u8]) -> io::Result<()> {
        if buf.len() as u64 > self.remaining {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "frame body longer than declared",
            ));
        }
        self.inner.write_all(buf)?;
        self.hasher.update(buf);
        self.remaining -= buf.len() as u64;
        Ok(())
    }

    /// Copy the rest of the body from a reader.
    pub fn copy_body_from<R: Read>(&mut self, reader: &mut R) -> io::Result<()> {
        let mut buf = vec![0u8; CHUNK];
        while self.remaining > 0 {
            let want = (self.remaining as usize).min(CHUNK);
            let n = reader.read(&mut buf[..want])?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "source shorter than frame body",
                ));
            }
            self.write_body(&buf[..n])?;
        }
        Ok(())
    }

    pub fn finish(mut self) -> io::Result<W> {
        if self.remaining != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "frame body shorter than declared",
            ));
        }
        let checksum = self.hasher.finalize();
        self.inner.write_all(&checksum.to_le_bytes())?;
        Ok(self.inner)
    }
}

/// Identity of a body: its length and CRC32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentDigest {
    pub len: u64,
    pub crc: u32,
}

impl ContentDigest {
    pub fn of(body: &[u8]) -> Self {
        Self {
            len: body.len() as u64,
            crc: compute_checksum(body),
        }
    }
}

/// Verify a framed file without loading it.
///
/// Returns `Ok(None)` if the file does not exist, and the frame verdict
/// otherwise.
pub fn digest_file(path: &Path, kind: FrameKind) -> io::Result<Option<Result<ContentDigest, FrameError>>> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let total = file.metadata()?.len();

    let mut hdr = [0u8; HEADER_LEN as usize];
    if total < OVERHEAD {
        return Ok(Some(Err(FrameError::Truncated(total))));
    }
    file.read_exact(&mut hdr)?;
    let declared = match parse_header(kind, &hdr) {
        Ok(len) => len,
        Err(e) => return Ok(Some(Err(e))),
    };
    let actual = total - OVERHEAD;
    if declared != actual {
        return Ok(Some(Err(FrameError::LengthMismatch { declared, actual })));
    }

    let mut frame_hasher = Hasher::new();
    frame_hasher.update(&hdr);
    let mut body_hasher = Hasher::new();
    let mut remaining = declared;
    let mut buf = vec![0u8; CHUNK];
    while remaining > 0 {
        let want = (remaining as usize).min(CHUNK);
        file.read_exact(&mut buf[..want])?;
        frame_hasher.update(&buf[..want]);
        body_hasher.update(&buf[..want]);
        remaining -= want as u64;
    }

    let mut stored = [0u8; 4];
    file.read_exact(&mut stored)?;
    let stored = u32::from_le_bytes(stored);
    let computed = frame_hasher.finalize();
    if stored != computed {
        return Ok(Some(Err(FrameError::ChecksumMismatch { stored, computed })));
    }

    Ok(Some(Ok(ContentDigest {
        len: declared,
        crc: body_hasher.finalize(),
    })))
}
