//! Physical copy directories
//!
//! Copy `i` of every element in a set lives in `<base>/<prefix>_<i>/`, under
//! the hex-encoded element name. Writes go to a uniquely named temp file in
//! the same directory which is fsynced and renamed over the target, so a copy
//! is always either the old frame or the new one.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::id::{decode_name, encode_name};

/// fsync a directory so that renames inside it are durable.
pub fn fsync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        let d = OpenOptions::new().read(true).open(dir)?;
        d.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

/// Replace `target` with the output of `fill`, atomically.
pub fn write_atomic_with<F>(target: &Path, fill: F) -> io::Result<()>
where
    F: FnOnce(&mut File) -> io::Result<()>,
{
    let dir = target
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "target has no parent"))?;
    let file_name = target
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "target has no file name"))?;
    let tmp = dir.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));

    let result = (|| {
        let mut file = OpenOptions::new().write(true).create_new(true).open(&tmp)?;
        fill(&mut file)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, target)?;
        fsync_dir(dir)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// The copy directories of one element set.
#[derive(Debug, Clone)]
pub struct CopyLayout {
    dirs: Vec<PathBuf>,
}

impl CopyLayout {
    pub fn new(base: &Path, prefix: &str, copies: usize) -> Self {
        let dirs = (0..copies)
            .map(|i| base.join(format!("{}_{}", prefix, i)))
            .collect();
        Self { dirs }
    }

    pub fn copies(&self) -> usize {
        self.dirs.len()
    }

    pub fn dir(&self, copy: usize) -> &Path {
        &self.dirs[copy]
    }

    pub fn path(&self, copy: usize, name: &str) -> PathBuf {
        self.dirs[copy].join(encode_name(name))
    }

    pub fn ensure_dirs(&self) -> io::Result<()> {
        for dir in &self.dirs {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Remove temp files left behind by an interrupted write.
    pub fn clean_temp_files(&self) -> io::Result<usize> {
        let mut removed = 0;
        for dir in &self.dirs {
            let entries = match fs::read_dir(dir) {
                Ok(e) => e,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            for entry in entries {
                let entry = entry?;
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with('.') && name.ends_with(".tmp") {
                    fs::remove_file(entry.path())?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Read one copy. `Ok(None)` if the copy slot is empty.
    pub fn read(&self, copy: usize, name: &str) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.path(copy, name)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn write(&self, copy: usize, name: &str, data: &[u8]) -> io::Result<()> {
        fs::create_dir_all(&self.dirs[copy])?;
        write_atomic_with(&self.path(copy, name), |f| io::Write::write_all(f, data))
    }

    /// Replace copy `to` with the raw bytes of copy `from`.
    pub fn clone_copy(&self, from: usize, to: usize, name: &str) -> io::Result<()> {
        let src = self.path(from, name);
        fs::create_dir_all(&self.dirs[to])?;
        write_atomic_with(&self.path(to, name), |dst| {
            let mut src = File::open(&src)?;
            io::copy(&mut src, dst)?;
            Ok(())
        })
    }

    pub fn remove(&self, copy: usize, name: &str) -> io::Result<()> {
        match fs::remove_file(self.path(copy, name)) {
            Ok(()) => fsync_dir(&self.dirs[copy]),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Element names stored in one copy directory.
    pub fn names(&self, copy: usize) -> io::Result<BTreeSet<String>> {
        let entries = match fs::read_dir(&self.dirs[copy]) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => return Err(e),
        };
        let mut names = BTreeSet::new();
        for entry in entries {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str().and_then(decode_name) {
                names.insert(name);
            }
        }
        Ok(names)
    }

    /// Names listed by at least `quorum` copy directories.
    ///
    /// Unreadable directories count as not listing anything.
    pub fn names_with_quorum(&self, quorum: usize) -> BTreeSet<String> {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for copy in 0..self.copies() {
            if let Ok(names) = self.names(copy) {
                for name in names {
                    *counts.entry(name).or_default() += 1;
                }
            }
        }
        counts
            .into_iter()
            .filter(|(_, n)| *n >= quorum.max(1))
            .map(|(name, _)| name)
            .collect()
    }

    /// Names listed by any copy directory.
    pub fn union_names(&self) -> BTreeSet<String> {
        self.names_with_quorum(1)
    }

    /// Bytes used by one element over all copies.
    pub fn element_usage(&self, name: &str) -> u64 {
        (0..self.copies())
            .filter_map(|c| fs::metadata(self.path(c, name)).ok())
            .map(|m| m.len())
            .sum()
    }

    /// Bytes used by every file in every copy directory.
    pub fn disk_usage(&self) -> io::Result<u64> {
        let mut total = 0;
        for dir in &self.dirs {
            total += dir_size(dir)?;
        }
        Ok(total)
    }
}

/// Recursive byte size of a directory. Missing directories are empty.
pub fn dir_size(dir: &Path) -> io::Result<u64> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let mut total = 0;
    for entry in entries {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += meta.len();
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_read_remove() {
        let dir = TempDir::new().unwrap();
        let layout = CopyLayout::new(dir.path(), "copy", 3);
        layout.ensure_dirs().unwrap();

        assert_eq!(layout.read(0, "k").unwrap(), None);
        layout.write(1, "k", b"abc").unwrap();
        assert_eq!(layout.read(1, "k").unwrap(), Some(b"abc".to_vec()));
        assert_eq!(layout.read(0, "k").unwrap(), None);

        layout.remove(1, "k").unwrap();
        layout.remove(1, "k").unwrap();
        assert_eq!(layout.read(1, "k").unwrap(), None);
    }

    #[test]
    fn test_names_ignore_temp_files() {
        let dir = TempDir::new().unwrap();
        let layout = CopyLayout::new(dir.path(), "copy", 1);
        layout.ensure_dirs().unwrap();
        layout.write(0, "alpha", b"1").unwrap();
        fs::write(layout.dir(0).join(".616c.deadbeef.tmp"), b"junk").unwrap();

        let names: Vec<_> = layout.names(0).unwrap().into_iter().collect();
        assert_eq!(names, vec!["alpha".to_string()]);

        assert_eq!(layout.clean_temp_files().unwrap(), 1);
        assert_eq!(fs::read_dir(layout.dir(0)).unwrap().count(), 1);
    }

    #[test]
    fn test_names_with_quorum() {
        let dir = TempDir::new().unwrap();
        let layout = CopyLayout::new(dir.path(), "copy", 3);
        layout.ensure_dirs().unwrap();
        for c in 0..3 {
            layout.write(c, "everywhere", b"x").unwrap();
        }
        layout.write(0, "once", b"x").unwrap();
        layout.write(0, "twice", b"x").unwrap();
        layout.write(2, "twice", b"x").unwrap();

        let majority: Vec<_> = layout.names_with_quorum(2).into_iter().collect();
        assert_eq!(majority, vec!["everywhere".to_string(), "twice".to_string()]);
        assert_eq!(layout.union_names().len(), 3);
    }

    #[test]
    fn test_clone_copy_and_usage() {
        let dir = TempDir::new().unwrap();
        let layout = CopyLayout::new(dir.path(), "copy", 2);
        layout.ensure_dirs().unwrap();
        layout.write(0, "f", b"hello").unwrap();
        layout.write(1, "f", b"bad").unwrap();

        layout.clone_copy(0, 1, "f").unwrap();
        assert_eq!(layout.read(1, "f").unwrap(), Some(b"hello".to_vec()));
        assert_eq!(layout.element_usage("f"), 10);
        assert_eq!(layout.disk_usage().unwrap(), 10);
    }

    #[test]
    fn test_missing_dirs_are_empty() {
        let dir = TempDir::new().unwrap();
        let layout = CopyLayout::new(&dir.path().join("nowhere"), "copy", 2);
        assert!(layout.names(0).unwrap().is_empty());
        assert_eq!(layout.disk_usage().unwrap(), 0);
        assert_eq!(layout.clean_temp_files().unwrap(), 0);
    }
}
