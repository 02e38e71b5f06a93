//! Per-element critical sections.
//!
//! Copy sets of one key or file are only mutated under that element's write
//! section; plain reads share it. Sections are created on first use and
//! dropped again once the last holder releases them, so the map only holds
//! elements that are currently in use.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::locks;

#[derive(Default)]
pub(crate) struct Sections {
    map: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl Sections {
    pub(crate) fn get(&self, name: &str) -> Section<'_> {
        let mut map = locks::lock(&self.map);
        let lock = map.entry(name.to_string()).or_default().clone();
        Section {
            sections: self,
            name: name.to_string(),
            lock,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        locks::lock(&self.map).len()
    }
}

/// A claim on one element's section.
pub(crate) struct Section<'a> {
    sections: &'a Sections,
    name: String,
    lock: Arc<RwLock<()>>,
}

impl Section<'_> {
    pub(crate) fn read(&self) -> RwLockReadGuard<'_, ()> {
        locks::read(&self.lock)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, ()> {
        locks::write(&self.lock)
    }
}

impl Drop for Section<'_> {
    fn drop(&mut self) {
        // clones are only taken under the map lock: the map and this claim
        // are the last two references
        let mut map = locks::lock(&self.sections.map);
        if Arc::strong_count(&self.lock) == 2 {
            map.remove(&self.name);
        }
    }
}
