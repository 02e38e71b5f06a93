//! Storage and accessor handles
//!
//! [`SharedHandle`] is a counted reference to an open storage: the storage
//! closes when the last clone is gone. [`UniqueHandle`] is the single owner
//! of a file accessor and cannot be cloned.
//!
//! Both can be emptied. Dereferencing an empty handle panics, so code that
//! may see one checks [`is_valid`](SharedHandle::is_valid) first or uses
//! `get()`.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

pub struct SharedHandle<T> {
    inner: Option<Arc<T>>,
}

impl<T> SharedHandle<T> {
    pub(crate) fn new(inner: Arc<T>) -> Self {
        Self { inner: Some(inner) }
    }

    pub fn is_valid(&self) -> bool {
        self.inner.is_some()
    }

    pub fn get(&self) -> Option<&T> {
        self.inner.as_deref()
    }

    /// Give up this reference. The handle becomes empty.
    pub fn release(&mut self) {
        self.inner = None;
    }

    /// Number of live handles to the same storage, 0 for an empty handle.
    pub fn use_count(&self) -> usize {
        self.inner.as_ref().map(Arc::strong_count).unwrap_or(0)
    }

    /// Whether both handles refer to the same instance.
    pub fn ptr_eq(&self, other: &SharedHandle<T>) -> bool {
        match (&self.inner, &other.inner) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl<T> Clone for SharedHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Deref for SharedHandle<T> {
    type Target = T;

    /// # Panics
    ///
    /// Panics if the handle is empty.
    fn deref(&self) -> &T {
        match &self.inner {
            Some(inner) => inner,
            None => panic!("dereferenced an empty SharedHandle"),
        }
    }
}

impl<T> fmt::Debug for SharedHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedHandle")
            .field("valid", &self.is_valid())
            .field("use_count", &self.use_count())
            .finish()
    }
}

pub struct UniqueHandle<T> {
    inner: Option<T>,
}

impl<T> UniqueHandle<T> {
    pub(crate) fn new(inner: T) -> Self {
        Self { inner: Some(inner) }
    }

    pub fn is_valid(&self) -> bool {
        self.inner.is_some()
    }

    pub fn get(&self) -> Option<&T> {
        self.inner.as_ref()
    }

    pub fn get_mut(&mut self) -> Option<&mut T> {
        self.inner.as_mut()
    }

    /// Move the value out, leaving the handle empty.
    pub fn take(&mut self) -> Option<T> {
        self.inner.take()
    }

    /// Drop the value now. The handle becomes empty.
    pub fn release(&mut self) {
        self.inner = None;
    }
}

impl<T> Deref for UniqueHandle<T> {
    type Target = T;

    /// # Panics
    ///
    /// Panics if the handle is empty.
    fn deref(&self) -> &T {
        match &self.inner {
            Some(inner) => inner,
            None => panic!("dereferenced an empty UniqueHandle"),
        }
    }
}

impl<T> DerefMut for UniqueHandle<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.inner {
            Some(inner) => inner,
            None => panic!("dereferenced an empty UniqueHandle"),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for UniqueHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("UniqueHandle").field(&self.inner).finish()
    }
}
