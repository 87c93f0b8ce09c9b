use std::sync::atomic::Ordering;

use crate::store::store::{ObjectStore, StoreError};

/// A single traversal over an [`ObjectStore`].
///
/// The cursor owns the keys that were live when it was created and reads
/// each value when it reaches the key, so entries removed behind it or ahead
/// of it are handled without touching store internals. Keys added after the
/// cursor was created are not visited.
pub struct Cursor<'a> {
    store: &'a ObjectStore,
    pending: std::vec::IntoIter<String>,
    current: Option<String>,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(store: &'a ObjectStore, keys: Vec<String>) -> Self {
        Self {
            store,
            pending: keys.into_iter(),
            current: None,
        }
    }

    /// Key of the entry most recently yielded, unless it was already removed.
    pub fn current_key(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Removes the entry most recently yielded.
    ///
    /// Returns `false` if nothing has been yielded yet or the current entry
    /// was already removed. A failed removal keeps the entry current, so it
    /// can be retried.
    pub fn remove_current(&mut self) -> Result<bool, StoreError> {
        let Some(key) = self.current.as_deref() else {
            return Ok(false);
        };
        let removed = self.store.remove(key)?;
        self.current = None;
        Ok(removed)
    }

    /// Keys still waiting to be visited (some may have been removed since).
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

impl Iterator for Cursor<'_> {
    type Item = Result<(String, Vec<u8>), StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.current = None;
        for key in self.pending.by_ref() {
            match self.store.get(&key) {
                Ok(Some(value)) => {
                    self.current = Some(key.clone());
                    return Some(Ok((key, value)));
                }
                // Removed since the snapshot was taken.
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}

impl Drop for Cursor<'_> {
    fn drop(&mut self) {
        self.store.traversing.store(false, Ordering::Release);
    }
}
