//! The writer lock and the operations that need it.
//!
//! All mutation goes through an [`XaLock`]. Allocation failures and
//! conflicts are recorded in the cursor rather than returned, so a caller
//! can drop the lock, call [`XaState::nomem`] and retry:
//!
//! ```
//! use xarray_core::{Entry, XArray, XaState};
//!
//! let xa: XArray<()> = XArray::new();
//! let mut xas = XaState::new(7);
//! loop {
//!     let lock = xa.lock();
//!     lock.store(&mut xas, Some(Entry::Value(3)));
//!     drop(lock);
//!     if !xas.nomem() {
//!         break;
//!     }
//! }
//! assert_eq!(xa.load(7), Some(Entry::Value(3)));
//! ```

use crossbeam_epoch::Guard;
use log::warn;
use parking_lot::MutexGuard;

use crate::entry::{Entry, RawEntry};
use crate::errors::Error;
use crate::helpers::range_last;
use crate::read::Iter;
use crate::reclaim::{pin, section_token};
use crate::state::XaState;
use crate::types::XArray;
use crate::walk::Filter;

/// Exclusive write access, plus the pin that keeps unlinked nodes alive
/// until it is dropped. Cursor positions from another section are dropped
/// on entry.
pub struct XaLock<'a, T> {
    xa: &'a XArray<T>,
    _lock: MutexGuard<'a, ()>,
    guard: Guard,
    token: u64,
}

impl<T: Send + Sync + 'static> XArray<T> {
    /// Take the writer lock.
    pub fn lock(&self) -> XaLock<'_, T> {
        XaLock {
            xa: self,
            _lock: self.lock.lock(),
            guard: pin(),
            token: section_token(),
        }
    }
}

impl<'a, T: Send + Sync + 'static> XaLock<'a, T> {
    pub fn load(&self, xas: &mut XaState) -> Option<Entry<T>> {
        xas.enter(self.token);
        let entry = self.xa.load_raw(xas);
        // SAFETY: pinned, and the lock keeps the slot's reference alive.
        unsafe { entry.to_entry() }
    }

    /// Store `entry` (or erase with `None`) over the cursor's range and
    /// return what was at the cursor's index. On failure the error is left
    /// in the cursor and the tree is unchanged.
    pub fn store(&self, xas: &mut XaState, entry: Option<Entry<T>>) -> Option<Entry<T>> {
        xas.enter(self.token);
        if xas.is_error() {
            return None;
        }
        let raw = match RawEntry::encode_opt(entry) {
            Ok(raw) => raw,
            Err(err) => {
                xas.set_error(err);
                return None;
            }
        };
        match self.xa.xas_store(xas, raw, &self.guard) {
            // SAFETY: the old entry's reference is released no earlier than
            // this pin.
            Some(old) => unsafe { old.to_entry() },
            None => {
                // SAFETY: the store failed, so the reference was never
                // published.
                unsafe { raw.release::<T>() };
                None
            }
        }
    }

    /// Store only if every index in the cursor's range is empty; otherwise
    /// record [`Error::AlreadyOccupied`].
    pub fn insert(&self, xas: &mut XaState, entry: Entry<T>) {
        xas.enter(self.token);
        if xas.is_error() {
            return;
        }
        let Some(last) = range_last(xas.index(), xas.order()) else {
            xas.set_error(Error::IndexOutOfRange);
            return;
        };
        if self
            .xa
            .find_raw(xas.index(), last, Filter::Present, false)
            .is_some()
        {
            xas.set_error(Error::AlreadyOccupied);
            return;
        }
        self.store(xas, Some(entry));
    }

    /// Replace the entry at the cursor with `new` if it currently is `old`.
    /// Returns the entry found there either way.
    pub fn compare_and_swap(
        &self,
        xas: &mut XaState,
        old: Option<&Entry<T>>,
        new: Option<Entry<T>>,
    ) -> Option<Entry<T>> {
        xas.enter(self.token);
        let cur = self.xa.load_raw(xas);
        if cur.holds(old) {
            self.store(xas, new)
        } else {
            // SAFETY: as in `load`.
            unsafe { cur.to_entry() }
        }
    }

    /// Tag the entry at the cursor. A no-op on an empty index.
    pub fn set_tag(&self, xas: &mut XaState, tag: usize) {
        xas.enter(self.token);
        if !self.check_tag(tag) {
            return;
        }
        let entry = self.xa.load_raw(xas);
        if entry.is_leaf() {
            self.xa.xas_set_tag(xas, tag);
        }
    }

    pub fn clear_tag(&self, xas: &mut XaState, tag: usize) {
        xas.enter(self.token);
        if !self.check_tag(tag) {
            return;
        }
        let entry = self.xa.load_raw(xas);
        if entry.is_leaf() {
            self.xa.xas_clear_tag(xas, tag);
        }
    }

    pub fn get_tag(&self, xas: &XaState, tag: usize) -> bool {
        self.xa.get_tag_raw(xas.index(), tag)
    }

    /// Entries overlapping the cursor's range, including one that began
    /// before it.
    pub fn conflicts(&self, xas: &XaState) -> Iter<'a, T> {
        let last = range_last(xas.index(), xas.order()).unwrap_or(usize::MAX);
        Iter::new(self.xa, xas.index(), last, Filter::Present)
    }

    /// Pre-build the nodes for the cursor's whole range.
    pub fn create_range(&self, xas: &mut XaState) {
        xas.enter(self.token);
        self.xa.xas_create_range(xas);
    }

    pub fn next(&self, xas: &mut XaState) -> Option<Entry<T>> {
        xas.enter(self.token);
        let entry = self.xa.xas_next(xas);
        // SAFETY: as in `load`.
        unsafe { entry.to_entry() }
    }

    pub fn prev(&self, xas: &mut XaState) -> Option<Entry<T>> {
        xas.enter(self.token);
        let entry = self.xa.xas_prev(xas);
        // SAFETY: as in `load`.
        unsafe { entry.to_entry() }
    }

    fn check_tag(&self, tag: usize) -> bool {
        if tag >= self.xa.tag_count() {
            warn!("[TAG] tag {tag} out of range (array has {})", self.xa.tag_count());
            return false;
        }
        true
    }
}
