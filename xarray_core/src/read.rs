//! Lock-free read sections and iteration.

use std::ptr::NonNull;

use crossbeam_epoch::Guard;

use crate::entry::{Entry, RawEntry};
use crate::reclaim::{pin, section_token};
use crate::state::XaState;
use crate::types::{Node, XArray};
use crate::walk::Filter;

/// A pinned read section. Entries cloned out of it stay valid after it is
/// dropped; nodes seen inside it are not freed until then.
///
/// A cursor keeps its position between calls on the same section. Handing
/// it to another section or lock makes it re-walk from the head.
pub struct ReadSection<'a, T> {
    xa: &'a XArray<T>,
    token: u64,
    _guard: Guard,
}

impl<T> XArray<T> {
    /// Enter a read section. Never blocks, not even on the writer lock.
    pub fn read(&self) -> ReadSection<'_, T> {
        ReadSection {
            xa: self,
            token: section_token(),
            _guard: pin(),
        }
    }
}

// SAFETY for the `to_entry` calls below: the word was read under this
// section's pin, so a pointer's reference is not released yet.
fn convert<T>(entry: RawEntry) -> Option<Entry<T>> {
    unsafe { entry.to_entry() }
}

impl<'a, T> ReadSection<'a, T> {
    pub fn load(&self, index: usize) -> Option<Entry<T>> {
        let mut xas = XaState::new(index);
        convert(self.xa.load_raw(&mut xas))
    }

    /// Load at the cursor, honouring its order.
    pub fn load_at(&self, xas: &mut XaState) -> Option<Entry<T>> {
        xas.enter(self.token);
        convert(self.xa.load_raw(xas))
    }

    pub fn next(&self, xas: &mut XaState) -> Option<Entry<T>> {
        xas.enter(self.token);
        convert(self.xa.xas_next(xas))
    }

    pub fn prev(&self, xas: &mut XaState) -> Option<Entry<T>> {
        xas.enter(self.token);
        convert(self.xa.xas_prev(xas))
    }

    pub fn get_tag(&self, index: usize, tag: usize) -> bool {
        self.xa.get_tag_raw(index, tag)
    }

    /// First entry in `[*index, max]` passing `filter`. An entry that covers
    /// `*index` but starts before it counts. On a hit `*index` is moved to
    /// the first covered index at or after the old value.
    pub fn find(&self, index: &mut usize, max: usize, filter: Filter) -> Option<Entry<T>> {
        let found = self.xa.find_raw(*index, max, filter, false)?;
        *index = found.index;
        convert(found.entry)
    }

    /// First entry beginning in `(*index, max]`.
    pub fn find_after(&self, index: &mut usize, max: usize, filter: Filter) -> Option<Entry<T>> {
        let start = index.checked_add(1)?;
        let found = self.xa.find_raw(start, max, filter, true)?;
        *index = found.index;
        convert(found.entry)
    }

    pub fn iter(&self, first: usize, last: usize) -> Iter<'a, T> {
        Iter::new(self.xa, first, last, Filter::Present)
    }

    pub fn iter_tagged(&self, first: usize, last: usize, tag: usize) -> Iter<'a, T> {
        Iter::new(self.xa, first, last, Filter::Tagged(tag))
    }
}

/// Lazy walk over the entries in an index range, each reported once at its
/// first index inside the range. Holds its own pin, under which it keeps the
/// node of the last hit and resumes from there.
pub struct Iter<'a, T> {
    xa: &'a XArray<T>,
    _guard: Guard,
    next: Option<usize>,
    last: usize,
    filter: Filter,
    hint: Option<(NonNull<Node>, usize)>,
}

impl<'a, T> Iter<'a, T> {
    pub(crate) fn new(xa: &'a XArray<T>, first: usize, last: usize, filter: Filter) -> Self {
        Self {
            xa,
            _guard: pin(),
            next: Some(first),
            last,
            filter,
            hint: None,
        }
    }
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (usize, Entry<T>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let start = self.next?;
            let hint = self.hint.take();
            let Some(found) = self.xa.find_from(hint, start, self.last, self.filter, false) else {
                self.next = None;
                return None;
            };
            self.next = found.last.checked_add(1);
            self.hint = found.node.map(|node| (node, found.index));
            if let Some(entry) = convert(found.entry) {
                return Some((found.index, entry));
            }
        }
    }
}
