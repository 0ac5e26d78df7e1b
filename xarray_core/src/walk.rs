//! Lock-free traversal.
//!
//! Everything here only loads slots, so it is safe from any thread holding an
//! epoch pin. A reader that lands on a retry or deleted marker re-walks from
//! the head; the writer never leaves one in a live slot.
//!
//! Nodes seen under a pin stay allocated until it is dropped, so a cursor or
//! iterator may keep its node between steps and move sideways or up from
//! there. An unlinked node is poisoned before it is retired, which sends such
//! a walker back to the head.

use std::ptr::NonNull;

use log::trace;
use metrics::counter;

use crate::entry::RawEntry;
use crate::state::{Walk, XaState};
use crate::types::{Node, XArray};

/// Which entries a search reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    /// Any non-empty entry.
    Present,
    /// Entries carrying this tag.
    Tagged(usize),
}

/// One search hit.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Found {
    /// First index at or after the search start covered by the entry.
    pub index: usize,
    /// Last index covered by the entry, never below `index`.
    pub last: usize,
    pub entry: RawEntry,
    /// Node holding the entry; `None` for the head.
    pub node: Option<NonNull<Node>>,
}

// SAFETY for every `unsafe { node.as_ref() }` below: nodes reachable from the
// head are only freed after the pins taken before their unlink are dropped,
// and every caller of this module holds a pin.
#[inline(always)]
fn node_ref<'g>(node: NonNull<Node>) -> &'g Node {
    unsafe { &*node.as_ptr() }
}

impl<T> XArray<T> {
    /// Highest index the entry in the head can reach.
    pub(crate) fn max_index(&self, entry: RawEntry) -> usize {
        match entry.as_node() {
            Some(node) => self.geo.node_max_index(node_ref(node).shift()),
            None => 0,
        }
    }

    /// Re-read the slot the cursor is positioned on.
    pub(crate) fn xas_reload(&self, xas: &XaState) -> RawEntry {
        match xas.walk {
            Walk::Head => self.head(),
            Walk::Node(node) => {
                let node = node_ref(node);
                let entry = node.slot(xas.offset);
                if entry.is_sibling() {
                    node.slot(entry.sibling_offset())
                } else {
                    entry
                }
            }
            _ => RawEntry::EMPTY,
        }
    }

    /// Begin a walk: the head entry, or `EMPTY` with the cursor in bounds
    /// state if the index lies beyond what the array covers.
    pub(crate) fn xas_start(&self, xas: &mut XaState) -> RawEntry {
        match xas.walk {
            Walk::Head | Walk::Node(_) => return self.xas_reload(xas),
            Walk::Error => return RawEntry::EMPTY,
            _ => {}
        }
        let entry = self.head();
        if entry.is_node() {
            if xas.index > self.max_index(entry) {
                xas.walk = Walk::Bounds;
                return RawEntry::EMPTY;
            }
        } else if xas.index != 0 {
            xas.walk = Walk::Bounds;
            return RawEntry::EMPTY;
        }
        xas.walk = Walk::Head;
        entry
    }

    /// Step into `node` toward the cursor's index, resolving siblings to
    /// their canonical slot.
    pub(crate) fn xas_descend(&self, xas: &mut XaState, node: NonNull<Node>) -> RawEntry {
        let n = node_ref(node);
        let mut offset = self.geo.offset(xas.index, n.shift());
        let mut entry = n.slot(offset);
        if entry.is_sibling() {
            offset = entry.sibling_offset();
            entry = n.slot(offset);
        }
        xas.walk = Walk::Node(node);
        xas.offset = offset;
        entry
    }

    /// Walk as far as the cursor's order allows. May return a marker.
    pub(crate) fn xas_load(&self, xas: &mut XaState) -> RawEntry {
        let (shift, _) = self.geo.split_order(xas.order);
        let mut entry = self.xas_start(xas);
        while let Some(node) = entry.as_node() {
            if shift > node_ref(node).shift() {
                break;
            }
            entry = self.xas_descend(xas, node);
        }
        entry
    }

    /// Load with restarts; never returns a marker.
    pub(crate) fn load_raw(&self, xas: &mut XaState) -> RawEntry {
        loop {
            let entry = self.xas_load(xas);
            if entry.is_retry() {
                counter!("xarray_read_retries_total").increment(1);
                xas.walk = Walk::Restart;
                continue;
            }
            return entry;
        }
    }

    fn tag_at(&self, xas: &XaState, tag: usize) -> bool {
        match xas.walk {
            Walk::Head => self.head_tagged(tag),
            Walk::Node(node) => node_ref(node).get_tag(xas.offset, tag),
            _ => false,
        }
    }

    /// Follow the tag summary bits down to the entry at `index`.
    pub(crate) fn get_tag_raw(&self, index: usize, tag: usize) -> bool {
        if tag >= self.tag_count() {
            return false;
        }
        let mut xas = XaState::new(index);
        'walk: loop {
            xas.walk = Walk::Restart;
            let mut entry = self.xas_start(&mut xas);
            loop {
                if !self.tag_at(&xas, tag) {
                    return false;
                }
                if entry.is_retry() {
                    counter!("xarray_read_retries_total").increment(1);
                    continue 'walk;
                }
                match entry.as_node() {
                    Some(node) => entry = self.xas_descend(&mut xas, node),
                    None => return entry.is_leaf(),
                }
            }
        }
    }

    fn matches(&self, node: &Node, offset: usize, filter: Filter) -> bool {
        match filter {
            Filter::Present => true,
            Filter::Tagged(tag) => node.get_tag(offset, tag),
        }
    }

    /// Last index covered by the entry whose canonical slot is `canon` in a
    /// node at `shift`, the node covering `index`.
    fn entry_last(&self, node: &Node, canon: usize, index: usize) -> usize {
        let shift = node.shift();
        let mut sibs = 0;
        let sibling = RawEntry::sibling(canon);
        while canon + sibs + 1 < self.geo.size && node.slot(canon + sibs + 1) == sibling {
            sibs += 1;
        }
        let start = self.geo.slot_index(index, shift, canon);
        let span = ((sibs + 1) << shift).wrapping_sub(1);
        start.saturating_add(span)
    }

    /// Smallest ancestor of `node` (itself included) whose span holds both
    /// `reference` and `index`. `reference` must lie inside `node`'s span.
    fn climb(&self, node: NonNull<Node>, reference: usize, index: usize) -> Option<NonNull<Node>> {
        let cs = self.geo.chunk_shift;
        let mut node = node;
        loop {
            let n = node_ref(node);
            let span = n.shift() + cs;
            if span >= usize::BITS || index >> span == reference >> span {
                return Some(node);
            }
            node = n.parent()?;
        }
    }

    /// First entry in `[start, max]` passing `filter`.
    ///
    /// With `skip_partial`, an entry that begins before `start` is passed
    /// over; otherwise it is reported at `start`.
    pub(crate) fn find_raw(
        &self,
        start: usize,
        max: usize,
        filter: Filter,
        skip_partial: bool,
    ) -> Option<Found> {
        self.find_from(None, start, max, filter, skip_partial)
    }

    /// [`XArray::find_raw`] resuming from `hint`, a node seen under the
    /// caller's pin and an index inside its span.
    ///
    /// When a node has nothing left the scan moves to the ancestor covering
    /// the next index. Any marker sends it back to the head.
    pub(crate) fn find_from(
        &self,
        hint: Option<(NonNull<Node>, usize)>,
        start: usize,
        max: usize,
        filter: Filter,
        skip_partial: bool,
    ) -> Option<Found> {
        if let Filter::Tagged(tag) = filter {
            if tag >= self.tag_count() {
                return None;
            }
        }
        let geo = self.geo;
        let mut index = start;
        let mut resume = hint;
        'walk: loop {
            if index > max {
                return None;
            }
            let resumed = resume
                .take()
                .and_then(|(node, reference)| self.climb(node, reference, index));
            let mut node = match resumed {
                Some(node) => node,
                None => {
                    let head = self.head();
                    let node = match head.as_node() {
                        Some(node) => node,
                        None => {
                            let wanted = match filter {
                                Filter::Present => true,
                                Filter::Tagged(tag) => self.head_tagged(tag),
                            };
                            if index == 0 && head.is_leaf() && wanted {
                                return Some(Found { index: 0, last: 0, entry: head, node: None });
                            }
                            if head.is_retry() {
                                continue 'walk;
                            }
                            return None;
                        }
                    };
                    if index > self.max_index(head) {
                        return None;
                    }
                    if let Filter::Tagged(tag) = filter {
                        if !self.head_tagged(tag) {
                            return None;
                        }
                    }
                    node
                }
            };
            loop {
                let n = node_ref(node);
                let shift = n.shift();
                let offset = geo.offset(index, shift);

                let first = n.slot(offset);
                if first.is_retry() {
                    counter!("xarray_read_retries_total").increment(1);
                    continue 'walk;
                }
                if first.is_sibling() {
                    // An entry that started in an earlier slot covers `index`.
                    let canon = first.sibling_offset();
                    let entry = n.slot(canon);
                    if entry.is_retry() {
                        counter!("xarray_read_retries_total").increment(1);
                        continue 'walk;
                    }
                    // A concurrent split may shorten the run under us.
                    let last = self.entry_last(n, canon, index).max(index);
                    if !skip_partial && entry.is_leaf() && self.matches(n, canon, filter) {
                        return Some(Found { index, last, entry, node: Some(node) });
                    }
                    let Some(next) = last.checked_add(1) else {
                        return None;
                    };
                    resume = Some((node, index));
                    index = next;
                    continue 'walk;
                }

                let mut scan = offset;
                let mut hit = None;
                while scan < geo.size {
                    let candidate = match filter {
                        Filter::Present => scan,
                        Filter::Tagged(tag) => {
                            let bits = n.tag_bits(tag) & (u64::MAX << scan);
                            if bits == 0 {
                                break;
                            }
                            bits.trailing_zeros() as usize
                        }
                    };
                    if candidate >= geo.size {
                        break;
                    }
                    let entry = n.slot(candidate);
                    if entry.is_retry() {
                        counter!("xarray_read_retries_total").increment(1);
                        continue 'walk;
                    }
                    if entry.is_empty() || entry.is_sibling() {
                        scan = candidate + 1;
                        continue;
                    }
                    hit = Some((candidate, entry));
                    break;
                }

                let Some((slot, entry)) = hit else {
                    // Nothing left in this node.
                    let span = shift + geo.chunk_shift;
                    if span >= usize::BITS || index >> span == usize::MAX >> span {
                        return None;
                    }
                    let next = ((index >> span) + 1) << span;
                    trace!("[FIND] node exhausted, resuming at {next:#x}");
                    resume = Some((node, index));
                    index = next;
                    continue 'walk;
                };

                let slot_start = geo.slot_index(index, shift, slot);
                let at = if slot == offset { index } else { slot_start };
                if at > max {
                    return None;
                }
                if let Some(child) = entry.as_node() {
                    index = at;
                    node = child;
                    continue;
                }
                let last = self.entry_last(n, slot, index).max(at);
                if skip_partial && slot_start < at {
                    let Some(next) = last.checked_add(1) else {
                        return None;
                    };
                    resume = Some((node, at));
                    index = next;
                    continue 'walk;
                }
                return Some(Found { index: at, last, entry, node: Some(node) });
            }
        }
    }

    /// Move a cursor that was on `from` to `xas.index`, reusing the node it
    /// stands on when the two indices share it or an ancestor.
    fn xas_step(&self, xas: &mut XaState, from: usize) -> RawEntry {
        let start = match xas.walk {
            Walk::Node(node) if xas.order == 0 => self.climb(node, from, xas.index),
            _ => None,
        };
        let Some(node) = start else {
            xas.walk = Walk::Restart;
            return self.load_raw(xas);
        };
        let mut entry = self.xas_descend(xas, node);
        while let Some(child) = entry.as_node() {
            entry = self.xas_descend(xas, child);
        }
        if entry.is_retry() {
            counter!("xarray_read_retries_total").increment(1);
            xas.walk = Walk::Restart;
            return self.load_raw(xas);
        }
        entry
    }

    /// Move the cursor to the next index and load it. Stepping past the top
    /// of the index space leaves the cursor off the end; stepping again
    /// wraps to 0.
    pub(crate) fn xas_next(&self, xas: &mut XaState) -> RawEntry {
        if xas.is_error() {
            return RawEntry::EMPTY;
        }
        let from = xas.index;
        if from == usize::MAX {
            if xas.walk != Walk::End {
                xas.walk = Walk::End;
                return RawEntry::EMPTY;
            }
            xas.index = 0;
            xas.walk = Walk::Restart;
            return self.load_raw(xas);
        }
        xas.index = from + 1;
        self.xas_step(xas, from)
    }

    /// Mirror of [`XArray::xas_next`].
    pub(crate) fn xas_prev(&self, xas: &mut XaState) -> RawEntry {
        if xas.is_error() {
            return RawEntry::EMPTY;
        }
        let from = xas.index;
        if from == 0 {
            if xas.walk != Walk::End {
                xas.walk = Walk::End;
                return RawEntry::EMPTY;
            }
            xas.index = usize::MAX;
            xas.walk = Walk::Restart;
            return self.load_raw(xas);
        }
        xas.index = from - 1;
        self.xas_step(xas, from)
    }
}
