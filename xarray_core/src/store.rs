//! Writer-side tree surgery.
//!
//! Every function here runs with the writer lock held and an epoch pin.
//! Allocation is settled before the first slot is touched: the walk counts
//! the nodes it will need and takes them from the cursor's reserve, so a
//! failed walk leaves the tree exactly as it found it.

use std::ptr::{self, NonNull};
use std::sync::atomic::Ordering;

use crossbeam_epoch::Guard;
use log::{debug, trace};
use metrics::{counter, gauge};

use crate::config::AllocMode;
use crate::entry::RawEntry;
use crate::errors::Error;
use crate::helpers::{full_bitmap, range_last};
use crate::observer::{notify_freed, notify_update, UpdateObserver};
use crate::reclaim::{defer_free_node, defer_release, poison};
use crate::state::{Walk, XaState};
use crate::types::{Node, XArray};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Create {
    /// Allocate whatever is missing on the way down.
    Fill,
    /// Stop at the first empty slot.
    Existing,
}

// SAFETY: the writer lock is held, so nodes reachable from the head stay
// allocated for the duration of the call.
#[inline(always)]
fn node_ref<'g>(node: NonNull<Node>) -> &'g Node {
    unsafe { &*node.as_ptr() }
}

impl<T: Send + Sync + 'static> XArray<T> {
    fn observer(&self) -> Option<&dyn UpdateObserver> {
        self.observer.as_deref()
    }

    fn adjust_counts(&self, node: &Node, count: isize, values: isize) {
        if count == 0 && values == 0 {
            return;
        }
        let was = node.is_value_only();
        let c = node.count() as isize + count;
        let v = node.values() as isize + values;
        debug_assert!(c >= 0 && c <= self.geo.size as isize, "slot count {c} out of range");
        debug_assert!(v >= 0 && v <= c, "value count {v} exceeds slot count {c}");
        node.count.store(c as u8, Ordering::Relaxed);
        node.nr_values.store(v as u8, Ordering::Relaxed);
        notify_update(self.observer(), node, was);
    }

    fn attach(&self, child: NonNull<Node>, parent: Option<NonNull<Node>>, offset: usize) {
        let c = node_ref(child);
        c.offset.store(offset as u8, Ordering::Relaxed);
        c.parent
            .store(parent.map_or(ptr::null_mut(), NonNull::as_ptr), Ordering::Release);
    }

    /// Top the cursor's reserve up to `need` nodes.
    fn reserve_nodes(&self, xas: &mut XaState, need: usize) -> bool {
        xas.want = need;
        while xas.spare.len() < need {
            let node = match self.config.get_alloc_mode() {
                AllocMode::Direct => Node::try_alloc(0),
                AllocMode::Deferred => None,
            };
            match node {
                Some(node) => xas.spare.push(node),
                None => {
                    debug!(
                        "[ALLOC] index {:#x} needs {} nodes, {} in reserve",
                        xas.index,
                        need,
                        xas.spare.len()
                    );
                    xas.set_error(Error::OutOfMemory);
                    return false;
                }
            }
        }
        true
    }

    fn alloc_node(&self, xas: &mut XaState, shift: u32) -> Option<NonNull<Node>> {
        let Some(mut node) = xas.spare.pop() else {
            xas.set_error(Error::OutOfMemory);
            return None;
        };
        node.shift = shift as u8;
        counter!("xarray_node_allocs_total").increment(1);
        gauge!("xarray_live_nodes").increment(1.0);
        Some(NonNull::from(Box::leak(node)))
    }

    /// Highest index the cursor's range touches, plus one when the range
    /// starts at 0 so that a range ending exactly on a node boundary still
    /// gets a node above it.
    fn xas_max(&self, xas: &XaState) -> usize {
        let mut max = xas.index;
        if xas.order > 0 {
            let mask = (1usize << xas.order) - 1;
            max |= mask;
            if mask == max {
                max += 1;
            }
        }
        max
    }

    /// Nodes a walk in `mode` will allocate, counted without touching the
    /// tree.
    fn nodes_needed(&self, xas: &XaState, mode: Create) -> usize {
        let geo = self.geo;
        let cs = geo.chunk_shift;
        let (order, _) = geo.split_order(xas.order);
        let index = xas.index;
        let levels = |from: u32| if from > order { ((from - order) / cs) as usize } else { 0 };

        let head = self.head();
        let max = self.xas_max(xas);
        if head.is_empty() {
            if mode == Create::Existing || max == 0 {
                return 0;
            }
            let mut shift = 0;
            while (max >> shift) >= geo.size {
                shift += cs;
            }
            return levels(shift + cs);
        }

        let real_top = head.as_node().map_or(0, |n| node_ref(n).shift() + cs);
        let mut top = real_top;
        let mut need = 0;
        match mode {
            Create::Fill => {
                let mut reach = self.max_index(head);
                while max > reach {
                    need += 1;
                    reach = geo.node_max_index(top);
                    top += cs;
                }
            }
            Create::Existing => {
                if index > self.max_index(head) {
                    return 0;
                }
            }
        }

        let mut shift = top;
        let mut entry = head;
        let mut fresh = need > 0;
        while shift > order {
            shift -= cs;
            if fresh {
                // A node added on top: slot 0 leads back to the old head.
                if geo.offset(index, shift) != 0 {
                    return need + levels(shift);
                }
                if shift == real_top {
                    fresh = false;
                }
                continue;
            }
            if entry.is_empty() {
                return match mode {
                    Create::Fill => need + levels(shift) + 1,
                    Create::Existing => need,
                };
            }
            let Some(node) = entry.as_node() else {
                // A leaf covering more than the target is pushed down one
                // level at a time.
                return need + levels(shift) + 1;
            };
            let n = node_ref(node);
            let mut offset = geo.offset(index, n.shift());
            entry = n.slot(offset);
            if entry.is_sibling() {
                offset = entry.sibling_offset();
                entry = n.slot(offset);
            }
        }
        need
    }

    /// Grow the tree upward until the head covers the cursor's range.
    /// Returns the shift one level above the new top node.
    fn xas_expand(&self, xas: &mut XaState, head: RawEntry) -> Option<u32> {
        let geo = self.geo;
        let cs = geo.chunk_shift;
        let max = self.xas_max(xas);
        if head.is_empty() {
            if max == 0 {
                return Some(0);
            }
            let mut shift = 0;
            while (max >> shift) >= geo.size {
                shift += cs;
            }
            return Some(shift + cs);
        }

        let mut head = head;
        let mut shift = head.as_node().map_or(0, |n| node_ref(n).shift() + cs);
        xas.walk = Walk::Head;
        while max > self.max_index(head) {
            let node = self.alloc_node(xas, shift)?;
            let n = node_ref(node);
            n.set_slot(0, head);
            for tag in 0..self.tag_count() {
                if self.head_tagged(tag) {
                    n.set_tag(0, tag);
                }
            }
            self.attach(node, None, 0);
            if let Some(old) = head.as_node() {
                self.attach(old, Some(node), 0);
            }
            self.adjust_counts(n, 1, head.is_value() as isize);
            head = RawEntry::node(node);
            self.set_head(head);
            trace!("[EXPAND] new top node at shift {shift}");
            shift += cs;
        }
        Some(shift)
    }

    /// Turn every sibling of the entry at `canon` into a full copy of it,
    /// tags included. Counts do not change.
    fn split_siblings(&self, node: &Node, canon: usize) {
        let entry = node.slot(canon);
        let sibling = RawEntry::sibling(canon);
        let mut offset = canon + 1;
        while offset < self.geo.size && node.slot(offset) == sibling {
            // SAFETY: the canonical slot keeps the entry alive while the
            // writer lock is held.
            unsafe { entry.acquire_copy::<T>() };
            for tag in 0..self.tag_count() {
                if node.get_tag(canon, tag) {
                    node.set_tag(offset, tag);
                }
            }
            node.set_slot(offset, entry);
            offset += 1;
        }
    }

    /// Replace the leaf covering the cursor's slot in `parent` with a node
    /// at `shift` whose slots all hold copies of it.
    fn push_down(&self, xas: &mut XaState, parent: NonNull<Node>, shift: u32) -> Option<NonNull<Node>> {
        let size = self.geo.size;
        let p = node_ref(parent);
        self.split_siblings(p, xas.offset);
        let offset = self.geo.offset(xas.index, p.shift());
        let entry = p.slot(offset);

        let child = self.alloc_node(xas, shift)?;
        let c = node_ref(child);
        for slot in 0..size {
            if slot > 0 {
                // SAFETY: as in `split_siblings`. Slot 0 inherits the
                // parent slot's reference.
                unsafe { entry.acquire_copy::<T>() };
            }
            c.set_slot(slot, entry);
        }
        c.count.store(size as u8, Ordering::Relaxed);
        if entry.is_value() {
            c.nr_values.store(size as u8, Ordering::Relaxed);
        }
        for tag in 0..self.tag_count() {
            if p.get_tag(offset, tag) {
                c.tags[tag].store(full_bitmap(size), Ordering::Relaxed);
            }
        }
        self.attach(child, Some(parent), offset);
        notify_update(self.observer(), c, false);

        p.set_slot(offset, RawEntry::node(child));
        if entry.is_value() {
            self.adjust_counts(p, 0, -1);
        }
        xas.offset = offset;
        debug!(
            "[SPLIT] entry at {:#x} pushed down to shift {shift}",
            self.geo.slot_index(xas.index, p.shift(), offset)
        );
        Some(child)
    }

    /// Walk to the cursor's target, creating nodes in `Fill` mode. Leaves
    /// the cursor on the target slot and returns the canonical entry there.
    /// Any entry straddling the target range's edges is split first.
    pub(crate) fn xas_create(&self, xas: &mut XaState, mode: Create) -> RawEntry {
        if xas.is_error() {
            return RawEntry::EMPTY;
        }
        let geo = self.geo;
        let cs = geo.chunk_shift;
        let (order, sibs) = geo.split_order(xas.order);

        let need = self.nodes_needed(xas, mode);
        if !self.reserve_nodes(xas, need) {
            return RawEntry::EMPTY;
        }

        let head = self.head();
        let mut shift = match mode {
            Create::Fill => match self.xas_expand(xas, head) {
                Some(shift) => shift,
                None => return RawEntry::EMPTY,
            },
            Create::Existing => {
                let inside = match head.as_node() {
                    Some(_) => xas.index <= self.max_index(head),
                    None => xas.index == 0 && !head.is_empty(),
                };
                if !inside {
                    xas.walk = Walk::Bounds;
                    return RawEntry::EMPTY;
                }
                head.as_node().map_or(0, |n| node_ref(n).shift() + cs)
            }
        };

        xas.walk = Walk::Head;
        let mut entry = self.head();
        let mut node: Option<NonNull<Node>> = None;
        while shift > order {
            shift -= cs;
            let next = if entry.is_empty() {
                if mode == Create::Existing {
                    return RawEntry::EMPTY;
                }
                let Some(child) = self.alloc_node(xas, shift) else {
                    return RawEntry::EMPTY;
                };
                self.attach(child, node, xas.offset);
                match node {
                    Some(parent) => {
                        let p = node_ref(parent);
                        p.set_slot(xas.offset, RawEntry::node(child));
                        self.adjust_counts(p, 1, 0);
                    }
                    None => self.set_head(RawEntry::node(child)),
                }
                child
            } else if let Some(child) = entry.as_node() {
                child
            } else {
                // A head leaf only ever covers index 0, which never needs a
                // node below it.
                let Some(parent) = node else {
                    return RawEntry::EMPTY;
                };
                match self.push_down(xas, parent, shift) {
                    Some(child) => child,
                    None => return RawEntry::EMPTY,
                }
            };
            node = Some(next);
            entry = self.xas_descend(xas, next);
        }

        if let Some(node) = node {
            let n = node_ref(node);
            let offset = geo.offset(xas.index, n.shift());
            let here = n.slot(offset);
            if here.is_sibling() {
                self.split_siblings(n, here.sibling_offset());
            }
            let end = offset + sibs + 1;
            if end < geo.size {
                let after = n.slot(end);
                if after.is_sibling() {
                    self.split_siblings(n, after.sibling_offset());
                }
            }
            xas.offset = offset;
            entry = n.slot(offset);
        }
        entry
    }

    /// The leaf at `index` below `node`.
    fn subtree_entry(&self, node: NonNull<Node>, index: usize) -> RawEntry {
        let mut entry = RawEntry::node(node);
        while let Some(node) = entry.as_node() {
            let n = node_ref(node);
            entry = n.slot(self.geo.offset(index, n.shift()));
            if entry.is_sibling() {
                entry = n.slot(entry.sibling_offset());
            }
        }
        entry
    }

    /// Store `entry` over the cursor's whole range.
    ///
    /// Takes ownership of `entry`'s reference on success. Returns the entry
    /// that was at the cursor's index (still owned by the caller's pin, not
    /// yet released), or `None` with the error recorded in the cursor.
    pub(crate) fn xas_store(&self, xas: &mut XaState, entry: RawEntry, guard: &Guard) -> Option<RawEntry> {
        let geo = self.geo;
        let (order, mut sibs) = geo.split_order(xas.order);
        let mode = if entry.is_empty() { Create::Existing } else { Create::Fill };
        let first = self.xas_create(xas, mode);
        if xas.is_error() {
            return None;
        }
        let node = match xas.walk {
            Walk::Node(node) => Some(node),
            Walk::Head => None,
            _ => return Some(RawEntry::EMPTY),
        };
        if let Some(n) = node {
            if order < node_ref(n).shift() {
                sibs = 0;
            }
        }
        counter!("xarray_stores_total").increment(1);

        let old = match first.as_node() {
            Some(sub) => self.subtree_entry(sub, xas.index),
            None => first,
        };
        if first == entry && sibs == 0 {
            // SAFETY: the slot already holds its own reference to this
            // pointer; the caller's one was never published.
            unsafe { entry.release::<T>() };
            if let Some(n) = node {
                if node_ref(n).count() == 0 {
                    self.delete_node(xas, n, guard);
                }
            }
            return Some(old);
        }

        let value = entry.is_value();
        let mut offset = xas.offset;
        let max = offset + sibs;
        let mut count: isize = 0;
        let mut values: isize = 0;
        let mut next = first;
        let mut canon = first;
        let mut cur = entry;
        if let Some(n) = node {
            if sibs > 0 {
                self.squash_tags(node_ref(n), offset, sibs);
            }
        }
        if entry.is_empty() {
            self.init_tags(xas);
        }

        loop {
            match node {
                Some(n) => node_ref(n).set_slot(offset, cur),
                None => self.set_head(cur),
            }
            if let Some(sub) = next.as_node() {
                self.free_subtree(sub, guard);
            } else {
                // SAFETY: `next` was just overwritten and is released once.
                unsafe { defer_release::<T>(guard, next) };
            }
            let Some(n) = node else { break };
            let n = node_ref(n);

            count += next.is_empty() as isize - cur.is_empty() as isize;
            values += (!canon.is_value()) as isize - (!value) as isize;
            if !entry.is_empty() {
                if offset == max {
                    break;
                }
                if !cur.is_sibling() {
                    cur = RawEntry::sibling(xas.offset);
                }
            } else if offset == geo.mask {
                break;
            }
            offset += 1;
            next = n.slot(offset);
            if !next.is_sibling() {
                if entry.is_empty() && offset > max {
                    break;
                }
                canon = next;
            }
        }

        if let Some(n) = node {
            self.update_node(xas, n, count, values, guard);
        }
        Some(old)
    }

    fn update_node(&self, xas: &mut XaState, node: NonNull<Node>, count: isize, values: isize, guard: &Guard) {
        if count == 0 && values == 0 {
            return;
        }
        self.adjust_counts(node_ref(node), count, values);
        if count < 0 {
            self.delete_node(xas, node, guard);
        }
    }

    /// Mark an unlinked node dead and queue it for freeing.
    fn retire(&self, node: NonNull<Node>, guard: &Guard) {
        let n = node_ref(node);
        let was = n.is_value_only();
        poison(n, self.geo.size);
        n.count.store(0, Ordering::Relaxed);
        n.nr_values.store(0, Ordering::Relaxed);
        notify_freed(self.observer(), n, was);
        // SAFETY: the caller unlinked the node before retiring it.
        unsafe { defer_free_node(guard, node) };
    }

    /// Remove `node` and any ancestors left empty, then shrink the top.
    fn delete_node(&self, xas: &mut XaState, node: NonNull<Node>, guard: &Guard) {
        let mut node = node;
        loop {
            let n = node_ref(node);
            if n.count() > 0 {
                break;
            }
            let parent = n.parent();
            let offset = n.offset_in_parent();
            match parent {
                Some(p) => node_ref(p).set_slot(offset, RawEntry::EMPTY),
                None => self.set_head(RawEntry::EMPTY),
            }
            self.retire(node, guard);
            let Some(p) = parent else {
                xas.walk = Walk::Bounds;
                return;
            };
            xas.walk = Walk::Node(p);
            xas.offset = offset;
            self.adjust_counts(node_ref(p), -1, 0);
            node = p;
        }
        if node_ref(node).parent().is_none() {
            self.shrink(xas, node, guard);
        }
    }

    /// Collapse the top while it holds only slot 0 and doing so keeps every
    /// index in place.
    fn shrink(&self, xas: &mut XaState, node: NonNull<Node>, guard: &Guard) {
        let mut node = node;
        loop {
            let n = node_ref(node);
            if n.count() != 1 {
                break;
            }
            let entry = n.slot(0);
            if entry.is_empty() {
                break;
            }
            if !entry.is_node() && n.shift() > 0 {
                break;
            }
            xas.walk = Walk::Bounds;
            self.set_head(entry);
            if let Some(child) = entry.as_node() {
                self.attach(child, None, 0);
            }
            // Readers parked on the old top must re-walk from the new head.
            poison(n, self.geo.size);
            let was = n.is_value_only();
            n.count.store(0, Ordering::Relaxed);
            n.nr_values.store(0, Ordering::Relaxed);
            notify_freed(self.observer(), n, was);
            // SAFETY: the head no longer points at `node`.
            unsafe { defer_free_node(guard, node) };
            trace!("[SHRINK] top node at shift {} removed", n.shift());
            match entry.as_node() {
                Some(child) => node = child,
                None => break,
            }
        }
    }

    /// Tear down an unlinked subtree.
    fn free_subtree(&self, top: NonNull<Node>, guard: &Guard) {
        let mut stack = vec![top];
        while let Some(node) = stack.pop() {
            let n = node_ref(node);
            for offset in 0..self.geo.size {
                let entry = n.slot(offset);
                if let Some(child) = entry.as_node() {
                    stack.push(child);
                } else {
                    // SAFETY: the subtree is unreachable; each slot's
                    // reference is released once.
                    unsafe { defer_release::<T>(guard, entry) };
                }
            }
            self.retire(node, guard);
        }
    }

    /// Fold the tags of the slots a multi-slot store is about to cover into
    /// its canonical slot.
    fn squash_tags(&self, node: &Node, offset: usize, sibs: usize) {
        let rest = ((1u64 << sibs) - 1) << (offset + 1);
        for tag in 0..self.tag_count() {
            if node.tag_bits(tag) & rest != 0 {
                node.tags[tag].fetch_and(!rest, Ordering::Release);
                node.set_tag(offset, tag);
            }
        }
    }

    fn init_tags(&self, xas: &XaState) {
        for tag in 0..self.tag_count() {
            self.xas_clear_tag(xas, tag);
        }
    }

    /// Set `tag` on the cursor's slot and on every summary bit above it.
    pub(crate) fn xas_set_tag(&self, xas: &XaState, tag: usize) {
        match xas.walk {
            Walk::Node(start) => {
                let mut node = node_ref(start);
                let mut offset = xas.offset;
                loop {
                    if node.set_tag(offset, tag) {
                        return;
                    }
                    match node.parent() {
                        Some(parent) => {
                            offset = node.offset_in_parent();
                            node = node_ref(parent);
                        }
                        None => break,
                    }
                }
            }
            Walk::Head => {}
            _ => return,
        }
        self.set_head_tag(tag);
    }

    /// Clear `tag` on the cursor's slot, and upward while nothing else in
    /// the node carries it.
    pub(crate) fn xas_clear_tag(&self, xas: &XaState, tag: usize) {
        match xas.walk {
            Walk::Node(start) => {
                let mut node = node_ref(start);
                let mut offset = xas.offset;
                loop {
                    if !node.clear_tag(offset, tag) || node.any_tag(tag) {
                        return;
                    }
                    match node.parent() {
                        Some(parent) => {
                            offset = node.offset_in_parent();
                            node = node_ref(parent);
                        }
                        None => break,
                    }
                }
            }
            Walk::Head => {}
            _ => return,
        }
        self.clear_head_tag(tag);
    }

    /// Build the nodes for every slot in the cursor's range without storing
    /// anything. Nodes left empty are reclaimed by the first store or erase
    /// that lands in them.
    pub(crate) fn xas_create_range(&self, xas: &mut XaState) {
        let (first, order) = (xas.index, xas.order);
        let Some(last) = range_last(first, order) else {
            xas.set_error(Error::IndexOutOfRange);
            return;
        };
        let mask = self.geo.mask;
        xas.order = 0;
        let mut chunk = first;
        loop {
            xas.index = (chunk | mask).min(last);
            xas.walk = Walk::Restart;
            self.xas_create(xas, Create::Fill);
            if xas.is_error() {
                break;
            }
            match (chunk | mask).checked_add(1) {
                Some(next) if next <= last => chunk = next,
                _ => break,
            }
        }
        xas.index = first;
        xas.order = order;
        if !xas.is_error() {
            xas.walk = Walk::Restart;
        }
    }
}
