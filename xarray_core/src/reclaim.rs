//! Deferred reclamation.
//!
//! Readers pin the current epoch for the length of one traversal. The writer
//! unlinks a node, overwrites its slots with a marker so stale readers
//! restart, and hands the memory to the collector; it is freed once every
//! reader pinned at unlink time has moved on. Strong references held by
//! replaced slots are released the same way.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_epoch::{self as epoch, Guard};
use log::trace;
use metrics::{counter, gauge};

use crate::entry::RawEntry;
use crate::types::Node;

/// Pin the calling thread.
#[inline]
pub(crate) fn pin() -> Guard {
    epoch::pin()
}

static NEXT_SECTION: AtomicU64 = AtomicU64::new(1);

/// A fresh id for a read section or writer lock. Cursor positions are only
/// reused under the id that produced them.
pub(crate) fn section_token() -> u64 {
    NEXT_SECTION.fetch_add(1, Ordering::Relaxed)
}

/// Mark every slot of an unlinked node so readers still inside it re-walk.
pub(crate) fn poison(node: &Node, size: usize) {
    for offset in 0..size {
        node.set_slot(offset, RawEntry::DELETED);
    }
}

/// Hand an unlinked node to the collector.
///
/// # Safety
/// `node` came from `Box::leak`, is no longer reachable from the head and is
/// not scheduled twice.
pub(crate) unsafe fn defer_free_node(guard: &Guard, node: NonNull<Node>) {
    let addr = node.as_ptr() as usize;
    trace!("[RECLAIM] node {addr:#x} queued");
    guard.defer_unchecked(move || drop(Box::from_raw(addr as *mut Node)));
    counter!("xarray_node_frees_total").increment(1);
    gauge!("xarray_live_nodes").decrement(1.0);
}

/// Release the reference a replaced slot held, once readers are done.
///
/// # Safety
/// `entry` was read from a slot that no longer holds it, and its reference
/// is released exactly once.
pub(crate) unsafe fn defer_release<T: Send + Sync + 'static>(guard: &Guard, entry: RawEntry) {
    if !entry.is_pointer() {
        return;
    }
    let bits = entry.bits();
    guard.defer_unchecked(move || RawEntry::from_bits(bits).release::<T>());
}

/// Free a node immediately. Only for exclusive access (drop).
///
/// # Safety
/// Same as [`defer_free_node`], and no reader can reach the node.
pub(crate) unsafe fn free_node_now(node: NonNull<Node>) {
    drop(Box::from_raw(node.as_ptr()));
    counter!("xarray_node_frees_total").increment(1);
    gauge!("xarray_live_nodes").decrement(1.0);
}
