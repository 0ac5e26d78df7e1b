//! Data structures for the XArray

use std::alloc::{alloc_zeroed, Layout};
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::XArrayConfig;
use crate::constants::*;
use crate::entry::RawEntry;
use crate::helpers::Geometry;
use crate::observer::UpdateObserver;

/// One trie level, aligned to a cache line.
///
/// `shift` is written before the node is published and never changes.
/// Everything else is atomic so readers can look at a node while the single
/// writer updates it.
#[repr(C, align(64))]
pub(crate) struct Node {
    pub shift: u8,
    pub offset: AtomicU8,      // slot in the parent
    pub count: AtomicU8,       // non-empty slots, siblings included
    pub nr_values: AtomicU8,   // slots covered by value entries
    pub parent: AtomicPtr<Node>, // null for the node under the head
    pub link: AtomicUsize,     // owned by the update observer
    pub tags: [AtomicU64; MAX_TAGS],
    pub slots: [AtomicUsize; MAX_CHUNK_SIZE],
}

const _: () = assert!(std::mem::align_of::<Node>() == CACHE_LINE);

impl Node {
    /// Allocate a zeroed node. Returns `None` when the allocator is out of
    /// memory instead of aborting.
    pub fn try_alloc(shift: u32) -> Option<Box<Node>> {
        let layout = Layout::new::<Node>();
        // SAFETY: all-zero bytes are a valid `Node` (atomics at 0, null
        // parent); the layout has non-zero size.
        unsafe {
            let ptr = alloc_zeroed(layout) as *mut Node;
            if ptr.is_null() {
                return None;
            }
            let mut node = Box::from_raw(ptr);
            node.shift = shift as u8;
            Some(node)
        }
    }

    #[inline(always)]
    pub fn shift(&self) -> u32 {
        self.shift as u32
    }

    #[inline(always)]
    pub fn slot(&self, offset: usize) -> RawEntry {
        RawEntry::from_bits(self.slots[offset].load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn set_slot(&self, offset: usize, entry: RawEntry) {
        self.slots[offset].store(entry.bits(), Ordering::Release);
    }

    #[inline(always)]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed) as usize
    }

    #[inline(always)]
    pub fn values(&self) -> usize {
        self.nr_values.load(Ordering::Relaxed) as usize
    }

    #[inline(always)]
    pub fn parent(&self) -> Option<NonNull<Node>> {
        NonNull::new(self.parent.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn offset_in_parent(&self) -> usize {
        self.offset.load(Ordering::Relaxed) as usize
    }

    #[inline(always)]
    pub fn tag_bits(&self, tag: usize) -> u64 {
        self.tags[tag].load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn get_tag(&self, offset: usize, tag: usize) -> bool {
        self.tag_bits(tag) & (1u64 << offset) != 0
    }

    /// Returns true if the bit was already set.
    #[inline(always)]
    pub fn set_tag(&self, offset: usize, tag: usize) -> bool {
        let bit = 1u64 << offset;
        self.tags[tag].fetch_or(bit, Ordering::Release) & bit != 0
    }

    /// Returns true if the bit was set.
    #[inline(always)]
    pub fn clear_tag(&self, offset: usize, tag: usize) -> bool {
        let bit = 1u64 << offset;
        self.tags[tag].fetch_and(!bit, Ordering::Release) & bit != 0
    }

    #[inline(always)]
    pub fn any_tag(&self, tag: usize) -> bool {
        self.tag_bits(tag) != 0
    }

    /// Every non-empty slot holds a value entry.
    #[inline]
    pub fn is_value_only(&self) -> bool {
        let count = self.count();
        count > 0 && count == self.values()
    }
}

/// Read-only window onto a node, handed to an [`UpdateObserver`].
pub struct NodeView<'a> {
    pub(crate) node: &'a Node,
}

impl<'a> NodeView<'a> {
    /// Stable for the node's lifetime; reused only after it is freed.
    pub fn id(&self) -> usize {
        self.node as *const Node as usize
    }

    pub fn shift(&self) -> u32 {
        self.node.shift()
    }

    /// Slot index in the parent; meaningless for the top node.
    pub fn offset(&self) -> usize {
        self.node.offset_in_parent()
    }

    pub fn is_top(&self) -> bool {
        self.node.parent().is_none()
    }

    pub fn count(&self) -> usize {
        self.node.count()
    }

    pub fn value_count(&self) -> usize {
        self.node.values()
    }

    /// A word the observer may use to thread the node into its own list.
    /// The container never reads or writes it.
    pub fn link(&self) -> &'a AtomicUsize {
        &self.node.link
    }
}

/// The container head.
pub struct XArray<T> {
    /// Either a direct entry for index 0 or the top node.
    pub(crate) head: AtomicUsize,
    /// One bit per tag: set when any entry carries it.
    pub(crate) tagged: AtomicU8,
    pub(crate) lock: Mutex<()>,
    pub(crate) geo: Geometry,
    pub(crate) config: XArrayConfig,
    pub(crate) observer: Option<Arc<dyn UpdateObserver>>,
    pub(crate) _marker: PhantomData<Arc<T>>,
}

// SAFETY: slots hold `Arc<T>` references and raw node pointers that are only
// freed through epoch reclamation; sharing is sound when `Arc<T>` is.
unsafe impl<T: Send + Sync> Send for XArray<T> {}
unsafe impl<T: Send + Sync> Sync for XArray<T> {}

impl<T> XArray<T> {
    #[inline(always)]
    pub(crate) fn head(&self) -> RawEntry {
        RawEntry::from_bits(self.head.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub(crate) fn set_head(&self, entry: RawEntry) {
        self.head.store(entry.bits(), Ordering::Release);
    }

    #[inline(always)]
    pub(crate) fn head_tagged(&self, tag: usize) -> bool {
        self.tagged.load(Ordering::Acquire) & (1u8 << tag) != 0
    }

    #[inline(always)]
    pub(crate) fn set_head_tag(&self, tag: usize) {
        self.tagged.fetch_or(1u8 << tag, Ordering::Release);
    }

    #[inline(always)]
    pub(crate) fn clear_head_tag(&self, tag: usize) {
        self.tagged.fetch_and(!(1u8 << tag), Ordering::Release);
    }

    #[inline(always)]
    pub(crate) fn tag_count(&self) -> usize {
        self.config.get_tag_count() as usize
    }
}
