pub mod config;
pub mod constants;
pub mod dump;
pub mod entry;
pub mod errors;
pub mod handle_registry;
pub mod helpers;
pub mod lock;
pub mod observer;
pub mod public_api;
pub mod read;
pub mod reclaim;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod walk;

pub use crate::config::{AllocMode, XArrayConfig};
pub use crate::entry::Entry;
pub use crate::errors::{Error, ErrorCode};
pub use crate::lock::XaLock;
pub use crate::observer::{NodeEvent, UpdateObserver, ValueNodeTracker};
pub use crate::read::{Iter, ReadSection};
pub use crate::state::{CursorState, XaState};
pub use crate::types::{NodeView, XArray};
pub use crate::walk::Filter;

use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, AtomicUsize};
use std::sync::Arc;

use log::{debug, warn};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::entry::RawEntry;
use crate::helpers::Geometry;
use crate::types::Node;

impl<T: Send + Sync + 'static> XArray<T> {
    // ---- logging bootstrapper -----------------------------------------------
    fn ensure_logging() {
        static INIT: OnceCell<()> = OnceCell::new();
        INIT.get_or_init(|| {
            // Fallback: simple env_logger with RFC-3339 ts off.
            let _ = env_logger::builder()
                .format_timestamp(None)
                .is_test(std::env::var("RUST_TEST_THREADS").is_ok())
                .try_init();
        });
    }

    /// An empty array with the default configuration.
    pub fn new() -> Self {
        Self::build(XArrayConfig::default(), None)
    }

    pub fn with_config(config: XArrayConfig) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self::build(config, None))
    }

    /// An empty array that reports node occupancy changes to `observer`.
    pub fn with_observer(config: XArrayConfig, observer: Arc<dyn UpdateObserver>) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self::build(config, Some(observer)))
    }

    fn build(config: XArrayConfig, observer: Option<Arc<dyn UpdateObserver>>) -> Self {
        Self::ensure_logging();
        debug!(
            "[INIT] chunk_shift={} tags={} alloc={:?}",
            config.get_chunk_shift(),
            config.get_tag_count(),
            config.get_alloc_mode()
        );
        XArray {
            head: AtomicUsize::new(0),
            tagged: AtomicU8::new(0),
            lock: Mutex::new(()),
            geo: Geometry::new(config.get_chunk_shift()),
            config,
            observer,
            _marker: PhantomData,
        }
    }

    pub fn config(&self) -> &XArrayConfig {
        &self.config
    }

    /// Run one logical write, dropping the lock to refill the cursor's
    /// reserve whenever the walk runs out of nodes.
    fn write<R>(&self, xas: &mut XaState, mut op: impl FnMut(&XaLock<'_, T>, &mut XaState) -> R) -> Result<R, Error> {
        loop {
            let out = {
                let lock = self.lock();
                op(&lock, xas)
            };
            match xas.error() {
                None => return Ok(out),
                Some(Error::OutOfMemory) => {
                    if xas.nomem() {
                        continue;
                    }
                    warn!("[NOMEM] write at {:#x} abandoned", xas.index());
                    return Err(Error::OutOfMemory);
                }
                Some(err) => return Err(err.clone()),
            }
        }
    }

    pub fn load(&self, index: usize) -> Option<Entry<T>> {
        self.read().load(index)
    }

    /// Store `entry` at `index`, or erase it with `None`. Returns the
    /// previous entry.
    pub fn store(&self, index: usize, entry: Option<Entry<T>>) -> Result<Option<Entry<T>>, Error> {
        let mut xas = XaState::new(index);
        self.write(&mut xas, |lock, xas| lock.store(xas, entry.clone()))
    }

    /// Store `entry` over `[index, index + 2^order)`, `index` aligned down.
    pub fn store_range(&self, index: usize, order: u32, entry: Option<Entry<T>>) -> Result<Option<Entry<T>>, Error> {
        let mut xas = XaState::with_order(index, order)?;
        self.write(&mut xas, |lock, xas| lock.store(xas, entry.clone()))
    }

    /// Empty `index`. Inside a multi-index entry only `index` is emptied;
    /// this may allocate to split the entry.
    pub fn erase(&self, index: usize) -> Result<Option<Entry<T>>, Error> {
        self.store(index, None)
    }

    pub fn insert(&self, index: usize, entry: Entry<T>) -> Result<(), Error> {
        self.insert_range(index, 0, entry)
    }

    /// Store over `[index, index + 2^order)` only if the whole range is empty.
    pub fn insert_range(&self, index: usize, order: u32, entry: Entry<T>) -> Result<(), Error> {
        let mut xas = XaState::with_order(index, order)?;
        self.write(&mut xas, |lock, xas| lock.insert(xas, entry.clone()))
    }

    /// Replace the entry at `index` with `new` if it is `old`. Returns the
    /// entry that was there; the swap happened iff it equals `old`.
    pub fn compare_and_swap(
        &self,
        index: usize,
        old: Option<&Entry<T>>,
        new: Option<Entry<T>>,
    ) -> Result<Option<Entry<T>>, Error> {
        let mut xas = XaState::new(index);
        self.write(&mut xas, |lock, xas| lock.compare_and_swap(xas, old, new.clone()))
    }

    /// See [`ReadSection::find`].
    pub fn find(&self, index: &mut usize, max: usize, filter: Filter) -> Option<Entry<T>> {
        self.read().find(index, max, filter)
    }

    /// See [`ReadSection::find_after`].
    pub fn find_after(&self, index: &mut usize, max: usize, filter: Filter) -> Option<Entry<T>> {
        self.read().find_after(index, max, filter)
    }

    pub fn iter(&self, first: usize, last: usize) -> Iter<'_, T> {
        Iter::new(self, first, last, Filter::Present)
    }

    pub fn iter_tagged(&self, first: usize, last: usize, tag: usize) -> Iter<'_, T> {
        Iter::new(self, first, last, Filter::Tagged(tag))
    }

    /// Every entry a store over `[index, index + 2^order)` would displace,
    /// each reported once at its first index inside the range.
    pub fn conflicts(&self, index: usize, order: u32) -> Result<Vec<(usize, Entry<T>)>, Error> {
        let xas = XaState::with_order(index, order)?;
        let lock = self.lock();
        Ok(lock.conflicts(&xas).collect())
    }

    /// Build every node `[index, index + 2^order)` needs so later stores in
    /// the range do not allocate.
    pub fn create_range(&self, index: usize, order: u32) -> Result<(), Error> {
        let mut xas = XaState::with_order(index, order)?;
        self.write(&mut xas, |lock, xas| lock.create_range(xas))
    }

    pub fn set_tag(&self, index: usize, tag: usize) {
        let mut xas = XaState::new(index);
        self.lock().set_tag(&mut xas, tag);
    }

    pub fn clear_tag(&self, index: usize, tag: usize) {
        let mut xas = XaState::new(index);
        self.lock().clear_tag(&mut xas, tag);
    }

    pub fn get_tag(&self, index: usize, tag: usize) -> bool {
        self.read().get_tag(index, tag)
    }

    /// Whether any entry carries `tag`.
    pub fn is_tagged(&self, tag: usize) -> bool {
        tag < self.tag_count() && self.head_tagged(tag)
    }

    pub fn is_empty(&self) -> bool {
        self.head().is_empty()
    }
}

impl<T: Send + Sync + 'static> Default for XArray<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for XArray<T> {
    fn drop(&mut self) {
        let head = self.head();
        let mut stack: Vec<NonNull<Node>> = Vec::new();
        match head.as_node() {
            Some(node) => stack.push(node),
            // SAFETY: `&mut self`; nobody else can see the head.
            None => unsafe { head.release::<T>() },
        }
        while let Some(node) = stack.pop() {
            // SAFETY: exclusive access; each node is reached exactly once.
            let n = unsafe { node.as_ref() };
            for offset in 0..self.geo.size {
                let entry = n.slot(offset);
                match entry.as_node() {
                    Some(child) => stack.push(child),
                    None => unsafe { entry.release::<T>() },
                }
            }
            unsafe { reclaim::free_node_now(node) };
        }
        self.set_head(RawEntry::EMPTY);
    }
}
