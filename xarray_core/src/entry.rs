//! Entry encoding.
//!
//! Every slot is one machine word. The low two bits pick the family:
//!
//! * `x1` - a value, payload in the upper bits
//! * `00` - a caller pointer (`Arc::into_raw`), or empty when the word is 0
//! * `10` - internal: a node pointer when the payload is at least
//!   `INTERNAL_NODE_MIN`, otherwise a sentinel (sibling, retry, deleted)
//!
//! Callers only ever see [`Entry`]; the internal families stay in this crate.

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::constants::*;
use crate::errors::Error;
use crate::types::Node;

/// A stored entry as seen by callers.
pub enum Entry<T> {
    /// Small integer payload, compared by value.
    Value(usize),
    /// Shared reference, compared by identity.
    Pointer(Arc<T>),
}

impl<T> Entry<T> {
    pub fn value(v: usize) -> Self {
        Entry::Value(v)
    }

    pub fn pointer(p: Arc<T>) -> Self {
        Entry::Pointer(p)
    }

    pub fn is_value(&self) -> bool {
        matches!(self, Entry::Value(_))
    }

    pub fn as_value(&self) -> Option<usize> {
        match self {
            Entry::Value(v) => Some(*v),
            Entry::Pointer(_) => None,
        }
    }

    pub fn as_pointer(&self) -> Option<&Arc<T>> {
        match self {
            Entry::Pointer(p) => Some(p),
            Entry::Value(_) => None,
        }
    }
}

impl<T> Clone for Entry<T> {
    fn clone(&self) -> Self {
        match self {
            Entry::Value(v) => Entry::Value(*v),
            Entry::Pointer(p) => Entry::Pointer(Arc::clone(p)),
        }
    }
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Entry::Value(a), Entry::Value(b)) => a == b,
            (Entry::Pointer(a), Entry::Pointer(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl<T> Eq for Entry<T> {}

impl<T> fmt::Debug for Entry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entry::Value(v) => write!(f, "Value({v})"),
            Entry::Pointer(p) => write!(f, "Pointer({:p})", Arc::as_ptr(p)),
        }
    }
}

/// Decoded view of a slot word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    Empty,
    Value(usize),
    Pointer(*const ()),
    Node(NonNull<Node>),
    Retry,
    Sibling(usize),
    Deleted,
}

/// One encoded slot word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct RawEntry(usize);

impl RawEntry {
    pub(crate) const EMPTY: RawEntry = RawEntry(0);
    pub(crate) const RETRY: RawEntry = RawEntry::internal(RETRY_CODE);
    pub(crate) const DELETED: RawEntry = RawEntry::internal(DELETED_CODE);

    #[inline(always)]
    const fn internal(payload: usize) -> Self {
        RawEntry((payload << 2) | 2)
    }

    #[inline(always)]
    pub(crate) const fn from_bits(bits: usize) -> Self {
        RawEntry(bits)
    }

    #[inline(always)]
    pub(crate) const fn bits(self) -> usize {
        self.0
    }

    #[inline(always)]
    pub(crate) fn sibling(offset: usize) -> Self {
        debug_assert!(offset < SIBLING_LIMIT);
        RawEntry::internal(offset)
    }

    #[inline(always)]
    pub(crate) fn node(node: NonNull<Node>) -> Self {
        RawEntry(node.as_ptr() as usize | 2)
    }

    #[inline(always)]
    pub(crate) fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub(crate) fn is_value(self) -> bool {
        self.0 & 1 == 1
    }

    #[inline(always)]
    pub(crate) fn is_pointer(self) -> bool {
        self.0 & 3 == 0 && self.0 != 0
    }

    #[inline(always)]
    pub(crate) fn is_internal(self) -> bool {
        self.0 & 3 == 2
    }

    #[inline(always)]
    pub(crate) fn is_node(self) -> bool {
        self.is_internal() && self.0 >> 2 >= INTERNAL_NODE_MIN
    }

    #[inline(always)]
    pub(crate) fn is_sibling(self) -> bool {
        self.is_internal() && self.0 >> 2 < SIBLING_LIMIT
    }

    /// Retry or deleted-node marker: the reader must re-walk.
    #[inline(always)]
    pub(crate) fn is_retry(self) -> bool {
        self == Self::RETRY || self == Self::DELETED
    }

    /// A caller entry (value or pointer).
    #[inline(always)]
    pub(crate) fn is_leaf(self) -> bool {
        self.is_value() || self.is_pointer()
    }

    #[inline(always)]
    pub(crate) fn sibling_offset(self) -> usize {
        debug_assert!(self.is_sibling());
        self.0 >> 2
    }

    #[inline(always)]
    pub(crate) fn as_node(self) -> Option<NonNull<Node>> {
        if self.is_node() {
            NonNull::new((self.0 & !3) as *mut Node)
        } else {
            None
        }
    }

    pub(crate) fn kind(self) -> Kind {
        if self.0 == 0 {
            Kind::Empty
        } else if self.is_value() {
            Kind::Value(self.0 >> 1)
        } else if self.is_pointer() {
            Kind::Pointer(self.0 as *const ())
        } else if let Some(node) = self.as_node() {
            Kind::Node(node)
        } else if self == Self::RETRY {
            Kind::Retry
        } else if self == Self::DELETED {
            Kind::Deleted
        } else {
            Kind::Sibling(self.sibling_offset())
        }
    }

    /// Encode a caller entry, moving its strong reference into the word.
    pub(crate) fn encode<T>(entry: Entry<T>) -> Result<Self, Error> {
        match entry {
            Entry::Value(v) if v > MAX_VALUE => Err(Error::ValueOutOfRange),
            Entry::Value(v) => Ok(RawEntry((v << 1) | 1)),
            Entry::Pointer(p) => {
                let raw = Arc::into_raw(p) as usize;
                debug_assert!(raw & 3 == 0, "Arc payload is at least word aligned");
                Ok(RawEntry(raw))
            }
        }
    }

    /// Encode an optional entry; `None` is the empty word.
    pub(crate) fn encode_opt<T>(entry: Option<Entry<T>>) -> Result<Self, Error> {
        match entry {
            Some(e) => Self::encode(e),
            None => Ok(Self::EMPTY),
        }
    }

    /// Whether this word holds `entry`: values by value, pointers by
    /// identity, `None` for the empty word.
    pub(crate) fn holds<T>(self, entry: Option<&Entry<T>>) -> bool {
        match entry {
            None => self.is_empty(),
            Some(Entry::Value(v)) => *v <= MAX_VALUE && self.0 == ((*v << 1) | 1),
            Some(Entry::Pointer(p)) => self.0 == Arc::as_ptr(p) as usize,
        }
    }

    /// Produce a caller entry without consuming the slot's reference.
    ///
    /// # Safety
    /// A pointer word must come from `encode::<T>` and its `Arc` must still be
    /// alive, which holds for any word read under an epoch pin.
    pub(crate) unsafe fn to_entry<T>(self) -> Option<Entry<T>> {
        match self.kind() {
            Kind::Value(v) => Some(Entry::Value(v)),
            Kind::Pointer(p) => {
                let p = p as *const T;
                Arc::increment_strong_count(p);
                Some(Entry::Pointer(Arc::from_raw(p)))
            }
            _ => None,
        }
    }

    /// Take one more strong reference for an extra copy of this word.
    ///
    /// # Safety
    /// Same contract as [`RawEntry::to_entry`].
    pub(crate) unsafe fn acquire_copy<T>(self) {
        if self.is_pointer() {
            Arc::increment_strong_count(self.0 as *const T);
        }
    }

    /// Give back the strong reference a slot held.
    ///
    /// # Safety
    /// The word must no longer be reachable by any reader that could still
    /// clone it, i.e. call from deferred reclamation or with exclusive access.
    pub(crate) unsafe fn release<T>(self) {
        if self.is_pointer() {
            drop(Arc::from_raw(self.0 as *const T));
        }
    }
}

impl fmt::Debug for RawEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            Kind::Empty => f.write_str("empty"),
            Kind::Value(v) => write!(f, "value {v} ({v:#x})"),
            Kind::Pointer(p) => write!(f, "{p:p}"),
            Kind::Node(n) => write!(f, "node {:p}", n.as_ptr()),
            Kind::Retry => f.write_str("retry"),
            Kind::Deleted => f.write_str("deleted"),
            Kind::Sibling(o) => write!(f, "sibling (slot {o})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_round_trip_up_to_the_edge() {
        for v in [0usize, 1, 42, MAX_VALUE - 1, MAX_VALUE] {
            let raw = RawEntry::encode::<()>(Entry::Value(v)).unwrap();
            assert!(raw.is_value() && raw.is_leaf());
            assert_eq!(raw.kind(), Kind::Value(v));
            assert_eq!(unsafe { raw.to_entry::<()>() }, Some(Entry::Value(v)));
        }
        assert_eq!(
            RawEntry::encode::<()>(Entry::Value(MAX_VALUE + 1)),
            Err(Error::ValueOutOfRange)
        );
    }

    #[test]
    fn pointers_keep_identity_and_refcount() {
        let a = Arc::new(7u32);
        let raw = RawEntry::encode(Entry::Pointer(Arc::clone(&a))).unwrap();
        assert!(raw.is_pointer());
        assert_eq!(Arc::strong_count(&a), 2);
        let back = unsafe { raw.to_entry::<u32>() }.unwrap();
        assert_eq!(back, Entry::Pointer(Arc::clone(&a)));
        assert_eq!(Arc::strong_count(&a), 3);
        drop(back);
        unsafe { raw.release::<u32>() };
        assert_eq!(Arc::strong_count(&a), 1);
    }

    #[test]
    fn internal_sentinels_are_distinct() {
        assert_eq!(RawEntry::RETRY.kind(), Kind::Retry);
        assert_eq!(RawEntry::DELETED.kind(), Kind::Deleted);
        assert_eq!(RawEntry::sibling(5).kind(), Kind::Sibling(5));
        assert!(RawEntry::RETRY.is_retry() && RawEntry::DELETED.is_retry());
        assert!(!RawEntry::sibling(0).is_retry());
        assert!(!RawEntry::sibling(63).is_node());
        assert!(!RawEntry::RETRY.is_leaf());
        assert_eq!(RawEntry::EMPTY.kind(), Kind::Empty);
    }

    #[test]
    fn equality_rules() {
        let a = Arc::new(1);
        let b = Arc::new(1);
        assert_eq!(Entry::<i32>::Value(3), Entry::Value(3));
        assert_ne!(Entry::Pointer(a.clone()), Entry::Pointer(b));
        assert_eq!(Entry::Pointer(a.clone()), Entry::Pointer(a));
    }
}
