//! The operation cursor.
//!
//! An `XaState` names a target (index and order) and remembers where the
//! last walk landed. It borrows nothing, so a writer can drop the lock,
//! refill the cursor's node reserve with [`XaState::nomem`], re-take the lock
//! and run the same operation again.

use std::ptr::NonNull;

use log::warn;
use metrics::counter;

use crate::constants::INDEX_BITS;
use crate::errors::Error;
use crate::helpers::align_down;
use crate::types::Node;

/// Where the cursor stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Walk {
    /// Never walked.
    Start,
    /// Must re-walk from the head.
    Restart,
    /// The index is outside what the array currently covers.
    Bounds,
    /// A step ran off either end of the index space; the next step in the
    /// same direction wraps.
    End,
    /// Positioned on the head slot.
    Head,
    /// Positioned on `offset` inside this node.
    Node(NonNull<Node>),
    /// Stuck until the error is cleared.
    Error,
}

/// Public projection of the cursor's walk state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorState {
    Start,
    Restart,
    Bounds,
    Positioned,
    Error(Error),
}

pub struct XaState {
    pub(crate) index: usize,
    pub(crate) order: u32,
    pub(crate) offset: usize,
    pub(crate) walk: Walk,
    pub(crate) error: Option<Error>,
    /// Nodes reserved for the next write, filled outside the lock.
    pub(crate) spare: Vec<Box<Node>>,
    /// Nodes the last failed walk asked for.
    pub(crate) want: usize,
    /// The read section or lock that produced `walk`. A position is only
    /// trusted under the same one.
    pub(crate) owner: u64,
}

impl XaState {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            order: 0,
            offset: 0,
            walk: Walk::Start,
            error: None,
            spare: Vec::new(),
            want: 0,
            owner: 0,
        }
    }

    /// Cursor over `[index, index + 2^order)`. The index is aligned down to
    /// the order.
    pub fn with_order(index: usize, order: u32) -> Result<Self, Error> {
        if order >= INDEX_BITS {
            return Err(Error::IndexOutOfRange);
        }
        let mut xas = Self::new(align_down(index, order));
        xas.order = order;
        Ok(xas)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn order(&self) -> u32 {
        self.order
    }

    /// Retarget to a new index; the next operation walks from the head.
    pub fn set_index(&mut self, index: usize) {
        self.index = align_down(index, self.order);
        self.walk = Walk::Restart;
    }

    pub fn set_order(&mut self, order: u32) -> Result<(), Error> {
        if order >= INDEX_BITS {
            return Err(Error::IndexOutOfRange);
        }
        self.order = order;
        self.index = align_down(self.index, order);
        self.walk = Walk::Restart;
        Ok(())
    }

    /// Forget the position and any error, keeping target and reserve.
    pub fn reset(&mut self) {
        self.walk = Walk::Restart;
        self.error = None;
    }

    pub fn state(&self) -> CursorState {
        match self.walk {
            Walk::Start => CursorState::Start,
            Walk::Restart => CursorState::Restart,
            Walk::Bounds | Walk::End => CursorState::Bounds,
            Walk::Head | Walk::Node(_) => CursorState::Positioned,
            Walk::Error => CursorState::Error(self.error.clone().unwrap_or(Error::OutOfMemory)),
        }
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub fn is_bounds(&self) -> bool {
        matches!(self.walk, Walk::Bounds | Walk::End)
    }

    /// Nodes currently held in reserve.
    pub fn reserved(&self) -> usize {
        self.spare.len()
    }

    pub(crate) fn set_error(&mut self, err: Error) {
        self.walk = Walk::Error;
        self.error = Some(err);
    }

    pub(crate) fn is_error(&self) -> bool {
        self.walk == Walk::Error
    }

    /// Adopt the cursor for the section or lock `owner`. A node position
    /// left by any other owner may point into freed memory or another
    /// array, so it is dropped.
    pub(crate) fn enter(&mut self, owner: u64) {
        if self.owner == owner {
            return;
        }
        self.owner = owner;
        if matches!(self.walk, Walk::Head | Walk::Node(_)) {
            self.walk = Walk::Restart;
        }
    }

    /// Recover from an allocation failure. Call with the writer lock
    /// dropped: allocates the nodes the failed walk asked for, clears the
    /// error and returns true if the operation should be retried.
    pub fn nomem(&mut self) -> bool {
        if self.error != Some(Error::OutOfMemory) {
            return false;
        }
        counter!("xarray_nomem_total").increment(1);
        let missing = self.want.saturating_sub(self.spare.len()).max(1);
        for _ in 0..missing {
            match Node::try_alloc(0) {
                Some(node) => self.spare.push(node),
                None => {
                    warn!("[NOMEM] allocator refused a node, giving up");
                    return false;
                }
            }
        }
        self.error = None;
        self.walk = Walk::Restart;
        true
    }
}

impl Default for XaState {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_order_aligns_and_bounds_checks() {
        let xas = XaState::with_order(67, 2).unwrap();
        assert_eq!(xas.index(), 64);
        assert_eq!(xas.order(), 2);
        assert_eq!(XaState::with_order(0, 64).err(), Some(Error::IndexOutOfRange));
        assert!(XaState::with_order(usize::MAX, 63).is_ok());
    }

    #[test]
    fn nomem_only_acts_on_out_of_memory() {
        let mut xas = XaState::new(5);
        assert!(!xas.nomem());
        xas.set_error(Error::AlreadyOccupied);
        assert!(!xas.nomem());
        xas.want = 3;
        xas.set_error(Error::OutOfMemory);
        assert!(xas.nomem());
        assert_eq!(xas.reserved(), 3);
        assert_eq!(xas.state(), CursorState::Restart);
        assert!(xas.error().is_none());
    }

    #[test]
    fn positions_do_not_survive_a_new_owner() {
        let mut xas = XaState::new(9);
        xas.enter(1);
        xas.walk = Walk::Head;
        xas.enter(1);
        assert_eq!(xas.state(), CursorState::Positioned);
        xas.enter(2);
        assert_eq!(xas.state(), CursorState::Restart);

        xas.walk = Walk::End;
        xas.enter(3);
        assert_eq!(xas.state(), CursorState::Bounds);
    }
}
