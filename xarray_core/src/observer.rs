//! Node update hook.
//!
//! The writer calls the observer synchronously, under the writer lock, when
//! a node starts or stops holding nothing but value entries, and when such a
//! node is torn down. The observer must not call back into the container.

use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use log::trace;

use crate::types::{Node, NodeView};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    /// Every occupied slot now holds a value.
    ValueOnly,
    /// The node left the value-only state but is still live.
    Mixed,
    /// A node that was value-only has been unlinked and will be freed.
    Freed,
}

pub trait UpdateObserver: Send + Sync {
    fn on_node_event(&self, node: &NodeView<'_>, event: NodeEvent);
}

/// Keeps the set of value-only nodes, e.g. to reclaim them under memory
/// pressure. The link word of each tracked node carries a generation stamp.
#[derive(Default)]
pub struct ValueNodeTracker {
    nodes: DashMap<usize, u32>, // node id -> shift
    stamp: AtomicUsize,
}

impl ValueNodeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: usize) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Shift of a tracked node.
    pub fn shift_of(&self, id: usize) -> Option<u32> {
        self.nodes.get(&id).map(|s| *s)
    }
}

impl UpdateObserver for ValueNodeTracker {
    fn on_node_event(&self, node: &NodeView<'_>, event: NodeEvent) {
        trace!("[TRACK] node={:#x} event={:?}", node.id(), event);
        match event {
            NodeEvent::ValueOnly => {
                let stamp = self.stamp.fetch_add(1, Ordering::Relaxed) + 1;
                node.link().store(stamp, Ordering::Relaxed);
                self.nodes.insert(node.id(), node.shift());
            }
            NodeEvent::Mixed | NodeEvent::Freed => {
                node.link().store(0, Ordering::Relaxed);
                self.nodes.remove(&node.id());
            }
        }
    }
}

/// Called by the writer after changing a node's counters. `was` is the
/// value-only state before the change.
pub(crate) fn notify_update(observer: Option<&dyn UpdateObserver>, node: &Node, was: bool) {
    let Some(obs) = observer else { return };
    let now = node.is_value_only();
    if was == now {
        return;
    }
    let event = if now { NodeEvent::ValueOnly } else { NodeEvent::Mixed };
    obs.on_node_event(&NodeView { node }, event);
}

/// Called by the writer before a node is scheduled for freeing. `was` is the
/// value-only state before its counters were zeroed.
pub(crate) fn notify_freed(observer: Option<&dyn UpdateObserver>, node: &Node, was: bool) {
    if let (Some(obs), true) = (observer, was) {
        obs.on_node_event(&NodeView { node }, NodeEvent::Freed);
    }
}
