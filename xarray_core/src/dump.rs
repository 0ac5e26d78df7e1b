//! Human-readable tree dump for debugging.

use std::fmt::Write;

use log::debug;

use crate::entry::{Kind, RawEntry};
use crate::reclaim::pin;
use crate::types::XArray;

impl<T> XArray<T> {
    /// Render the whole tree, one line per node or occupied slot, and log it
    /// at debug level.
    pub fn dump(&self) -> String {
        let _guard = pin();
        let mut out = String::new();
        let head = self.head();
        let _ = writeln!(
            out,
            "xarray {:p} head {:#x} tags {:#010b} chunk_shift {}",
            self as *const Self,
            head.bits(),
            self.tagged.load(std::sync::atomic::Ordering::Relaxed),
            self.geo.chunk_shift
        );
        let span = match head.as_node() {
            // SAFETY: pinned above.
            Some(node) => unsafe { node.as_ref() }.shift() + self.geo.chunk_shift,
            None => 0,
        };
        self.dump_entry(&mut out, head, 0, span, 1);
        for line in out.lines() {
            debug!("{line}");
        }
        out
    }

    /// `span` is the number of index bits the slot holding `entry` covers.
    fn dump_entry(&self, out: &mut String, entry: RawEntry, index: usize, span: u32, depth: usize) {
        let last = if span >= usize::BITS {
            usize::MAX
        } else {
            index | ((1usize << span) - 1)
        };
        let pad = "  ".repeat(depth);
        match entry.kind() {
            Kind::Empty => {}
            Kind::Node(ptr) => {
                // SAFETY: pinned by `dump`.
                let node = unsafe { ptr.as_ref() };
                let _ = write!(
                    out,
                    "{pad}{index:#x}-{last:#x}: node {:p} shift {} count {} values {} parent {:p} offset {}",
                    ptr.as_ptr(),
                    node.shift(),
                    node.count(),
                    node.values(),
                    node.parent.load(std::sync::atomic::Ordering::Relaxed),
                    node.offset_in_parent()
                );
                for tag in 0..self.tag_count() {
                    let _ = write!(out, " tag{tag} {:#018x}", node.tag_bits(tag));
                }
                out.push('\n');
                let shift = node.shift();
                for offset in 0..self.geo.size {
                    let child = node.slot(offset);
                    let base = index | (offset << shift);
                    self.dump_entry(out, child, base, shift, depth + 1);
                }
            }
            Kind::Sibling(canon) => {
                let _ = writeln!(out, "{pad}{index:#x}-{last:#x}: sibling of slot {canon}");
            }
            _ => {
                let _ = writeln!(out, "{pad}{index:#x}-{last:#x}: {entry:?}");
            }
        }
    }
}
