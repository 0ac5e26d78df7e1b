//! Index arithmetic shared by the walk and the store paths

use crate::constants::INDEX_BITS;

/// Fanout of one trie level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub chunk_shift: u32,
    pub size: usize,
    pub mask: usize,
}

impl Geometry {
    pub const fn new(chunk_shift: u8) -> Self {
        let size = 1usize << chunk_shift;
        Self {
            chunk_shift: chunk_shift as u32,
            size,
            mask: size - 1,
        }
    }

    /// Slot of `index` inside a node consuming `shift` low bits below it.
    #[inline(always)]
    pub fn offset(&self, index: usize, shift: u32) -> usize {
        (index >> shift) & self.mask
    }

    /// Highest index reachable through a node at `shift`.
    #[inline]
    pub fn node_max_index(&self, shift: u32) -> usize {
        let span = shift + self.chunk_shift;
        if span >= INDEX_BITS {
            usize::MAX
        } else {
            (1usize << span) - 1
        }
    }

    /// `order` as (node shift, extra sibling slots).
    #[inline]
    pub fn split_order(&self, order: u32) -> (u32, usize) {
        let rem = order % self.chunk_shift;
        (order - rem, (1usize << rem) - 1)
    }

    /// Index of slot `offset` in a node at `shift` that covers `index`.
    #[inline]
    pub fn slot_index(&self, index: usize, shift: u32, offset: usize) -> usize {
        let span = shift + self.chunk_shift;
        let base = if span >= INDEX_BITS {
            0
        } else {
            index & !((1usize << span) - 1)
        };
        base | (offset << shift)
    }
}

/// Last index of `[index, index + 2^order)`, or `None` if `order` cannot
/// be represented.
#[inline]
pub fn range_last(index: usize, order: u32) -> Option<usize> {
    if order >= INDEX_BITS {
        return None;
    }
    Some(index | ((1usize << order) - 1))
}

/// Clear the low `order` bits.
#[inline]
pub fn align_down(index: usize, order: u32) -> usize {
    if order >= INDEX_BITS {
        0
    } else {
        index & !((1usize << order) - 1)
    }
}

/// Bitmap of every slot in a node of `size` slots.
#[inline(always)]
pub const fn full_bitmap(size: usize) -> u64 {
    if size >= 64 {
        u64::MAX
    } else {
        (1u64 << size) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_order_rounds_to_levels() {
        let g = Geometry::new(6);
        assert_eq!(g.split_order(0), (0, 0));
        assert_eq!(g.split_order(2), (0, 3));
        assert_eq!(g.split_order(6), (6, 0));
        assert_eq!(g.split_order(63), (60, 7));
        let small = Geometry::new(2);
        assert_eq!(small.split_order(5), (4, 1));
    }

    #[test]
    fn node_span_saturates_at_top() {
        let g = Geometry::new(6);
        assert_eq!(g.node_max_index(0), 63);
        assert_eq!(g.node_max_index(6), 4095);
        assert_eq!(g.node_max_index(60), usize::MAX);
        assert_eq!(Geometry::new(5).node_max_index(60), usize::MAX);
    }

    #[test]
    fn slot_index_keeps_upper_bits() {
        let g = Geometry::new(6);
        assert_eq!(g.slot_index(1_000_000, 0, 3), (1_000_000 & !63) | 3);
        assert_eq!(g.slot_index(usize::MAX, 60, 0), 0);
        assert_eq!(g.slot_index(usize::MAX, 60, 15), 15usize << 60);
    }

    #[test]
    fn range_helpers() {
        assert_eq!(range_last(64, 2), Some(67));
        assert_eq!(range_last(0, 63), Some(usize::MAX >> 1));
        assert_eq!(range_last(0, 64), None);
        assert_eq!(align_down(67, 2), 64);
        assert_eq!(full_bitmap(16), 0xffff);
        assert_eq!(full_bitmap(64), u64::MAX);
    }
}
