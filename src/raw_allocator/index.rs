//! The free-block index: doubly-linked lists threaded through the
//! `pred`/`succ` words of free payloads.
//!
//! The lists are unordered by address; insertion is LIFO at the head.
//! The explicit-list organization keeps everything in class 0, the
//! segregated organizations spread blocks over [`CLASS_COUNT`] classes.

use super::config::Placement;
use super::heap::{Heap, PayloadOffset};
use crate::sink::Sink;

/// Number of size classes.
pub(super) const CLASS_COUNT: usize = 20;

/// Class of a boundary-tagged block.
///
/// Class `i` holds sizes in `[2^(i+4), 2^(i+5))`, so class 0 starts at
/// the 16-byte minimum block; the last class is open-ended.
pub(super) fn size_class(size: u32) -> usize {
    debug_assert!(size >= 16);
    let log2 = (31 - size.leading_zeros()) as usize;
    usize::min(log2 - 4, CLASS_COUNT - 1)
}

/// Class of a buddy block: the exponent of the smallest power of two
/// holding `size`, clamped to the last class.
///
/// Buddy blocks are powers of two themselves, so each class below the
/// clamp holds exactly one size.
pub(super) fn buddy_class(size: u32) -> usize {
    debug_assert!(size >= 16);
    let log2 = size.next_power_of_two().trailing_zeros() as usize;
    usize::min(log2, CLASS_COUNT - 1)
}

/// The index over free blocks: one list head per class.
pub(super) struct FreeIndex {
    roots: [Option<PayloadOffset>; CLASS_COUNT],
}

impl FreeIndex {
    pub const fn new() -> Self {
        Self {
            roots: [None; CLASS_COUNT],
        }
    }

    /// Push `bp` at the head of `class`.
    pub fn insert<S: Sink>(&mut self, heap: &mut Heap<S>, class: usize, bp: PayloadOffset) {
        let head = self.roots[class];
        heap.set_pred(bp, None);
        heap.set_succ(bp, head);
        if let Some(head) = head {
            heap.set_pred(head, Some(bp));
        }
        self.roots[class] = Some(bp);
    }

    /// Unlink `bp` from `class`.
    pub fn remove<S: Sink>(&mut self, heap: &mut Heap<S>, class: usize, bp: PayloadOffset) {
        let pred = heap.pred(bp);
        let succ = heap.succ(bp);
        match pred {
            None => self.roots[class] = succ,
            Some(pred) => heap.set_succ(pred, succ),
        }
        if let Some(succ) = succ {
            heap.set_pred(succ, pred);
        }
    }

    /// The head of `class`, i.e. the most recently inserted block.
    pub fn head(&self, class: usize) -> Option<PayloadOffset> {
        self.roots[class]
    }

    /// Search `class` for a block of at least `asize` bytes under the
    /// given placement rule.
    pub fn search_class<S: Sink>(
        &self,
        heap: &Heap<S>,
        class: usize,
        asize: u32,
        placement: Placement,
    ) -> Option<PayloadOffset> {
        let mut choice: Option<(PayloadOffset, u32)> = None;
        let mut cursor = self.roots[class];
        while let Some(bp) = cursor {
            let size = heap.header(bp).size();
            if size >= asize {
                match placement {
                    Placement::FirstFit => return Some(bp),
                    Placement::BestFit => {
                        if choice.map_or(true, |(_, best)| size < best) {
                            choice = Some((bp, size));
                        }
                    }
                    Placement::WorstFit => {
                        if choice.map_or(true, |(_, worst)| size > worst) {
                            choice = Some((bp, size));
                        }
                    }
                }
            }
            cursor = heap.succ(bp);
        }
        choice.map(|(bp, _)| bp)
    }

    /// Whether `bp` is linked into `class`. Diagnostics only.
    pub fn contains<S: Sink>(&self, heap: &Heap<S>, class: usize, bp: PayloadOffset) -> bool {
        let mut cursor = self.roots[class];
        while let Some(current) = cursor {
            if current == bp {
                return true;
            }
            cursor = heap.succ(current);
        }
        false
    }

    /// The length of `class`, verifying the `pred`/`succ` wiring on the
    /// way. `None` signals broken wiring (or a cycle). Diagnostics only.
    pub fn count_class<S: Sink>(&self, heap: &Heap<S>, class: usize) -> Option<usize> {
        let limit = (heap.size() / 16) as usize + 1;
        let mut count = 0;
        let mut pred = None;
        let mut cursor = self.roots[class];
        while let Some(bp) = cursor {
            if heap.pred(bp) != pred {
                return None;
            }
            count += 1;
            if count > limit {
                return None;
            }
            pred = Some(bp);
            cursor = heap.succ(bp);
        }
        Some(count)
    }
}
