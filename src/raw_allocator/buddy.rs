//! The binary-buddy organization.
//!
//! Blocks are powers of two and carry only a header: predecessors are
//! never walked, and a block's merge partner is derived from its
//! address. For a block of size `s` at offset `o` from the region base,
//! the buddy lives at offset `o ^ s`. Merging requires the buddy to be
//! free *and* still of size `s`; a buddy that has been split further
//! reports a smaller size and must stay apart.
//!
//! The region base is chosen so payloads land on 8-byte boundaries, and
//! every block's offset from it is a multiple of the block's size. Heap
//! extensions keep that tiling: a new block is placed on the next
//! properly aligned offset and the gap up to it is carved into maximal
//! aligned power-of-two blocks, which are released like any other free
//! block.

use super::config::Placement;
use super::heap::PayloadOffset;
use super::index;
use super::word::{State, Word};
use super::{buddy_asize, CheckError, RawAllocator, MIN_BLOCK};

use crate::sink::Sink;

/// Offset of the buddy region base: everything below is the alignment
/// pad. The base is 4 mod 8, so each payload (base + block offset + 4)
/// is 8-aligned.
pub(super) const REGION_BASE: u32 = 4;

impl<S: Sink> RawAllocator<S> {
    /// Find a block to split down to `asize` (a power of two): the head
    /// of the first non-empty class at or above the target.
    ///
    /// Classes below the clamp hold exactly one size, so their head
    /// always qualifies; the open-ended last class is walked for a real
    /// fit.
    pub(super) fn buddy_search(&self, asize: u32) -> Option<PayloadOffset> {
        (index::buddy_class(asize)..index::CLASS_COUNT).find_map(|class| {
            if class < index::CLASS_COUNT - 1 {
                self.index.head(class)
            } else {
                self.index
                    .search_class(&self.heap, class, asize, Placement::FirstFit)
            }
        })
    }

    /// Halve `bp`'s block until it matches `asize`, indexing each upper
    /// half, and mark the result allocated.
    pub(super) fn buddy_place(&mut self, bp: PayloadOffset, asize: u32) -> PayloadOffset {
        self.unindex(bp);
        let mut size = self.heap.header(bp).size();
        while size > asize {
            size /= 2;
            let upper = PayloadOffset(bp.0 + size);
            self.heap.set_header(upper, Word::free(size));
            self.index_free(upper);
        }
        self.heap.set_header(bp, Word::allocated(size));
        bp
    }

    /// Merge `bp` with its address-derived buddy for as long as the
    /// partner is free and has not been split to a smaller size, then
    /// index the result.
    ///
    /// `bp`'s header must already read "free"; the block must not be in
    /// the index yet.
    pub(super) fn buddy_coalesce(&mut self, bp: PayloadOffset) -> PayloadOffset {
        let mut start = bp.0 - REGION_BASE - 4;
        let mut size = self.heap.header(bp).size();
        let region = self.heap.size() - REGION_BASE;
        loop {
            let buddy = start ^ size;
            // the buddy may simply not have been extended yet
            if buddy >= region || region - buddy < size {
                break;
            }
            let buddy_word = self.heap.word(REGION_BASE + buddy);
            if buddy_word.size() != size || buddy_word.state() != State::Free {
                break;
            }
            self.index.remove(
                &mut self.heap,
                index::buddy_class(size),
                PayloadOffset(REGION_BASE + buddy + 4),
            );
            start = u32::min(start, buddy);
            size *= 2;
        }
        let merged = PayloadOffset(REGION_BASE + start + 4);
        self.heap.set_header(merged, Word::free(size));
        self.index_free(merged);
        merged
    }

    /// Extend the region with a free block of at least `asize` bytes.
    ///
    /// The block is sized to `max(asize, chunk)` and starts on the next
    /// offset that is a multiple of its size. The gap up to there is
    /// tiled with maximal aligned power-of-two blocks and released.
    /// Returns the (possibly merged) new block.
    pub(super) fn buddy_grow(&mut self, asize: u32) -> Option<PayloadOffset> {
        let chunk = buddy_asize(self.config.chunk_size).unwrap_or(asize);
        let block = asize.max(chunk);
        let cur = (self.heap.size() - REGION_BASE) as u64;
        let start = match cur % u64::from(block) {
            0 => cur,
            misfit => cur + (u64::from(block) - misfit),
        };
        // a successful extension proves the offsets fit back into `u32`
        let total = usize::try_from(start - cur + u64::from(block)).ok()?;
        self.heap.extend(total)?;
        let (cur, start) = (cur as u32, start as u32);

        // Mark the new block before releasing the gap, so gap merges
        // stop at its edge instead of reading unwritten words.
        let bp = PayloadOffset(REGION_BASE + start + 4);
        self.heap.set_header(bp, Word::allocated(block));

        let mut at = cur;
        while at < start {
            let piece = 1 << at.trailing_zeros();
            debug_assert!(piece <= start - at);
            let gap_bp = PayloadOffset(REGION_BASE + at + 4);
            self.heap.set_header(gap_bp, Word::free(piece));
            self.buddy_coalesce(gap_bp);
            at += piece;
        }

        self.heap.set_header(bp, Word::free(block));
        Some(self.buddy_coalesce(bp))
    }

    /// The buddy half of [`check`](RawAllocator::check).
    pub(super) fn check_buddy(&self) -> Result<(), CheckError> {
        let region = self.heap.size() - REGION_BASE;
        let mut offset = 0; // relative to the region base
        let mut free_blocks = 0;
        while offset < region {
            if region - offset < 4 {
                return Err(CheckError::BrokenLayout);
            }
            let word = self.heap.word(REGION_BASE + offset);
            let size = word.size();
            let bp = PayloadOffset(REGION_BASE + offset + 4);
            if size < MIN_BLOCK || !size.is_power_of_two() || bp.0 % 8 != 0 {
                return Err(CheckError::MalformedBlock { offset: bp.0 });
            }
            if offset % size != 0 {
                return Err(CheckError::MisalignedBuddy { offset: bp.0 });
            }
            if size > region - offset {
                return Err(CheckError::BrokenLayout);
            }
            let free = word.state() == State::Free;
            if free {
                free_blocks += 1;
                let buddy = offset ^ size;
                if buddy < region && region - buddy >= size {
                    let buddy_word = self.heap.word(REGION_BASE + buddy);
                    if buddy_word.size() == size && buddy_word.state() == State::Free {
                        return Err(CheckError::UncoalescedBlocks { offset: bp.0 });
                    }
                }
            }
            self.check_membership(bp, size, free)?;
            offset += size;
        }
        self.check_index_totals(free_blocks)
    }
}
