//! This module provides the raw allocator and its support types.
//!
//! A "raw allocator" is one, that simply gets requests for a specific
//! memory size but does not need to worry about alignment beyond the
//! native 8 bytes of the block layout: every payload it hands out is
//! 8-aligned by construction.
//!
//! The allocator manages a monotonically growing heap obtained from a
//! [`Sink`]. The heap is carved into blocks, each led by a 4-byte header
//! word packing `(size, allocated)`; the boundary-tag organizations
//! mirror the header in a footer, so the previous block is reachable in
//! O(1). Free blocks thread a doubly-linked list through their first two
//! payload words, forming the index that placement searches. Freed
//! blocks merge eagerly with free neighbors, so two adjacent free blocks
//! never coexist.
mod buddy;
mod config;
mod heap;
mod index;
mod word;

pub use config::{Config, Placement, Strategy};

use heap::{BlockIter, Heap, PayloadOffset};
use index::{FreeIndex, CLASS_COUNT};
use word::{State, Word};

use crate::sink::Sink;

use core::mem::MaybeUninit;

/// Header plus footer, the bookkeeping cost of a boundary-tagged block.
const OVERHEAD: u32 = 8;
/// Smallest legal block: header, `pred`, `succ`, footer.
const MIN_BLOCK: u32 = 16;
/// Largest legal block; keeps sizes within the 32-bit word.
const MAX_BLOCK: usize = 1 << 31;
/// Heap prefix of the boundary-tag layouts: alignment pad, prologue
/// header/footer pair and the initial epilogue header.
const TAGGED_PREFIX: u32 = 16;
/// Header offset of the first real block in the boundary-tag layouts.
const FIRST_HEADER: u32 = 12;

/// An error occurred when calling `free()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeError {
    /// There is a double-free detected: the block containing the pointer
    /// is already free.
    DoubleFreeDetected,
    /// An invalid pointer was freed up (either a pointer outside of the
    /// heap memory or a pointer into the block bookkeeping).
    AllocationNotFound,
}

/// A violated heap invariant, reported by [`RawAllocator::check`].
///
/// Offsets attached to a variant name the payload of the offending
/// block, measured from [`heap_lo`](RawAllocator::heap_lo).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckError {
    /// A block is smaller than the 16-byte minimum, not properly
    /// aligned, or (buddy) not a power of two.
    MalformedBlock { offset: u32 },
    /// Header and footer of a block disagree.
    TagMismatch { offset: u32 },
    /// Two neighboring blocks are both free, or a free buddy pair was
    /// left unmerged.
    UncoalescedBlocks { offset: u32 },
    /// A free block is missing from its class list, or a block shows up
    /// in a list it does not belong to.
    IndexMismatch { offset: u32 },
    /// A buddy block's offset is not a multiple of its size.
    MisalignedBuddy { offset: u32 },
    /// A free list's `pred`/`succ` wiring is inconsistent, or the lists
    /// hold a different number of blocks than the heap does.
    BrokenIndex,
    /// The block walk does not tile the heap up to the break, or a
    /// sentinel is damaged.
    BrokenLayout,
}

/// A raw memory allocator for contiguous slices of bytes with 8-byte
/// payload alignment.
///
/// The allocator is generic over its [`Sink`] and over the free-list
/// organization selected by its [`Config`]: a single explicit LIFO list,
/// twenty size-class lists with segregated fit, or a binary-buddy
/// structure. The heap prefix is written lazily on first use, so
/// construction is `const` and cannot fail.
pub struct RawAllocator<S> {
    heap: Heap<S>,
    index: FreeIndex,
    config: Config,
    initialized: bool,
}

impl<S: Sink> RawAllocator<S> {
    /// Create a new [`RawAllocator`] over the given sink.
    pub const fn new(sink: S, config: Config) -> Self {
        Self {
            heap: Heap::new(sink),
            index: FreeIndex::new(),
            config,
            initialized: false,
        }
    }

    /// Allocate a memory block with room for `size` bytes.
    ///
    /// The payload is 8-aligned. Returns `None` if the sink cannot
    /// supply enough heap; a `size` of zero yields `None` by the malloc
    /// contract.
    pub fn allocate(&mut self, size: usize) -> Option<&mut [MaybeUninit<u8>]> {
        let asize = self.adjusted_size(size)?;
        let bp = self.allocate_block(asize)?;
        Some(self.payload_of(bp))
    }

    /// Free a pointer inside an allocated memory block.
    ///
    /// Any pointer into the block's payload is accepted, which is what
    /// lets the aligning facade hand back adjusted pointers. A null
    /// pointer is a no-op. The freed block is merged with its free
    /// neighbors immediately.
    pub fn free(&mut self, ptr: *mut u8) -> Result<(), FreeError> {
        if ptr.is_null() {
            return Ok(());
        }
        let bp = self.resolve(ptr).ok_or(FreeError::AllocationNotFound)?;
        if self.heap.header(bp).state() == State::Free {
            return Err(FreeError::DoubleFreeDetected);
        }
        self.release(bp);
        Ok(())
    }

    /// Resize the allocation containing `ptr`.
    ///
    /// Follows the malloc contract: a null `ptr` allocates, a zero
    /// `size` frees and yields `None`. Shrinking keeps the block as is;
    /// growing absorbs a free successor when the two together fit and
    /// otherwise moves the allocation, keeping the old payload bytes up
    /// to the smaller of both sizes. On failure the old allocation stays
    /// untouched.
    pub fn reallocate(&mut self, ptr: *mut u8, size: usize) -> Option<&mut [MaybeUninit<u8>]> {
        if ptr.is_null() {
            return self.allocate(size);
        }
        if size == 0 {
            let _ = self.free(ptr);
            return None;
        }

        let bp = self.resolve(ptr)?;
        if self.heap.header(bp).state() == State::Free {
            return None;
        }
        let old = self.heap.header(bp).size();
        let need = size.checked_add(OVERHEAD as usize)?;
        let need = match self.config.strategy {
            Strategy::Buddy => buddy_asize(need)? as usize,
            _ => need,
        };
        if need <= old as usize {
            return Some(self.payload_of(bp));
        }

        if self.config.strategy != Strategy::Buddy {
            let next = self.heap.next(bp);
            let next_word = self.heap.header(next);
            // A free successor of nonzero size; the size test keeps the
            // epilogue out explicitly.
            if next_word.state() == State::Free
                && next_word.size() != 0
                && (old + next_word.size()) as usize >= need
            {
                self.unindex(next);
                let merged = Word::allocated(old + next_word.size());
                self.heap.set_header(bp, merged);
                self.heap.set_footer(bp, merged);
                return Some(self.payload_of(bp));
            }
        }

        let asize = self.adjusted_size(need)?;
        let new_bp = self.allocate_block(asize)?;
        let kept = usize::min(old as usize - OVERHEAD as usize, size);
        self.heap.copy_payload(bp, new_bp, kept);
        self.release(bp);
        Some(self.payload_of(new_bp))
    }

    /// Validate the heap against the block-layout invariants.
    ///
    /// Walks every block and every free list. Read-only; meant for tests
    /// and debug assertions, not for the allocation hot path.
    pub fn check(&self) -> Result<(), CheckError> {
        if !self.initialized {
            return Ok(());
        }
        match self.config.strategy {
            Strategy::Buddy => self.check_buddy(),
            _ => self.check_tagged(),
        }
    }

    /// The lowest heap address. Diagnostics only.
    pub fn heap_lo(&self) -> *const u8 {
        self.heap.sink().region()
    }

    /// One past the highest heap address. Diagnostics only.
    pub fn heap_hi(&self) -> *const u8 {
        self.heap
            .sink()
            .region()
            .wrapping_add(self.heap.size() as usize)
    }

    /// The current heap size in bytes. Diagnostics only.
    pub fn heap_size(&self) -> usize {
        self.heap.size() as usize
    }

    /// Round a requested payload size up to a legal block size.
    fn adjusted_size(&self, size: usize) -> Option<u32> {
        if size == 0 {
            return None;
        }
        let needed = size.checked_add(OVERHEAD as usize)?;
        match self.config.strategy {
            Strategy::Buddy => buddy_asize(needed),
            _ => {
                let asize = (needed.checked_add(7)? & !7).max(MIN_BLOCK as usize);
                (asize <= MAX_BLOCK).then(|| asize as u32)
            }
        }
    }

    /// Place an `asize`-byte allocation, extending the heap on demand.
    fn allocate_block(&mut self, asize: u32) -> Option<PayloadOffset> {
        self.ensure_init()?;
        if let Some(bp) = self.search(asize) {
            return Some(self.place(bp, asize));
        }
        let bp = self.grow(asize)?;
        Some(self.place(bp, asize))
    }

    /// Write the heap prefix and seed the heap with the first chunk.
    fn ensure_init(&mut self) -> Option<()> {
        if self.initialized {
            return Some(());
        }
        match self.config.strategy {
            Strategy::Buddy => {
                self.heap.extend(buddy::REGION_BASE as usize)?;
            }
            _ => {
                self.heap.extend(TAGGED_PREFIX as usize)?;
                self.heap.set_word(4, Word::allocated(8)); // prologue header
                self.heap.set_word(8, Word::allocated(8)); // prologue footer
                self.heap.set_word(12, Word::allocated(0)); // epilogue
            }
        }
        self.initialized = true;
        // The first extension carries the configured bias. Its failure
        // is not fatal; the first allocation will drive the growth
        // itself.
        let first = self
            .config
            .chunk_size
            .saturating_add(self.config.initial_extension_bias);
        match self.config.strategy {
            Strategy::Buddy => {
                if let Some(asize) = buddy_asize(first) {
                    let _ = self.buddy_grow(asize);
                }
            }
            _ => {
                let _ = self.extend_heap(first);
            }
        }
        Some(())
    }

    /// Grow the heap by at least `bytes` and merge the fresh block with
    /// a trailing free neighbor. Returns the coalesced free block.
    fn extend_heap(&mut self, bytes: usize) -> Option<PayloadOffset> {
        let bytes = (bytes.max(MIN_BLOCK as usize).checked_add(7)?) & !7;
        let old_brk = self.heap.extend(bytes)?;
        // The old epilogue header turns into the new block's header.
        let bp = PayloadOffset(old_brk);
        let word = Word::free(bytes as u32);
        self.heap.set_header(bp, word);
        self.heap.set_footer(bp, word);
        let epilogue = self.heap.next(bp);
        self.heap.set_header(epilogue, Word::allocated(0));
        Some(self.coalesce(bp))
    }

    fn grow(&mut self, asize: u32) -> Option<PayloadOffset> {
        match self.config.strategy {
            Strategy::Buddy => self.buddy_grow(asize),
            _ => self.extend_heap(usize::max(asize as usize, self.config.chunk_size)),
        }
    }

    /// Find a free block of at least `asize` bytes.
    fn search(&self, asize: u32) -> Option<PayloadOffset> {
        match self.config.strategy {
            Strategy::ExplicitList => {
                self.index
                    .search_class(&self.heap, 0, asize, self.config.placement)
            }
            Strategy::SegregatedFit => (index::size_class(asize)..CLASS_COUNT).find_map(|class| {
                self.index
                    .search_class(&self.heap, class, asize, self.config.placement)
            }),
            Strategy::Buddy => self.buddy_search(asize),
        }
    }

    /// Consume the free block `bp` for an `asize`-byte allocation,
    /// splitting off the remainder if it can stand as a block of its
    /// own.
    fn place(&mut self, bp: PayloadOffset, asize: u32) -> PayloadOffset {
        if self.config.strategy == Strategy::Buddy {
            return self.buddy_place(bp, asize);
        }
        self.unindex(bp);
        let size = self.heap.header(bp).size();
        let remainder = size - asize;
        if remainder >= MIN_BLOCK {
            let word = Word::allocated(asize);
            self.heap.set_header(bp, word);
            self.heap.set_footer(bp, word);
            let rest = self.heap.next(bp);
            let rest_word = Word::free(remainder);
            self.heap.set_header(rest, rest_word);
            self.heap.set_footer(rest, rest_word);
            self.index_free(rest);
        } else {
            let word = Word::allocated(size);
            self.heap.set_header(bp, word);
            self.heap.set_footer(bp, word);
        }
        bp
    }

    /// Merge `bp` with its free neighbors and index the result.
    ///
    /// `bp`'s tags must already read "free"; the block must not be in
    /// the index yet. The sentinels report "allocated" and therefore
    /// stop merging at either end of the heap.
    fn coalesce(&mut self, bp: PayloadOffset) -> PayloadOffset {
        let prev_free = self.heap.word(bp.0 - 8).state() == State::Free;
        let next = self.heap.next(bp);
        let next_word = self.heap.header(next);
        let next_free = next_word.state() == State::Free;
        let size = self.heap.header(bp).size();

        let bp = match (prev_free, next_free) {
            (false, false) => bp,
            (false, true) => {
                self.unindex(next);
                let merged = Word::free(size + next_word.size());
                self.heap.set_header(bp, merged);
                self.heap.set_footer(bp, merged);
                bp
            }
            (true, false) => {
                let prev = self.heap.prev(bp);
                self.unindex(prev);
                let merged = Word::free(self.heap.header(prev).size() + size);
                self.heap.set_header(prev, merged);
                self.heap.set_footer(prev, merged);
                prev
            }
            (true, true) => {
                let prev = self.heap.prev(bp);
                self.unindex(prev);
                self.unindex(next);
                let merged = Word::free(self.heap.header(prev).size() + size + next_word.size());
                self.heap.set_header(prev, merged);
                self.heap.set_footer(prev, merged);
                prev
            }
        };
        self.index_free(bp);
        bp
    }

    /// Mark `bp` free and hand it to the coalescer of the active
    /// organization.
    fn release(&mut self, bp: PayloadOffset) {
        let word = Word::free(self.heap.header(bp).size());
        match self.config.strategy {
            Strategy::Buddy => {
                self.heap.set_header(bp, word);
                self.buddy_coalesce(bp);
            }
            _ => {
                self.heap.set_header(bp, word);
                self.heap.set_footer(bp, word);
                self.coalesce(bp);
            }
        }
    }

    /// Find the block whose payload contains `ptr`.
    fn resolve(&self, ptr: *const u8) -> Option<PayloadOffset> {
        if !self.initialized {
            return None;
        }
        let offset = self.heap.offset_of(ptr)?;
        let overhead = self.payload_overhead();
        self.blocks()
            .find(|&(bp, word)| offset >= bp.0 && offset < bp.0 + word.size() - overhead)
            .map(|(bp, _)| bp)
    }

    /// Iterate over all blocks of the active layout.
    fn blocks(&self) -> BlockIter<'_, S> {
        let first_header = match self.config.strategy {
            Strategy::Buddy => buddy::REGION_BASE,
            _ => FIRST_HEADER,
        };
        self.heap.blocks(first_header)
    }

    /// Bookkeeping bytes of a block under the active layout.
    fn payload_overhead(&self) -> u32 {
        match self.config.strategy {
            Strategy::Buddy => 4,
            _ => OVERHEAD,
        }
    }

    fn payload_of(&mut self, bp: PayloadOffset) -> &mut [MaybeUninit<u8>] {
        let capacity = self.heap.header(bp).size() - self.payload_overhead();
        self.heap.payload_slice(bp, capacity as usize)
    }

    fn class_of(&self, size: u32) -> usize {
        match self.config.strategy {
            Strategy::ExplicitList => 0,
            Strategy::SegregatedFit => index::size_class(size),
            Strategy::Buddy => index::buddy_class(size),
        }
    }

    fn index_free(&mut self, bp: PayloadOffset) {
        let class = self.class_of(self.heap.header(bp).size());
        self.index.insert(&mut self.heap, class, bp);
    }

    fn unindex(&mut self, bp: PayloadOffset) {
        let class = self.class_of(self.heap.header(bp).size());
        self.index.remove(&mut self.heap, class, bp);
    }

    /// The boundary-tag half of [`check`](Self::check).
    fn check_tagged(&self) -> Result<(), CheckError> {
        let brk = self.heap.size();
        if self.heap.word(4) != Word::allocated(8) || self.heap.word(8) != Word::allocated(8) {
            return Err(CheckError::BrokenLayout);
        }
        let mut offset = FIRST_HEADER;
        let mut prev_free = false;
        let mut free_blocks = 0;
        loop {
            if offset + 4 > brk {
                return Err(CheckError::BrokenLayout);
            }
            let word = self.heap.word(offset);
            if word.size() == 0 {
                // the epilogue must be the last word of the heap
                if word.state() != State::Allocated || offset + 4 != brk {
                    return Err(CheckError::BrokenLayout);
                }
                break;
            }
            let bp = PayloadOffset(offset + 4);
            let size = word.size();
            if size < MIN_BLOCK || size % 8 != 0 || bp.0 % 8 != 0 {
                return Err(CheckError::MalformedBlock { offset: bp.0 });
            }
            if offset + size + 4 > brk {
                return Err(CheckError::BrokenLayout);
            }
            if self.heap.footer(bp) != word {
                return Err(CheckError::TagMismatch { offset: bp.0 });
            }
            let free = word.state() == State::Free;
            if free && prev_free {
                return Err(CheckError::UncoalescedBlocks { offset: bp.0 });
            }
            if free {
                free_blocks += 1;
            }
            self.check_membership(bp, size, free)?;
            prev_free = free;
            offset += size;
        }
        self.check_index_totals(free_blocks)
    }

    /// A block must appear in exactly its class list, and only if free.
    fn check_membership(&self, bp: PayloadOffset, size: u32, free: bool) -> Result<(), CheckError> {
        let class = self.class_of(size);
        for candidate in 0..CLASS_COUNT {
            let expected = free && candidate == class;
            if self.index.contains(&self.heap, candidate, bp) != expected {
                return Err(CheckError::IndexMismatch { offset: bp.0 });
            }
        }
        Ok(())
    }

    /// The lists must hold exactly the free blocks the walk saw.
    fn check_index_totals(&self, free_blocks: usize) -> Result<(), CheckError> {
        let mut total = 0;
        for class in 0..CLASS_COUNT {
            total += self
                .index
                .count_class(&self.heap, class)
                .ok_or(CheckError::BrokenIndex)?;
        }
        if total == free_blocks {
            Ok(())
        } else {
            Err(CheckError::BrokenIndex)
        }
    }
}

/// The power-of-two block size holding `needed` bytes, if it fits the
/// 32-bit word.
fn buddy_asize(needed: usize) -> Option<u32> {
    let asize = needed.max(MIN_BLOCK as usize).checked_next_power_of_two()?;
    (asize <= MAX_BLOCK).then(|| asize as u32)
}
