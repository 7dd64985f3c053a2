//! Boundary-tag heap allocator with selectable free-list organizations
//!
//! This crate provides a malloc-style allocator over a monotonically
//! growing, brk-like heap region. The central type is [`Allocator`],
//! which implements the [`core::alloc::GlobalAlloc`]-trait and is
//! therefore usable as the `#[global_allocator]` on `#![no_std]`-targets;
//! the underlying [`RawAllocator`] is public as well for callers that
//! want the malloc/free/realloc surface directly or bring their own
//! [`sink`](crate::sink).
//!
//! # Usage
//! Copy and paste the following into your binary crate and adjust the
//! heap size (here 64 KiB):
//! ```no_run
//! #[global_allocator]
//! static ALLOCATOR: brkalloc::Allocator<{ 64 * 1024 }> = brkalloc::Allocator::new();
//!
//! extern crate alloc;
//! ```
//! Afterwards the usual collections (`alloc::vec::Vec`,
//! `alloc::collections::BTreeMap`, ...) just work.
//!
//! The free-list organization and placement policy are selectable at
//! construction time:
//! ```no_run
//! use brkalloc::{Allocator, Config, Strategy};
//!
//! static ALLOCATOR: Allocator<{ 64 * 1024 }> =
//!     Allocator::with_config(Config::with_strategy(Strategy::Buddy));
//! ```
//!
//! # Implementation
//! The heap is carved into *blocks*. Every block starts with a 4-byte
//! header word packing `(size, allocated)`; since sizes are multiples of
//! 8, bit 0 of the word carries the allocated-flag. The boundary-tag
//! organizations mirror the header in a footer at the end of the block,
//! so a backward walk can read the previous block's size in O(1):
//! ```text
//! | hdr | payload ......... | ftr | hdr | payload ... | ftr |
//!       ^-- 8-aligned                   ^-- 8-aligned
//! ```
//! A free block reuses its first two payload words as `pred`/`succ`
//! links of a doubly-linked free list, which dictates the minimum block
//! size of 16 bytes. Three index organizations are available:
//!
//! - [`Strategy::ExplicitList`]: one LIFO list over all free blocks,
//!   searched by first, best or worst fit.
//! - [`Strategy::SegregatedFit`]: twenty size-class lists (class `i`
//!   holds sizes from `2^(i+4)` up to twice that), searched in ascending
//!   class order.
//! - [`Strategy::Buddy`]: block sizes are powers of two, footers are
//!   dropped, and a block merges only with the equally-sized partner at
//!   its address XOR its size.
//!
//! Freeing merges a block with its free neighbors immediately, so two
//! adjacent free blocks never coexist. Placement splits the chosen block
//! when the remainder can stand alone as a 16-byte block (the buddy
//! organization instead halves its block down to the target size). When
//! no free block fits, the heap grows by at least one configurable chunk
//! (4 KiB by default) and the fresh block merges with a free block at
//! the old top of the heap.
//!
//! The heap itself comes from a [`sink::Sink`]: a fixed buffer inside
//! the allocator value by default, or the real program break via
//! `sbrk(2)` when the `sbrk` feature is enabled on Unix.
#![cfg_attr(not(test), no_std)]
#![warn(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

mod raw_allocator;
pub mod sink;

pub use raw_allocator::{CheckError, Config, FreeError, Placement, RawAllocator, Strategy};

use sink::BufferSink;

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

/// The heap allocator.
///
/// This is the main type of this crate: a [`RawAllocator`] over an
/// `N`-byte buffer inside the value itself, protected by a `spin::Mutex`
/// to make it usable through shared references (a requirement of
/// [`GlobalAlloc`]). The heap memory is statically bounded by `N`, so
/// the allocator can be placed in a `static` and the heap is accounted
/// to the static memory of the program.
///
/// Besides the [`GlobalAlloc`]-impl, the malloc-style entry points
/// ([`allocate`](Self::allocate), [`free`](Self::free),
/// [`reallocate`](Self::reallocate)) are exposed directly for drivers
/// that manage raw pointers themselves.
pub struct Allocator<const N: usize> {
    raw: spin::Mutex<RawAllocator<BufferSink<N>>>,
}

impl<const N: usize> Allocator<N> {
    /// Create a new [`Allocator`] with the default configuration
    /// (segregated fit, first fit, 4 KiB chunks).
    ///
    /// This function is a `const fn`, therefore you can call it directly
    /// when creating the allocator.
    ///
    /// # Panics
    /// This function will panic, if the supplied buffer size, i.e. `N`,
    /// is less than `32` or not divisible by `8`.
    #[must_use = "assign the allocator to a static variable and apply the `#[global_allocator]`-attribute to make it the global allocator"]
    pub const fn new() -> Self {
        Self::with_config(Config::new())
    }

    /// Create a new [`Allocator`] with the given [`Config`].
    ///
    /// # Panics
    /// This function will panic, if the supplied buffer size, i.e. `N`,
    /// is less than `32` or not divisible by `8`.
    #[must_use = "assign the allocator to a static variable and apply the `#[global_allocator]`-attribute to make it the global allocator"]
    pub const fn with_config(config: Config) -> Self {
        assert!(N >= 32, "too small heap memory: minimum size is 32");
        assert!(N % 8 == 0, "memory size has to be divisible by 8");
        let raw = spin::Mutex::new(RawAllocator::new(BufferSink::new(), config));
        Self { raw }
    }

    /// Allocate `size` bytes with 8-byte alignment.
    ///
    /// Returns a null pointer if the heap is exhausted or `size` is
    /// zero.
    pub fn allocate(&self, size: usize) -> *mut u8 {
        self.raw
            .lock()
            .allocate(size)
            .map_or(ptr::null_mut(), |memory| memory.as_mut_ptr().cast())
    }

    /// Free the allocation containing `ptr`.
    ///
    /// A null `ptr` is a no-op; a pointer outside any live allocation is
    /// reported as an error and leaves the heap untouched.
    pub fn free(&self, ptr: *mut u8) -> Result<(), FreeError> {
        self.raw.lock().free(ptr)
    }

    /// Resize the allocation at `ptr` to `size` bytes, malloc-style.
    ///
    /// The returned pointer may differ from `ptr`; in that case the old
    /// payload has been copied over up to the smaller of both sizes. A
    /// null return means the old allocation is still intact (except for
    /// `size == 0`, which frees it).
    pub fn reallocate(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        self.raw
            .lock()
            .reallocate(ptr, size)
            .map_or(ptr::null_mut(), |memory| memory.as_mut_ptr().cast())
    }

    /// Validate the heap against the block-layout invariants.
    ///
    /// Intended for tests and debugging sessions; it walks the whole
    /// heap and all free lists.
    pub fn check(&self) -> Result<(), CheckError> {
        self.raw.lock().check()
    }

    /// Align a given pointer to the specified alignment.
    ///
    /// # Safety
    /// This function requires `align` to be a power of two and requires
    /// the `ptr` to point to a memory region, that is large enough, so
    /// that the aligned pointer is still in that memory region.
    unsafe fn align_to(ptr: *mut u8, align: usize) -> *mut u8 {
        let addr = ptr as usize;
        let mismatch = addr & (align - 1);
        let offset = if mismatch != 0 { align - mismatch } else { 0 };
        // SAFETY: "in-bound"-requirement is part of the safety-contract
        // of this function, therefore the caller is responsible for it
        unsafe { ptr.add(offset) }
    }
}

// SAFETY: the implementation adheres to the `GlobalAlloc` contract: it
// does not panic on allocation failure (null is returned instead), the
// returned pointers honor the layout's alignment, and deallocation
// accepts the pointers handed out by `alloc`.
unsafe impl<const N: usize> GlobalAlloc for Allocator<N> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let align = layout.align();
        // the raw allocator always returns 8-aligned payloads, therefore
        // smaller alignments are always fulfilled. Larger alignments
        // over-allocate by `align` bytes, which is enough to shift the
        // returned pointer onto the requested boundary.
        let size = if align > 8 {
            match layout.size().checked_add(align) {
                Some(size) => size,
                None => return ptr::null_mut(),
            }
        } else {
            layout.size()
        };

        match self.raw.lock().allocate(size) {
            // SAFETY: `align` is a power of two as by the contract of
            // `Layout`. Furthermore the memory slice was enlarged (see
            // above), so that the aligned pointer will still be in the
            // same allocation.
            Some(memory) => unsafe { Self::align_to(memory.as_mut_ptr().cast(), align) },
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // alignment is irrelevant here, as `RawAllocator::free` can
        // handle any pointer in a block's payload, so simply forward the
        // pointer. The `free()`-method might detect errors, but those
        // cannot lead to panics (by contract of `GlobalAlloc`), and
        // there is no stable way to abort on `core`. Therefore the only
        // viable option is: do nothing.
        let _maybe_error = self.raw.lock().free(ptr).ok();
        // errors are ignored
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        // natively aligned layouts can use the in-place fast paths of
        // the raw allocator
        if layout.align() <= 8 {
            return match self.raw.lock().reallocate(ptr, new_size) {
                Some(memory) => memory.as_mut_ptr().cast(),
                None => ptr::null_mut(),
            };
        }

        // over-aligned blocks must not take the raw fast paths (an
        // absorbed successor keeps the old, possibly unaligned base), so
        // they go the allocate-copy-free route
        let new_layout = match Layout::from_size_align(new_size, layout.align()) {
            Ok(new_layout) => new_layout,
            Err(_) => return ptr::null_mut(),
        };
        // SAFETY: `new_layout` is as valid as the caller's `layout`.
        let new_ptr = unsafe { self.alloc(new_layout) };
        if !new_ptr.is_null() {
            let kept = usize::min(layout.size(), new_size);
            // SAFETY: `ptr` is live with `layout.size()` bytes and the
            // new block holds at least `kept` bytes; distinct blocks do
            // not overlap. Copying `MaybeUninit`-wise tolerates bytes
            // the caller never initialized.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    ptr.cast::<core::mem::MaybeUninit<u8>>(),
                    new_ptr.cast::<core::mem::MaybeUninit<u8>>(),
                    kept,
                );
                self.dealloc(ptr, layout);
            }
        }
        new_ptr
    }
}

#[cfg(test)]
mod tests {
    use crate::{Allocator, Config, Placement, Strategy};
    use core::alloc::{GlobalAlloc, Layout};
    use core::ptr;

    #[test]
    fn alignment_of_align_to() {
        // create buffer memory for proper indexing. One could use random
        // integers and cast them to pointers, but this would violate the
        // strict provenance rules and `miri` would detect that. Therefore
        // this uses a valid and suitably aligned buffer and pointers into
        // that buffer.
        #[repr(align(16))]
        struct Align([u8; 16]);
        let mut just_a_buffer_to_get_a_valid_address = Align([0_u8; 16]);
        let base: *mut u8 = ptr::addr_of_mut!(just_a_buffer_to_get_a_valid_address.0).cast();

        // create some pointers to the buffer with some offsets
        let ptr_0x10 = base;
        let ptr_0x11 = base.wrapping_add(1);
        let ptr_0x14 = base.wrapping_add(4);
        let ptr_0x1c = base.wrapping_add(0xc);
        let ptr_0x20 = base.wrapping_add(0x10);

        // the actual test for the alignment of `align_to()`
        assert_eq!(unsafe { Allocator::<32>::align_to(ptr_0x11, 4) }, ptr_0x14);
        assert_eq!(unsafe { Allocator::<32>::align_to(ptr_0x10, 4) }, ptr_0x10);

        assert_eq!(unsafe { Allocator::<32>::align_to(ptr_0x11, 1) }, ptr_0x11);

        assert_eq!(unsafe { Allocator::<32>::align_to(ptr_0x1c, 16) }, ptr_0x20);
    }

    // the following tests ensure, that a pointer with the requested
    // alignment is returned

    /// Assert the given alignment of pointers.
    macro_rules! assert_alignment {
        ($ptr:expr, $align:expr) => {{
            assert_eq!(($ptr as usize) % $align, 0, "Alignment not fulfilled");
        }};
    }

    #[test]
    fn small_alignments() {
        let allocator = Allocator::<8192>::new();

        let ptr = unsafe { allocator.alloc(Layout::from_size_align(8, 2).unwrap()) };
        assert_alignment!(ptr, 1);

        let ptr = unsafe { allocator.alloc(Layout::from_size_align(4, 8).unwrap()) };
        assert_alignment!(ptr, 8);
    }

    #[test]
    fn large_alignments() {
        let allocator = Allocator::<8192>::new();

        let ptr = unsafe { allocator.alloc(Layout::from_size_align(4, 32).unwrap()) };
        assert_alignment!(ptr, 32);

        let ptr = unsafe { allocator.alloc(Layout::from_size_align(4, 256).unwrap()) };
        assert_alignment!(ptr, 256);
        allocator.check().unwrap();
    }

    #[cfg(not(miri))] // too slow
    #[test]
    fn huge_alignment() {
        // in static memory to prevent stack overflow
        const FOUR_MEG: usize = 4 * 1024 * 1024;

        static ALLOCATOR: Allocator<{ 10 * 1024 * 1024 }> = Allocator::new();
        let ptr = unsafe { ALLOCATOR.alloc(Layout::from_size_align(4, FOUR_MEG).unwrap()) };

        assert_alignment!(ptr, FOUR_MEG);
    }

    #[test]
    fn deallocation_of_adjusted_pointers() {
        let allocator = Allocator::<8192>::new();
        let layout = Layout::from_size_align(16, 64).unwrap();

        let ptr = unsafe { allocator.alloc(layout) };
        assert_alignment!(ptr, 64);
        unsafe { allocator.dealloc(ptr, layout) };
        allocator.check().unwrap();
    }

    #[test]
    fn example_usage() {
        // do some example allocations. There is an intermediate
        // deallocation, different allocation/deallocation-orders,
        // different alignments and different sizes.
        static ALLOCATOR: Allocator<8192> = Allocator::new();

        unsafe {
            let layout1 = Layout::new::<u32>();
            let ptr1 = ALLOCATOR.alloc(layout1);
            assert_ne!(ptr1, ptr::null_mut());

            let layout2 = Layout::new::<f64>();
            let ptr2 = ALLOCATOR.alloc(layout2);
            assert_ne!(ptr2, ptr::null_mut());

            let layout3 = Layout::new::<[u16; 12]>();
            let ptr3 = ALLOCATOR.alloc(layout3);
            assert_ne!(ptr3, ptr::null_mut());

            ALLOCATOR.dealloc(ptr2, layout2);

            let layout4 = Layout::new::<[u128; 3]>();
            let ptr4 = ALLOCATOR.alloc(layout4);
            assert_ne!(ptr4, ptr::null_mut());

            let layout5 = Layout::new::<f32>();
            let ptr5 = ALLOCATOR.alloc(layout5);
            assert_ne!(ptr5, ptr::null_mut());

            ALLOCATOR.dealloc(ptr3, layout3);
            ALLOCATOR.dealloc(ptr4, layout4);
            ALLOCATOR.dealloc(ptr5, layout5);
            ALLOCATOR.dealloc(ptr1, layout1);
        }
        ALLOCATOR.check().unwrap();
    }

    #[test]
    fn realloc_through_the_global_allocator() {
        let allocator = Allocator::<8192>::new();
        let layout = Layout::from_size_align(32, 8).unwrap();

        unsafe {
            let ptr = allocator.alloc(layout);
            ptr.write_bytes(0x42, 32);

            let grown = allocator.realloc(ptr, layout, 2000);
            assert_ne!(grown, ptr::null_mut());
            for offset in 0..32 {
                assert_eq!(grown.add(offset).read(), 0x42);
            }
            allocator.dealloc(grown, Layout::from_size_align(2000, 8).unwrap());
        }
        allocator.check().unwrap();
    }

    #[test]
    fn malloc_style_entry_points() {
        let allocator = Allocator::<8192>::new();

        let ptr = allocator.allocate(100);
        assert_ne!(ptr, ptr::null_mut());
        assert_alignment!(ptr, 8);

        let grown = allocator.reallocate(ptr, 50);
        assert_eq!(grown, ptr);

        allocator.free(grown).unwrap();
        assert!(allocator.free(grown).is_err());
        allocator.check().unwrap();
    }

    #[test]
    fn every_strategy_serves_the_same_workload() {
        for strategy in [
            Strategy::ExplicitList,
            Strategy::SegregatedFit,
            Strategy::Buddy,
        ] {
            let allocator: Allocator<16384> =
                Allocator::with_config(Config::with_strategy(strategy));
            let a = allocator.allocate(100);
            let b = allocator.allocate(2000);
            let c = allocator.allocate(30);
            assert_ne!(a, ptr::null_mut());
            assert_ne!(b, ptr::null_mut());
            assert_ne!(c, ptr::null_mut());
            allocator.free(b).unwrap();
            let d = allocator.reallocate(a, 300);
            assert_ne!(d, ptr::null_mut());
            allocator.check().unwrap();
            allocator.free(c).unwrap();
            allocator.free(d).unwrap();
            allocator.check().unwrap();
        }
    }

    #[test]
    fn placement_is_configurable() {
        for placement in [Placement::FirstFit, Placement::BestFit, Placement::WorstFit] {
            let config = Config {
                strategy: Strategy::ExplicitList,
                placement,
                chunk_size: 4096,
                initial_extension_bias: 0,
            };
            let allocator: Allocator<8192> = Allocator::with_config(config);
            let ptr = allocator.allocate(64);
            assert_ne!(ptr, ptr::null_mut());
            allocator.free(ptr).unwrap();
            allocator.check().unwrap();
        }
    }
}
