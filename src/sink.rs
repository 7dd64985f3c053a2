//! Heap memory sources.
//!
//! A [`Sink`] hands out a single contiguous region of bytes, brk-style:
//! it can only append, never shrink, and never moves bytes it has already
//! handed out. The allocator owns the interpretation of everything below
//! the break; the sink owns the mapping itself.
//!
//! Two sinks are provided: [`BufferSink`] places the heap in a
//! fixed-capacity buffer inside the allocator value (suitable for
//! `static` allocators on `no_std`-targets), and [`SbrkSink`] (behind the
//! `sbrk` feature, Unix only) moves the real program break.

use core::mem::MaybeUninit;

/// A brk-style source of heap memory.
///
/// # Safety
/// Implementors must guarantee that
/// - `region()`/`region_mut()` point to the start of a single allocation
///   that is valid for `heap_size()` bytes, is 8-aligned, and does not
///   move for as long as the sink itself does not move;
/// - `extend` is append-only: a successful `extend(n)` grows
///   `heap_size()` by exactly `n` and returns the offset of the first new
///   byte, leaving all previously extended bytes untouched;
/// - a failed `extend` leaves `heap_size()` unchanged.
pub unsafe trait Sink {
    /// Append `bytes` to the region.
    ///
    /// Returns the offset (from [`region`](Sink::region)) at which the
    /// new bytes begin, or `None` if the sink cannot grow any further.
    fn extend(&mut self, bytes: usize) -> Option<usize>;

    /// The number of bytes extended so far.
    fn heap_size(&self) -> usize;

    /// The lowest address of the region.
    fn region(&self) -> *const u8;

    /// The lowest address of the region, for writing.
    fn region_mut(&mut self) -> *mut u8;
}

/// A fixed-capacity sink backed by storage inside the value itself.
///
/// The break starts at zero and advances through the buffer until the
/// capacity is exhausted. The storage is uninitialized; only words the
/// allocator has written are ever read back.
#[repr(align(8))]
pub struct BufferSink<const N: usize> {
    bytes: [MaybeUninit<u8>; N],
    brk: usize,
}

impl<const N: usize> BufferSink<N> {
    /// Create an empty sink.
    ///
    /// This function is a `const fn`, so the sink (and an allocator
    /// around it) can live in a `static`.
    ///
    /// # Panics
    /// This function panics if the capacity is not a multiple of 8 (the
    /// payload alignment of the block layout).
    pub const fn new() -> Self {
        assert!(N % 8 == 0, "memory size has to be divisible by 8");
        Self {
            bytes: [MaybeUninit::uninit(); N],
            brk: 0,
        }
    }
}

// SAFETY: the buffer is one inline allocation, 8-aligned via
// `repr(align)`; `brk` only ever advances and is bounded by `N`, so every
// extended byte stays inside `bytes`.
unsafe impl<const N: usize> Sink for BufferSink<N> {
    fn extend(&mut self, bytes: usize) -> Option<usize> {
        let new_brk = self.brk.checked_add(bytes)?;
        if new_brk > N {
            return None;
        }
        let offset = self.brk;
        self.brk = new_brk;
        Some(offset)
    }

    fn heap_size(&self) -> usize {
        self.brk
    }

    fn region(&self) -> *const u8 {
        self.bytes.as_ptr().cast()
    }

    fn region_mut(&mut self) -> *mut u8 {
        self.bytes.as_mut_ptr().cast()
    }
}

/// The program break, moved via `sbrk(2)`.
///
/// Nothing is requested from the system until the first extension. The
/// first extension also rounds the break up to an 8-byte boundary, since
/// `sbrk` itself makes no alignment promise. If some other part of the
/// process moves the break between extensions, the region would no longer
/// be contiguous; such an extension is refused.
#[cfg(all(feature = "sbrk", unix))]
pub struct SbrkSink {
    base: *mut u8,
    size: usize,
}

#[cfg(all(feature = "sbrk", unix))]
impl SbrkSink {
    /// Create a sink over the current program break.
    pub const fn new() -> Self {
        Self {
            base: core::ptr::null_mut(),
            size: 0,
        }
    }
}

// SAFETY: `sbrk` appends to the single program-break region; the first
// extension aligns the claimed base to 8 bytes and later extensions are
// verified to continue exactly at `base + size`.
#[cfg(all(feature = "sbrk", unix))]
unsafe impl Sink for SbrkSink {
    fn extend(&mut self, bytes: usize) -> Option<usize> {
        if self.base.is_null() {
            // SAFETY: `sbrk(0)` only queries the current break.
            let current = unsafe { libc::sbrk(0) };
            if current as isize == -1 {
                return None;
            }
            let pad = (current as usize).wrapping_neg() % 8;
            let request = isize::try_from(bytes.checked_add(pad)?).ok()?;
            // SAFETY: moving the break is this sink's purpose; the kernel
            // either grants the bytes or reports failure without moving.
            let old = unsafe { libc::sbrk(request) };
            if old as isize == -1 {
                return None;
            }
            self.base = old.cast::<u8>().wrapping_add(pad);
            self.size = bytes;
            Some(0)
        } else {
            let request = isize::try_from(bytes).ok()?;
            // SAFETY: as above.
            let old = unsafe { libc::sbrk(request) };
            if old as isize == -1 {
                return None;
            }
            if old.cast::<u8>() != self.base.wrapping_add(self.size) {
                // Someone else moved the break; the new bytes are not
                // contiguous with the region and cannot be used.
                return None;
            }
            let offset = self.size;
            self.size += bytes;
            Some(offset)
        }
    }

    fn heap_size(&self) -> usize {
        self.size
    }

    fn region(&self) -> *const u8 {
        self.base
    }

    fn region_mut(&mut self) -> *mut u8 {
        self.base
    }
}
