#![feature(test)]
extern crate test;
use test::Bencher;

use std::alloc::{GlobalAlloc as _, Layout};

mod repeated_allocation_deallocation {
    use super::*;

    /// Run a benchmark, which repeatedly allocates and deallocates the same
    /// block. The benchmark will allocate the given amount of blocks beforehand
    /// (before running the actual benchmark) in order to fill up the heap with
    /// unrelated allocations.
    ///
    /// # Panics
    /// This will panic, if the requested pre-allocations fill up the whole
    /// heap (so the actual benchmark cannot allocate blocks anymore).
    fn benchmark_with_preallocation(b: &mut Bencher, pre_allocations: usize) {
        let allocator = brkalloc::Allocator::<20480>::new();
        // pre-allocate much memory to see the impact of loaded free lists
        for _ in 0..pre_allocations {
            unsafe { allocator.alloc(Layout::new::<u8>()) };
        }

        let layout = Layout::new::<u8>();

        // make sure, that there is enough room for the next allocation
        let ptr = unsafe { allocator.alloc(layout) };
        assert_ne!(ptr, std::ptr::null_mut::<u8>());
        unsafe { allocator.dealloc(ptr, layout) };

        // run actual benchmark: allocate & deallocate the same block repeatedly
        b.iter(|| {
            let ptr = unsafe { allocator.alloc(layout) };
            let ptr = test::black_box(ptr);
            unsafe { allocator.dealloc(ptr, layout) };
        });
    }

    #[bench]
    fn no_memory_usage(b: &mut Bencher) {
        benchmark_with_preallocation(b, 0);
    }

    #[bench]
    fn low_memory_usage(b: &mut Bencher) {
        benchmark_with_preallocation(b, 8);
    }

    #[bench]
    fn medium_memory_usage(b: &mut Bencher) {
        benchmark_with_preallocation(b, 510);
    }

    #[bench]
    fn high_memory_usage(b: &mut Bencher) {
        benchmark_with_preallocation(b, 1020);
    }
}

mod organizations {
    use super::*;
    use brkalloc::{Allocator, Config, Strategy};

    /// The same mixed workload for each free-list organization: a bin of
    /// long-lived blocks, a churn of short-lived ones and a realloc.
    fn benchmark_strategy(b: &mut Bencher, strategy: Strategy) {
        let allocator: Allocator<65536> = Allocator::with_config(Config::with_strategy(strategy));

        let bin: Vec<*mut u8> = (0..16).map(|i| allocator.allocate(24 + i * 40)).collect();
        assert!(bin.iter().all(|ptr| !ptr.is_null()));

        b.iter(|| {
            let short = allocator.allocate(100);
            let long = allocator.allocate(900);
            let short = allocator.reallocate(short, 250);
            allocator.free(test::black_box(long)).unwrap();
            allocator.free(test::black_box(short)).unwrap();
        });
    }

    #[bench]
    fn explicit_list(b: &mut Bencher) {
        benchmark_strategy(b, Strategy::ExplicitList);
    }

    #[bench]
    fn segregated_fit(b: &mut Bencher) {
        benchmark_strategy(b, Strategy::SegregatedFit);
    }

    #[bench]
    fn buddy(b: &mut Bencher) {
        benchmark_strategy(b, Strategy::Buddy);
    }
}
