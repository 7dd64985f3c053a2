#[test]
fn is_usable_in_const_contexts() {
    const _ALLOCATOR1: brkalloc::Allocator<64> = brkalloc::Allocator::new();
    static _ALLOCATOR2: brkalloc::Allocator<64> = brkalloc::Allocator::new();
}

#[test]
fn configurations_are_const_too() {
    use brkalloc::{Allocator, Config, Strategy};

    const _EXPLICIT: Allocator<64> =
        Allocator::with_config(Config::with_strategy(Strategy::ExplicitList));
    static _BUDDY: Allocator<64> = Allocator::with_config(Config::with_strategy(Strategy::Buddy));
}

#[test]
fn supports_global_alloc() {
    fn assert<T: core::alloc::GlobalAlloc>(_: T) {}
    assert(brkalloc::Allocator::<64>::new())
}

#[test]
#[should_panic(expected = "too small heap memory")]
fn min_heap_size_of_at_least_32() {
    let _allocator = brkalloc::Allocator::<16>::new(); // panic here
}

#[test]
#[should_panic(expected = "divisible by 8")]
fn heap_size_must_be_a_multiple_of_8() {
    let _allocator = brkalloc::Allocator::<60>::new(); // panic here
}
