#![no_std]

const HEAP_SIZE: usize = 4 * 1024 * 1024;

#[global_allocator]
static ALLOCATOR: brkalloc::Allocator<HEAP_SIZE> = brkalloc::Allocator::new();

extern crate alloc;

#[test]
fn vec() {
    let mut v = alloc::vec![1, 2, 3];
    v.push(4);

    assert_eq!((1..=4).collect::<alloc::vec::Vec<_>>(), v);
    ALLOCATOR.check().unwrap();
}

#[test]
fn map_and_formatting() {
    let mut map = alloc::collections::BTreeMap::new();
    map.insert(10, "Hello");
    map.insert(11, "world");
    map.insert(20, "Hallo");
    map.insert(21, "Welt");
    map.insert(-1, "english");
    map.insert(-2, "german");

    let english = alloc::format!("[{}]: {}, {}!", map[&-1], map[&10], map[&11]);
    let german = alloc::format!("[{}]: {}, {}!", map[&-2], map[&20], map[&21]);
    assert_eq!(english, "[english]: Hello, world!");
    assert_eq!(german, "[german]: Hallo, Welt!");
    ALLOCATOR.check().unwrap();
}

#[test]
fn growing_and_shrinking_vectors() {
    let mut grown = alloc::vec::Vec::new();
    for i in 0..10_000_u32 {
        grown.push(i);
    }
    assert_eq!(grown.iter().copied().sum::<u32>(), 49_995_000);

    grown.truncate(16);
    grown.shrink_to_fit();
    assert_eq!(grown.len(), 16);
    ALLOCATOR.check().unwrap();
}
