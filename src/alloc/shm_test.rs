use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use std::{sync::Arc, thread};

use super::*;
use crate::{
    buffer::{BufferFactory, HeapFactory},
    chunk::ChunkManager,
};

fn new_allocator(name: &str, chunk_size: usize) -> ShmAllocator {
    HeapFactory::unlink(name);
    let factory: Arc<dyn BufferFactory> = Arc::new(HeapFactory::new());
    let chunks = ChunkManager::create(factory, name, chunk_size, true).unwrap();
    ShmAllocator::create(chunks).unwrap()
}

#[test]
fn test_allocate() {
    let alc = new_allocator("test_alloc_allocate", 1024);
    let ptr = alc.allocate(128).unwrap();
    assert!(!ptr.is_null());
    assert!(alc.capacity_of(ptr) >= 128);
    alc.validate().unwrap();
}

#[test]
fn test_allocate_deallocate() {
    let alc = new_allocator("test_alloc_free", 1024);
    let stats = alc.validate().unwrap();
    let initial_free = stats.free_bytes;

    let ptr = alc.allocate(128).unwrap();
    alc.validate().unwrap();
    assert!(alc.deallocate(ptr));

    // freeing the same pointer again fails.
    assert!(!alc.deallocate(ptr));
    // freeing null fails.
    assert!(!alc.deallocate(std::ptr::null_mut()));

    // allocate and free returns the store to its free byte count.
    let stats = alc.validate().unwrap();
    assert_eq!(stats.free_bytes, initial_free);
}

#[test]
fn test_multiple_allocations() {
    let alc = new_allocator("test_alloc_multi", 1024);
    let ptr1 = alc.allocate(128).unwrap();
    let ptr2 = alc.allocate(256).unwrap();
    assert_ne!(ptr1, ptr2);
    assert!(alc.capacity_of(ptr1) >= 128);
    assert!(alc.capacity_of(ptr2) >= 256);

    // payloads do not overlap.
    unsafe {
        std::ptr::write_bytes(ptr1, 0xAA, 128);
        std::ptr::write_bytes(ptr2, 0xBB, 256);
        assert!((0..128).all(|i| ptr1.add(i).read() == 0xAA));
        assert!((0..256).all(|i| ptr2.add(i).read() == 0xBB));
    }

    assert!(alc.deallocate(ptr1));
    assert!(alc.deallocate(ptr2));
    alc.validate().unwrap();
}

#[test]
fn test_index_roundtrip() {
    let alc = new_allocator("test_alloc_index", 1024);
    let ptr = alc.allocate(64).unwrap();
    let index = alc.to_index(ptr);
    assert_eq!(alc.to_ptr(index).unwrap(), ptr);
    assert_eq!(alc.capacity_at(index), alc.capacity_of(ptr));
    assert!(alc.deallocate_at(index));
}

#[test]
fn test_allocate_grows_chunks() {
    let alc = new_allocator("test_alloc_grow", 256);
    // larger than the whole first chunk; forces doubling growth.
    let ptr = alc.allocate(4000).unwrap();
    assert!(alc.capacity_of(ptr) >= 4000);
    unsafe { std::ptr::write_bytes(ptr, 0xCD, 4000) };

    let ptr2 = alc.allocate(16).unwrap();
    assert!(!ptr2.is_null());
    unsafe { assert!((0..4000).all(|i| ptr.add(i).read() == 0xCD)) };
    alc.validate().unwrap();
}

#[test]
fn test_memory_recycling() {
    let alc = new_allocator("test_alloc_recycle", 4096);
    let ptr1 = alc.allocate(1024).unwrap();
    unsafe { std::ptr::write_bytes(ptr1, b'a', 1024) };
    assert!(alc.deallocate(ptr1));

    let mut ptrs = vec![];
    for (i, fill) in [b'b', b'c', b'd'].iter().enumerate() {
        let ptr = alc.allocate(256).unwrap();
        unsafe { std::ptr::write_bytes(ptr, *fill, 256) };
        // no aliasing with earlier live allocations.
        for (_, prev) in ptrs.iter().take(i) {
            let prev: *mut u8 = *prev;
            assert!(
                (ptr as usize) + 256 <= prev as usize || (prev as usize) + 256 <= ptr as usize
            );
        }
        ptrs.push((*fill, ptr));
    }

    // earlier payloads were not clobbered.
    for (fill, ptr) in ptrs.iter() {
        unsafe { assert!((0..256).all(|i| ptr.add(i).read() == *fill)) };
    }
    for (_, ptr) in ptrs {
        assert!(alc.deallocate(ptr));
    }
    alc.validate().unwrap();
}

#[test]
fn test_allocator_reattach() {
    let name = "test_alloc_reattach";
    let alc = new_allocator(name, 1024);
    let ptr = alc.allocate(100).unwrap();
    unsafe { std::ptr::write_bytes(ptr, 0x5A, 100) };
    let index = alc.to_index(ptr);
    std::mem::drop(alc);

    let factory: Arc<dyn BufferFactory> = Arc::new(HeapFactory::new());
    let chunks = ChunkManager::create(factory, name, 1024, true).unwrap();
    let alc = ShmAllocator::create(chunks).unwrap();
    let ptr = alc.to_ptr(index).unwrap();
    unsafe { assert!((0..100).all(|i| ptr.add(i).read() == 0x5A)) };
    assert!(alc.deallocate(ptr));
    alc.validate().unwrap();
}

#[test]
fn test_concurrent_allocations() {
    let alc = Arc::new(new_allocator("test_alloc_threads", 1024));
    let mut handles = vec![];
    for _ in 0..8 {
        let alc = Arc::clone(&alc);
        handles.push(thread::spawn(move || {
            let ptr1 = alc.allocate(128).unwrap();
            let ptr2 = alc.allocate(256).unwrap();
            assert_ne!(ptr1, ptr2);
            assert!(alc.capacity_of(ptr1) >= 128);
            assert!(alc.capacity_of(ptr2) >= 256);
            assert!(alc.deallocate(ptr1));
            assert!(alc.deallocate(ptr2));
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    alc.validate().unwrap();
}

#[test]
fn test_allocator_stress() {
    let seed: u64 = random();
    println!("test_allocator_stress seed:{}", seed);

    let alc = Arc::new(new_allocator("test_alloc_stress", 4096));

    let n_threads = std::cmp::max(num_cpus::get(), 8) as u64;
    let mut handles = vec![];
    for t in 0..n_threads {
        let alc = Arc::clone(&alc);
        handles.push(thread::spawn(move || {
            let mut rng = SmallRng::seed_from_u64(seed + t);
            for i in 0..1000_u64 {
                let size = (rng.gen::<usize>() % 511) + 1;
                let fill = (t as u8).wrapping_mul(31).wrapping_add(i as u8);
                let ptr = alc.allocate(size).unwrap();
                unsafe {
                    std::ptr::write_bytes(ptr, fill, size);
                    assert!((0..size).all(|j| ptr.add(j).read() == fill));
                }
                assert!(alc.deallocate(ptr));
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // nothing leaked: every usable byte is back on the free list.
    let stats = alc.validate().unwrap();
    assert_eq!(stats.n_marked, 0);
    assert_eq!(stats.free_bytes, alc.capacity() - STATE_SIZE);
}
