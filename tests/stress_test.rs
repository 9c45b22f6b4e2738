use core::ptr::NonNull;
use std::collections::HashMap;

use arenalloc::pool::Pool;
use arenalloc::{AlignedAllocator, Arena, Hashtable, ToyMemory, MAX_ALIGN};

use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};
use test_env_log::test;

fn seeded_rng() -> StdRng {
    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("Using seed {}", seed);
    StdRng::seed_from_u64(seed)
}

#[test]
fn test_pool_stress() {
    const SLOTS: usize = 64;
    const OBJECT_SIZE: usize = 24;

    let mut toy = ToyMemory::default();
    let arena = Arena::create(&mut toy, 4096).unwrap();
    let mut pool = Pool::create(&arena, OBJECT_SIZE, SLOTS).unwrap();
    let mut rng = seeded_rng();

    // Each handle remembers the tag written into its slot
    let mut handles: [Option<(NonNull<u8>, u64)>; 96] = [None; 96];
    let mut live: usize = 0;
    let mut peak: usize = 0;

    fn validate(pool: &Pool<'_>, live: usize, peak: usize) {
        let (validity, stats) = pool.stats();
        log::info!(
            "Live: {}; used: {}; Validity: {:?}, Stats: {:?}",
            live,
            pool.used_memory(),
            validity,
            stats,
        );
        assert!(validity.is_valid());
        assert_eq!(pool.used_memory(), live * OBJECT_SIZE);
        assert_eq!(stats.length, SLOTS - live);
        assert_eq!(pool.peak_memory(), peak * OBJECT_SIZE);
    }

    for step in 0..1024 * 10 {
        let chosen = handles.choose_mut(&mut rng).unwrap();
        match *chosen {
            None => match pool.allocate() {
                Some(ptr) => {
                    let tag = rng.next_u64();
                    unsafe { (ptr.as_ptr() as *mut u64).write_unaligned(tag) };
                    *chosen = Some((ptr, tag));
                    live += 1;
                    peak = peak.max(live);
                }
                None => {
                    log::info!("Step {}: pool full", step);
                    assert_eq!(live, SLOTS);
                }
            },
            Some((ptr, tag)) => {
                let found = unsafe { (ptr.as_ptr() as *const u64).read_unaligned() };
                assert_eq!(found, tag, "slot {:?} was overwritten", ptr);
                pool.free(ptr);
                *chosen = None;
                live -= 1;
            }
        }

        validate(&pool, live, peak);
    }
}

#[test]
fn test_arena_marker_stress() {
    let mut toy = ToyMemory::default();
    let mut arena = Arena::create(&mut toy, 16 * 1024).unwrap();
    let mut rng = seeded_rng();

    let sizes = Uniform::new_inclusive(0usize, 96);
    let actions = Uniform::new(0u32, 10);
    let mut markers: Vec<usize> = Vec::new();
    let mut peak = 0;

    for _ in 0..1024 * 10 {
        match actions.sample(&mut rng) {
            0..=5 => {
                let size = sizes.sample(&mut rng);
                let &align = [1usize, 2, 4, 8, 16, 64].choose(&mut rng).unwrap();
                let before = arena.used_memory();
                match arena.try_alloc(size, align) {
                    Some(ptr) => {
                        assert_eq!(ptr.as_ptr() as usize % align, 0);
                        assert!(arena.used_memory() >= before + size);
                        assert!(arena.used_memory() < before + size + align);
                        unsafe { ptr.as_ptr().write_bytes(0xEE, size) };
                    }
                    None => {
                        assert_eq!(arena.used_memory(), before);
                        arena.clear();
                        markers.clear();
                    }
                }
            }
            6..=7 => markers.push(arena.get_marker()),
            _ => {
                if let Some(marker) = markers.pop() {
                    arena.free_to_marker(marker);
                    assert_eq!(arena.used_memory(), marker);
                }
            }
        }

        peak = peak.max(arena.used_memory());
        assert_eq!(arena.peak_memory(), peak);
        assert!(arena.used_memory() <= arena.capacity());
    }
}

#[test]
fn test_hashtable_against_hashmap() {
    let mut toy = ToyMemory::default();
    let arena = Arena::create(&mut toy, 160 * 1024).unwrap();
    let table = Hashtable::create(&arena).unwrap();
    let mut model: HashMap<String, u32> = HashMap::new();
    let mut rng = seeded_rng();

    let keys = Uniform::new(0u32, 1000);
    for step in 0..1024 * 4 {
        let key = format!("key/{}", keys.sample(&mut rng));
        if step % 3 == 0 {
            assert_eq!(table.get(&key), model.get(&key).copied());
        } else {
            let value = rng.next_u32();
            let stored = table.set(&arena, &key, value).unwrap();
            assert_eq!(stored, key);
            model.insert(key, value);
        }

        assert_eq!(table.len(), model.len());
        assert!(table.len() <= table.capacity() / 2);
    }

    let mut found = 0;
    for (key, value) in table.iter() {
        assert_eq!(model.get(key), Some(&value));
        found += 1;
    }
    assert_eq!(found, model.len());
}

#[test]
fn test_aligned_stress() {
    let mut toy = ToyMemory::default();
    let mut allocator = AlignedAllocator::new(&mut toy);
    let mut rng = seeded_rng();

    let sizes = Uniform::new_inclusive(1usize, 2048);
    let mut blocks: [Option<(NonNull<u8>, usize, usize, u8)>; 32] = [None; 32];

    for _ in 0..1024 * 4 {
        let chosen = blocks.choose_mut(&mut rng).unwrap();
        match *chosen {
            None => {
                let size = sizes.sample(&mut rng);
                let &align = [1usize, 2, 4, 8, 16, 32, 64, 128, MAX_ALIGN]
                    .choose(&mut rng)
                    .unwrap();
                let fill = (rng.next_u32() & 0xFF) as u8;
                let ptr = match allocator.allocate(size, align) {
                    Ok(ptr) => ptr,
                    // The toy heap only reclaims from the top; try again later
                    Err(_) => continue,
                };
                assert_eq!(ptr.as_ptr() as usize % align, 0);
                unsafe { ptr.as_ptr().write_bytes(fill, size) };
                *chosen = Some((ptr, size, align, fill));
            }
            Some((ptr, size, align, fill)) => {
                let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
                assert!(bytes.iter().all(|&b| b == fill));
                unsafe { allocator.free(ptr, size, align) };
                *chosen = None;
            }
        }
    }

    for block in blocks.iter_mut() {
        if let Some((ptr, size, align, _)) = block.take() {
            unsafe { allocator.free(ptr, size, align) };
        }
    }
    assert_eq!(allocator.live(), 0);
    drop(allocator);
    assert_eq!(toy.reserved, 0);
}
