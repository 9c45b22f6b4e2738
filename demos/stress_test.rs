//! An example program that carves a pool and a hashtable out of one arena on
//! real virtual memory, churns through a large number of slots and keys, and
//! checks validity along the way.

use std::ptr::NonNull;

use arenalloc::pool::Pool;
use arenalloc::{Arena, Hashtable, SystemMemory};

use rand::distributions::{Distribution, Uniform};
use rand::{RngCore, SeedableRng};

// Total number of pool operations
const STEPS: usize = 64 * 1024;
// Slots in the pool
const SLOTS: usize = 1024;
// Log_2 of the arena size
const LOG2_ARENA_SIZE: usize = 22;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.contains(&"--help".to_owned()) {
        println!("USAGE: {} [STEPS] [SLOTS] [LOG2_ARENA_SIZE]", args[0]);
        return;
    }
    let steps: usize = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(STEPS);
    let slots: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(SLOTS);
    let log2_arena_size: usize = args
        .get(3)
        .and_then(|s| s.parse().ok())
        .unwrap_or(LOG2_ARENA_SIZE);

    env_logger::init();
    println!("Running Stress Test.\n\nParameters:");
    println!("    {} total steps", steps);
    println!("    {} pool slots", slots);
    println!("    2^{} byte arena", log2_arena_size);

    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("Using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);

    let mut memory = SystemMemory::new();
    let arena = Arena::create(&mut memory, 1 << log2_arena_size).expect("reserving the arena");
    let mut pool = Pool::create(&arena, 64, slots).expect("fitting the pool");
    let table = Hashtable::create(&arena).expect("fitting the table");

    let mut live: Vec<NonNull<u8>> = Vec::new();
    let coin = Uniform::new(0u32, 4);

    for i in 1..=steps {
        if coin.sample(&mut rng) < 3 {
            match pool.allocate() {
                Some(ptr) => live.push(ptr),
                None => log::debug!("Pool full at step {}", i),
            }
        } else if !live.is_empty() {
            let ix = Uniform::new(0, live.len()).sample(&mut rng);
            pool.free(live.swap_remove(ix));
        }

        if i % 16 == 0 {
            let key = format!("step-{}", i % 4096);
            if table.set(&arena, &key, i).is_none() {
                println!("Arena too small to keep growing the table at step {}", i);
                break;
            }
        }

        let (validity, stats) = pool.stats();
        if i % 4096 == 0 {
            println!("Step {} / {}", i, steps);
            println!("    Live slots: {}, free: {}", live.len(), stats.length);
            println!("    Table keys: {} in {} slots", table.len(), table.capacity());
            println!("    Arena: {} / {} bytes", arena.used_memory(), arena.capacity());
        }
        assert!(validity.is_valid());
        assert_eq!(live.len() + stats.length, slots);
    }

    for ptr in live.drain(..) {
        pool.free(ptr);
    }

    let (validity, stats) = pool.stats();
    println!("\nFinished.");
    println!("    Pool stats:  {:?}", stats);
    println!("    Pool peak:   {} bytes", pool.peak_memory());
    println!("    Arena peak:  {} bytes", arena.peak_memory());
    assert!(validity.is_valid());
}
