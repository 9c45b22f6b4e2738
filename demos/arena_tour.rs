//! A walk through the allocators on real virtual memory: markers and rewinds,
//! a pool, a hashtable and an aligned block.
//!
//! Run with `RUST_LOG=debug` to see regions being created and released.

use std::mem;

use arenalloc::{AlignedAllocator, Arena, Hashtable, Pool, SystemMemory, DEFAULT_ALIGNMENT};

fn main() {
    env_logger::init();

    let mut memory = SystemMemory::new();
    println!("Page size: {} bytes", arenalloc::VirtualMemory::page_size(&memory));

    {
        let mut arena = Arena::create(&mut memory, 2048).expect("reserving the arena");

        let x = arena.alloc_default(mem::size_of::<i32>()).cast::<i32>();
        unsafe { x.as_ptr().write(67) };
        println!("x: {}", unsafe { x.as_ptr().read() });

        let marker = arena.get_marker();

        let y = arena.alloc_default(mem::size_of::<i32>()).cast::<i32>();
        unsafe { y.as_ptr().write(89) };
        println!("y: {}", unsafe { y.as_ptr().read() });

        arena.free_to_marker(marker);

        // z lands where y was, so reading y now shows z's value
        let z = arena.alloc_default(mem::size_of::<i32>()).cast::<i32>();
        unsafe { z.as_ptr().write(100) };
        println!("z: {}", unsafe { z.as_ptr().read() });
        println!("y: {}", unsafe { y.as_ptr().read() });

        arena.clear();

        let w = arena.alloc_default(mem::size_of::<i32>()).cast::<i32>();
        unsafe { w.as_ptr().write(12) };
        println!("w: {}", unsafe { w.as_ptr().read() });
        println!("x: {}", unsafe { x.as_ptr().read() });

        {
            let mut pool = Pool::create(&arena, 32, 8).expect("fitting the pool");
            let slot = pool.allocate().expect("a free slot");
            pool.free(slot);
            println!(
                "Pool: {} slots of {} bytes, peak {} bytes",
                pool.capacity(),
                pool.object_size(),
                pool.peak_memory()
            );

            let table = Hashtable::create(&arena).expect("fitting the table");
            table.set(&arena, "novel", 21);
            table.set(&arena, "adriel", 22);
            println!("novel: {:?}", table.get("novel"));
            println!("adriel: {:?}", table.get("adriel"));
            println!("unknown: {:?}", table.get("unknown"));
            println!("Table: {:?}", table);
        }

        println!(
            "Arena: {} of {} bytes in use, peak {}",
            arena.used_memory(),
            arena.capacity(),
            arena.peak_memory()
        );
        arena.destroy();
    }

    let text = "Hello world";
    let mut aligned = AlignedAllocator::new(&mut memory);
    let buffer = aligned
        .allocate(text.len() + 1, DEFAULT_ALIGNMENT)
        .expect("reserving the buffer");
    let copied = unsafe {
        buffer
            .as_ptr()
            .copy_from_nonoverlapping(text.as_ptr(), text.len());
        std::str::from_utf8_unchecked(std::slice::from_raw_parts(buffer.as_ptr(), text.len()))
    };
    println!("Aligned buffer at {:p}: {}", buffer, copied);
    unsafe { aligned.free(buffer, text.len() + 1, DEFAULT_ALIGNMENT) };
    drop(aligned);

    println!(
        "Reservations still held: {} ({} pages)",
        memory.reservations(),
        memory.pages()
    );
}
