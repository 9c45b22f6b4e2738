#![cfg_attr(not(test), no_std)]

//! Composable allocators built on virtual memory.
//!
//! ## Overview
//!
//! Everything here is layered on a [`VirtualMemory`](memory/trait.VirtualMemory.html)
//! provider, which reserves, commits, decommits and releases address space:
//!
//! ```text
//!   VirtualMemory ──┬── AlignedAllocator     one reservation per block
//!                   │
//!                   ├── StackAllocator       linear, owns its region
//!                   │
//!                   └── Arena                linear, owns its region ...
//!                         ├── Arena          ... or is carved from a parent
//!                         ├── Pool           fixed-size slots
//!                         └── Hashtable      string keys, open addressing
//! ```
//!
//! An arena is the unit of bulk reclamation. Pools, hashtables and child
//! arenas built on it borrow it, so it cannot be rewound, cleared or
//! destroyed while any of them is alive, and none of them ever give memory
//! back on their own.
//!
//! ## Failure
//!
//! Running an arena or stack allocator out of space, asking for an alignment
//! that is not a power of two (or above 256 for the aligned allocator),
//! rewinding past the capacity and freeing a foreign pointer into a pool are
//! programming errors: they are logged and then panic. Failing to reserve
//! memory from the provider, running a pool dry, and running out of arena
//! space while growing a hashtable are reported to the caller as `Err` or
//! `None`.
//!
//! ## Threads
//!
//! None of these types are `Sync`. Each allocator is meant to have one owner.

pub mod aligned;
pub mod hashtable;
pub mod linear;
pub mod memory;
pub mod pool;

pub use aligned::{align_address, align_pointer, AlignedAllocator, MAX_ALIGN};
pub use hashtable::{hash_key, Hashtable, INITIAL_CAPACITY};
pub use linear::{
    Arena, ArenaBacking, Backing, LinearAllocator, Owned, StackAllocator, DEFAULT_ALIGNMENT,
};
#[cfg(feature = "use_libc")]
pub use memory::SystemMemory;
pub use memory::{Protection, ToyMemory, ToyMemoryExhausted, VirtualMemory};
pub use pool::Pool;
