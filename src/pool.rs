//! A fixed-size slot allocator carved from an arena.
//!
//! The slots of a free pool are threaded into a singly linked list: the first
//! word of every free slot holds the index of the next free slot, or
//! `END_OF_LIST`. Allocation pops the head and freeing pushes onto it, so the
//! most recently freed slot is always the next one handed out.

use core::fmt;
use core::marker::PhantomData;
use core::mem;
use core::ptr::NonNull;

use log::{debug, error};
use static_assertions::const_assert;

use crate::linear::{Backing, LinearAllocator, DEFAULT_ALIGNMENT};

const LINK_SIZE: usize = mem::size_of::<usize>();
const END_OF_LIST: usize = usize::MAX;
// No slot index can reach the sentinel: a region is at most isize::MAX bytes.
const_assert!(END_OF_LIST > isize::MAX as usize);

pub struct Pool<'a> {
    mem: NonNull<u8>,
    free_list_head: Option<usize>,
    size: usize,
    used_size: usize,
    peak_size: usize,
    object_count: usize,
    object_size: usize,
    _arena: PhantomData<&'a ()>,
}

impl<'a> Pool<'a> {
    /// Create a pool of `count` slots of `object_size` bytes, aligned to
    /// `DEFAULT_ALIGNMENT`.
    pub fn create<B: Backing>(
        arena: &'a LinearAllocator<B>,
        object_size: usize,
        count: usize,
    ) -> Option<Self> {
        Pool::create_aligned(arena, object_size, count, DEFAULT_ALIGNMENT)
    }

    /// Create a pool of `count` slots of `object_size` bytes, with the first
    /// slot aligned to `align`.
    ///
    /// Returns `None` if the arena cannot fit the slots. Panics if a slot is
    /// smaller than a `usize`, or if `count` is zero.
    pub fn create_aligned<B: Backing>(
        arena: &'a LinearAllocator<B>,
        object_size: usize,
        count: usize,
        align: usize,
    ) -> Option<Self> {
        if object_size < LINK_SIZE {
            error!(
                "Pool slots of {} bytes cannot hold a {} byte free list link",
                object_size, LINK_SIZE
            );
            panic!("Pool allocator only supports objects at least as big as a pointer");
        }
        assert!(count > 0, "Pool allocator needs at least one slot");

        let bytes_needed = object_size.checked_mul(count)?;
        let mem = arena.try_alloc(bytes_needed, align)?;

        let mut pool = Pool {
            mem,
            free_list_head: None,
            size: bytes_needed,
            used_size: 0,
            peak_size: 0,
            object_count: count,
            object_size,
            _arena: PhantomData,
        };
        pool.thread_free_list();

        debug!(
            "Created pool of {} x {} bytes at {:p}",
            count, object_size, mem
        );
        Some(pool)
    }

    fn slot(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.object_count);
        unsafe { self.mem.as_ptr().add(index * self.object_size) }
    }

    fn read_link(&self, index: usize) -> Option<usize> {
        let next = unsafe { (self.slot(index) as *const usize).read_unaligned() };
        match next {
            END_OF_LIST => None,
            next => Some(next),
        }
    }

    fn write_link(&mut self, index: usize, next: Option<usize>) {
        let next = next.unwrap_or(END_OF_LIST);
        unsafe { (self.slot(index) as *mut usize).write_unaligned(next) };
    }

    fn thread_free_list(&mut self) {
        for index in 0..self.object_count {
            let next = index + 1;
            let link = if next < self.object_count {
                Some(next)
            } else {
                None
            };
            self.write_link(index, link);
        }
        self.free_list_head = Some(0);
    }

    /// Take a slot, or `None` if every slot is in use.
    pub fn allocate(&mut self) -> Option<NonNull<u8>> {
        let index = match self.free_list_head {
            Some(index) => index,
            None => {
                debug!("Pool at {:p} is exhausted", self.mem);
                return None;
            }
        };

        self.free_list_head = self.read_link(index);
        self.used_size += self.object_size;
        self.peak_size = self.peak_size.max(self.used_size);

        Some(unsafe { NonNull::new_unchecked(self.slot(index)) })
    }

    /// Give a slot back.
    ///
    /// Panics if `ptr` is not the start of a slot in this pool, or if no slot
    /// is in use. Debug builds also panic whenever the slot is already free.
    pub fn free(&mut self, ptr: NonNull<u8>) {
        let index = self.index_of(ptr);
        debug_assert!(
            !self.is_free(index),
            "slot {} at {:p} was freed twice",
            index,
            ptr
        );

        let used_size = match self.used_size.checked_sub(self.object_size) {
            Some(used_size) => used_size,
            None => {
                error!(
                    "Freed slot {} at {:p} while no slot of the pool is in use",
                    index, ptr
                );
                panic!("slot {} at {:p} was freed twice", index, ptr);
            }
        };

        let head = self.free_list_head;
        self.write_link(index, head);
        self.free_list_head = Some(index);
        self.used_size = used_size;
    }

    fn index_of(&self, ptr: NonNull<u8>) -> usize {
        let base = self.mem.as_ptr() as usize;
        let addr = ptr.as_ptr() as usize;
        if addr < base || addr >= base + self.size || (addr - base) % self.object_size != 0 {
            error!(
                "{:p} is not a slot of the pool at {:p} ({} x {} bytes)",
                ptr, self.mem, self.object_count, self.object_size
            );
            panic!("Pointer does not belong to this pool");
        }
        (addr - base) / self.object_size
    }

    // Walks the free list, so only for debug checks.
    fn is_free(&self, index: usize) -> bool {
        let mut next = self.free_list_head;
        let mut steps = 0;
        while let Some(current) = next {
            if current == index {
                return true;
            }
            steps += 1;
            if steps > self.object_count || current >= self.object_count {
                // Corrupt list; `stats` reports it.
                return false;
            }
            next = self.read_link(current);
        }
        false
    }

    /// Mark every slot free again. Peak usage is kept.
    pub fn clear(&mut self) {
        self.thread_free_list();
        self.used_size = 0;
    }

    pub fn used_memory(&self) -> usize {
        self.used_size
    }

    pub fn peak_memory(&self) -> usize {
        self.peak_size
    }

    pub fn object_size(&self) -> usize {
        self.object_size
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.object_count
    }

    /// Slots that can still be allocated.
    pub fn available(&self) -> usize {
        self.object_count - self.used_size / self.object_size
    }

    /// Walk the free list, and check it against the usage counters.
    pub fn stats(&self) -> (Validity, Stats) {
        let mut validity: Validity = Default::default();
        let mut stats: Stats = Default::default();

        let mut next = self.free_list_head;
        while let Some(index) = next {
            if index >= self.object_count {
                // Points outside the pool. This is really bad.
                validity.out_of_range += 1;
                break;
            }
            if stats.length >= self.object_count {
                // More free slots than slots: the list loops back on itself.
                validity.cycles += 1;
                break;
            }

            stats.length += 1;
            stats.size += self.object_size;
            next = self.read_link(index);
        }

        if stats.size + self.used_size != self.size {
            validity.miscounted = true;
        }

        (validity, stats)
    }
}

impl<'a> fmt::Debug for Pool<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("mem", &self.mem)
            .field("object_size", &self.object_size)
            .field("object_count", &self.object_count)
            .field("used_size", &self.used_size)
            .field("peak_size", &self.peak_size)
            .field("free_list_head", &self.free_list_head)
            .finish()
    }
}

/// Validity contains a representation of all invalid states found in a
/// Pool's free list.
#[derive(Default, Debug)]
pub struct Validity {
    /// Links pointing past the last slot.
    pub out_of_range: usize,
    /// Times the list was found revisiting a slot.
    pub cycles: usize,
    /// Free bytes plus used bytes do not add up to the pool size.
    pub miscounted: bool,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        self.out_of_range == 0 && self.cycles == 0 && !self.miscounted
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

#[derive(Default, Debug)]
pub struct Stats {
    /// Free slots.
    pub length: usize,
    /// Free bytes.
    pub size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::linear::Arena;
    use crate::memory::ToyMemory;
    use test_env_log::test;

    #[test]
    fn test_exhaustion_and_reuse() {
        let mut toy = ToyMemory::default();
        let arena = Arena::create(&mut toy, 4096).unwrap();
        let mut pool = Pool::create(&arena, 32, 4).unwrap();
        assert_eq!(arena.used_memory(), 128);

        let slots: Vec<NonNull<u8>> = (0..4).map(|_| pool.allocate().unwrap()).collect();
        for pair in slots.windows(2) {
            assert_eq!(pair[1].as_ptr() as usize - pair[0].as_ptr() as usize, 32);
        }
        assert_eq!(pool.used_memory(), 128);
        assert_eq!(pool.available(), 0);
        assert!(pool.allocate().is_none());

        // The freed slot is the next one out
        pool.free(slots[2]);
        assert_eq!(pool.allocate(), Some(slots[2]));

        pool.free(slots[0]);
        pool.free(slots[3]);
        assert_eq!(pool.allocate(), Some(slots[3]));
        assert_eq!(pool.allocate(), Some(slots[0]));
        assert!(pool.allocate().is_none());

        let (validity, stats) = pool.stats();
        assert!(validity.is_valid());
        assert_eq!(stats.length, 0);
    }

    #[test]
    fn test_slots_hold_data() {
        let mut toy = ToyMemory::default();
        let arena = Arena::create(&mut toy, 4096).unwrap();
        let mut pool = Pool::create_aligned(&arena, 16, 8, 64).unwrap();

        let first = pool.allocate().unwrap();
        assert_eq!(first.as_ptr() as usize % 64, 0);
        let second = pool.allocate().unwrap();

        unsafe {
            (first.as_ptr() as *mut [u64; 2]).write([1, 2]);
            (second.as_ptr() as *mut [u64; 2]).write([3, 4]);
            assert_eq!((first.as_ptr() as *const [u64; 2]).read(), [1, 2]);
        }

        pool.free(second);
        let (validity, stats) = pool.stats();
        assert!(validity.is_valid());
        assert_eq!(stats.length, 7);
        assert_eq!(stats.size, 7 * 16);
        assert_eq!(unsafe { (first.as_ptr() as *const [u64; 2]).read() }, [1, 2]);
    }

    #[test]
    fn test_peak_and_clear() {
        let mut toy = ToyMemory::default();
        let arena = Arena::create(&mut toy, 4096).unwrap();
        let mut pool = Pool::create(&arena, 8, 10).unwrap();

        for _ in 0..6 {
            pool.allocate().unwrap();
        }
        assert_eq!(pool.used_memory(), 48);

        pool.clear();
        assert_eq!(pool.used_memory(), 0);
        assert_eq!(pool.peak_memory(), 48);
        assert_eq!(pool.available(), 10);

        for _ in 0..10 {
            pool.allocate().unwrap();
        }
        assert_eq!(pool.peak_memory(), 80);
        assert!(pool.stats().0.is_valid());
    }

    #[test]
    fn test_arena_too_small() {
        let mut toy = ToyMemory::default();
        let arena = Arena::create(&mut toy, 64).unwrap();
        assert!(Pool::create(&arena, 16, 5).is_none());
        assert_eq!(arena.used_memory(), 0);
    }

    #[test]
    #[should_panic(expected = "at least as big as a pointer")]
    fn test_rejects_small_objects() {
        let mut toy = ToyMemory::default();
        let arena = Arena::create(&mut toy, 1024).unwrap();
        let _ = Pool::create(&arena, 2, 10);
    }

    #[test]
    #[should_panic(expected = "does not belong to this pool")]
    fn test_rejects_foreign_pointer() {
        let mut toy = ToyMemory::default();
        let arena = Arena::create(&mut toy, 1024).unwrap();
        let mut pool = Pool::create(&arena, 16, 4).unwrap();
        let outside = arena.alloc(16, 16);
        pool.free(outside);
    }

    #[test]
    #[should_panic(expected = "does not belong to this pool")]
    fn test_rejects_misaligned_pointer() {
        let mut toy = ToyMemory::default();
        let arena = Arena::create(&mut toy, 1024).unwrap();
        let mut pool = Pool::create(&arena, 16, 4).unwrap();
        let slot = pool.allocate().unwrap();
        pool.free(unsafe { NonNull::new_unchecked(slot.as_ptr().add(4)) });
    }

    #[test]
    #[should_panic(expected = "freed twice")]
    fn test_free_with_nothing_in_use() {
        let mut toy = ToyMemory::default();
        let arena = Arena::create(&mut toy, 1024).unwrap();
        let mut pool = Pool::create(&arena, 16, 4).unwrap();
        let slot = pool.allocate().unwrap();
        pool.clear();
        // Caught by the usage counter even where the free list walk is off
        pool.free(slot);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "freed twice")]
    fn test_double_free() {
        let mut toy = ToyMemory::default();
        let arena = Arena::create(&mut toy, 1024).unwrap();
        let mut pool = Pool::create(&arena, 16, 4).unwrap();
        let slot = pool.allocate().unwrap();
        pool.free(slot);
        pool.free(slot);
    }
}
