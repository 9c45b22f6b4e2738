//! Linear allocators: the arena and the stack allocator.
//!
//! Both hand out increasing offsets from one fixed-capacity region and only
//! give memory back by rewinding their cursor (the "marker"):
//!
//! ```text
//!   base                          base + marker               base + capacity
//!   │                             │                           │
//!   ▼                             ▼                           ▼
//!   ┌──────┬───┬─────────┬──────┬─────────────────────────────┐
//!   │  A1  │pad│   A2    │  A3  │         free space          │
//!   └──────┴───┴─────────┴──────┴─────────────────────────────┘
//! ```
//!
//! They differ only in where that region comes from, so both are a
//! [`LinearAllocator`](struct.LinearAllocator.html) over a different
//! [`Backing`](trait.Backing.html):
//!
//! - [`Arena`](type.Arena.html) either owns a reservation from a
//!   `VirtualMemory` provider, or is carved out of a parent arena. A carved
//!   arena borrows its parent, so the parent cannot be rewound, cleared or
//!   destroyed while the child is alive.
//! - [`StackAllocator`](type.StackAllocator.html) always owns its own
//!   reservation.
//!
//! Allocation only needs `&self`, so pools, hashtables and child arenas can
//! all share one arena. Rewinding and clearing need `&mut self`, which means
//! the borrow checker refuses them while anything built on the arena still
//! exists. Raw pointers returned by `alloc` are not tracked: after a rewind
//! the bytes they point at may be handed out again.

use core::cell::Cell;
use core::marker::PhantomData;
use core::mem;
use core::ptr::NonNull;
use core::slice;
use core::str;

use log::{debug, error, trace};

use crate::aligned::align_address;
use crate::memory::VirtualMemory;

/// Alignment used by `alloc_default` and for carving child arenas.
pub const DEFAULT_ALIGNMENT: usize = 16;

/// Where a linear allocator's region comes from, and how it is given back.
pub trait Backing {
    /// Give the region back.
    ///
    /// # Safety
    ///
    /// Called exactly once, with the region this backing produced, after the
    /// last use of any memory inside it.
    unsafe fn release(&mut self, base: NonNull<u8>, capacity: usize);

    /// Whether `release` returns address space to a provider.
    fn owns_memory(&self) -> bool;
}

/// A region reserved and committed directly from a provider.
#[derive(Debug)]
pub struct Owned<M: VirtualMemory> {
    memory: M,
}

impl<M: VirtualMemory> Owned<M> {
    fn reserve(mut memory: M, size: usize) -> Result<(Self, NonNull<u8>), M::Err> {
        let base = memory.reserve(size)?;
        unsafe { memory.commit(base, size) };
        Ok((Owned { memory }, base))
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }
}

impl<M: VirtualMemory> Backing for Owned<M> {
    unsafe fn release(&mut self, base: NonNull<u8>, capacity: usize) {
        self.memory.decommit(base, capacity);
        self.memory.release(base, capacity);
    }

    fn owns_memory(&self) -> bool {
        true
    }
}

/// An arena's region: its own reservation, or a slice of a parent arena.
#[derive(Debug)]
pub enum ArenaBacking<'p, M: VirtualMemory> {
    Provider(Owned<M>),
    Parent(PhantomData<&'p ()>),
}

impl<'p, M: VirtualMemory> Backing for ArenaBacking<'p, M> {
    unsafe fn release(&mut self, base: NonNull<u8>, capacity: usize) {
        match self {
            ArenaBacking::Provider(owned) => owned.release(base, capacity),
            // The parent owns these bytes and reclaims them with its own region.
            ArenaBacking::Parent(_) => {}
        }
    }

    fn owns_memory(&self) -> bool {
        match self {
            ArenaBacking::Provider(_) => true,
            ArenaBacking::Parent(_) => false,
        }
    }
}

/// A bump allocator over one committed region, with marker based rewinding and
/// a high-water mark.
///
/// Invariant: `marker <= capacity`, and `peak` is the largest marker ever
/// observed.
pub struct LinearAllocator<B: Backing> {
    base: NonNull<u8>,
    capacity: usize,
    marker: Cell<usize>,
    peak: Cell<usize>,
    backing: B,
}

/// A linear allocator that may be nested inside a parent arena for `'p`.
pub type Arena<'p, M> = LinearAllocator<ArenaBacking<'p, M>>;

/// A linear allocator that always owns its region.
pub type StackAllocator<M> = LinearAllocator<Owned<M>>;

impl<'p, M: VirtualMemory> LinearAllocator<ArenaBacking<'p, M>> {
    /// Reserve and commit a `size` byte arena straight from the provider.
    pub fn create(memory: M, size: usize) -> Result<Self, M::Err> {
        let (owned, base) = Owned::reserve(memory, size)?;
        debug!("Created arena of {} bytes at {:p}", size, base);
        Ok(LinearAllocator::from_parts(
            base,
            size,
            ArenaBacking::Provider(owned),
        ))
    }

    /// Carve a `size` byte arena out of this one.
    ///
    /// The child's bytes are an ordinary allocation here; dropping the child
    /// releases nothing, and they come back when this arena is rewound past
    /// them, cleared or destroyed. Panics if this arena cannot fit the child.
    pub fn child(&self, size: usize) -> Arena<'_, M> {
        let base = self.alloc(size, DEFAULT_ALIGNMENT);
        debug!("Carved child arena of {} bytes at {:p}", size, base);
        LinearAllocator::from_parts(base, size, ArenaBacking::Parent(PhantomData))
    }

    /// Whether this arena lives inside a parent arena.
    pub fn is_nested(&self) -> bool {
        !self.backing.owns_memory()
    }
}

impl<M: VirtualMemory> LinearAllocator<Owned<M>> {
    /// Reserve and commit a `size` byte stack allocator from the provider.
    pub fn create(memory: M, size: usize) -> Result<Self, M::Err> {
        let (owned, base) = Owned::reserve(memory, size)?;
        debug!("Created stack allocator of {} bytes at {:p}", size, base);
        Ok(LinearAllocator::from_parts(base, size, owned))
    }

    pub fn memory(&self) -> &M {
        self.backing.memory()
    }
}

impl<B: Backing> LinearAllocator<B> {
    fn from_parts(base: NonNull<u8>, capacity: usize, backing: B) -> Self {
        LinearAllocator {
            base,
            capacity,
            marker: Cell::new(0),
            peak: Cell::new(0),
            backing,
        }
    }

    // Padding needed to align the cursor, as (aligned offset, padding).
    fn placement(&self, align: usize) -> (usize, usize) {
        let marker = self.marker.get();
        let current = self.base.as_ptr() as usize + marker;
        let padding = align_address(current, align) - current;
        (marker + padding, padding)
    }

    /// Allocate `size` bytes aligned to `align`, or `None` if they do not fit.
    ///
    /// This is the recoverable path, for sub-allocators that report failure
    /// to their own callers. Panics only if `align` is not a power of two.
    pub fn try_alloc(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let (offset, padding) = self.placement(align);
        let end = offset.checked_add(size)?;
        if end > self.capacity {
            return None;
        }

        self.marker.set(end);
        if end > self.peak.get() {
            self.peak.set(end);
        }
        trace!(
            "Allocated {} bytes (+{} padding), {} of {} in use",
            size,
            padding,
            end,
            self.capacity
        );

        Some(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) })
    }

    /// Allocate `size` bytes aligned to `align`.
    ///
    /// Running out of space is a configuration error, not a runtime
    /// condition: the request is logged and this panics.
    pub fn alloc(&self, size: usize, align: usize) -> NonNull<u8> {
        match self.try_alloc(size, align) {
            Some(ptr) => ptr,
            None => self.exhausted(size, align),
        }
    }

    /// Allocate `size` bytes aligned to `DEFAULT_ALIGNMENT`.
    pub fn alloc_default(&self, size: usize) -> NonNull<u8> {
        self.alloc(size, DEFAULT_ALIGNMENT)
    }

    #[cold]
    fn exhausted(&self, size: usize, align: usize) -> ! {
        let (_, padding) = self.placement(align);
        let marker = self.marker.get();
        let wanted = marker.saturating_add(padding).saturating_add(size);
        error!(
            "Linear allocator requested more than total size..\
             \n\tMax size: {} bytes\
             \n\tRequested: {} bytes\
             \n\tPadding: {} bytes\
             \n\tCurrent size: {}\
             \nOver max by {} bytes",
            self.capacity,
            size,
            padding,
            marker,
            wanted - self.capacity
        );
        panic!(
            "linear allocator exhausted: {} bytes (+{} padding) requested with {} of {} bytes in use",
            size, padding, marker, self.capacity
        );
    }

    /// Move `value` into the allocator, or `None` if it does not fit.
    ///
    /// The value is never dropped.
    #[allow(clippy::mut_from_ref)]
    pub fn try_alloc_value<T>(&self, value: T) -> Option<&mut T> {
        let ptr = self
            .try_alloc(mem::size_of::<T>(), mem::align_of::<T>())?
            .cast::<T>();
        unsafe {
            ptr.as_ptr().write(value);
            Some(&mut *ptr.as_ptr())
        }
    }

    /// Move `value` into the allocator, panicking if it does not fit.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc_value<T>(&self, value: T) -> &mut T {
        let ptr = self
            .alloc(mem::size_of::<T>(), mem::align_of::<T>())
            .cast::<T>();
        unsafe {
            ptr.as_ptr().write(value);
            &mut *ptr.as_ptr()
        }
    }

    /// Allocate `len` copies of `value` as a slice.
    #[allow(clippy::mut_from_ref)]
    pub fn try_alloc_slice_fill<T: Copy>(&self, len: usize, value: T) -> Option<&mut [T]> {
        let size = mem::size_of::<T>().checked_mul(len)?;
        let ptr = self.try_alloc(size, mem::align_of::<T>())?.cast::<T>();
        unsafe {
            for i in 0..len {
                ptr.as_ptr().add(i).write(value);
            }
            Some(slice::from_raw_parts_mut(ptr.as_ptr(), len))
        }
    }

    /// Copy `s` into the allocator.
    #[allow(clippy::mut_from_ref)]
    pub fn try_alloc_str(&self, s: &str) -> Option<&mut str> {
        let ptr = self.try_alloc(s.len(), 1)?;
        unsafe {
            ptr.as_ptr()
                .copy_from_nonoverlapping(s.as_ptr(), s.len());
            let bytes = slice::from_raw_parts_mut(ptr.as_ptr(), s.len());
            Some(str::from_utf8_unchecked_mut(bytes))
        }
    }

    /// The current cursor, to be handed back to `free_to_marker` later.
    pub fn get_marker(&self) -> usize {
        self.marker.get()
    }

    /// Rewind to a marker observed earlier.
    ///
    /// Everything allocated after that marker is logically freed. The bytes
    /// are not cleared, and raw pointers into them will alias whatever is
    /// allocated next. Panics if `marker` is beyond the capacity.
    pub fn free_to_marker(&mut self, marker: usize) {
        if marker > self.capacity {
            error!(
                "Cannot rewind to marker {}, capacity is {} bytes",
                marker, self.capacity
            );
            panic!(
                "marker {} is beyond capacity {}",
                marker, self.capacity
            );
        }
        self.marker.set(marker);
        if marker > self.peak.get() {
            self.peak.set(marker);
        }
    }

    /// Rewind to the start. Peak usage is kept.
    pub fn clear(&mut self) {
        self.free_to_marker(0);
    }

    pub fn used_memory(&self) -> usize {
        self.marker.get()
    }

    /// The most memory ever in use at once, across clears and rewinds.
    pub fn peak_memory(&self) -> usize {
        self.peak.get()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.marker.get()
    }

    /// Whether `ptr` points inside this allocator's region.
    pub fn contains(&self, ptr: *const u8) -> bool {
        let base = self.base.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= base && addr < base + self.capacity
    }

    /// Give the region back. Same as dropping it.
    pub fn destroy(self) {
        drop(self)
    }
}

impl<B: Backing> Drop for LinearAllocator<B> {
    fn drop(&mut self) {
        debug!(
            "Destroying linear allocator at {:p}: {} bytes, peak {}",
            self.base,
            self.capacity,
            self.peak.get()
        );
        unsafe { self.backing.release(self.base, self.capacity) };
    }
}
