//! Virtual memory providers, the layer every allocator in this crate sits on.
//!
//! ## Basic Types
//!
//! ### [`VirtualMemory`](trait.VirtualMemory.html)
//!
//! `VirtualMemory` is a simple trait interface meant to abstract over the calls
//! to the OS to reserve, commit, decommit and release address space.
//!
//! ### [`SystemMemory`](struct.SystemMemory.html)
//!
//! A `SystemMemory` uses `libc` to map pages from the Unix OS. Reserved pages
//! are mapped with no access at all, and only become readable and writable
//! once committed.
//!
//! ### [`ToyMemory`](struct.ToyMemory.html)
//!
//! `ToyMemory` is a static array that can pretend to be the OS. A mutable
//! borrow of it implements `VirtualMemory` for such a purpose. It is mainly
//! useful for testing.

use core::fmt;
use core::ops::BitOr;
use core::ptr::NonNull;

#[cfg(feature = "use_libc")]
use errno::Errno;
#[cfg(feature = "use_libc")]
use log::{error, trace};

// Round up value to the nearest multiple of increment
pub fn round_up(value: usize, increment: usize) -> usize {
    if value == 0 {
        return 0;
    }
    increment * ((value - 1) / increment + 1)
}

/// Access flags for committed memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Protection(u32);

impl Protection {
    pub const NONE: Protection = Protection(0);
    pub const READ: Protection = Protection(1 << 0);
    pub const WRITE: Protection = Protection(1 << 1);
    pub const EXEC: Protection = Protection(1 << 2);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Protection) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Protection {
    type Output = Protection;

    fn bitor(self, rhs: Protection) -> Protection {
        Protection(self.0 | rhs.0)
    }
}

pub trait VirtualMemory {
    type Err;

    /// The granularity every request is rounded up to.
    fn page_size(&self) -> usize;

    /// Reserve at least `size` bytes of address space. The memory is not
    /// usable until it has been committed.
    ///
    /// The range must stay where it is when the provider value is moved.
    /// A provider whose pages live inside itself implements this trait for a
    /// mutable borrow of itself instead, so the borrow pins it.
    fn reserve(&mut self, size: usize) -> Result<NonNull<u8>, Self::Err>;

    /// Make a reserved range readable and writable. Failure is fatal.
    ///
    /// # Safety
    ///
    /// `ptr..ptr + size` must lie inside a range returned by `reserve` on this
    /// provider that has not been released.
    unsafe fn commit(&mut self, ptr: NonNull<u8>, size: usize);

    /// Hand the pages backing a range back to the OS, keeping the addresses.
    ///
    /// # Safety
    ///
    /// Same as `commit`. Nothing may read the range afterwards without
    /// committing it again.
    unsafe fn decommit(&mut self, ptr: NonNull<u8>, size: usize);

    /// Give the address range back entirely.
    ///
    /// # Safety
    ///
    /// `ptr` and `size` must match a prior `reserve` of the same or larger
    /// extent, and nothing may touch the range afterwards.
    unsafe fn release(&mut self, ptr: NonNull<u8>, size: usize);

    /// Change the access flags of a committed range.
    ///
    /// # Safety
    ///
    /// Same as `commit`; removing access from memory that is still in use
    /// will fault.
    unsafe fn set_protection(&mut self, ptr: NonNull<u8>, size: usize, protection: Protection);
}

// A provider borrowed mutably is still a provider, so one `SystemMemory` can
// back several allocators in turn.
impl<M: VirtualMemory + ?Sized> VirtualMemory for &mut M {
    type Err = M::Err;

    fn page_size(&self) -> usize {
        (**self).page_size()
    }

    fn reserve(&mut self, size: usize) -> Result<NonNull<u8>, Self::Err> {
        (**self).reserve(size)
    }

    unsafe fn commit(&mut self, ptr: NonNull<u8>, size: usize) {
        (**self).commit(ptr, size)
    }

    unsafe fn decommit(&mut self, ptr: NonNull<u8>, size: usize) {
        (**self).decommit(ptr, size)
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>, size: usize) {
        (**self).release(ptr, size)
    }

    unsafe fn set_protection(&mut self, ptr: NonNull<u8>, size: usize, protection: Protection) {
        (**self).set_protection(ptr, size, protection)
    }
}

/// SystemMemory uses virtual memory pages from the OS.
///
/// The page size is read once, when the provider is constructed, and carried
/// along with it from then on.
#[cfg(feature = "use_libc")]
#[derive(Debug)]
pub struct SystemMemory {
    page_size: usize,
    // Just for tracking, not really needed
    pages: usize,
    reservations: usize,
}

#[cfg(feature = "use_libc")]
impl Default for SystemMemory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "use_libc")]
impl SystemMemory {
    pub fn new() -> Self {
        SystemMemory {
            page_size: sysconf::page::pagesize(),
            pages: 0,
            reservations: 0,
        }
    }

    /// Pages currently reserved through this provider.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Reservations not yet released.
    pub fn reservations(&self) -> usize {
        self.reservations
    }

    // Every call must agree on the span, or release would unmap too little.
    fn span(&self, size: usize) -> usize {
        round_up(size, self.page_size).max(self.page_size)
    }
}

#[cfg(feature = "use_libc")]
impl VirtualMemory for SystemMemory {
    type Err = Errno;

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn reserve(&mut self, size: usize) -> Result<NonNull<u8>, Errno> {
        let to_reserve = self.span(size);

        let ptr = unsafe {
            libc::mmap(
                // Address we want the memory at. We don't care, so null it is.
                core::ptr::null_mut(),
                to_reserve,
                // No access until the range is committed
                libc::PROT_NONE,
                // MAP_ANON: We don't want a file descriptor, we're just going to
                //   use the memory.
                //
                // MAP_PRIVATE: We're not sharing this with any other process.
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(errno::errno());
        }

        let ptr = match NonNull::new(ptr as *mut u8) {
            Some(p) => p,
            None => return Err(Errno(libc::ENOMEM)),
        };

        self.pages += to_reserve / self.page_size;
        self.reservations += 1;
        trace!("Reserved {} bytes at {:p}", to_reserve, ptr);

        Ok(ptr)
    }

    unsafe fn commit(&mut self, ptr: NonNull<u8>, size: usize) {
        let span = self.span(size);
        let status = libc::mprotect(
            ptr.as_ptr() as *mut libc::c_void,
            span,
            libc::PROT_READ | libc::PROT_WRITE,
        );
        if status != 0 {
            let err = errno::errno();
            error!("Failed to commit {} bytes at {:p}: {}", span, ptr, err);
            panic!("Failed to commit memory: {}", err);
        }
    }

    unsafe fn decommit(&mut self, ptr: NonNull<u8>, size: usize) {
        let span = self.span(size);
        let status = libc::madvise(ptr.as_ptr() as *mut libc::c_void, span, libc::MADV_DONTNEED);
        if status != 0 {
            error!(
                "Failed to decommit {} bytes at {:p}: {}",
                span,
                ptr,
                errno::errno()
            );
        }
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>, size: usize) {
        let span = self.span(size);
        let status = libc::munmap(ptr.as_ptr() as *mut libc::c_void, span);
        if status != 0 {
            // The mapping is still there, so the counters stay as they are.
            error!(
                "Failed to release {} bytes at {:p}: {}",
                span,
                ptr,
                errno::errno()
            );
            return;
        }

        self.pages = self.pages.saturating_sub(span / self.page_size);
        self.reservations = self.reservations.saturating_sub(1);
        trace!("Released {} bytes at {:p}", span, ptr);
    }

    unsafe fn set_protection(&mut self, ptr: NonNull<u8>, size: usize, protection: Protection) {
        let mut flags = libc::PROT_NONE;
        if protection.contains(Protection::READ) {
            flags |= libc::PROT_READ;
        }
        if protection.contains(Protection::WRITE) {
            flags |= libc::PROT_WRITE;
        }
        if protection.contains(Protection::EXEC) {
            flags |= libc::PROT_EXEC;
        }

        let span = self.span(size);
        let status = libc::mprotect(ptr.as_ptr() as *mut libc::c_void, span, flags);
        if status != 0 {
            let err = errno::errno();
            error!("Failed to protect {} bytes at {:p}: {}", span, ptr, err);
            panic!("Failed to set protection: {}", err);
        }
    }
}

pub const TOY_MEMORY_SIZE: usize = 256 * 1024;

// Page aligned, so the first reservation starts on a 4096 byte boundary.
#[repr(C, align(4096))]
pub struct ToyPages(pub [u8; TOY_MEMORY_SIZE]);

/// A pretend OS over an inline buffer.
///
/// Reservations are handed out bump-style; releasing the most recent
/// reservation gives its address space back, so a reserve / release / reserve
/// cycle lands on the same address.
///
/// Only `&mut ToyMemory` is a `VirtualMemory`: the pages are inside the
/// struct, so it has to stay put while anything uses them.
pub struct ToyMemory {
    pub page_size: usize,
    /// High end of the handed out address space.
    pub size: usize,
    /// Bytes reserved and not yet released.
    pub reserved: usize,
    /// Bytes committed and not yet decommitted.
    pub committed: usize,
    pub heap: ToyPages,
}

impl Default for ToyMemory {
    fn default() -> Self {
        ToyMemory {
            page_size: 64,
            size: 0,
            reserved: 0,
            committed: 0,
            heap: ToyPages([0; TOY_MEMORY_SIZE]),
        }
    }
}

impl fmt::Debug for ToyMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToyMemory")
            .field("page_size", &self.page_size)
            .field("size", &self.size)
            .field("reserved", &self.reserved)
            .field("committed", &self.committed)
            .finish()
    }
}

impl ToyMemory {
    fn span(&self, size: usize) -> usize {
        round_up(size, self.page_size).max(self.page_size)
    }

    fn offset_of(&self, ptr: NonNull<u8>) -> usize {
        let base = self.heap.0.as_ptr() as usize;
        let addr = ptr.as_ptr() as usize;
        assert!(
            addr >= base && addr <= base + self.size,
            "{:p} was not handed out by this ToyMemory",
            ptr
        );
        addr - base
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToyMemoryExhausted {
    pub requested: usize,
    pub available: usize,
}

impl fmt::Display for ToyMemoryExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "toy memory exhausted: requested {} bytes, {} available",
            self.requested, self.available
        )
    }
}

impl<'t> VirtualMemory for &'t mut ToyMemory {
    type Err = ToyMemoryExhausted;

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn reserve(&mut self, size: usize) -> Result<NonNull<u8>, Self::Err> {
        let allocating = self.span(size);
        let available = TOY_MEMORY_SIZE - self.size;
        if allocating > available {
            return Err(ToyMemoryExhausted {
                requested: allocating,
                available,
            });
        }

        let ptr = unsafe { NonNull::new_unchecked(self.heap.0.as_mut_ptr().add(self.size)) };
        self.size += allocating;
        self.reserved += allocating;
        Ok(ptr)
    }

    unsafe fn commit(&mut self, ptr: NonNull<u8>, size: usize) {
        let span = self.span(size);
        let offset = self.offset_of(ptr);
        assert!(
            offset + span <= self.size,
            "committing {} bytes at {:p} runs past the reserved space",
            span,
            ptr
        );
        self.committed += span;
    }

    unsafe fn decommit(&mut self, ptr: NonNull<u8>, size: usize) {
        let span = self.span(size);
        self.offset_of(ptr);
        self.committed = self.committed.saturating_sub(span);
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>, size: usize) {
        let span = self.span(size);
        let offset = self.offset_of(ptr);
        self.reserved = self.reserved.saturating_sub(span);
        if offset + span == self.size {
            self.size = offset;
        }
        if self.reserved == 0 {
            // Everything is back; forget any holes below the top too.
            self.size = 0;
        }
    }

    unsafe fn set_protection(&mut self, ptr: NonNull<u8>, _size: usize, _protection: Protection) {
        // An inline buffer has no page protection to change.
        self.offset_of(ptr);
    }
}
