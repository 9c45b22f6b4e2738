//! Address alignment helpers and the one-shot aligned allocator.
//!
//! Every block handed out by [`AlignedAllocator`](struct.AlignedAllocator.html)
//! is preceded by a single hidden byte recording how far the returned address
//! was pushed forward from the start of the reservation:
//!
//! ```text
//!   raw                         aligned
//!   │                           │
//!   ▼                           ▼
//!   ┌──────────── shift ──────┬─┬──────────────── bytes ───────┬─────┐
//!   │        padding          │s│        caller's block        │ ... │
//!   └─────────────────────────┴─┴──────────────────────────────┴─────┘
//!                              ▲
//!                              └── shift byte, 256 stored as 0
//! ```

use core::ptr::NonNull;

use log::{error, trace};
use static_assertions::const_assert;

use crate::memory::VirtualMemory;

/// Largest alignment the shift byte can describe.
pub const MAX_ALIGN: usize = 256;
const_assert!(MAX_ALIGN.is_power_of_two());
// A shift of exactly MAX_ALIGN wraps to 0 in the byte, every other shift fits.
const_assert!(MAX_ALIGN == u8::MAX as usize + 1);

/// Round `addr` up to the next multiple of `align`.
///
/// Panics if `align` is not a power of two.
pub fn align_address(addr: usize, align: usize) -> usize {
    assert!(
        align.is_power_of_two(),
        "'align' must be a power of 2, got {}",
        align
    );
    let mask = align - 1;
    (addr + mask) & !mask
}

/// Round `ptr` up to the next multiple of `align`, keeping its provenance.
pub fn align_pointer(ptr: *mut u8, align: usize) -> *mut u8 {
    let addr = ptr as usize;
    ptr.wrapping_add(align_address(addr, align) - addr)
}

fn encode_shift(shift: usize) -> u8 {
    (shift & 0xFF) as u8
}

fn decode_shift(byte: u8) -> usize {
    match byte {
        0 => MAX_ALIGN,
        b => b as usize,
    }
}

// Bytes reserved for a block: room for the block plus a full `align` of
// shift. Overflow is fatal.
fn reservation_size(bytes: usize, align: usize) -> usize {
    match bytes.checked_add(align) {
        Some(total) => total,
        None => {
            error!(
                "Aligned allocation of {} bytes with {}-byte alignment overflows usize",
                bytes, align
            );
            panic!("aligned allocation size overflows: {} + {}", bytes, align);
        }
    }
}

/// Allocates blocks of any power-of-two alignment up to `MAX_ALIGN`, each with
/// its own reservation from the provider.
///
/// Nothing about a block is stored besides the shift byte, so `free` must be
/// given the same size and alignment the block was allocated with.
#[derive(Debug, Default)]
pub struct AlignedAllocator<M> {
    memory: M,
    live: usize,
}

impl<M: VirtualMemory> AlignedAllocator<M> {
    pub fn new(memory: M) -> Self {
        AlignedAllocator { memory, live: 0 }
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn into_inner(self) -> M {
        self.memory
    }

    /// Blocks allocated and not yet freed.
    pub fn live(&self) -> usize {
        self.live
    }

    /// Allocate `bytes` bytes aligned to `align`.
    ///
    /// Panics if `align` is not a power of two or exceeds `MAX_ALIGN`, or if
    /// `bytes + align` overflows. These are checked before anything is
    /// reserved. A failed reservation is returned to the caller.
    pub fn allocate(&mut self, bytes: usize, align: usize) -> Result<NonNull<u8>, M::Err> {
        if !align.is_power_of_two() {
            error!(
                "Aligned allocation of {} bytes asked for {}-byte alignment",
                bytes, align
            );
            panic!("'align' must be a power of 2, got {}", align);
        }
        if align > MAX_ALIGN {
            error!(
                "Aligned allocation of {} bytes asked for {}-byte alignment, max is {}",
                bytes, align, MAX_ALIGN
            );
            panic!(
                "AlignedAllocator only supports up to {}-byte alignment",
                MAX_ALIGN
            );
        }

        let actual_bytes = reservation_size(bytes, align);
        let raw = self.memory.reserve(actual_bytes)?;
        unsafe { self.memory.commit(raw, actual_bytes) };

        let raw_ptr = raw.as_ptr();
        let mut aligned = align_pointer(raw_ptr, align);
        if aligned == raw_ptr {
            // Always leave room for the shift byte.
            aligned = aligned.wrapping_add(align);
        }

        let shift = aligned as usize - raw_ptr as usize;
        assert!(
            shift > 0 && shift <= MAX_ALIGN,
            "Max difference in alignment is {}, got {}",
            MAX_ALIGN,
            shift
        );

        unsafe {
            aligned.sub(1).write(encode_shift(shift));
        }

        self.live += 1;
        trace!(
            "Aligned {} bytes to {} at {:p} (shift {})",
            bytes,
            align,
            aligned,
            shift
        );

        Ok(unsafe { NonNull::new_unchecked(aligned) })
    }

    /// Return a block to the provider.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from `allocate` on this allocator with exactly
    /// this `size` and `align`, and must not be used afterwards.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>, size: usize, align: usize) {
        let aligned = ptr.as_ptr();
        let shift = decode_shift(aligned.sub(1).read());

        let raw = NonNull::new_unchecked(aligned.sub(shift));
        let actual_bytes = reservation_size(size, align);
        self.memory.decommit(raw, actual_bytes);
        self.memory.release(raw, actual_bytes);

        self.live = self.live.saturating_sub(1);
    }
}
