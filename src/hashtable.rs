//! An open-addressing, string-keyed hashtable that lives inside an arena.
//!
//! Keys are hashed with 64-bit FNV-1a and collisions are resolved by linear
//! probing. The table doubles whenever an insert finds it half full, so a probe
//! always reaches an empty slot.
//!
//! Both the table record and its slots are allocated from an arena, as are
//! copies of every key. Growing abandons the old slots inside the arena; they
//! are only reclaimed when the arena itself is cleared or destroyed.

use core::fmt;
use core::iter::FusedIterator;
use core::slice;

use log::debug;
use static_assertions::const_assert;

use crate::linear::{Backing, LinearAllocator};

/// Slots in a freshly created table.
pub const INITIAL_CAPACITY: usize = 32;
const_assert!(INITIAL_CAPACITY.is_power_of_two());

const FNV_OFFSET: u64 = 14_695_981_039_346_656_037;
const FNV_PRIME: u64 = 1_099_511_628_211;

/// Return the 64-bit FNV-1a hash of `key`.
pub fn hash_key(key: &str) -> u64 {
    key.bytes().fold(FNV_OFFSET, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
    })
}

// Where the probe for `key` starts in a table of `capacity` slots.
fn home_slot(key: &str, capacity: usize) -> usize {
    (hash_key(key) & (capacity as u64 - 1)) as usize
}

#[derive(Clone, Copy)]
struct Entry<'a, V> {
    key: &'a str,
    value: V,
}

pub struct Hashtable<'a, V> {
    entries: &'a mut [Option<Entry<'a, V>>],
    length: usize,
}

impl<'a, V: Copy> Hashtable<'a, V> {
    /// Allocate an empty table in `arena`.
    ///
    /// Returns `None` if the arena cannot fit it.
    pub fn create<B: Backing>(arena: &'a LinearAllocator<B>) -> Option<&'a mut Self> {
        let entries = arena.try_alloc_slice_fill(INITIAL_CAPACITY, None)?;
        arena.try_alloc_value(Hashtable { entries, length: 0 })
    }

    // Index of the slot holding `key`, or of the empty slot ending its probe.
    fn probe(&self, key: &str) -> usize {
        let mask = self.entries.len() - 1;
        let mut index = home_slot(key, self.entries.len());
        loop {
            match &self.entries[index] {
                Some(entry) if entry.key != key => index = (index + 1) & mask,
                _ => return index,
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.entries[self.probe(key)].map(|entry| entry.value)
    }

    /// Insert or overwrite `key`.
    ///
    /// A new key is copied into `arena`; an existing key keeps its copy and
    /// only the value changes. Returns the stored key, or `None` if `arena`
    /// could not fit the copy or the grown table.
    pub fn set<B: Backing>(
        &mut self,
        arena: &'a LinearAllocator<B>,
        key: &str,
        value: V,
    ) -> Option<&'a str> {
        if self.length >= self.capacity() / 2 {
            self.grow(arena)?;
        }

        let index = self.probe(key);
        if let Some(entry) = self.entries[index].as_mut() {
            entry.value = value;
            return Some(entry.key);
        }

        let owned: &'a str = arena.try_alloc_str(key)?;
        self.entries[index] = Some(Entry { key: owned, value });
        self.length += 1;
        Some(owned)
    }

    fn grow<B: Backing>(&mut self, arena: &'a LinearAllocator<B>) -> Option<()> {
        let new_capacity = self.capacity().checked_mul(2)?;
        let entries = arena.try_alloc_slice_fill(new_capacity, None)?;

        let mask = new_capacity - 1;
        for entry in self.entries.iter().flatten() {
            let mut index = home_slot(entry.key, new_capacity);
            while entries[index].is_some() {
                index = (index + 1) & mask;
            }
            entries[index] = Some(*entry);
        }

        debug!(
            "Grew hashtable from {} to {} slots ({} keys)",
            self.capacity(),
            new_capacity,
            self.length
        );
        self.entries = entries;
        Some(())
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Iterate over `(key, value)` pairs in slot order.
    pub fn iter(&self) -> Iter<'_, 'a, V> {
        Iter {
            slots: self.entries.iter(),
        }
    }
}

impl<'a, V: Copy + fmt::Debug> fmt::Debug for Hashtable<'a, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

pub struct Iter<'t, 'a, V> {
    slots: slice::Iter<'t, Option<Entry<'a, V>>>,
}

impl<'t, 'a, V: Copy> Iterator for Iter<'t, 'a, V> {
    type Item = (&'a str, V);

    fn next(&mut self) -> Option<Self::Item> {
        self.slots
            .find_map(|slot| slot.map(|entry| (entry.key, entry.value)))
    }
}

impl<'t, 'a, V: Copy> FusedIterator for Iter<'t, 'a, V> {}

impl<'t, 'a, V: Copy> IntoIterator for &'t Hashtable<'a, V> {
    type Item = (&'a str, V);
    type IntoIter = Iter<'t, 'a, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
