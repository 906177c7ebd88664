//! Virtual device pointers and the table that backs them.
//!
//! Device buffers are opaque objects with no stable address, so the rest of
//! the crate deals in [`VirtualPtr`]: a tagged 64-bit handle that resolves
//! through a table to `(buffer, byte offset, size)`. Bit 63 marks a value as
//! virtual; the low bits carry a slot index and a generation counter, so a
//! pointer that outlives its registration fails resolution instead of
//! silently aliasing whatever reused the slot.

use std::sync::RwLock;

use clmem_common::{Error, Result};
use tracing::trace;

use crate::backend::BufferHandle;

/// High bit distinguishing virtual pointers from arbitrary integers.
const VIRTUAL_TAG: u64 = 1 << 63;
/// Bits 32..63 hold the generation, bits 0..32 the slot index.
const GENERATION_SHIFT: u32 = 32;
const GENERATION_MASK: u64 = (1 << 31) - 1;
const SLOT_MASK: u64 = (1 << 32) - 1;

/// Tagged handle standing in for a device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VirtualPtr(u64);

impl VirtualPtr {
    fn pack(slot: u32, generation: u32) -> Self {
        let gen = (generation as u64 & GENERATION_MASK) << GENERATION_SHIFT;
        Self(VIRTUAL_TAG | gen | slot as u64)
    }

    /// True when `raw` carries the virtual tag bit.
    pub fn is_virtual(raw: u64) -> bool {
        raw & VIRTUAL_TAG != 0
    }

    /// Reinterprets a raw value as a virtual pointer. Resolution still
    /// validates slot and generation, so a forged value only ever yields
    /// [`Error::UnknownPointer`].
    pub fn from_raw(raw: u64) -> Option<Self> {
        if Self::is_virtual(raw) {
            Some(Self(raw))
        } else {
            None
        }
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    fn slot(self) -> usize {
        (self.0 & SLOT_MASK) as usize
    }

    fn generation(self) -> u32 {
        ((self.0 >> GENERATION_SHIFT) & GENERATION_MASK) as u32
    }
}

impl std::fmt::Display for VirtualPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// What a pointer resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    /// Backing buffer.
    pub buffer: BufferHandle,
    /// Byte offset of this pointer within the buffer.
    pub offset: usize,
    /// Bytes reachable from the pointer: buffer size minus offset.
    pub size: usize,
    /// True when this pointer was the original allocation (offset zero,
    /// registered by the allocator rather than derived by pointer
    /// arithmetic). Only origin pointers may be freed.
    pub origin: bool,
}

struct Slot {
    generation: u32,
    entry: Option<Resolved>,
}

/// Slab of registered pointers. All methods take `&self`; interior locking
/// keeps registration and resolution safe across threads.
pub struct VirtualMemoryTable {
    inner: RwLock<TableInner>,
}

struct TableInner {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

impl VirtualMemoryTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(TableInner {
                slots: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    /// Registers a mapping and returns its pointer.
    pub fn register(
        &self,
        buffer: BufferHandle,
        offset: usize,
        size: usize,
        origin: bool,
    ) -> VirtualPtr {
        let entry = Resolved {
            buffer,
            offset,
            size,
            origin,
        };
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let slot = match inner.free.pop() {
            Some(slot) => {
                inner.slots[slot].entry = Some(entry);
                slot
            }
            None => {
                inner.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                inner.slots.len() - 1
            }
        };
        let ptr = VirtualPtr::pack(slot as u32, inner.slots[slot].generation);
        trace!(ptr = %ptr, buffer = buffer.raw(), offset, size, origin, "registered pointer");
        ptr
    }

    /// Resolves a pointer to its current mapping.
    pub fn resolve(&self, ptr: VirtualPtr) -> Result<Resolved> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .slots
            .get(ptr.slot())
            .filter(|s| s.generation == ptr.generation())
            .and_then(|s| s.entry)
            .ok_or(Error::UnknownPointer { ptr: ptr.raw() })
    }

    /// Removes a mapping. The slot's generation is bumped before reuse, so
    /// the retired pointer can never resolve again.
    pub fn unregister(&self, ptr: VirtualPtr) -> Result<Resolved> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let slot_idx = ptr.slot();
        let slot = inner
            .slots
            .get_mut(slot_idx)
            .ok_or(Error::UnknownPointer { ptr: ptr.raw() })?;
        if slot.generation != ptr.generation() {
            return Err(Error::UnknownPointer { ptr: ptr.raw() });
        }
        // A matching generation always has a live entry: removal bumps the
        // generation in the same critical section.
        let entry = slot
            .entry
            .take()
            .ok_or(Error::UnknownPointer { ptr: ptr.raw() })?;
        slot.generation = slot.generation.wrapping_add(1) & GENERATION_MASK as u32;
        inner.free.push(slot_idx);
        trace!(ptr = %ptr, buffer = entry.buffer.raw(), "unregistered pointer");
        Ok(entry)
    }

    /// True when `ptr` once resolved through this table and was later
    /// unregistered: its slot exists and the generation has moved past the
    /// pointer's. A forged value whose slot never existed, or whose
    /// generation is ahead of the slot's, is not retired, just unknown.
    pub fn is_retired(&self, ptr: VirtualPtr) -> bool {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .slots
            .get(ptr.slot())
            .map_or(false, |s| ptr.generation() < s.generation)
    }

    /// All live pointers backed by `buffer`. Used when a buffer is freed to
    /// retire derived slice pointers along with the origin.
    pub fn entries_for_buffer(&self, buffer: BufferHandle) -> Vec<VirtualPtr> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| {
                slot.entry
                    .filter(|e| e.buffer == buffer)
                    .map(|_| VirtualPtr::pack(idx as u32, slot.generation))
            })
            .collect()
    }

    /// Number of live mappings.
    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for VirtualMemoryTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(n: u64) -> BufferHandle {
        BufferHandle(n)
    }

    #[test]
    fn registered_pointer_carries_tag() {
        let table = VirtualMemoryTable::new();
        let ptr = table.register(buf(1), 0, 1024, true);
        assert!(VirtualPtr::is_virtual(ptr.raw()));
    }

    #[test]
    fn plain_integer_is_not_virtual() {
        assert!(!VirtualPtr::is_virtual(0));
        assert!(!VirtualPtr::is_virtual(0x7fff_ffff_ffff_ffff));
        assert!(VirtualPtr::from_raw(12345).is_none());
    }

    #[test]
    fn resolve_returns_registered_mapping() {
        let table = VirtualMemoryTable::new();
        let ptr = table.register(buf(7), 128, 896, false);
        let r = table.resolve(ptr).unwrap();
        assert_eq!(r.buffer, buf(7));
        assert_eq!(r.offset, 128);
        assert_eq!(r.size, 896);
        assert!(!r.origin);
    }

    #[test]
    fn unregister_then_resolve_fails() {
        let table = VirtualMemoryTable::new();
        let ptr = table.register(buf(1), 0, 64, true);
        table.unregister(ptr).unwrap();
        assert!(matches!(
            table.resolve(ptr),
            Err(Error::UnknownPointer { .. })
        ));
    }

    #[test]
    fn stale_pointer_does_not_alias_slot_reuse() {
        let table = VirtualMemoryTable::new();
        let old = table.register(buf(1), 0, 64, true);
        table.unregister(old).unwrap();
        let new = table.register(buf(2), 0, 128, true);
        // Slot is reused but the generation moved on.
        assert_ne!(old.raw(), new.raw());
        assert!(table.resolve(old).is_err());
        assert_eq!(table.resolve(new).unwrap().buffer, buf(2));
    }

    #[test]
    fn retired_pointers_are_distinguishable_from_forged_ones() {
        let table = VirtualMemoryTable::new();
        let ptr = table.register(buf(1), 0, 64, true);
        assert!(!table.is_retired(ptr));
        table.unregister(ptr).unwrap();
        assert!(table.is_retired(ptr));
        // Slot 999 never existed.
        let forged = VirtualPtr::pack(999, 0);
        assert!(!table.is_retired(forged));
        // Right slot, generation from the future.
        let ahead = VirtualPtr::pack(0, 40);
        assert!(!table.is_retired(ahead));
        assert!(matches!(
            table.unregister(ahead),
            Err(Error::UnknownPointer { .. })
        ));
    }

    #[test]
    fn distinct_registrations_get_distinct_pointers() {
        let table = VirtualMemoryTable::new();
        let a = table.register(buf(1), 0, 64, true);
        let b = table.register(buf(1), 16, 48, false);
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn resolve_stays_consistent_under_concurrent_churn() {
        use std::sync::Arc;
        let table = Arc::new(VirtualMemoryTable::new());
        let stable = table.register(buf(42), 16, 240, false);
        let churn = {
            let table = Arc::clone(&table);
            std::thread::spawn(move || {
                for _ in 0..2000 {
                    let p = table.register(buf(7), 0, 32, true);
                    table.unregister(p).unwrap();
                }
            })
        };
        let readers: Vec<_> = (0..3)
            .map(|_| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    for _ in 0..2000 {
                        let r = table.resolve(stable).unwrap();
                        assert_eq!(r.buffer, buf(42));
                        assert_eq!(r.offset, 16);
                    }
                })
            })
            .collect();
        churn.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }

    #[test]
    fn entries_for_buffer_finds_derived_pointers() {
        let table = VirtualMemoryTable::new();
        let a = table.register(buf(3), 0, 256, true);
        let b = table.register(buf(3), 64, 192, false);
        let _other = table.register(buf(4), 0, 32, true);
        let mut entries = table.entries_for_buffer(buf(3));
        entries.sort_by_key(|p| p.raw());
        let mut expect = vec![a, b];
        expect.sort_by_key(|p| p.raw());
        assert_eq!(entries, expect);
    }
}
