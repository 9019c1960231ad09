//! Reverse mappings (pv lists).
//!
//! Every managed frame heads a singly-linked list of the (space, va) pairs that map it.
//! Entries live in one pool-owned arena and link by index, so unlinking never frees
//! memory out from under a concurrent walker; freed slots go on a free list.
//!
//! Locking: a list is only touched while its frame's lock is held. The pool lock nests
//! inside the frame lock and is never held across calls.

use alloc::vec::Vec;

use spin::Mutex;

use crate::frame::PvHead;
use crate::{PhysicalAddress, SpaceId, VirtualAddress};

/// Index of an entry in the pv arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PvIndex(u32);

/// One alias of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    /// Space holding the mapping. Does not keep the space alive.
    pub space: SpaceId,
    /// Virtual address of the mapping within the space.
    pub va: VirtualAddress,
    /// Page table holding the PTE; its wire count drops when the entry goes away.
    pub table: PhysicalAddress,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    mapping: Mapping,
    next: Option<PvIndex>,
}

#[derive(Default)]
struct Arena {
    slots: Vec<Slot>,
    free: Option<PvIndex>,
    live: usize,
}

impl Arena {
    fn slot(&self, index: PvIndex) -> &Slot {
        &self.slots[index.0 as usize]
    }

    fn slot_mut(&mut self, index: PvIndex) -> &mut Slot {
        &mut self.slots[index.0 as usize]
    }
}

/// The global pool of pv entries.
pub(crate) struct PvPool {
    arena: Mutex<Arena>,
    capacity: usize,
}

const UNUSED: Mapping = Mapping {
    space: SpaceId::KERNEL,
    va: VirtualAddress::new(0),
    table: PhysicalAddress::new(0),
};

impl PvPool {
    /// Creates a pool holding at most `capacity` live entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            arena: Mutex::new(Arena::default()),
            capacity,
        }
    }

    /// Takes an unlinked entry from the pool.
    pub fn get(&self) -> Option<PvIndex> {
        let mut arena = self.arena.lock();
        if arena.live >= self.capacity {
            return None;
        }
        let index = match arena.free {
            Some(index) => {
                arena.free = arena.slot(index).next;
                index
            }
            None => {
                let index = PvIndex(u32::try_from(arena.slots.len()).ok()?);
                arena.slots.push(Slot {
                    mapping: UNUSED,
                    next: None,
                });
                index
            }
        };
        arena.live += 1;
        Some(index)
    }

    /// Returns an unlinked entry to the pool.
    pub fn put(&self, index: PvIndex) {
        let mut arena = self.arena.lock();
        let free = arena.free;
        *arena.slot_mut(index) = Slot {
            mapping: UNUSED,
            next: free,
        };
        arena.free = Some(index);
        arena.live -= 1;
    }

    /// Records `mapping` in `index` and pushes it on the frame's list.
    pub fn link(&self, head: &mut PvHead, index: PvIndex, mapping: Mapping) {
        let mut arena = self.arena.lock();
        debug_assert!(
            Self::find(&arena, head, mapping.space, mapping.va).is_none(),
            "duplicate pv entry for {:?}:{}",
            mapping.space,
            mapping.va
        );
        *arena.slot_mut(index) = Slot {
            mapping,
            next: head.head,
        };
        head.head = Some(index);
    }

    /// Unlinks the entry for (space, va), returning it still allocated.
    pub fn unlink(
        &self,
        head: &mut PvHead,
        space: SpaceId,
        va: VirtualAddress,
    ) -> Option<(PvIndex, Mapping)> {
        let mut arena = self.arena.lock();
        let mut previous: Option<PvIndex> = None;
        let mut cursor = head.head;
        while let Some(index) = cursor {
            let slot = *arena.slot(index);
            if slot.mapping.space == space && slot.mapping.va == va {
                match previous {
                    Some(previous) => arena.slot_mut(previous).next = slot.next,
                    None => head.head = slot.next,
                }
                arena.slot_mut(index).next = None;
                return Some((index, slot.mapping));
            }
            previous = Some(index);
            cursor = slot.next;
        }
        None
    }

    /// Returns true if (space, va) is on the list.
    pub fn contains(&self, head: &PvHead, space: SpaceId, va: VirtualAddress) -> bool {
        Self::find(&self.arena.lock(), head, space, va).is_some()
    }

    /// Copies out every alias on the list.
    pub fn snapshot(&self, head: &PvHead) -> Vec<Mapping> {
        let arena = self.arena.lock();
        let mut mappings = Vec::new();
        let mut cursor = head.head;
        while let Some(index) = cursor {
            let slot = arena.slot(index);
            mappings.push(slot.mapping);
            cursor = slot.next;
        }
        mappings
    }

    /// Returns the number of entries handed out.
    #[cfg(test)]
    pub fn live(&self) -> usize {
        self.arena.lock().live
    }

    fn find(arena: &Arena, head: &PvHead, space: SpaceId, va: VirtualAddress) -> Option<PvIndex> {
        let mut cursor = head.head;
        while let Some(index) = cursor {
            let slot = arena.slot(index);
            if slot.mapping.space == space && slot.mapping.va == va {
                return Some(index);
            }
            cursor = slot.next;
        }
        None
    }
}
