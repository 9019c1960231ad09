//! Cache and TLB maintenance.
//!
//! PA-RISC caches are virtually indexed and the TLB is reloaded by software, so every
//! change to a PTE must first push the old translation out of the instruction cache,
//! both TLBs and the data cache. [`CacheOps`] is the set of primitives the platform
//! supplies; [`TlbReload`] covers the optional hashed page table some CPUs (the 7100LC
//! family) consult before walking the space directory.

use alloc::{boxed::Box, vec::Vec};

use spin::Mutex;

use crate::{PageNumber, Pte, SpaceId, VirtualAddress, arch};

/// Cache and TLB primitives, each scoped to one (space, va) range.
pub trait CacheOps: Send + Sync {
    /// Flushes instruction cache lines (`fic`).
    fn flush_icache(&self, space: SpaceId, va: VirtualAddress, len: usize);
    /// Purges the instruction TLB entry (`pitlb`).
    fn purge_itlb(&self, space: SpaceId, va: VirtualAddress);
    /// Writes back and invalidates data cache lines (`fdc`).
    fn flush_dcache(&self, space: SpaceId, va: VirtualAddress, len: usize);
    /// Purges the data TLB entry (`pdtlb`).
    fn purge_dtlb(&self, space: SpaceId, va: VirtualAddress);
    /// Invalidates data cache lines without writing them back (`pdc`).
    fn purge_dcache(&self, space: SpaceId, va: VirtualAddress, len: usize);
    /// Writes back data cache lines, keeping them valid.
    fn write_back_dcache(&self, space: SpaceId, va: VirtualAddress, len: usize);
}

/// Cache operations for hosts with physically-indexed, coherent caches.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCacheOps;

impl CacheOps for NoCacheOps {
    fn flush_icache(&self, _: SpaceId, _: VirtualAddress, _: usize) {}
    fn purge_itlb(&self, _: SpaceId, _: VirtualAddress) {}
    fn flush_dcache(&self, _: SpaceId, _: VirtualAddress, _: usize) {}
    fn purge_dtlb(&self, _: SpaceId, _: VirtualAddress) {}
    fn purge_dcache(&self, _: SpaceId, _: VirtualAddress, _: usize) {}
    fn write_back_dcache(&self, _: SpaceId, _: VirtualAddress, _: usize) {}
}

/// How TLB misses are refilled.
pub trait TlbReload: Send + Sync {
    /// Returns a cached translation, if this strategy keeps any.
    fn lookup(&self, space: SpaceId, va: VirtualAddress) -> Option<Pte>;
    /// Caches a translation found by walking the tables.
    fn insert(&self, space: SpaceId, va: VirtualAddress, pte: Pte);
    /// Drops any cached translation for (space, va).
    fn invalidate(&self, space: SpaceId, va: VirtualAddress);
}

/// Misses walk the space directory every time; nothing is cached.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftwareWalk;

impl TlbReload for SoftwareWalk {
    fn lookup(&self, _: SpaceId, _: VirtualAddress) -> Option<Pte> {
        None
    }

    fn insert(&self, _: SpaceId, _: VirtualAddress, _: Pte) {}

    fn invalidate(&self, _: SpaceId, _: VirtualAddress) {}
}

#[derive(Debug, Clone, Copy, Default)]
struct HptEntry {
    tag: Option<(SpaceId, PageNumber)>,
    pte: Pte,
}

/// A direct-mapped hashed page table in front of the two-level walk.
pub struct HashedPageTable {
    entries: Mutex<Box<[HptEntry]>>,
    mask: usize,
}

impl HashedPageTable {
    /// Creates a table of `entries` slots.
    ///
    /// # Panics
    ///
    /// Panics if `entries` is not a power of two.
    pub fn new(entries: usize) -> Self {
        assert!(
            entries.is_power_of_two(),
            "hashed page table size must be a power of two"
        );
        let table: Vec<HptEntry> = (0..entries).map(|_| HptEntry::default()).collect();
        Self {
            entries: Mutex::new(table.into_boxed_slice()),
            mask: entries - 1,
        }
    }

    fn hash(&self, space: SpaceId, va: VirtualAddress) -> usize {
        (((space.as_u32() as usize) << 5) ^ (va.as_usize() >> arch::PAGE_SHIFT)) & self.mask
    }
}

impl TlbReload for HashedPageTable {
    fn lookup(&self, space: SpaceId, va: VirtualAddress) -> Option<Pte> {
        let entry = self.entries.lock()[self.hash(space, va)];
        (entry.tag == Some((space, va.page_number()))).then_some(entry.pte)
    }

    fn insert(&self, space: SpaceId, va: VirtualAddress, pte: Pte) {
        let slot = self.hash(space, va);
        self.entries.lock()[slot] = HptEntry {
            tag: Some((space, va.page_number())),
            pte,
        };
    }

    fn invalidate(&self, space: SpaceId, va: VirtualAddress) {
        let slot = self.hash(space, va);
        let mut entries = self.entries.lock();
        if entries[slot].tag == Some((space, va.page_number())) {
            entries[slot] = HptEntry::default();
        }
    }
}

/// TLB refill strategy, chosen once at bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlbReloadKind {
    #[default]
    SoftwareWalk,
    Hashed {
        entries: usize,
    },
}

impl TlbReloadKind {
    pub(crate) fn build(self) -> Box<dyn TlbReload> {
        match self {
            Self::SoftwareWalk => Box::new(SoftwareWalk),
            Self::Hashed { entries } => Box::new(HashedPageTable::new(entries)),
        }
    }
}

/// Pushes the translation `pte` for (space, va) out of every cache and TLB.
///
/// Must complete before the PTE word is overwritten or cleared: the frame may be
/// reused the moment the new word is visible.
pub(crate) fn flush_translation(
    cache: &dyn CacheOps,
    tlb: &dyn TlbReload,
    space: SpaceId,
    va: VirtualAddress,
    pte: Pte,
) {
    if pte.prot().is_executable() {
        cache.flush_icache(space, va, arch::PAGE_SIZE);
    }
    cache.purge_itlb(space, va);
    cache.purge_dtlb(space, va);
    tlb.invalidate(space, va);
    cache.flush_dcache(space, va, arch::PAGE_SIZE);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CacheOp, RecordingCache};
    use crate::{PhysicalAddress, Privilege, Protection, PteFields, encode_protection};

    fn pte(prot: Protection) -> Pte {
        Pte::pack(PteFields {
            frame: PhysicalAddress::new(0x3000),
            prot: encode_protection(prot, Privilege::User),
            wired: false,
            uncacheable: false,
            dirty: false,
            reftrap: false,
        })
        .unwrap()
    }

    #[test]
    fn hashed_table_caches_and_invalidates() {
        let hpt = HashedPageTable::new(16);
        let space = SpaceId::new(3);
        let va = VirtualAddress::new(0x0040_2000);
        assert_eq!(hpt.lookup(space, va), None);

        hpt.insert(space, va, pte(Protection::READ));
        assert_eq!(hpt.lookup(space, va), Some(pte(Protection::READ)));
        assert_eq!(hpt.lookup(SpaceId::new(4), va), None);

        hpt.invalidate(space, va);
        assert_eq!(hpt.lookup(space, va), None);
    }

    #[test]
    fn invalidate_leaves_colliding_entry_alone() {
        let hpt = HashedPageTable::new(1);
        let space = SpaceId::new(1);
        let a = VirtualAddress::new(0x1000);
        let b = VirtualAddress::new(0x2000);
        hpt.insert(space, a, pte(Protection::READ));
        hpt.invalidate(space, b);
        assert!(hpt.lookup(space, a).is_some());
    }

    #[test]
    fn flush_skips_icache_for_data_pages() {
        let cache = RecordingCache::default();
        let va = VirtualAddress::new(0x1000);
        flush_translation(&cache, &SoftwareWalk, SpaceId::new(1), va, pte(Protection::READ_WRITE));
        assert_eq!(
            cache.ops(),
            [CacheOp::PurgeItlb, CacheOp::PurgeDtlb, CacheOp::FlushDcache]
        );
    }

    #[test]
    fn flush_orders_icache_first_for_text() {
        let cache = RecordingCache::default();
        let va = VirtualAddress::new(0x1000);
        let text = pte(Protection::READ_EXECUTE);
        flush_translation(&cache, &SoftwareWalk, SpaceId::new(1), va, text);
        assert_eq!(
            cache.ops(),
            [
                CacheOp::FlushIcache,
                CacheOp::PurgeItlb,
                CacheOp::PurgeDtlb,
                CacheOp::FlushDcache
            ]
        );
    }
}
