//! Address space management.
//!
//! An [`AddressSpace`] is one hardware space identifier plus the page directory the TLB
//! miss handler walks for it. Every operation that reads and then writes the space's
//! tables holds the space's object lock for its whole duration.
//!
//! Callers hold spaces through [`Pmap`], an atomically reference-counted handle. Dropping
//! the last handle destroys the space: leftover tables are torn down, the identifier is
//! released and the directory page goes back to the frame allocator.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::Deref;

use bitflags::bitflags;
use spin::Mutex;

use crate::{
    Attributes, PageDirectory, PhysicalAddress, PmapError, Privilege, Protection, Pte, PteFields,
    PteFlags, Result, SpaceId, VirtualAddress,
    arch::{ENTRIES_PER_PAGE, PAGE_SIZE},
    encode_protection,
    page_directory::TablePage,
    pv::Mapping,
    system::Machine,
};

bitflags! {
    /// Options for [`AddressSpace::enter`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EnterFlags: u8 {
        /// The mapping may not be evicted.
        const WIRED = 1 << 0;
        /// Return an error instead of panicking when a resource runs out.
        const CAN_FAIL = 1 << 1;
        /// Bypass the data cache (device memory).
        const UNCACHED = 1 << 2;
    }
}

/// Page counts for an address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Statistics {
    /// Mapped pages plus the directory and table pages themselves.
    pub resident: usize,
    /// Mapped pages entered with [`EnterFlags::WIRED`].
    pub wired: usize,
}

/// What the context switch code loads for a space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Activation {
    /// Value for the space registers.
    pub space: SpaceId,
    /// Value for the protection identifier registers.
    pub protection_id: u32,
    /// Directory the miss handler walks.
    pub directory: PhysicalAddress,
}

pub(crate) struct SpaceInner {
    pub directory: PageDirectory,
    pub stats: Statistics,
}

/// One virtual address space.
pub struct AddressSpace {
    id: SpaceId,
    privilege: Privilege,
    directory: PhysicalAddress,
    machine: Arc<Machine>,
    pub(crate) inner: Mutex<SpaceInner>,
}

/// A counted reference to an [`AddressSpace`].
#[derive(Clone)]
pub struct Pmap(pub(crate) Arc<AddressSpace>);

impl Pmap {
    /// Takes another reference to the space.
    pub fn reference(&self) -> Pmap {
        self.clone()
    }

    /// Drops this reference. The space is destroyed with its last reference.
    pub fn destroy(self) {
        drop(self);
    }

    /// Returns the number of live references.
    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl Deref for Pmap {
    type Target = AddressSpace;

    fn deref(&self) -> &AddressSpace {
        &self.0
    }
}

impl core::fmt::Debug for Pmap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pmap")
            .field("space", &self.id)
            .field("directory", &self.directory)
            .finish()
    }
}

fn next_page(va: VirtualAddress) -> Option<VirtualAddress> {
    va.checked_add(PAGE_SIZE)
}

/// Builds the entry written over `current` by an enter of `new`.
///
/// Uncacheability survives any remap. The hardware-maintained dirty and reference-trap
/// bits survive only while the frame stays the same.
fn compose(new: Pte, current: Pte, same_frame: bool) -> Pte {
    if current.is_empty() {
        return new;
    }
    let mut kept = current.flags() & PteFlags::UNCACHEABLE;
    if same_frame {
        kept |= current.flags() & (PteFlags::DIRTY | PteFlags::REFTRAP);
    }
    new.with_flags(kept, true)
}

impl AddressSpace {
    pub(crate) fn new(
        id: SpaceId,
        machine: Arc<Machine>,
        directory: PageDirectory,
        privilege: Privilege,
    ) -> Self {
        Self {
            id,
            privilege,
            directory: directory.physical_address(),
            machine,
            inner: Mutex::new(SpaceInner {
                directory,
                stats: Statistics {
                    resident: 1,
                    wired: 0,
                },
            }),
        }
    }

    /// Returns the hardware space identifier.
    pub fn space_id(&self) -> SpaceId {
        self.id
    }

    /// Returns the protection identifier for this space.
    pub fn protection_id(&self) -> u32 {
        self.id.protection_id()
    }

    /// Returns the current page counts.
    pub fn stats(&self) -> Statistics {
        self.inner.lock().stats
    }

    /// Returns the register values that make this space current.
    pub fn activation(&self) -> Activation {
        Activation {
            space: self.id,
            protection_id: self.protection_id(),
            directory: self.directory,
        }
    }

    /// Maps the page at `va` to the frame at `pa`.
    ///
    /// Replaces any existing mapping at `va`. Without [`EnterFlags::CAN_FAIL`], running
    /// out of table pages or pv entries panics.
    pub fn enter(
        &self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        prot: Protection,
        flags: EnterFlags,
    ) -> Result<()> {
        let fields = PteFields {
            frame: pa,
            prot: encode_protection(prot, self.privilege),
            wired: flags.contains(EnterFlags::WIRED),
            uncacheable: flags.contains(EnterFlags::UNCACHED),
            dirty: false,
            reftrap: false,
        };
        self.enter_fields(va, fields, flags.contains(EnterFlags::CAN_FAIL))
    }

    pub(crate) fn enter_fields(
        &self,
        va: VirtualAddress,
        fields: PteFields,
        can_fail: bool,
    ) -> Result<()> {
        debug_assert!(va.is_aligned(PAGE_SIZE), "unaligned virtual address {va}");
        let m = &*self.machine;
        let new = Pte::pack(fields)?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let (table, fresh_table) = match inner.directory.get(m, va) {
            Some(table) => (table, false),
            None => match inner.directory.alloc_table(m, self.id, va, &mut inner.stats) {
                Ok(table) => (table, true),
                Err(err) => return self.enter_failed(err, va, can_fail),
            },
        };
        let page = TablePage::new(&m.translator, table);
        let old = page.get(va);
        let same_frame = !old.is_empty() && old.frame() == fields.frame;
        let tracked = m.is_tracking() && m.frames.get(fields.frame).is_some();

        // Take the pv entry up front so a failure leaves nothing half done. With the pool
        // dry, a remap of a tracked page moves the entry it already has instead.
        let mut spare = None;
        if tracked && !same_frame {
            spare = m.pv.get();
            if spare.is_none() && !self.has_pv(old, va) {
                if fresh_table {
                    inner
                        .directory
                        .release_table(m, self.id, va, table, &mut inner.stats);
                }
                return self.enter_failed(PmapError::OutOfResources, va, can_fail);
            }
        }

        if old.is_empty() {
            inner.stats.resident += 1;
            if let Some(frame) = m.frames.get(table) {
                frame.wire();
            }
        } else {
            m.flush_pte(self.id, va, old);
            if old.is_wired() {
                inner.stats.wired -= 1;
            }
        }
        if fields.wired {
            inner.stats.wired += 1;
        }

        // The new frame's reverse mapping is linked before the entry points at it and the
        // old frame's is unlinked only after the entry has moved away, so a pv walk of
        // either frame always finds a live alias and waits on the space lock for it.
        let old_frame = (!old.is_empty() && !same_frame)
            .then(|| m.frames.get(old.frame()))
            .flatten();
        if tracked
            && !same_frame
            && spare.is_none()
            && let Some(frame) = old_frame
        {
            spare = m.pv.unlink(&mut frame.pv(), self.id, va).map(|(index, _)| index);
        }
        if tracked
            && !same_frame
            && let Some(frame) = m.frames.get(fields.frame)
            && let Some(index) = spare.take()
        {
            let mapping = Mapping {
                space: self.id,
                va,
                table,
            };
            m.pv.link(&mut frame.pv(), index, mapping);
        }

        let previous = page
            .update(va, |current| Some(compose(new, current, same_frame)))
            .unwrap_or(old);

        if let Some(frame) = old_frame {
            let mut head = frame.pv();
            head.attrs |= previous.attributes();
            if let Some((index, _)) = m.pv.unlink(&mut head, self.id, va) {
                drop(head);
                m.pv.put(index);
            }
        }

        if tracked && !same_frame {
            #[cfg(any(test, feature = "alias-check"))]
            self.check_aliases(va, fields.frame, fields.prot.is_writable());
        }

        log::trace!("space {}: {} -> {:?}", self.id, va, page.get(va));
        Ok(())
    }

    fn has_pv(&self, pte: Pte, va: VirtualAddress) -> bool {
        let m = &*self.machine;
        !pte.is_empty()
            && m.frames
                .get(pte.frame())
                .is_some_and(|frame| m.pv.contains(&frame.pv(), self.id, va))
    }

    fn enter_failed(&self, err: PmapError, va: VirtualAddress, can_fail: bool) -> Result<()> {
        if can_fail {
            log::debug!("space {}: enter {} failed: {}", self.id, va, err);
            return Err(err);
        }
        log::error!("space {}: cannot map {}: {}", self.id, va, err);
        panic!("pmap enter failed: {err}");
    }

    /// Flags writable mappings of `pa` that land on a different cache line than `va`.
    #[cfg(any(test, feature = "alias-check"))]
    fn check_aliases(&self, va: VirtualAddress, pa: PhysicalAddress, writable: bool) {
        use crate::arch::ALIAS_MASK;
        use core::sync::atomic::Ordering;

        let m = &*self.machine;
        let Some(frame) = m.frames.get(pa) else {
            return;
        };
        let mappings = m.pv.snapshot(&frame.pv());
        for alias in mappings {
            if alias.space == self.id && alias.va == va {
                continue;
            }
            let pte = m.walk(alias.space, alias.va);
            if pte.is_empty() || pte.frame() != pa {
                continue;
            }
            let colors_differ =
                (alias.va.as_usize() & ALIAS_MASK) != (va.as_usize() & ALIAS_MASK);
            if colors_differ && (writable || pte.prot().is_writable()) {
                log::warn!(
                    "writable alias of {}: {}:{} and {}:{}",
                    pa,
                    self.id,
                    va,
                    alias.space,
                    alias.va
                );
                m.alias_warnings.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Unmaps every page in `start..end`.
    ///
    /// Ranges with no page table are skipped a whole table at a time.
    pub fn remove(&self, start: VirtualAddress, end: VirtualAddress) {
        let m = &*self.machine;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let mut va = start.align_down(PAGE_SIZE);
        while va < end {
            let Some(table) = inner.directory.get(m, va) else {
                match va.next_table_boundary() {
                    Some(next) => {
                        va = next;
                        continue;
                    }
                    None => break,
                }
            };
            self.clear_pte(inner, va, table);
            match next_page(va) {
                Some(next) => va = next,
                None => break,
            }
        }
    }

    /// Clears the PTE at `va`, returning what it held.
    fn clear_pte(
        &self,
        inner: &mut SpaceInner,
        va: VirtualAddress,
        table: PhysicalAddress,
    ) -> Option<Pte> {
        let m = &*self.machine;
        let page = TablePage::new(&m.translator, table);
        let pte = page.get(va);
        if pte.is_empty() {
            return None;
        }

        m.flush_pte(self.id, va, pte);
        let pte = page.swap(va, Pte::EMPTY);
        if pte.is_wired() {
            inner.stats.wired -= 1;
        }
        inner.stats.resident -= 1;
        self.forget(va, pte);
        if self.id != SpaceId::KERNEL {
            inner
                .directory
                .release_table(m, self.id, va, table, &mut inner.stats);
        } else if let Some(frame) = m.frames.get(table) {
            frame.unwire();
        }
        log::trace!("space {}: removed {} ({:?})", self.id, va, pte);
        Some(pte)
    }

    /// Harvests a dead entry's attributes and drops its reverse mapping.
    fn forget(&self, va: VirtualAddress, pte: Pte) {
        let m = &*self.machine;
        let Some(frame) = m.frames.get(pte.frame()) else {
            return;
        };
        let mut head = frame.pv();
        head.attrs |= pte.attributes();
        match m.pv.unlink(&mut head, self.id, va) {
            Some((index, _)) => {
                drop(head);
                m.pv.put(index);
            }
            None if m.is_tracking() && self.id != SpaceId::KERNEL => {
                log::warn!("space {}: no pv entry for {} -> {}", self.id, va, pte.frame());
            }
            None => {}
        }
    }

    /// Changes the rights of every mapped page in `start..end` to `prot`.
    ///
    /// Entries already carrying the target rights are left alone. Dropping write
    /// access clears the dirty bit once it has been harvested.
    pub fn protect(&self, start: VirtualAddress, end: VirtualAddress, prot: Protection) {
        let m = &*self.machine;
        let field = encode_protection(prot, self.privilege);
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let mut va = start.align_down(PAGE_SIZE);
        while va < end {
            let Some(table) = inner.directory.get(m, va) else {
                match va.next_table_boundary() {
                    Some(next) => {
                        va = next;
                        continue;
                    }
                    None => break,
                }
            };

            let page = TablePage::new(&m.translator, table);
            let pte = page.get(va);
            if !pte.is_empty() && pte.prot() != field {
                m.flush_pte(self.id, va, pte);
                let previous = page
                    .update(va, |current| {
                        let next = current.with_prot(field);
                        Some(if field.is_writable() {
                            next
                        } else {
                            next.with_flags(PteFlags::DIRTY, false)
                        })
                    })
                    .unwrap_or(pte);
                if let Some(frame) = m.frames.get(previous.frame()) {
                    frame.pv().attrs |= previous.attributes();
                }
                log::trace!("space {}: protect {} {:?}", self.id, va, prot);
            }

            match next_page(va) {
                Some(next) => va = next,
                None => break,
            }
        }
    }

    /// Clears the wired flag of the mapping at `va`.
    pub fn unwire(&self, va: VirtualAddress) {
        let m = &*self.machine;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(table) = inner.directory.get(m, va) else {
            return;
        };
        let page = TablePage::new(&m.translator, table);
        let changed = page.update(va, |current| {
            current
                .is_wired()
                .then(|| current.with_flags(PteFlags::WIRED, false))
        });
        if changed.is_some() {
            inner.stats.wired -= 1;
        }
    }

    /// Returns the physical address `va` translates to, if mapped.
    pub fn extract(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let pte = self.read(va)?;
        Some(pte.frame() + va.page_offset())
    }

    fn read(&self, va: VirtualAddress) -> Option<Pte> {
        let m = &*self.machine;
        let mut inner = self.inner.lock();
        let table = inner.directory.get(m, va)?;
        let pte = TablePage::new(&m.translator, table).get(va);
        (!pte.is_empty()).then_some(pte)
    }

    /// Returns the entry at `va` if it still maps `pa`.
    pub(crate) fn read_alias(&self, va: VirtualAddress, pa: PhysicalAddress) -> Option<Pte> {
        self.read(va).filter(|pte| pte.frame() == pa)
    }

    /// Unmaps `va` if it still maps `pa`.
    pub(crate) fn remove_alias(&self, va: VirtualAddress, pa: PhysicalAddress) -> bool {
        let m = &*self.machine;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(table) = inner.directory.get(m, va) else {
            return false;
        };
        if TablePage::new(&m.translator, table).get(va).frame() != pa {
            return false;
        }
        self.clear_pte(inner, va, table).is_some()
    }

    /// Applies attribute changes to the entry at `va` if it still maps `pa`, returning
    /// the entry as it was.
    pub(crate) fn change_alias(
        &self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        set: Attributes,
        clear: Attributes,
    ) -> Option<Pte> {
        let m = &*self.machine;
        let mut inner = self.inner.lock();
        let table = inner.directory.get(m, va)?;
        let page = TablePage::new(&m.translator, table);
        let pte = page.get(va);
        if pte.is_empty() || pte.frame() != pa {
            return None;
        }
        m.flush_pte(self.id, va, pte);
        page.update(va, |current| Some(current.apply_attributes(set, clear)))
    }

    /// Pushes the mapping at `va` out of the caches and TLBs if it still maps `pa`.
    pub(crate) fn flush_alias(&self, va: VirtualAddress, pa: PhysicalAddress) {
        let m = &*self.machine;
        let mut inner = self.inner.lock();
        let Some(table) = inner.directory.get(m, va) else {
            return;
        };
        let pte = TablePage::new(&m.translator, table).get(va);
        if !pte.is_empty() && pte.frame() == pa {
            m.flush_pte(self.id, va, pte);
        }
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let m = Arc::clone(&self.machine);
        let id = self.id;
        let inner = self.inner.get_mut();

        if id != SpaceId::KERNEL {
            let tables: Vec<_> = inner.directory.tables(&m).collect();
            if !tables.is_empty() {
                log::warn!(
                    "space {}: destroyed with {} page tables resident",
                    id,
                    tables.len()
                );
            }
            for (base, table) in tables {
                let page = TablePage::new(&m.translator, table);
                for index in 0..ENTRIES_PER_PAGE {
                    let va = base + index * PAGE_SIZE;
                    let pte = page.get(va);
                    if pte.is_empty() {
                        continue;
                    }
                    m.flush_pte(id, va, pte);
                    let pte = page.swap(va, Pte::EMPTY);
                    let Some(frame) = m.frames.get(pte.frame()) else {
                        continue;
                    };
                    let mut head = frame.pv();
                    head.attrs |= pte.attributes();
                    if let Some((index, _)) = m.pv.unlink(&mut head, id, va) {
                        drop(head);
                        m.pv.put(index);
                    }
                }
                inner.directory.discard_table(&m, base, table);
            }
        }

        m.sdir.release(id);
        inner.directory.free(&m);
        log::debug!("space {}: destroyed", id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FrameAllocator;
    use crate::testing::{CacheOp, TestSystem};

    const VA: VirtualAddress = VirtualAddress::new(0x0040_3000);

    #[test]
    fn map_unmap_restores_extract_and_counts() {
        let t = TestSystem::new();
        let space = t.system.create().unwrap();
        let frame = t.frame();

        space
            .enter(VA, frame, Protection::READ_WRITE, EnterFlags::empty())
            .unwrap();
        let before = space.stats();
        space
            .enter(VA + PAGE_SIZE, t.frame(), Protection::READ_WRITE, EnterFlags::empty())
            .unwrap();
        assert_eq!(space.extract(VA + PAGE_SIZE + 0x24).map(|pa| pa.page_offset()), Some(0x24));

        space.remove(VA + PAGE_SIZE, VA + 2 * PAGE_SIZE);
        assert_eq!(space.extract(VA + PAGE_SIZE), None);
        assert_eq!(space.stats(), before);
        assert_eq!(space.extract(VA), Some(frame));
    }

    #[test]
    fn tables_are_reclaimed_with_their_last_entry() {
        let t = TestSystem::new();
        let space = t.system.create().unwrap();
        assert_eq!(space.stats().resident, 1);
        let free = t.allocator.free_frames();

        space
            .enter(VA, t.frame(), Protection::READ_WRITE, EnterFlags::empty())
            .unwrap();
        assert_eq!(space.stats().resident, 3);
        assert_eq!(t.allocator.free_frames(), free - 2);

        space.remove(VA, VA + PAGE_SIZE);
        assert_eq!(space.stats().resident, 1);
        assert_eq!(t.allocator.free_frames(), free - 1);
        let m = t.system.machine();
        assert_eq!(space.inner.lock().directory.get(m, VA), None);
    }

    #[test]
    fn protect_is_idempotent_and_skips_flushes() {
        let t = TestSystem::new();
        let space = t.system.create().unwrap();
        space
            .enter(VA, t.frame(), Protection::READ_WRITE, EnterFlags::empty())
            .unwrap();

        space.protect(VA, VA + PAGE_SIZE, Protection::READ);
        let once = space.read(VA).unwrap();
        assert!(!t.cache.ops().is_empty());

        t.cache.clear();
        space.protect(VA, VA + PAGE_SIZE, Protection::READ);
        assert_eq!(space.read(VA), Some(once));
        assert!(t.cache.ops().is_empty());
    }

    #[test]
    fn write_protect_harvests_then_clears_dirty() {
        let t = TestSystem::new();
        let space = t.system.create().unwrap();
        let frame = t.frame();
        space
            .enter(VA, frame, Protection::READ_WRITE, EnterFlags::empty())
            .unwrap();
        assert!(t.system.record_access(space.space_id(), VA, true));

        space.protect(VA, VA + PAGE_SIZE, Protection::READ);
        assert!(!space.read(VA).unwrap().flags().contains(PteFlags::DIRTY));
        assert!(t.system.is_modified(frame));
    }

    #[test]
    fn same_frame_remap_keeps_dirty_bit() {
        let t = TestSystem::new();
        let space = t.system.create().unwrap();
        let frame = t.frame();
        space
            .enter(VA, frame, Protection::READ_WRITE, EnterFlags::empty())
            .unwrap();
        t.system.record_access(space.space_id(), VA, true);

        space
            .enter(VA, frame, Protection::all(), EnterFlags::empty())
            .unwrap();
        let pte = space.read(VA).unwrap();
        assert!(pte.flags().contains(PteFlags::DIRTY));
        assert_eq!(pte.prot().protection(), Protection::all());
        assert_eq!(t.system.mappings(frame).len(), 1);
    }

    #[test]
    fn remap_flushes_old_translation_before_rewrite() {
        let t = TestSystem::new();
        let space = t.system.create().unwrap();
        let (first, second) = (t.frame(), t.frame());
        space
            .enter(VA, first, Protection::READ_EXECUTE, EnterFlags::empty())
            .unwrap();
        t.cache.clear();

        space
            .enter(VA, second, Protection::READ_WRITE, EnterFlags::empty())
            .unwrap();
        let events = t.cache.events();
        assert_eq!(
            events.iter().map(|e| e.op).collect::<Vec<_>>(),
            [
                CacheOp::FlushIcache,
                CacheOp::PurgeItlb,
                CacheOp::PurgeDtlb,
                CacheOp::FlushDcache
            ]
        );
        for event in &events {
            assert_eq!(event.space, space.space_id());
            assert_eq!(event.va, VA);
            assert_eq!(event.pte.frame(), first);
        }
        assert_eq!(space.extract(VA), Some(second));
        assert!(t.system.mappings(first).is_empty());
        assert_eq!(t.system.mappings(second).len(), 1);
    }

    #[test]
    fn remove_flushes_before_clearing() {
        let t = TestSystem::new();
        let space = t.system.create().unwrap();
        space
            .enter(VA, t.frame(), Protection::READ_WRITE, EnterFlags::empty())
            .unwrap();
        let before = space.read(VA).unwrap();
        t.cache.clear();

        space.remove(VA, VA + PAGE_SIZE);
        let events = t.cache.events();
        assert!(!events.is_empty());
        for event in &events {
            assert_eq!((event.space, event.va), (space.space_id(), VA));
            assert_eq!(event.pte, before);
        }
        assert_eq!(space.read(VA), None);
    }

    #[test]
    fn protect_flushes_before_rewrite() {
        let t = TestSystem::new();
        let space = t.system.create().unwrap();
        space
            .enter(VA, t.frame(), Protection::READ_WRITE, EnterFlags::empty())
            .unwrap();
        let before = space.read(VA).unwrap();
        t.cache.clear();

        space.protect(VA, VA + PAGE_SIZE, Protection::READ);
        let events = t.cache.events();
        assert!(!events.is_empty());
        for event in &events {
            assert_eq!(event.pte, before);
            assert_eq!(event.pte.prot().protection(), Protection::READ_WRITE);
        }
        assert_eq!(space.read(VA).unwrap().prot().protection(), Protection::READ);
    }

    #[test]
    fn remap_links_reverse_mapping_before_rewrite() {
        use core::sync::atomic::{AtomicBool, Ordering};

        let t = TestSystem::new();
        let space = t.system.create().unwrap();
        let (first, second) = (t.frame(), t.frame());
        space
            .enter(VA, first, Protection::READ, EnterFlags::empty())
            .unwrap();
        let m = t.system.machine();
        let id = space.space_id();
        let done = AtomicBool::new(false);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for round in 0..2000 {
                    let pa = if round % 2 == 0 { second } else { first };
                    space
                        .enter(VA, pa, Protection::READ, EnterFlags::empty())
                        .unwrap();
                }
                done.store(true, Ordering::Release);
            });
            while !done.load(Ordering::Acquire) {
                for pa in [first, second] {
                    let frame = m.frames.get(pa).unwrap();
                    let head = frame.pv();
                    if m.walk(id, VA).frame() == pa {
                        assert!(m.pv.contains(&head, id, VA), "{pa} mapped without pv entry");
                    }
                }
            }
        });
        assert_eq!(t.system.mappings(first).len(), 1);
        assert!(t.system.mappings(second).is_empty());
    }

    #[test]
    fn kernel_mapping_of_frame_zero_is_visible_and_removable() {
        let t = TestSystem::new();
        let kernel = t.system.kernel();
        let va = VirtualAddress::new(0x0100_0000);
        let zero = PhysicalAddress::new(0);
        let before = kernel.stats();

        kernel
            .enter(va, zero, Protection::READ, EnterFlags::empty())
            .unwrap();
        assert_eq!(kernel.extract(va), Some(zero));
        assert_eq!(kernel.stats().resident, before.resident + 2);

        kernel.remove(va, va + PAGE_SIZE);
        assert_eq!(kernel.extract(va), None);
        // Kernel tables stay once allocated.
        assert_eq!(kernel.stats().resident, before.resident + 1);
        assert_eq!(kernel.stats().wired, before.wired);
    }

    #[test]
    fn remap_to_new_frame_moves_reverse_mapping() {
        let t = TestSystem::new();
        let space = t.system.create().unwrap();
        let (first, second) = (t.frame(), t.frame());
        space
            .enter(VA, first, Protection::READ_WRITE, EnterFlags::WIRED)
            .unwrap();
        t.system.record_access(space.space_id(), VA, true);
        space
            .enter(VA, second, Protection::READ_WRITE, EnterFlags::empty())
            .unwrap();

        assert!(t.system.is_modified(first));
        assert!(!t.system.is_modified(second));
        assert_eq!(space.stats().wired, 0);
        assert_eq!(t.system.machine().pv.live(), 1);
    }

    #[test]
    fn remove_skips_empty_tables() {
        let t = TestSystem::new();
        let space = t.system.create().unwrap();
        let high = VirtualAddress::new(0xbf00_0000);
        space
            .enter(VA, t.frame(), Protection::READ, EnterFlags::empty())
            .unwrap();
        space
            .enter(high, t.frame(), Protection::READ, EnterFlags::empty())
            .unwrap();

        space.remove(VirtualAddress::new(0), VirtualAddress::new(0xffff_ffff));
        assert_eq!(space.extract(VA), None);
        assert_eq!(space.extract(high), None);
        assert_eq!(space.stats().resident, 1);
    }

    #[test]
    fn wired_accounting_and_unwire() {
        let t = TestSystem::new();
        let space = t.system.create().unwrap();
        space
            .enter(VA, t.frame(), Protection::READ, EnterFlags::WIRED)
            .unwrap();
        assert_eq!(space.stats().wired, 1);

        space.unwire(VA);
        space.unwire(VA);
        assert_eq!(space.stats().wired, 0);
        assert!(!space.read(VA).unwrap().is_wired());
    }

    #[test]
    fn uncached_request_sets_uncacheable() {
        let t = TestSystem::new();
        let space = t.system.create().unwrap();
        space
            .enter(VA, t.frame(), Protection::READ_WRITE, EnterFlags::UNCACHED)
            .unwrap();
        assert!(space.read(VA).unwrap().flags().contains(PteFlags::UNCACHEABLE));
    }

    #[test]
    fn can_fail_reports_table_exhaustion() {
        let t = TestSystem::new();
        let space = t.system.create().unwrap();
        let frame = t.frame();
        let held = t.allocator.drain();

        let result = space.enter(VA, frame, Protection::READ, EnterFlags::CAN_FAIL);
        assert_eq!(result, Err(PmapError::OutOfMemory));
        assert_eq!(space.stats().resident, 1);
        assert_eq!(space.extract(VA), None);

        for frame in held {
            t.allocator.deallocate(frame);
        }
    }

    #[test]
    #[should_panic(expected = "pmap enter failed")]
    fn exhaustion_without_can_fail_panics() {
        let t = TestSystem::new();
        let space = t.system.create().unwrap();
        let frame = t.frame();
        let _held = t.allocator.drain();
        let _ = space.enter(VA, frame, Protection::READ, EnterFlags::empty());
    }

    #[test]
    fn pv_exhaustion_releases_fresh_table() {
        let t = TestSystem::with_pv_capacity(1);
        let space = t.system.create().unwrap();
        space
            .enter(VA, t.frame(), Protection::READ, EnterFlags::empty())
            .unwrap();
        let free = t.allocator.free_frames();
        let far = VirtualAddress::new(0x1000_0000);

        let result = space.enter(far, t.frame(), Protection::READ, EnterFlags::CAN_FAIL);
        assert_eq!(result, Err(PmapError::OutOfResources));
        // One frame went to the test's data page; the table came back.
        assert_eq!(t.allocator.free_frames(), free - 1);
        assert_eq!(space.stats().resident, 3);

        // A remap reuses the entry it gives up.
        space
            .enter(VA, t.frame(), Protection::READ, EnterFlags::CAN_FAIL)
            .unwrap();
    }

    #[test]
    fn destroy_tears_down_leftover_tables() {
        let t = TestSystem::new();
        let free = t.allocator.free_frames();
        let frame = t.frame();
        let space = t.system.create().unwrap();
        let id = space.space_id();
        space
            .enter(VA, frame, Protection::READ_WRITE, EnterFlags::empty())
            .unwrap();
        t.system.record_access(id, VA, true);

        let other = space.reference();
        assert_eq!(space.reference_count(), 2);
        space.destroy();
        assert!(t.system.machine().sdir.lookup(id).is_some());
        other.destroy();

        assert_eq!(t.system.machine().sdir.lookup(id), None);
        assert!(t.system.mappings(frame).is_empty());
        assert!(t.system.is_modified(frame));
        assert_eq!(t.allocator.free_frames(), free - 1);
    }

    #[test]
    fn activation_describes_space() {
        let t = TestSystem::new();
        let space = t.system.create().unwrap();
        let activation = space.activation();
        assert_eq!(activation.space, space.space_id());
        assert_eq!(activation.protection_id, (space.space_id().as_u32() + 1) << 1);
        assert_eq!(
            t.system.machine().sdir.lookup(space.space_id()),
            Some(activation.directory)
        );
    }
}
