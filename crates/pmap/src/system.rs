//! The pmap system: process-wide state and the operations that cross address spaces.
//!
//! [`PmapSystem::bootstrap`] builds the kernel address space before any allocator for
//! reverse-map entries exists; [`PmapSystem::init`] turns reverse mapping on once the
//! VM system is up. Operations keyed by physical frame (`page_remove`, `test_attribute`,
//! `change_attribute`, `zero_page`, `copy_page`) walk the frame's aliases one space at a
//! time.

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::ops::Range;
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Once;

#[cfg(any(test, feature = "alias-check"))]
use core::sync::atomic::AtomicUsize;

use crate::{
    AddressSpace, AddressTranslator, Attributes, BootLayout, CacheOps, EnterFlags,
    FrameAllocator, FrameTable, PageDirectory, PhysicalAddress, Pmap, PmapConfig, Privilege,
    ProtField, Protection, Pte, PteFields, PteFlags, Result, SpaceDirectory, SpaceId, TlbReload,
    VirtualAddress,
    arch::{self, PAGE_SIZE},
    cache,
    page_directory::{DirectoryPage, TablePage},
    pv::{Mapping, PvPool},
    space_directory::Owner,
};

static GLOBAL: Once<PmapSystem> = Once::new();

/// State shared by every address space.
pub(crate) struct Machine {
    pub translator: AddressTranslator,
    pub allocator: Arc<dyn FrameAllocator>,
    pub frames: FrameTable,
    pub cache: Arc<dyn CacheOps>,
    pub tlb: Box<dyn TlbReload>,
    pub pv: PvPool,
    pub sdir: SpaceDirectory,
    pub config: PmapConfig,
    tracking: AtomicBool,
    #[cfg(any(test, feature = "alias-check"))]
    pub alias_warnings: AtomicUsize,
}

impl Machine {
    /// Returns true once reverse mappings are being kept.
    pub fn is_tracking(&self) -> bool {
        self.tracking.load(Ordering::Acquire)
    }

    fn table_for(&self, space: SpaceId, va: VirtualAddress) -> Option<PhysicalAddress> {
        let directory = self.sdir.lookup(space)?;
        DirectoryPage::new(&self.translator, directory).get(va)
    }

    /// Walks space directory, directory and table without taking any lock.
    pub fn walk(&self, space: SpaceId, va: VirtualAddress) -> Pte {
        self.table_for(space, va)
            .map_or(Pte::EMPTY, |table| TablePage::new(&self.translator, table).get(va))
    }

    /// Pushes `pte`, the current translation of (space, va), out of caches and TLBs.
    pub fn flush_pte(&self, space: SpaceId, va: VirtualAddress, pte: Pte) {
        cache::flush_translation(&*self.cache, &*self.tlb, space, va, pte);
    }
}

/// The collaborators the engine runs on.
pub struct Platform {
    /// Access to physical memory.
    pub translator: AddressTranslator,
    /// Source of directory and table pages.
    pub allocator: Arc<dyn FrameAllocator>,
    /// Cache and TLB primitives.
    pub cache: Arc<dyn CacheOps>,
    /// Metadata for managed physical memory.
    pub frames: FrameTable,
}

/// The physical map.
pub struct PmapSystem {
    machine: Arc<Machine>,
    kernel: Pmap,
    virtual_avail: VirtualAddress,
}

impl PmapSystem {
    /// Builds the kernel address space and its boot mappings.
    ///
    /// Kernel text and data are mapped one-to-one and wired; the gateway page is mapped
    /// at [`SYSCALLGATE`](arch::SYSCALLGATE). Reverse mapping stays off until
    /// [`init`](Self::init).
    pub fn bootstrap(config: PmapConfig, platform: Platform, layout: &BootLayout) -> Result<Self> {
        let machine = Arc::new(Machine {
            translator: platform.translator,
            allocator: platform.allocator,
            frames: platform.frames,
            cache: platform.cache,
            tlb: config.tlb_reload.build(),
            pv: PvPool::new(config.pv_pool_capacity),
            sdir: SpaceDirectory::new(config.max_space_id, config.space_id_seed),
            config,
            tracking: AtomicBool::new(false),
            #[cfg(any(test, feature = "alias-check"))]
            alias_warnings: AtomicUsize::new(0),
        });

        let directory = PageDirectory::allocate(&machine, Some(SpaceId::KERNEL))?;
        machine.sdir.install_kernel(directory.physical_address());
        let kernel = Arc::new(AddressSpace::new(
            SpaceId::KERNEL,
            Arc::clone(&machine),
            directory,
            Privilege::Kernel,
        ));
        machine.sdir.attach(SpaceId::KERNEL, Arc::downgrade(&kernel));
        let kernel = Pmap(kernel);

        log::debug!(
            "bootstrap: text {}..{} data {}..{}",
            layout.kernel_text.start,
            layout.kernel_text.end,
            layout.kernel_data.start,
            layout.kernel_data.end
        );
        let flags = EnterFlags::WIRED | EnterFlags::CAN_FAIL;
        for (range, prot) in [
            (&layout.kernel_text, Protection::READ_EXECUTE),
            (&layout.kernel_data, Protection::READ_WRITE),
        ] {
            let mut pa = range.start.align_down(PAGE_SIZE);
            while pa < range.end {
                kernel.enter(VirtualAddress::new(pa.as_usize()), pa, prot, flags)?;
                pa = pa + PAGE_SIZE;
            }
        }

        let gateway = PteFields {
            frame: layout.gateway_page,
            prot: ProtField::GATEWAY,
            wired: true,
            uncacheable: false,
            dirty: false,
            reftrap: false,
        };
        kernel.enter_fields(VirtualAddress::new(arch::SYSCALLGATE), gateway, true)?;
        log::debug!("bootstrap: gateway {} at {:#x}", layout.gateway_page, arch::SYSCALLGATE);

        Ok(Self {
            machine,
            kernel,
            virtual_avail: VirtualAddress::new(layout.end().as_usize()),
        })
    }

    /// Starts keeping reverse mappings for managed frames.
    pub fn init(&self) {
        self.machine.tracking.store(true, Ordering::Release);
        log::debug!("pmap: reverse mapping enabled");
    }

    /// Makes this system reachable through [`global`](Self::global).
    ///
    /// # Panics
    ///
    /// Panics if a system was already installed.
    pub fn install_global(self) -> &'static PmapSystem {
        assert!(!GLOBAL.is_completed(), "pmap system installed twice");
        GLOBAL.call_once(move || self)
    }

    /// Returns the installed system, if any.
    pub fn global() -> Option<&'static PmapSystem> {
        GLOBAL.get()
    }

    pub(crate) fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    /// Returns the kernel address space.
    pub fn kernel(&self) -> &Pmap {
        &self.kernel
    }

    /// Returns the kernel virtual range free for general use after bootstrap.
    pub fn virtual_space(&self) -> Range<VirtualAddress> {
        self.virtual_avail..VirtualAddress::new(arch::SYSCALLGATE)
    }

    /// Creates a user address space with a fresh random identifier.
    pub fn create(&self) -> Result<Pmap> {
        let m = &self.machine;
        let directory = PageDirectory::allocate(m, None)?;
        let id = match m.sdir.allocate(directory.physical_address()) {
            Ok(id) => id,
            Err(err) => {
                directory.free(m);
                return Err(err);
            }
        };
        let space = Arc::new(AddressSpace::new(
            id,
            Arc::clone(m),
            directory,
            Privilege::User,
        ));
        m.sdir.attach(id, Arc::downgrade(&space));
        log::debug!("space {}: created", id);
        Ok(Pmap(space))
    }

    /// Gives the system a chance to reclaim page table pages from `space`.
    ///
    /// Tables are already freed as their last entry goes away, so there is nothing
    /// left to do.
    pub fn collect(&self, space: &Pmap) {
        log::trace!("space {}: collect", space.space_id());
    }

    /// Maps a kernel page. Always wired; device memory is made uncacheable.
    ///
    /// # Panics
    ///
    /// Panics if the mapping cannot be made.
    pub fn kernel_enter(&self, va: VirtualAddress, pa: PhysicalAddress, prot: Protection) {
        let mut flags = EnterFlags::WIRED;
        if pa.as_usize() >= self.machine.config.io_space {
            flags |= EnterFlags::UNCACHED;
        }
        if let Err(err) = self.kernel.enter(va, pa, prot, flags) {
            log::error!("kernel_enter {} -> {}: {}", va, pa, err);
            panic!("kernel_enter failed: {err}");
        }
    }

    /// Unmaps `len` bytes of kernel address space starting at `va`.
    pub fn kernel_remove(&self, va: VirtualAddress, len: usize) {
        let end = va
            .checked_add(len)
            .unwrap_or(VirtualAddress::new(u32::MAX as usize));
        self.kernel.remove(va, end);
    }

    fn space(&self, id: SpaceId) -> Option<Arc<AddressSpace>> {
        self.machine.sdir.space(id)
    }

    /// Returns every (space, va) currently mapping the frame at `pa`.
    pub fn mappings(&self, pa: PhysicalAddress) -> Vec<Mapping> {
        let m = &self.machine;
        m.frames
            .get(pa)
            .map(|frame| m.pv.snapshot(&frame.pv()))
            .unwrap_or_default()
    }

    /// Drops a stale reverse mapping whose PTE no longer maps `pa`.
    fn drop_stale(&self, pa: PhysicalAddress, alias: Mapping) {
        let m = &self.machine;
        let Some(frame) = m.frames.get(pa) else {
            return;
        };
        let mut head = frame.pv();
        if let Some((index, _)) = m.pv.unlink(&mut head, alias.space, alias.va) {
            drop(head);
            m.pv.put(index);
        }
    }

    /// Removes every mapping of the frame at `pa`.
    ///
    /// An alias in a space that is still being torn down is left to the teardown, which
    /// flushes and unlinks it; this waits for that to finish.
    pub fn page_remove(&self, pa: PhysicalAddress) {
        let sdir = &self.machine.sdir;
        loop {
            let aliases = self.mappings(pa);
            if aliases.is_empty() {
                break;
            }
            let mut dying = false;
            for alias in aliases {
                match sdir.owner(alias.space) {
                    Owner::Live(space) => {
                        if !space.remove_alias(alias.va, pa) {
                            self.drop_stale(pa, alias);
                        }
                    }
                    Owner::Dying => dying = true,
                    Owner::Gone => sdir.if_unowned(alias.space, || self.drop_stale(pa, alias)),
                }
            }
            if dying {
                core::hint::spin_loop();
            }
        }
        log::trace!("page_remove {}", pa);
    }

    fn flush_aliases(&self, pa: PhysicalAddress) {
        for alias in self.mappings(pa) {
            if let Some(space) = self.space(alias.space) {
                space.flush_alias(alias.va, pa);
            }
        }
    }

    /// Fills the frame at `pa` with zeroes.
    pub fn zero_page(&self, pa: PhysicalAddress) {
        debug_assert!(pa.is_aligned(PAGE_SIZE), "unaligned frame {pa}");
        let m = &self.machine;
        self.flush_aliases(pa);
        m.cache
            .purge_dcache(SpaceId::KERNEL, VirtualAddress::new(pa.as_usize()), PAGE_SIZE);
        // SAFETY: `pa` names a whole frame reachable through the translator, and every
        // cached alias of it has just been flushed.
        unsafe { ptr::write_bytes(m.translator.phys_to_ptr::<u8>(pa), 0, PAGE_SIZE) };
        m.cache
            .flush_dcache(SpaceId::KERNEL, VirtualAddress::new(pa.as_usize()), PAGE_SIZE);
    }

    /// Copies the frame at `src` over the frame at `dst`.
    pub fn copy_page(&self, src: PhysicalAddress, dst: PhysicalAddress) {
        debug_assert!(src != dst, "copying frame {src} onto itself");
        let m = &self.machine;
        self.flush_aliases(src);
        self.flush_aliases(dst);
        let src_va = VirtualAddress::new(src.as_usize());
        let dst_va = VirtualAddress::new(dst.as_usize());
        m.cache.write_back_dcache(SpaceId::KERNEL, src_va, PAGE_SIZE);
        m.cache.purge_dcache(SpaceId::KERNEL, dst_va, PAGE_SIZE);
        // SAFETY: both frames are whole pages reachable through the translator and
        // distinct, so the ranges do not overlap.
        unsafe {
            ptr::copy_nonoverlapping(
                m.translator.phys_to_ptr::<u8>(src),
                m.translator.phys_to_ptr::<u8>(dst),
                PAGE_SIZE,
            )
        };
        m.cache.flush_dcache(SpaceId::KERNEL, dst_va, PAGE_SIZE);
    }

    /// Returns true if any attribute in `mask` is set for the frame at `pa`.
    ///
    /// Live mappings are consulted until the answer is known.
    pub fn test_attribute(&self, pa: PhysicalAddress, mask: Attributes) -> bool {
        let m = &self.machine;
        let Some(frame) = m.frames.get(pa) else {
            return false;
        };
        let (mut attrs, aliases) = {
            let head = frame.pv();
            (head.attrs, m.pv.snapshot(&head))
        };
        for alias in aliases {
            if attrs.intersects(mask) {
                break;
            }
            let Some(pte) = self
                .space(alias.space)
                .and_then(|space| space.read_alias(alias.va, pa))
            else {
                continue;
            };
            let seen = pte.attributes();
            if !attrs.contains(seen) {
                attrs |= seen;
                frame.pv().attrs |= seen;
            }
        }
        attrs.intersects(mask)
    }

    /// Sets and clears attributes of the frame at `pa` in every live mapping.
    ///
    /// Returns true if any attribute in `set` or `clear` was observed before the
    /// change. Aliases are visited one space at a time; a mapping entered or removed
    /// concurrently may or may not be seen.
    pub fn change_attribute(
        &self,
        pa: PhysicalAddress,
        set: Attributes,
        clear: Attributes,
    ) -> bool {
        let m = &self.machine;
        let Some(frame) = m.frames.get(pa) else {
            return false;
        };
        let (mut seen, aliases) = {
            let mut head = frame.pv();
            let seen = head.attrs;
            head.attrs = head.attrs.difference(clear).union(set);
            (seen, m.pv.snapshot(&head))
        };
        for alias in aliases {
            if let Some(previous) = self
                .space(alias.space)
                .and_then(|space| space.change_alias(alias.va, pa, set, clear))
            {
                seen |= previous.attributes();
            }
        }
        seen.intersects(set | clear)
    }

    /// Returns true if the frame has been written.
    pub fn is_modified(&self, pa: PhysicalAddress) -> bool {
        self.test_attribute(pa, Attributes::MODIFIED)
    }

    /// Returns true if the frame has been touched since its reference bit was cleared.
    pub fn is_referenced(&self, pa: PhysicalAddress) -> bool {
        self.test_attribute(pa, Attributes::REFERENCED)
    }

    /// Clears the modified attribute, returning whether it was set.
    pub fn clear_modify(&self, pa: PhysicalAddress) -> bool {
        self.change_attribute(pa, Attributes::empty(), Attributes::MODIFIED)
    }

    /// Clears the referenced attribute, returning whether it was set.
    pub fn clear_reference(&self, pa: PhysicalAddress) -> bool {
        self.change_attribute(pa, Attributes::empty(), Attributes::REFERENCED)
    }

    /// Resolves a TLB miss for (space, va). Takes no space lock.
    pub fn tlb_miss(&self, space: SpaceId, va: VirtualAddress) -> Option<Pte> {
        let m = &self.machine;
        if let Some(pte) = m.tlb.lookup(space, va) {
            return Some(pte);
        }
        let pte = m.walk(space, va);
        if pte.is_empty() {
            return None;
        }
        m.tlb.insert(space, va, pte);
        Some(pte)
    }

    /// Handles a reference or dirty-bit trap: marks the entry referenced, and dirty
    /// for a store. Returns false if the access is not permitted.
    pub fn record_access(&self, space: SpaceId, va: VirtualAddress, write: bool) -> bool {
        let m = &self.machine;
        let Some(table) = m.table_for(space, va) else {
            return false;
        };
        let page = TablePage::new(&m.translator, table);
        let permitted = |pte: Pte| {
            !pte.is_empty()
                && pte.prot() != ProtField::NO_ACCESS
                && (!write || pte.prot().is_writable())
        };
        let updated = page.update(va, |pte| {
            if !permitted(pte) {
                return None;
            }
            let next = pte.with_flags(PteFlags::REFTRAP, false);
            Some(if write {
                next.with_flags(PteFlags::DIRTY, true)
            } else {
                next
            })
        });
        if updated.is_none() {
            return false;
        }
        m.tlb.invalidate(space, va);
        true
    }

    /// Returns the number of writable cache aliases reported so far.
    #[cfg(any(test, feature = "alias-check"))]
    pub fn alias_warnings(&self) -> usize {
        self.machine.alias_warnings.load(Ordering::Relaxed)
    }
}
