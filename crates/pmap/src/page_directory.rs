//! Page directory and page table pages.
//!
//! This module provides views over directory and table pages in physical memory and the
//! `PageDirectory` type each address space owns, which allocates page tables lazily one
//! at a time and returns them once their last entry goes away.
//!
//! Words are accessed atomically: the TLB miss path reads them without taking the
//! owning space's lock.

use core::ptr;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::{
    AddressTranslator, FrameFlag, PhysicalAddress, PmapError, Pte, Result, SpaceId, Statistics,
    VirtualAddress,
    arch::{self, ENTRIES_PER_PAGE},
    system::Machine,
};

type Words = [AtomicU32; ENTRIES_PER_PAGE];

fn words(translator: &AddressTranslator, page: PhysicalAddress) -> &Words {
    debug_assert!(
        page.is_aligned(arch::PAGE_SIZE),
        "table pointer is not page-aligned"
    );
    // SAFETY: `page` is a directory or table page handed to us by the frame allocator,
    // reachable through the translator for as long as the translator lives, and every
    // access to its words is atomic.
    unsafe { &*translator.phys_to_ptr::<Words>(page) }
}

/// Fills a freshly allocated page with zeroes before anything can see it.
pub(crate) fn zero_page(translator: &AddressTranslator, page: PhysicalAddress) {
    // SAFETY: the page was just allocated and is not yet published anywhere.
    unsafe { ptr::write_bytes(translator.phys_to_ptr::<u8>(page), 0, arch::PAGE_SIZE) }
}

/// A view of a directory page.
pub(crate) struct DirectoryPage<'a> {
    words: &'a Words,
}

impl<'a> DirectoryPage<'a> {
    pub fn new(translator: &'a AddressTranslator, page: PhysicalAddress) -> Self {
        Self {
            words: words(translator, page),
        }
    }

    /// Returns the table installed for `va`, if any.
    pub fn get(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let word = self.words[va.pde_index()].load(Ordering::Acquire);
        (word != 0).then(|| PhysicalAddress::from(word))
    }

    fn set(&self, va: VirtualAddress, table: Option<PhysicalAddress>) {
        let word = table.map_or(0, PhysicalAddress::as_word);
        self.words[va.pde_index()].store(word, Ordering::Release);
    }

    fn slot(&self, slot: usize) -> Option<PhysicalAddress> {
        let word = self.words[slot].load(Ordering::Acquire);
        (word != 0).then(|| PhysicalAddress::from(word))
    }
}

/// A view of a page table page.
pub(crate) struct TablePage<'a> {
    words: &'a Words,
}

impl<'a> TablePage<'a> {
    pub fn new(translator: &'a AddressTranslator, page: PhysicalAddress) -> Self {
        Self {
            words: words(translator, page),
        }
    }

    /// Reads the PTE for `va`.
    pub fn get(&self, va: VirtualAddress) -> Pte {
        Pte::from_word(self.words[va.pte_index()].load(Ordering::Acquire))
    }

    /// Writes the PTE for `va`.
    pub fn set(&self, va: VirtualAddress, pte: Pte) {
        self.words[va.pte_index()].store(pte.as_word(), Ordering::Release);
    }

    /// Replaces the PTE for `va`, returning the entry it held.
    pub fn swap(&self, va: VirtualAddress, pte: Pte) -> Pte {
        Pte::from_word(self.words[va.pte_index()].swap(pte.as_word(), Ordering::AcqRel))
    }

    /// Atomically rewrites the PTE for `va` as long as `f` returns a new value.
    /// Returns the previous entry on success.
    pub fn update(&self, va: VirtualAddress, mut f: impl FnMut(Pte) -> Option<Pte>) -> Option<Pte> {
        self.words[va.pte_index()]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                f(Pte::from_word(word)).map(Pte::as_word)
            })
            .ok()
            .map(Pte::from_word)
    }

    fn is_empty(&self) -> bool {
        self.words.iter().all(|word| word.load(Ordering::Acquire) == 0)
    }
}

#[derive(Debug, Clone, Copy)]
struct TableHint {
    slot: usize,
    table: PhysicalAddress,
}

/// The root of an address space's translation tree.
///
/// Only the owning space touches it, always under the space lock.
pub struct PageDirectory {
    phys: PhysicalAddress,
    hint: Option<TableHint>,
}

impl PageDirectory {
    /// Allocates and zeroes a directory page.
    pub(crate) fn allocate(m: &Machine, owner: Option<SpaceId>) -> Result<Self> {
        let phys = m
            .allocator
            .allocate(owner)
            .ok_or(PmapError::OutOfMemory)?;
        zero_page(&m.translator, phys);
        if let Some(frame) = m.frames.get(phys) {
            frame.flags.atomic_set(FrameFlag::Directory);
        }
        Ok(Self { phys, hint: None })
    }

    /// Returns the physical address of the directory page.
    pub fn physical_address(&self) -> PhysicalAddress {
        self.phys
    }

    fn page<'a>(&self, m: &'a Machine) -> DirectoryPage<'a> {
        DirectoryPage::new(&m.translator, self.phys)
    }

    /// Returns the page table covering `va`, if one is installed.
    ///
    /// The hint remembers the last table touched; it is checked against the directory
    /// slot before being trusted.
    pub(crate) fn get(&mut self, m: &Machine, va: VirtualAddress) -> Option<PhysicalAddress> {
        let page = self.page(m);
        if let Some(hint) = self.hint
            && hint.slot == va.pde_index()
            && page.get(va) == Some(hint.table)
        {
            return Some(hint.table);
        }

        let table = page.get(va)?;
        self.hint = Some(TableHint {
            slot: va.pde_index(),
            table,
        });
        Some(table)
    }

    /// Allocates, zeroes and installs the page table covering `va`.
    ///
    /// The table page counts toward the space's resident pages. Its wire count starts
    /// at 1: the table's own existence, with no live entries.
    pub(crate) fn alloc_table(
        &mut self,
        m: &Machine,
        owner: SpaceId,
        va: VirtualAddress,
        stats: &mut Statistics,
    ) -> Result<PhysicalAddress> {
        let table = m
            .allocator
            .allocate(Some(owner))
            .ok_or(PmapError::OutOfMemory)?;
        zero_page(&m.translator, table);
        if let Some(frame) = m.frames.get(table) {
            frame.flags.atomic_set(FrameFlag::Table);
            frame.set_wire_count(1);
        }

        self.page(m).set(va, Some(table));
        stats.resident += 1;
        self.hint = Some(TableHint {
            slot: va.pde_index(),
            table,
        });
        log::debug!(
            "space {}: table {} for {}",
            owner,
            table,
            va.align_down(arch::PDE_SIZE)
        );
        Ok(table)
    }

    /// Drops one live entry from `table`, freeing it once only its own existence
    /// holds it.
    pub(crate) fn release_table(
        &mut self,
        m: &Machine,
        owner: SpaceId,
        va: VirtualAddress,
        table: PhysicalAddress,
        stats: &mut Statistics,
    ) {
        let Some(frame) = m.frames.get(table) else {
            return;
        };
        if frame.unwire() > 1 {
            return;
        }
        debug_assert!(
            TablePage::new(&m.translator, table).is_empty(),
            "freeing a table with live entries"
        );

        self.page(m).set(va, None);
        stats.resident -= 1;
        if self.hint.is_some_and(|hint| hint.table == table) {
            self.hint = None;
        }
        frame.set_wire_count(0);
        frame.flags.atomic_clear(FrameFlag::Table);
        m.allocator.deallocate(table);
        log::debug!("space {}: freed table {}", owner, table);
    }

    /// Returns every installed table as (first va covered, table).
    pub(crate) fn tables<'a>(
        &self,
        m: &'a Machine,
    ) -> impl Iterator<Item = (VirtualAddress, PhysicalAddress)> + 'a {
        let page = self.page(m);
        (0..ENTRIES_PER_PAGE).filter_map(move |slot| {
            page.slot(slot)
                .map(|table| (VirtualAddress::new(slot << arch::PDE_SHIFT), table))
        })
    }

    /// Unlinks `table` without consulting its wire count. Used on teardown.
    pub(crate) fn discard_table(
        &mut self,
        m: &Machine,
        va: VirtualAddress,
        table: PhysicalAddress,
    ) {
        self.page(m).set(va, None);
        self.hint = None;
        if let Some(frame) = m.frames.get(table) {
            frame.set_wire_count(0);
            frame.flags.atomic_clear(FrameFlag::Table);
        }
        m.allocator.deallocate(table);
    }

    /// Returns the directory page to the allocator.
    pub(crate) fn free(&self, m: &Machine) {
        if let Some(frame) = m.frames.get(self.phys) {
            frame.flags.atomic_clear(FrameFlag::Directory);
        }
        m.allocator.deallocate(self.phys);
    }
}
