//! Architecture constants for the PA-RISC address translation layout.
//!
//! The engine models the two-level layout the TLB miss handler walks:
//!
//! - Bits 0-11: Page offset (4 KiB pages)
//! - Bits 12-21: Page table index (1024 entries)
//! - Bits 22-31: Page directory index (1024 slots)
//!
//! Both levels are exactly one page of 32-bit words. A directory slot holds the
//! physical address of a page table (zero when empty); a table entry holds a PTE.
//!
//! When testing, or with the `software-emulation` feature, the [`software`] module
//! supplies an emulated physical memory and frame allocator so the engine can run hosted.

#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use software::{EmulatedFrameAllocator, EmulatedMemory};

/// Maximum number of bits in a physical address.
pub const MAX_PHYSICAL_BITS: usize = 32;

/// Maximum number of bits in a virtual address (the offset within a space).
pub const MAX_VIRTUAL_BITS: usize = 32;

/// Page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: usize = 12;

/// Shift of the directory index within a virtual address.
pub const PDE_SHIFT: usize = 22;

/// Bytes of virtual address space covered by one page table.
pub const PDE_SIZE: usize = 1 << PDE_SHIFT;

/// Number of words in a directory or table page.
pub const ENTRIES_PER_PAGE: usize = PAGE_SIZE / core::mem::size_of::<u32>();

/// Virtually-indexed cache alias distance. Two mappings of one frame whose virtual
/// addresses differ below this boundary land in different cache lines.
pub const ALIAS_MASK: usize = 0x003f_ffff;

/// Virtual address of the syscall gateway page in every space.
pub const SYSCALLGATE: usize = 0xc000_0000;

/// Default physical address above which memory is device (I/O) space.
pub const IO_SPACE: usize = 0xf000_0000;

/// Space identifier reserved for the kernel.
pub const KERNEL_SPACE_ID: u32 = 0;

/// Default exclusive upper bound for user space identifiers.
pub const MAX_SPACE_ID: u32 = 0x7ffd;

/// Returns the directory slot for a virtual address.
#[inline]
pub const fn pde_index(address: usize) -> usize {
    (address >> PDE_SHIFT) & (ENTRIES_PER_PAGE - 1)
}

/// Returns the page table index for a virtual address.
#[inline]
pub const fn pte_index(address: usize) -> usize {
    (address >> PAGE_SHIFT) & (ENTRIES_PER_PAGE - 1)
}

/// Validates a physical address.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr <= u32::MAX as usize
}

/// Validates a virtual address.
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    addr <= u32::MAX as usize
}
