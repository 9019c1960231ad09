#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # pmap
//!
//! The physical map for a PA-RISC style MMU with a software-reloaded, space-tagged TLB.
//! It provides:
//!
//! - Two-level page tables per address space, with tables allocated on first use and
//!   freed with their last entry.
//! - A space directory mapping hardware space identifiers to page directories, read
//!   lock-free by the TLB miss path.
//! - Reverse mappings from physical frames to every (space, va) that maps them, with
//!   modified/referenced attribute harvesting.
//! - The cache and TLB flush protocol that precedes every PTE change.
//! - Software emulation of physical memory for testing in non-kernel environments.

extern crate alloc;

mod address;
mod address_space;
pub mod arch;
mod cache;
mod config;
mod error;
mod frame;
mod numbers;
mod page_directory;
mod pte;
mod pv;
mod space_directory;
mod system;

#[cfg(test)]
mod testing;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress};
pub use address_space::{Activation, AddressSpace, EnterFlags, Pmap, Statistics};
pub use cache::{CacheOps, HashedPageTable, NoCacheOps, SoftwareWalk, TlbReload, TlbReloadKind};
pub use config::{BootLayout, PmapConfig};
pub use error::{PmapError, Result};
pub use frame::{Frame, FrameAllocator, FrameFlag, FrameFlags, FrameTable};
pub use numbers::{FrameNumber, PageNumber};
pub use page_directory::PageDirectory;
pub use pte::{
    Attributes, Privilege, ProtField, Protection, Pte, PteFields, PteFlags, encode_protection,
};
pub use pv::Mapping;
pub use space_directory::{SpaceDirectory, SpaceId};
pub use system::{Platform, PmapSystem};

#[cfg(any(test, feature = "software-emulation"))]
pub use arch::{EmulatedFrameAllocator, EmulatedMemory};

pub use arch::PAGE_SIZE;
