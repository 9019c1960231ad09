//! Boot-time configuration.

use core::ops::Range;

use crate::{PhysicalAddress, TlbReloadKind, arch};

/// Tunables consumed once by [`PmapSystem::bootstrap`](crate::PmapSystem::bootstrap).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmapConfig {
    /// Exclusive upper bound of the space identifier range.
    pub max_space_id: u32,
    /// Maximum number of live reverse-map entries.
    pub pv_pool_capacity: usize,
    /// Physical addresses at or above this are device registers; kernel mappings of
    /// them are made uncacheable.
    pub io_space: usize,
    /// Seed for space identifier selection.
    pub space_id_seed: u64,
    /// How TLB misses are refilled.
    pub tlb_reload: TlbReloadKind,
}

impl Default for PmapConfig {
    fn default() -> Self {
        Self {
            max_space_id: arch::MAX_SPACE_ID,
            pv_pool_capacity: 1 << 16,
            io_space: arch::IO_SPACE,
            space_id_seed: 0x9e37_79b9_7f4a_7c15,
            tlb_reload: TlbReloadKind::SoftwareWalk,
        }
    }
}

/// Physical layout of the loaded kernel.
///
/// Text and data are mapped one-to-one, wired, before anything else runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootLayout {
    /// Kernel text, mapped read/execute.
    pub kernel_text: Range<PhysicalAddress>,
    /// Kernel data and bss, mapped read/write.
    pub kernel_data: Range<PhysicalAddress>,
    /// The page holding the syscall gateway code.
    pub gateway_page: PhysicalAddress,
}

impl BootLayout {
    /// Returns the first page past the kernel image.
    pub fn end(&self) -> PhysicalAddress {
        self.kernel_text
            .end
            .max(self.kernel_data.end)
            .align_up(arch::PAGE_SIZE)
    }
}
