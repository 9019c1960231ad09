//! Fixtures shared by the unit tests.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use spin::{Mutex, MutexGuard, Once};

use crate::{
    AddressTranslator, BootLayout, CacheOps, EmulatedFrameAllocator, FrameAllocator, FrameTable,
    PhysicalAddress, Platform, PmapConfig, PmapSystem, Pte, SpaceId, VirtualAddress,
    arch::PAGE_SIZE, system::Machine,
};

/// Frames of emulated memory behind every test system.
pub const FRAMES: usize = 256;

/// First frame handed out by the test allocator. Frames below it hold the kernel image.
pub const FIRST_FREE_FRAME: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheOp {
    FlushIcache,
    PurgeItlb,
    FlushDcache,
    PurgeDtlb,
    PurgeDcache,
    WriteBackDcache,
}

/// One cache primitive and the PTE the miss handler would have seen when it ran.
#[derive(Debug, Clone, Copy)]
pub struct CacheEvent {
    pub op: CacheOp,
    pub space: SpaceId,
    pub va: VirtualAddress,
    pub pte: Pte,
}

/// Cache operations that record every call.
pub struct RecordingCache {
    events: Mutex<Vec<CacheEvent>>,
    machine: Once<Weak<Machine>>,
}

impl Default for RecordingCache {
    fn default() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            machine: Once::new(),
        }
    }
}

impl RecordingCache {
    pub(crate) fn attach(&self, machine: &Arc<Machine>) {
        self.machine.call_once(|| Arc::downgrade(machine));
    }

    pub fn events(&self) -> Vec<CacheEvent> {
        self.events.lock().clone()
    }

    pub fn ops(&self) -> Vec<CacheOp> {
        self.events.lock().iter().map(|event| event.op).collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Blocks every cache primitive until the guard is dropped.
    pub fn stall(&self) -> MutexGuard<'_, Vec<CacheEvent>> {
        self.events.lock()
    }

    fn record(&self, op: CacheOp, space: SpaceId, va: VirtualAddress) {
        let pte = self
            .machine
            .get()
            .and_then(Weak::upgrade)
            .map_or(Pte::EMPTY, |machine| machine.walk(space, va));
        self.events.lock().push(CacheEvent { op, space, va, pte });
    }
}

impl CacheOps for RecordingCache {
    fn flush_icache(&self, space: SpaceId, va: VirtualAddress, _: usize) {
        self.record(CacheOp::FlushIcache, space, va);
    }

    fn purge_itlb(&self, space: SpaceId, va: VirtualAddress) {
        self.record(CacheOp::PurgeItlb, space, va);
    }

    fn flush_dcache(&self, space: SpaceId, va: VirtualAddress, _: usize) {
        self.record(CacheOp::FlushDcache, space, va);
    }

    fn purge_dtlb(&self, space: SpaceId, va: VirtualAddress) {
        self.record(CacheOp::PurgeDtlb, space, va);
    }

    fn purge_dcache(&self, space: SpaceId, va: VirtualAddress, _: usize) {
        self.record(CacheOp::PurgeDcache, space, va);
    }

    fn write_back_dcache(&self, space: SpaceId, va: VirtualAddress, _: usize) {
        self.record(CacheOp::WriteBackDcache, space, va);
    }
}

/// A bootstrapped, initialized system over emulated memory.
///
/// Kernel text is frames 1-2, data frames 3-4 and the gateway frame 5.
pub struct TestSystem {
    pub system: PmapSystem,
    pub allocator: Arc<EmulatedFrameAllocator>,
    pub cache: Arc<RecordingCache>,
}

impl TestSystem {
    pub fn new() -> Self {
        Self::with_config(Self::config())
    }

    pub fn with_pv_capacity(capacity: usize) -> Self {
        Self::with_config(PmapConfig {
            pv_pool_capacity: capacity,
            ..Self::config()
        })
    }

    pub fn config() -> PmapConfig {
        PmapConfig {
            space_id_seed: 0x5eed,
            ..PmapConfig::default()
        }
    }

    pub fn with_config(config: PmapConfig) -> Self {
        let allocator = Arc::new(EmulatedFrameAllocator::new(
            FIRST_FREE_FRAME,
            FRAMES - FIRST_FREE_FRAME,
        ));
        let cache = Arc::new(RecordingCache::default());
        let platform = Platform {
            translator: AddressTranslator::emulated(FRAMES),
            allocator: allocator.clone(),
            cache: cache.clone(),
            frames: FrameTable::new(PhysicalAddress::new(0), FRAMES),
        };
        let system = PmapSystem::bootstrap(config, platform, &Self::layout())
            .expect("bootstrap failed");
        cache.attach(system.machine());
        system.init();
        cache.clear();
        Self {
            system,
            allocator,
            cache,
        }
    }

    pub fn layout() -> BootLayout {
        BootLayout {
            kernel_text: Self::page(1)..Self::page(3),
            kernel_data: Self::page(3)..Self::page(5),
            gateway_page: Self::page(5),
        }
    }

    /// Returns the address of emulated frame `n`.
    pub fn page(n: usize) -> PhysicalAddress {
        PhysicalAddress::new(n * PAGE_SIZE)
    }

    /// Takes a frame from the allocator for use as a data page.
    pub fn frame(&self) -> PhysicalAddress {
        self.allocator
            .allocate(None)
            .expect("test frames exhausted")
    }
}
