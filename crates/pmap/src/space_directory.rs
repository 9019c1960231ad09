//! Space identifiers and the space directory.
//!
//! The space directory maps a space identifier to the physical address of that space's
//! page directory. The TLB miss path indexes it with the faulting space register, so
//! the hardware-visible half is a flat array of words read without locks. The registry
//! half (identifier allocation, back-references to live spaces) sits behind its own lock.

use alloc::{boxed::Box, sync::Arc, sync::Weak, vec::Vec};
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use rand::{RngCore, SeedableRng, rngs::SmallRng};
use spin::Mutex;

use crate::{AddressSpace, PhysicalAddress, PmapError, Result, arch};

/// Attempts at a random identifier before falling back to a scan.
const RANDOM_PROBES: usize = 32;

/// A hardware space identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SpaceId(u32);

impl SpaceId {
    /// The kernel's reserved identifier.
    pub const KERNEL: Self = Self(arch::KERNEL_SPACE_ID);

    /// Creates an identifier from its raw value.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw identifier.
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the protection identifier loaded into the PID registers for this space.
    pub const fn protection_id(self) -> u32 {
        (self.0 + 1) << 1
    }
}

impl fmt::Debug for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpaceId({:#x})", self.0)
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

struct Registry {
    spaces: Vec<Weak<AddressSpace>>,
    rng: SmallRng,
    live: usize,
}

/// What a space identifier refers to.
pub(crate) enum Owner {
    Live(Arc<AddressSpace>),
    /// The last reference is gone and teardown has not released the identifier yet.
    Dying,
    Gone,
}

/// Process-wide map from space identifier to page directory.
pub struct SpaceDirectory {
    directories: Box<[AtomicU32]>,
    registry: Mutex<Registry>,
}

impl SpaceDirectory {
    /// Creates a directory for identifiers `0..limit`; 0 is reserved for the kernel.
    ///
    /// # Panics
    ///
    /// Panics if `limit` leaves no room for a user identifier.
    pub fn new(limit: u32, seed: u64) -> Self {
        assert!(limit >= 2, "space identifier range is empty");
        let directories = (0..limit).map(|_| AtomicU32::new(0)).collect();
        let spaces = (0..limit).map(|_| Weak::new()).collect();
        Self {
            directories,
            registry: Mutex::new(Registry {
                spaces,
                rng: SmallRng::seed_from_u64(seed),
                live: 0,
            }),
        }
    }

    /// Returns the page directory installed for `space`. Never blocks.
    pub fn lookup(&self, space: SpaceId) -> Option<PhysicalAddress> {
        let word = self
            .directories
            .get(space.0 as usize)?
            .load(Ordering::Acquire);
        (word != 0).then(|| PhysicalAddress::from(word))
    }

    /// Returns the number of user identifiers in use.
    pub fn live(&self) -> usize {
        self.registry.lock().live
    }

    /// Picks a random unused identifier and installs `directory` for it.
    pub(crate) fn allocate(&self, directory: PhysicalAddress) -> Result<SpaceId> {
        let mut registry = self.registry.lock();
        let limit = self.directories.len() as u32;
        if registry.live >= (limit - 1) as usize {
            return Err(PmapError::NoSpaceIdentifiers);
        }

        let is_free = |id: u32| {
            id != arch::KERNEL_SPACE_ID && self.directories[id as usize].load(Ordering::Acquire) == 0
        };
        let mut chosen = None;
        for _ in 0..RANDOM_PROBES {
            let id = registry.rng.next_u32() % limit;
            if is_free(id) {
                chosen = Some(id);
                break;
            }
        }
        let start = registry.rng.next_u32() % limit;
        let id = chosen
            .or_else(|| (0..limit).map(|i| (start + i) % limit).find(|&id| is_free(id)))
            .ok_or(PmapError::NoSpaceIdentifiers)?;

        self.directories[id as usize].store(directory.as_word(), Ordering::Release);
        registry.live += 1;
        Ok(SpaceId(id))
    }

    /// Installs the kernel's directory under the reserved identifier.
    pub(crate) fn install_kernel(&self, directory: PhysicalAddress) {
        self.directories[arch::KERNEL_SPACE_ID as usize]
            .store(directory.as_word(), Ordering::Release);
    }

    /// Records the live space behind an allocated identifier.
    pub(crate) fn attach(&self, space: SpaceId, owner: Weak<AddressSpace>) {
        self.registry.lock().spaces[space.0 as usize] = owner;
    }

    /// Returns the live space for an identifier, if it still exists.
    pub(crate) fn space(&self, space: SpaceId) -> Option<Arc<AddressSpace>> {
        self.registry
            .lock()
            .spaces
            .get(space.0 as usize)
            .and_then(Weak::upgrade)
    }

    /// Tells a pv walk what became of the space behind an identifier.
    pub(crate) fn owner(&self, space: SpaceId) -> Owner {
        let registry = self.registry.lock();
        let Some(slot) = registry.spaces.get(space.0 as usize) else {
            return Owner::Gone;
        };
        match slot.upgrade() {
            Some(live) => Owner::Live(live),
            None if slot.weak_count() > 0 => Owner::Dying,
            None => Owner::Gone,
        }
    }

    /// Runs `f` with the registry locked if no space holds `space`.
    pub(crate) fn if_unowned(&self, space: SpaceId, f: impl FnOnce()) {
        let registry = self.registry.lock();
        let unowned = registry
            .spaces
            .get(space.0 as usize)
            .is_none_or(|slot| slot.weak_count() == 0);
        if unowned {
            f();
        }
    }

    /// Clears the directory entry and frees the identifier for reuse.
    pub(crate) fn release(&self, space: SpaceId) {
        let mut registry = self.registry.lock();
        self.directories[space.0 as usize].store(0, Ordering::Release);
        registry.spaces[space.0 as usize] = Weak::new();
        if space != SpaceId::KERNEL {
            registry.live -= 1;
        }
    }
}
