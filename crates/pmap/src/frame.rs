//! Physical frame metadata and the frame allocator interface.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use spin::{Mutex, MutexGuard};

use crate::pv::PvIndex;
use crate::{Attributes, FrameNumber, PhysicalAddress, SpaceId};

/// Source and sink of physical pages for directory and table pages.
///
/// The engine never owns general-purpose memory; it borrows one page per directory
/// and per table and hands it back when the table empties or the space dies.
pub trait FrameAllocator: Send + Sync {
    /// Allocates one page-aligned frame. `owner` is the space the page is for, when known.
    fn allocate(&self, owner: Option<SpaceId>) -> Option<PhysicalAddress>;

    /// Returns a frame obtained from [`allocate`](Self::allocate).
    fn deallocate(&self, frame: PhysicalAddress);
}

/// Holds the pmap metadata for a physical memory frame.
///
/// Modeled after the `md` part of a VM page: the reverse-map list head, the attributes
/// harvested from mappings that no longer exist, and a wire count used when the frame
/// backs a page table.
pub struct Frame {
    /// Flags identifying the role of this frame.
    pub flags: FrameFlags,
    wire_count: AtomicU32,
    pv: Mutex<PvHead>,
}

/// Reverse-map head of a frame. Guarded by the frame's own lock.
#[derive(Debug, Default)]
pub(crate) struct PvHead {
    pub head: Option<PvIndex>,
    pub attrs: Attributes,
}

impl Frame {
    /// Returns the number of live entries plus one while the frame backs a page table.
    pub fn wire_count(&self) -> u32 {
        self.wire_count.load(Ordering::Acquire)
    }

    pub(crate) fn set_wire_count(&self, count: u32) {
        self.wire_count.store(count, Ordering::Release);
    }

    pub(crate) fn wire(&self) {
        self.wire_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one wire and returns the new count.
    pub(crate) fn unwire(&self) -> u32 {
        let previous = self.wire_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "frame wire count underflow");
        previous - 1
    }

    /// Locks the reverse-map head.
    pub(crate) fn pv(&self) -> MutexGuard<'_, PvHead> {
        self.pv.lock()
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self {
            flags: FrameFlags::new(),
            wire_count: AtomicU32::new(0),
            pv: Mutex::new(PvHead::default()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFlag {
    /// Frame backs a page directory.
    Directory = 1 << 0,
    /// Frame backs a page table.
    Table = 1 << 1,
}

/// Atomic flags for a physical memory frame.
#[derive(Default)]
pub struct FrameFlags(AtomicU64);

impl FrameFlags {
    /// Creates a new `FrameFlags` instance with all flags cleared.
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Sets the given flag atomically.
    pub fn atomic_set(&self, flag: FrameFlag) {
        self.0.fetch_or(flag as u64, Ordering::AcqRel);
    }

    /// Clears the given flag atomically.
    pub fn atomic_clear(&self, flag: FrameFlag) {
        self.0.fetch_and(!(flag as u64), Ordering::AcqRel);
    }

    /// Tests if the given flag is set, atomically.
    pub fn atomic_test(&self, flag: FrameFlag) -> bool {
        self.0.load(Ordering::Acquire) & (flag as u64) != 0
    }
}

/// Metadata for every managed frame in one contiguous physical range.
///
/// Frames outside the range (device memory, firmware) are unmanaged: they can be
/// mapped, but have no reverse map and no accumulated attributes.
pub struct FrameTable {
    base: FrameNumber,
    frames: Box<[Frame]>,
}

impl FrameTable {
    /// Creates metadata for `count` frames starting at `base`.
    pub fn new(base: PhysicalAddress, count: usize) -> Self {
        let frames = (0..count).map(|_| Frame::default()).collect();
        Self {
            base: base.frame_number(),
            frames,
        }
    }

    /// Returns the metadata for the frame containing `addr`, if it is managed.
    pub fn get(&self, addr: PhysicalAddress) -> Option<&Frame> {
        let number = addr.frame_number();
        if number < self.base {
            return None;
        }
        self.frames.get(number - self.base)
    }

    /// Returns the number of managed frames.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Returns true if no frame is managed.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
