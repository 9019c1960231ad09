//! Software emulation of physical memory for testing and development.
//!
//! Physical address `n` is byte `n` of a host buffer made of page-aligned pages, so table
//! pages and frame contents can be read and written exactly as the kernel would through its
//! direct map. Frame 0 exists but is never handed out: a zero directory slot or PTE frame
//! must always mean "empty".

use alloc::{boxed::Box, vec::Vec};
use core::cell::UnsafeCell;

use spin::Mutex;

use super::PAGE_SIZE;
use crate::{FrameAllocator, PhysicalAddress, SpaceId};

#[derive(Clone, Copy)]
#[repr(C, align(4096))]
struct EmulatedPage([u8; PAGE_SIZE]);

/// Emulated physical memory for software simulation.
pub struct EmulatedMemory {
    pages: Box<[UnsafeCell<EmulatedPage>]>,
}

// SAFETY: All access goes through raw pointers handed out by `translate`; the engine
// serializes writers with its own locks and uses atomics for words the miss path reads.
unsafe impl Sync for EmulatedMemory {}

impl EmulatedMemory {
    /// Creates a zeroed emulated memory region of `frames` pages.
    pub fn new(frames: usize) -> Self {
        let pages = (0..frames)
            .map(|_| UnsafeCell::new(EmulatedPage([0; PAGE_SIZE])))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { pages }
    }

    /// Translates a physical address to a pointer into the buffer.
    ///
    /// # Panics
    ///
    /// Panics if the address is outside the emulated region.
    pub fn translate(&self, phys: usize) -> *mut u8 {
        let page = phys / PAGE_SIZE;
        assert!(page < self.pages.len(), "physical address out of bounds");
        // SAFETY: `page` is in bounds and the offset stays inside that page.
        unsafe { self.pages[page].get().cast::<u8>().add(phys % PAGE_SIZE) }
    }

    /// Translates a pointer into the buffer back to a physical address.
    ///
    /// # Panics
    ///
    /// Panics if the pointer is not within the emulated region.
    pub fn ptr_to_phys(&self, ptr: *const u8) -> usize {
        let base = self.pages.as_ptr() as usize;
        let addr = ptr as usize;
        assert!(
            addr >= base && addr < base + self.size(),
            "pointer not within emulated memory"
        );
        addr - base
    }

    /// Returns the size of the emulated memory region in bytes.
    pub fn size(&self) -> usize {
        self.pages.len() * PAGE_SIZE
    }

    /// Returns the number of frames in the emulated region.
    pub fn frames(&self) -> usize {
        self.pages.len()
    }
}

/// A free-list frame allocator over a range of emulated frames.
pub struct EmulatedFrameAllocator {
    free: Mutex<Vec<PhysicalAddress>>,
}

impl EmulatedFrameAllocator {
    /// Creates an allocator handing out frames `first..first + count`, lowest first.
    ///
    /// # Panics
    ///
    /// Panics if the range includes frame 0.
    pub fn new(first: usize, count: usize) -> Self {
        assert!(first > 0, "frame 0 must stay reserved");
        let free = (first..first + count)
            .rev()
            .map(|frame| PhysicalAddress::new(frame * PAGE_SIZE))
            .collect();
        Self {
            free: Mutex::new(free),
        }
    }

    /// Returns the number of frames still available.
    pub fn free_frames(&self) -> usize {
        self.free.lock().len()
    }

    /// Removes every free frame, returning them so a test can give them back later.
    pub fn drain(&self) -> Vec<PhysicalAddress> {
        core::mem::take(&mut *self.free.lock())
    }
}

impl FrameAllocator for EmulatedFrameAllocator {
    fn allocate(&self, owner: Option<SpaceId>) -> Option<PhysicalAddress> {
        let frame = self.free.lock().pop();
        if frame.is_none() {
            log::trace!("emulated allocator exhausted (owner {:?})", owner);
        }
        frame
    }

    fn deallocate(&self, frame: PhysicalAddress) {
        debug_assert!(frame.is_aligned(PAGE_SIZE), "freeing a misaligned frame");
        self.free.lock().push(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translate_round_trips() {
        let mem = EmulatedMemory::new(4);
        let ptr = mem.translate(2 * PAGE_SIZE + 8);
        assert_eq!(mem.ptr_to_phys(ptr), 2 * PAGE_SIZE + 8);
        assert_eq!(mem.size(), 4 * PAGE_SIZE);
    }

    #[test]
    fn pages_are_page_aligned() {
        let mem = EmulatedMemory::new(2);
        assert_eq!(mem.translate(PAGE_SIZE) as usize % PAGE_SIZE, 0);
    }

    #[test]
    #[should_panic(expected = "physical address out of bounds")]
    fn translate_out_of_bounds() {
        let mem = EmulatedMemory::new(1);
        mem.translate(PAGE_SIZE);
    }

    #[test]
    fn allocator_hands_out_lowest_first_and_recycles() {
        let alloc = EmulatedFrameAllocator::new(1, 2);
        let a = alloc.allocate(None).unwrap();
        let b = alloc.allocate(None).unwrap();
        assert_eq!(a, PhysicalAddress::new(PAGE_SIZE));
        assert_eq!(b, PhysicalAddress::new(2 * PAGE_SIZE));
        assert!(alloc.allocate(None).is_none());

        alloc.deallocate(a);
        assert_eq!(alloc.free_frames(), 1);
        assert_eq!(alloc.allocate(None), Some(a));
    }

    #[test]
    #[should_panic(expected = "frame 0 must stay reserved")]
    fn frame_zero_is_reserved() {
        EmulatedFrameAllocator::new(0, 1);
    }
}
