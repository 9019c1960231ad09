//! Address types for physical and virtual memory.
//!
//! This module provides wrappers around physical and virtual addresses, with the
//! index helpers the directory walk needs, and the translator the engine uses to reach
//! physical memory (table pages, frame contents) from kernel code.

use core::fmt;
use core::ops::{Add, Sub};

use crate::{FrameNumber, PageNumber, arch};

#[cfg(any(test, feature = "software-emulation"))]
use crate::arch::EmulatedMemory;

/// Address translator for reaching physical memory.
///
/// This enum supports two modes:
/// - Hardware: physical memory is reachable at a fixed offset (the kernel's direct map,
///   which is the identity on PA-RISC)
/// - Emulated: physical memory is a host buffer (testing mode)
pub enum AddressTranslator {
    /// Hardware translation using a direct-map offset.
    Hardware { direct_map_offset: usize },
    /// Emulated translation using a simulated memory region.
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(EmulatedMemory),
}

impl AddressTranslator {
    /// Creates a new hardware translator with the given direct-map offset.
    pub const fn hardware(direct_map_offset: usize) -> Self {
        Self::Hardware { direct_map_offset }
    }

    /// Creates a new emulated translator backed by `frames` pages of memory.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(frames: usize) -> Self {
        Self::Emulated(EmulatedMemory::new(frames))
    }

    /// Translates a physical address to a typed pointer.
    pub fn phys_to_ptr<T>(&self, phys: PhysicalAddress) -> *mut T {
        match self {
            Self::Hardware { direct_map_offset } => {
                phys.as_usize().wrapping_add(*direct_map_offset) as *mut T
            }
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.translate(phys.as_usize()).cast(),
        }
    }

    /// Translates a pointer back to a physical address.
    pub fn ptr_to_phys<T>(&self, ptr: *const T) -> PhysicalAddress {
        match self {
            Self::Hardware { direct_map_offset } => {
                PhysicalAddress::new((ptr as usize).wrapping_sub(*direct_map_offset))
            }
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => PhysicalAddress::new(mem.ptr_to_phys(ptr.cast())),
        }
    }
}

/// Macro to define common address type functionality.
///
/// This macro generates the basic structure and methods common to both physical
/// and virtual address types, reducing code duplication.
macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Aligns the address down to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// Aligns the address up to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self((self.0 + align - 1) & !(align - 1))
            }

            /// Returns the offset within the page.
            #[inline]
            pub const fn page_offset(self) -> usize {
                self.0 & (arch::PAGE_SIZE - 1)
            }

            /// Adds `rhs` bytes, returning `None` past the architecture's width.
            #[inline]
            pub const fn checked_add(self, rhs: usize) -> Option<Self> {
                match self.0.checked_add(rhs) {
                    Some(addr) if addr <= u32::MAX as usize => Some(Self(addr)),
                    _ => None,
                }
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl From<u32> for $name {
            #[inline]
            fn from(addr: u32) -> Self {
                Self(addr as usize)
            }
        }

        impl From<usize> for $name {
            #[inline]
            fn from(addr: usize) -> Self {
                Self::new(addr)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self::new(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    "A physical memory address.\n\n\
     Physical addresses are 32 bits wide. Values at or above the I/O space threshold\n\
     name device registers rather than memory."
);

impl PhysicalAddress {
    /// Creates a new physical address.
    ///
    /// # Panics
    ///
    /// Panics if the address exceeds the architecture's maximum physical address width.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            arch::validate_physical(addr),
            "physical address exceeds maximum width"
        );
        Self(addr)
    }

    /// Returns the physical address as the 32-bit word stored in directory slots.
    #[inline]
    pub const fn as_word(self) -> u32 {
        self.0 as u32
    }

    /// Returns the corresponding frame number for this physical address.
    #[inline]
    pub const fn frame_number(self) -> FrameNumber {
        FrameNumber::new(self.0 >> arch::PAGE_SHIFT)
    }
}

impl_address_common!(
    VirtualAddress,
    "A virtual memory address: the offset half of a (space, offset) pair.\n\n\
     It provides methods for address manipulation, alignment checks,\n\
     and extracting directory and table indices."
);

impl VirtualAddress {
    /// Creates a new virtual address.
    ///
    /// # Panics
    ///
    /// Panics if the address exceeds the architecture's virtual address width.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            arch::validate_virtual(addr),
            "virtual address exceeds maximum width"
        );
        Self(addr)
    }

    /// Returns the page directory slot for this address.
    #[inline]
    pub const fn pde_index(self) -> usize {
        arch::pde_index(self.0)
    }

    /// Returns the page table index for this address.
    #[inline]
    pub const fn pte_index(self) -> usize {
        arch::pte_index(self.0)
    }

    /// Returns the first address covered by the next page table, or `None` at the top
    /// of the address space.
    #[inline]
    pub const fn next_table_boundary(self) -> Option<Self> {
        Self(self.0 & !(arch::PDE_SIZE - 1)).checked_add(arch::PDE_SIZE)
    }

    /// Gets the corresponding page number for this virtual address.
    #[inline]
    pub const fn page_number(self) -> PageNumber {
        PageNumber::new(self.0 >> arch::PAGE_SHIFT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod physical_address {
        use super::*;

        #[test]
        fn new_max_valid_address() {
            let max_addr = (1usize << arch::MAX_PHYSICAL_BITS) - 1;
            let addr = PhysicalAddress::new(max_addr);
            assert_eq!(addr.as_usize(), max_addr);
            assert_eq!(addr.as_word(), u32::MAX);
        }

        #[test]
        #[should_panic(expected = "physical address exceeds maximum width")]
        fn new_exceeds_max() {
            PhysicalAddress::new(1usize << arch::MAX_PHYSICAL_BITS);
        }

        #[test]
        fn alignment_check() {
            let addr = PhysicalAddress::new(arch::PAGE_SIZE * 4);
            assert!(addr.is_aligned(arch::PAGE_SIZE));
            assert!(!addr.is_aligned(arch::PAGE_SIZE * 8));
            assert_eq!(
                PhysicalAddress::new(0x1234).align_down(arch::PAGE_SIZE),
                PhysicalAddress::new(0x1000)
            );
            assert_eq!(
                PhysicalAddress::new(0x1234).align_up(arch::PAGE_SIZE),
                PhysicalAddress::new(0x2000)
            );
        }

        #[test]
        fn frame_number() {
            assert_eq!(
                PhysicalAddress::new(0x5fff).frame_number(),
                FrameNumber::new(5)
            );
        }
    }

    mod virtual_address {
        use super::*;

        #[test]
        fn indexes() {
            let va = VirtualAddress::new(0x0080_3123);
            assert_eq!(va.pde_index(), 2);
            assert_eq!(va.pte_index(), 3);
            assert_eq!(va.page_offset(), 0x123);
            assert_eq!(va.page_number(), PageNumber::new(0x803));
        }

        #[test]
        fn next_table_boundary() {
            let va = VirtualAddress::new(0x0040_1000);
            assert_eq!(va.next_table_boundary(), Some(VirtualAddress::new(0x0080_0000)));
            let top = VirtualAddress::new(0xffc0_0000);
            assert_eq!(top.next_table_boundary(), None);
        }

        #[test]
        fn checked_add_stops_at_width() {
            let va = VirtualAddress::new(0xffff_f000);
            assert_eq!(va.checked_add(arch::PAGE_SIZE), None);
            assert_eq!(
                va.checked_add(0xfff),
                Some(VirtualAddress::new(0xffff_ffff))
            );
        }

        #[test]
        fn formats() {
            let va = VirtualAddress::new(0x1000);
            assert_eq!(format!("{}", va), "0x1000");
            assert_eq!(format!("{:?}", va), "VirtualAddress(0x1000)");
        }
    }

    #[test]
    fn emulated_translator_round_trips() {
        let translator = AddressTranslator::emulated(4);
        let phys = PhysicalAddress::new(3 * arch::PAGE_SIZE + 4);
        let ptr: *mut u32 = translator.phys_to_ptr(phys);
        assert_eq!(translator.ptr_to_phys(ptr), phys);
    }

    #[test]
    fn hardware_translator_applies_offset() {
        let translator = AddressTranslator::hardware(0x1000_0000);
        let ptr: *mut u8 = translator.phys_to_ptr(PhysicalAddress::new(0x2000));
        assert_eq!(ptr as usize, 0x1000_2000);
        assert_eq!(translator.ptr_to_phys(ptr), PhysicalAddress::new(0x2000));
    }
}
