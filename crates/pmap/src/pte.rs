//! Page table entry codec.
//!
//! A PTE is one 32-bit word: the frame address in the top 20 bits and the
//! protection/attribute bits of the TLB protection word, shifted down by 19, below it.
//!
//! - Bit 0: Uncacheable
//! - Bits 1-4: Privilege levels (PL1/PL2 pair)
//! - Bits 5-7: Access type
//! - Bit 8: Break
//! - Bit 9: Dirty
//! - Bit 10: Reference trap
//! - Bit 11: Wired (software only, never loaded into the TLB)
//! - Bits 12-31: Physical frame address
//!
//! An all-zero word is an empty entry. Every access-rights encoding is non-zero, so no
//! mapping packs to it, frame 0 included.

use bitflags::bitflags;

use crate::{PhysicalAddress, PmapError, Result, arch};

bitflags! {
    /// Access rights requested by the VM layer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

impl Protection {
    /// No access at all.
    pub const NONE: Self = Self::empty();
    /// Read and write.
    pub const READ_WRITE: Self = Self::READ.union(Self::WRITE);
    /// Read and execute.
    pub const READ_EXECUTE: Self = Self::READ.union(Self::EXECUTE);
}

bitflags! {
    /// Per-frame attributes accumulated across every alias of a frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Attributes: u8 {
        /// Some alias wrote to the frame.
        const MODIFIED = 1 << 0;
        /// Some alias touched the frame since the last reference clear.
        const REFERENCED = 1 << 1;
    }
}

bitflags! {
    /// Attribute bits of a PTE, in PTE position.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PteFlags: u32 {
        const UNCACHEABLE = 1 << 0;
        const BREAK = 1 << 8;
        const DIRTY = 1 << 9;
        const REFTRAP = 1 << 10;
        const WIRED = 1 << 11;
    }
}

/// Privilege a mapping is entered for. User mappings are reachable from privilege
/// level 3, kernel mappings only from level 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    Kernel,
    User,
}

const AR_MASK: u32 = 0x0000_00fe;
const TYPE_SHIFT: u32 = 5;
const TYPE_READ: u32 = 0 << TYPE_SHIFT;
const TYPE_WRITE: u32 = 1 << TYPE_SHIFT;
const TYPE_EXECUTE: u32 = 2 << TYPE_SHIFT;
const TYPE_GATEWAY: u32 = 4 << TYPE_SHIFT;
const TYPE_MASK: u32 = 7 << TYPE_SHIFT;
const PL1_USER: u32 = 0x0000_0018;
const PL2_USER: u32 = 0x0000_0006;
const PL_USER: u32 = PL1_USER | PL2_USER;
const FRAME_MASK: u32 = !(arch::PAGE_SIZE as u32 - 1);

/// The access-rights field of a PTE (bits 1-7), in PTE position.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtField(u32);

impl ProtField {
    /// No access from any privilege level.
    pub const NO_ACCESS: Self = Self(0x0000_00e6);
    /// Execute-only gateway page that promotes to privilege level 0.
    pub const GATEWAY: Self = Self(TYPE_GATEWAY | PL1_USER);

    /// Returns the raw field bits in PTE position.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Decodes the field back into abstract rights. The gateway decodes as
    /// read/execute; the no-access encoding as [`Protection::NONE`].
    pub fn protection(self) -> Protection {
        if self == Self::NO_ACCESS {
            return Protection::NONE;
        }
        match self.0 & TYPE_MASK {
            TYPE_READ => Protection::READ,
            TYPE_WRITE => Protection::READ_WRITE,
            TYPE_EXECUTE | TYPE_GATEWAY => Protection::READ_EXECUTE,
            _ => Protection::all(),
        }
    }

    /// Returns true if stores are permitted through this field.
    pub fn is_writable(self) -> bool {
        self.protection().contains(Protection::WRITE)
    }

    /// Returns true if instruction fetches are permitted through this field.
    pub fn is_executable(self) -> bool {
        self.protection().contains(Protection::EXECUTE)
    }
}

impl core::fmt::Debug for ProtField {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ProtField({:#04x}, {:?})", self.0, self.protection())
    }
}

/// Converts abstract rights to the hardware access-rights field.
///
/// The hardware has no write-only or execute-only-without-read encodings, so write and
/// execute each imply read. The empty set maps to [`ProtField::NO_ACCESS`].
pub fn encode_protection(prot: Protection, privilege: Privilege) -> ProtField {
    let access = match (
        prot.contains(Protection::WRITE),
        prot.contains(Protection::EXECUTE),
    ) {
        _ if prot.is_empty() => return ProtField::NO_ACCESS,
        (false, false) => TYPE_READ,
        (true, false) => TYPE_WRITE,
        (false, true) => TYPE_EXECUTE,
        (true, true) => TYPE_WRITE | TYPE_EXECUTE,
    };
    let levels = match (privilege, access) {
        // PL2 is the write level, which a read-only page never uses. Parking it at 3
        // keeps the kernel read-only field off zero.
        (Privilege::Kernel, TYPE_READ) => PL2_USER,
        (Privilege::Kernel, _) => 0,
        (Privilege::User, _) => PL_USER,
    };
    ProtField(access | levels)
}

/// The unpacked fields of a PTE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PteFields {
    pub frame: PhysicalAddress,
    pub prot: ProtField,
    pub wired: bool,
    pub uncacheable: bool,
    pub dirty: bool,
    pub reftrap: bool,
}

/// A page table entry word.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Pte(u32);

impl Pte {
    /// The empty (invalid) entry.
    pub const EMPTY: Self = Self(0);

    /// Packs the given fields into an entry.
    ///
    /// Fails with [`PmapError::MisalignedFrame`] if the frame address is not page-aligned.
    pub fn pack(fields: PteFields) -> Result<Self> {
        if !fields.frame.is_aligned(arch::PAGE_SIZE) {
            return Err(PmapError::MisalignedFrame);
        }

        let mut flags = PteFlags::empty();
        flags.set(PteFlags::WIRED, fields.wired);
        flags.set(PteFlags::UNCACHEABLE, fields.uncacheable);
        flags.set(PteFlags::DIRTY, fields.dirty);
        flags.set(PteFlags::REFTRAP, fields.reftrap);
        let word = fields.frame.as_word() | (fields.prot.0 & AR_MASK) | flags.bits();
        debug_assert_ne!(word, 0, "mapping of {} packs to the empty entry", fields.frame);
        Ok(Self(word))
    }

    /// Unpacks every field of this entry.
    pub fn unpack(self) -> PteFields {
        let flags = self.flags();
        PteFields {
            frame: self.frame(),
            prot: self.prot(),
            wired: flags.contains(PteFlags::WIRED),
            uncacheable: flags.contains(PteFlags::UNCACHEABLE),
            dirty: flags.contains(PteFlags::DIRTY),
            reftrap: flags.contains(PteFlags::REFTRAP),
        }
    }

    /// Creates an entry from a raw word.
    pub const fn from_word(word: u32) -> Self {
        Self(word)
    }

    /// Returns the raw word.
    pub const fn as_word(self) -> u32 {
        self.0
    }

    /// Returns true if this entry maps nothing.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns the mapped frame.
    pub const fn frame(self) -> PhysicalAddress {
        PhysicalAddress::new((self.0 & FRAME_MASK) as usize)
    }

    /// Returns the access-rights field.
    pub const fn prot(self) -> ProtField {
        ProtField(self.0 & AR_MASK)
    }

    /// Returns the attribute bits.
    pub const fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Returns true if the entry is wired.
    pub fn is_wired(self) -> bool {
        self.flags().contains(PteFlags::WIRED)
    }

    /// Returns a copy of this entry with a different access-rights field.
    pub const fn with_prot(self, prot: ProtField) -> Self {
        Self((self.0 & !AR_MASK) | (prot.0 & AR_MASK))
    }

    /// Returns a copy of this entry with `flags` set or cleared.
    pub const fn with_flags(self, flags: PteFlags, value: bool) -> Self {
        if value {
            Self(self.0 | flags.bits())
        } else {
            Self(self.0 & !flags.bits())
        }
    }

    /// Returns the frame attributes this entry witnesses: a dirty entry means the frame
    /// was modified, and an entry whose reference trap is disarmed has been referenced.
    pub fn attributes(self) -> Attributes {
        let flags = self.flags();
        let mut attrs = Attributes::empty();
        attrs.set(Attributes::MODIFIED, flags.contains(PteFlags::DIRTY));
        attrs.set(Attributes::REFERENCED, !flags.contains(PteFlags::REFTRAP));
        attrs
    }

    /// Applies attribute changes to the entry's hardware bits. Clearing is applied
    /// before setting.
    pub fn apply_attributes(self, set: Attributes, clear: Attributes) -> Self {
        let mut pte = self;
        if clear.contains(Attributes::MODIFIED) {
            pte = pte.with_flags(PteFlags::DIRTY, false);
        }
        if clear.contains(Attributes::REFERENCED) {
            pte = pte.with_flags(PteFlags::REFTRAP, true);
        }
        if set.contains(Attributes::MODIFIED) {
            pte = pte.with_flags(PteFlags::DIRTY, true);
        }
        if set.contains(Attributes::REFERENCED) {
            pte = pte.with_flags(PteFlags::REFTRAP, false);
        }
        pte
    }
}

impl core::fmt::Debug for Pte {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_empty() {
            return f.write_str("Pte(empty)");
        }
        write!(
            f,
            "Pte({} {:?} {:?})",
            self.frame(),
            self.prot().protection(),
            self.flags()
        )
    }
}
