use core::fmt;

/// Errors the pmap engine reports to its callers.
///
/// Only resource exhaustion is recoverable. Callers that cannot tolerate failure
/// (kernel mappings, `enter` without [`EnterFlags::CAN_FAIL`](crate::EnterFlags::CAN_FAIL))
/// never see these: the engine halts instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmapError {
    /// The frame allocator had no page for a directory or table.
    OutOfMemory,
    /// The reverse-map entry pool is exhausted.
    OutOfResources,
    /// Every space identifier in the configured range is in use.
    NoSpaceIdentifiers,
    /// A frame address was not page-aligned.
    MisalignedFrame,
}

impl fmt::Display for PmapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => f.write_str("out of memory"),
            Self::OutOfResources => f.write_str("out of pv entries"),
            Self::NoSpaceIdentifiers => f.write_str("no free space identifiers"),
            Self::MisalignedFrame => f.write_str("frame address is not page-aligned"),
        }
    }
}

impl core::error::Error for PmapError {}

pub type Result<T, E = PmapError> = core::result::Result<T, E>;
