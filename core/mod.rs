//! Core allocator subsystems: synchronization primitives and memory
//! management (the SLAB allocator and its frame contract).

pub mod mm;
pub mod sync;

/// Errors surfaced by core subsystems that are not themselves part of
/// the allocator's null-on-OOM contract (see `mm::SlabError`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Memory management error.
    Memory(mm::SlabError),
    /// Invalid state transition (e.g. double init).
    InvalidState,
    /// Not implemented (reserved for future frame-source backends).
    NotImplemented,
}

impl From<mm::SlabError> for Error {
    fn from(err: mm::SlabError) -> Self {
        Error::Memory(err)
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Memory(e) => write!(f, "memory management error: {e}"),
            Error::InvalidState => write!(f, "invalid state"),
            Error::NotImplemented => write!(f, "not implemented"),
        }
    }
}
