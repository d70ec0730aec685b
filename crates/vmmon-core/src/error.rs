use crate::{Mpn, UserVa};

/// An error reported by the host environment.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostError {
    /// The host could not provide memory.
    #[error("Out of memory")]
    OutOfMemory,

    /// The machine page is not known to the host.
    #[error("Invalid machine page {0}")]
    InvalidMpn(Mpn),

    /// The access crosses a page boundary or the end of a buffer.
    #[error("Out of bounds")]
    OutOfBounds,

    /// The user-space address is not mapped.
    #[error("User fault at {0}")]
    UserFault(UserVa),

    /// The machine page is not a pinned user page.
    #[error("Machine page {0} is not pinned")]
    NotPinned(Mpn),
}

/// An error raised while growing a sparse directory.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryError {
    /// The index lies beyond the directory's fixed top level.
    #[error("Index out of range")]
    OutOfRange,

    /// A directory page could not be allocated.
    #[error("Out of memory")]
    OutOfMemory,
}
