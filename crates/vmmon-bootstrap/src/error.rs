use vmmon_core::{HostError, VcpuId};

/// An error code returned by the monitor loader.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MonLoaderError {
    /// The header magic does not match.
    #[error("Bad header magic")]
    BadMagic,

    /// The header has no entries.
    #[error("Missing entry table")]
    MissingTable,

    /// Invalid arguments.
    #[error("Invalid arguments")]
    Args,

    /// An entry size or page count is out of range.
    #[error("Invalid size")]
    Size,

    /// A second address space entry for the same VCPU.
    #[error("Duplicate address space")]
    DuplicateAddrSpace,

    /// The address space needs more page tables than the loader tracks.
    #[error("Address space too large")]
    AddrSpaceTooLarge,

    /// A page allocation failed.
    #[error("Allocation failed")]
    Alloc,

    /// A page could not be mapped.
    #[error("Map failed")]
    Map,

    /// The destination PTE is already in use.
    #[error("Already mapped")]
    AlreadyMapped,

    /// The VPN lies outside the address space.
    #[error("Invalid VPN")]
    InvalidVpn,

    /// No address space has been established.
    #[error("No address space")]
    NoAddrSpace,

    /// An existing page table does not match the recipe.
    #[error("Page table import failed")]
    PtImport,

    /// A page table mapping does not match the recorded tables.
    #[error("Page table verification failed")]
    PtVerify,

    /// A page table entry covers a different number of tables.
    #[error("Page table map size mismatch")]
    PtMapSize,

    /// Sharing pages failed.
    #[error("Share failed")]
    Share,

    /// Unknown content type.
    #[error("Invalid content type")]
    InvalidContent,

    /// The source type is not valid for the content type.
    #[error("Invalid source type")]
    InvalidSource,

    /// The environment could not be initialized.
    #[error("Callout init failed")]
    CalloutInit,

    /// Copying from the blob failed.
    #[error("Callout copy failed")]
    CalloutCopy,

    /// Reading a PTE failed.
    #[error("Callout get PTE failed")]
    CalloutGetPte,

    /// Writing a PTE failed.
    #[error("Callout map in PTE failed")]
    CalloutMapInPte,

    /// The VCPU has no page root.
    #[error("Callout page root failed")]
    CalloutPageRoot,

    /// Filling a page failed.
    #[error("Callout zero failed")]
    CalloutZero,
}

/// A loader error together with where it happened.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{error} (line: {line:?}, vcpu: {vcpu:?})")]
pub struct MonLoaderFailure {
    /// The error code.
    pub error: MonLoaderError,

    /// Index of the entry being processed, if the entry loop was reached.
    pub line: Option<usize>,

    /// The VCPU being processed, if the VCPU loop was reached.
    pub vcpu: Option<VcpuId>,
}

impl From<MonLoaderError> for MonLoaderFailure {
    fn from(error: MonLoaderError) -> Self {
        Self {
            error,
            line: None,
            vcpu: None,
        }
    }
}

/// A reason a VMM blob was rejected.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobError {
    /// The blob exceeds the maximum size.
    #[error("Blob too large ({size} > {max})")]
    TooLarge {
        /// Requested size.
        size: u64,
        /// Maximum size.
        max: u64,
    },

    /// The header offset lies beyond the blob.
    #[error("Header offset {offset} beyond blob size {size}")]
    BadHeaderOffset {
        /// Header offset.
        offset: u64,
        /// Blob size.
        size: u64,
    },

    /// The fixed part of the header does not fit.
    #[error("Header truncated at offset {offset} (blob size {size})")]
    TruncatedHeader {
        /// Header offset.
        offset: u64,
        /// Blob size.
        size: u64,
    },

    /// The header declares more entries than the blob holds.
    #[error("Header declares {count} entries, blob holds {fits}")]
    EntryTableOverflow {
        /// Declared entry count.
        count: u32,
        /// Entries that fit.
        fits: u64,
    },

    /// A backing page could not be allocated.
    #[error("Allocation failed: {0}")]
    Alloc(HostError),

    /// The user buffer could not be copied.
    #[error("User copy failed: {0}")]
    UserCopy(HostError),

    /// Writing a backing page failed.
    #[error(transparent)]
    Host(HostError),
}

/// An error raised while creating or bootstrapping a VM.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapError {
    /// The blob was rejected.
    #[error(transparent)]
    Blob(#[from] BlobError),

    /// The loader failed.
    #[error(transparent)]
    MonLoader(#[from] MonLoaderFailure),

    /// A host operation failed.
    #[error(transparent)]
    Host(#[from] HostError),

    /// No blob has been loaded.
    #[error("No blob loaded")]
    NoBlob,

    /// A blob is already loaded.
    #[error("Blob already loaded")]
    BlobLoaded,

    /// The VCPU count is zero or above the maximum.
    #[error("Invalid VCPU count {0}")]
    InvalidVcpuCount(u32),

    /// The VCPU does not exist.
    #[error("Invalid VCPU {0}")]
    InvalidVcpu(VcpuId),

    /// The pinned memory tracker is full or could not be allocated.
    #[error("Out of locked memory")]
    OutOfMemory,
}
