//! Core types and host collaborator contracts for vmmon.
//!
//! This crate holds the vocabulary shared by every other vmmon crate:
//! page-number newtypes, the traits through which the bootstrap core talks
//! to its host operating system, the per-VM lock the trackers rely on, and
//! the sparse directory both trackers are built on.

mod core;
pub mod dir;
mod error;
pub mod host;
mod sync;

pub use self::{
    core::{
        Lpn, Ma, Mpn, PAGE_OFFSET_MASK, PAGE_SHIFT, PAGE_SIZE, UserVa, VcpuId, Vpn,
        bytes_to_pages, is_page_aligned,
    },
    dir::SparseDirectory,
    error::{DirectoryError, HostError},
    host::{HostMemory, KernelHeap, PageAllocator},
    sync::{VmLock, VmLockGuard},
};

/// Maximum number of virtual CPUs per VM.
pub const MAX_VCPUS: u32 = 2048;
