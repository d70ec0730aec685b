//! Monitor bootstrap for vmmon.
//!
//! Bootstrapping a VM takes three steps:
//!
//! 1. The VMM blob is copied from user space into locked pages and its
//!    loader header is validated ([`VmmBlob`]).
//! 2. The [`MonLoader`] replays the header's entry table for every VCPU,
//!    building each VCPU's monitor address space through a set of
//!    [`MonLoaderCallouts`].
//! 3. On failure, everything claimed so far is released in bulk through
//!    the VM's trackers ([`Vm::teardown`]).
//!
//! [`Vm`] ties these together over any [`HostMemory`] implementation.
//!
//! [`HostMemory`]: vmmon_core::HostMemory

mod blob;
mod error;
mod header;
mod monloader;
mod vm;
mod vmmon;

pub use self::{
    blob::{VMM_BLOB_MAX_SIZE, VmmBlob},
    error::{BlobError, BootstrapError, MonLoaderError, MonLoaderFailure},
    header::{
        BlobSource, ContentType, MONLOADER_HEADER_MAGIC, MonLoaderEntry, MonLoaderHeader,
        MonLoaderHeaderBuilder, SHARED_REGION_HV_OPTIONAL, SourceType,
    },
    monloader::{
        MON_PT_L1_MPNS, MON_PT_L2_MPNS, MON_PT_L3_MPNS, MON_PT_L4_MPNS, MonLoader,
        MonLoaderCallouts, MonLoaderConfig, PageTableMode,
    },
    vm::Vm,
    vmmon::SharedRegion,
};
