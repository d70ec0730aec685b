//! Loader callouts backed by a [`Vm`].

use vmmon_arch_amd64::{Amd64, PageTableEntry, PteFlags};
use vmmon_core::{HostMemory, Mpn, PAGE_SIZE, UserVa, VcpuId};

use crate::{MonLoaderCallouts, Vm, VmmBlob};

/// A user-owned memory region the monitor shares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedRegion {
    sub_index: u64,
    va: UserVa,
    pages: u64,
    per_vcpu: bool,
}

impl SharedRegion {
    /// Creates a region of `pages` pages at `va`, shared by every VCPU.
    pub fn new(sub_index: u64, va: UserVa, pages: u64) -> Self {
        Self {
            sub_index,
            va,
            pages,
            per_vcpu: false,
        }
    }

    /// Gives every VCPU its own `pages` pages, laid out back to back in
    /// VCPU order.
    pub fn with_per_vcpu(self, per_vcpu: bool) -> Self {
        Self { per_vcpu, ..self }
    }

    /// Returns the sub-index the loader refers to the region by.
    pub fn sub_index(&self) -> u64 {
        self.sub_index
    }

    /// Returns the user address of page `page` as seen by `vcpu`.
    pub fn page_va(&self, vcpu: VcpuId, page: u64) -> Option<UserVa> {
        if page >= self.pages {
            return None;
        }

        let base = if self.per_vcpu {
            u64::from(vcpu.0) * self.pages
        }
        else {
            0
        };

        Some(self.va + (base + page) * PAGE_SIZE)
    }
}

/// The loader environment of a VM being bootstrapped.
///
/// Lives only for the duration of [`Vm::bootstrap`], which holds the VM
/// lock throughout.
pub(crate) struct VmmonCallouts<'a, H>
where
    H: HostMemory,
{
    vm: &'a mut Vm<H>,
    blob: &'a VmmBlob,
    regions: &'a [SharedRegion],
}

impl<'a, H> VmmonCallouts<'a, H>
where
    H: HostMemory,
{
    pub fn new(vm: &'a mut Vm<H>, blob: &'a VmmBlob, regions: &'a [SharedRegion]) -> Self {
        Self { vm, blob, regions }
    }
}

impl<H> MonLoaderCallouts for VmmonCallouts<'_, H>
where
    H: HostMemory,
{
    fn init(&mut self, num_vcpus: u32) -> bool {
        if num_vcpus != self.vm.num_vcpus() {
            tracing::warn!(num_vcpus, vm_vcpus = self.vm.num_vcpus(), "VCPU count mismatch");
            return false;
        }

        true
    }

    fn cleanup(&mut self) {
        tracing::trace!(locked_pages = self.vm.locked_pages(), "loader done");
    }

    fn alloc_mpn(&mut self, vcpu: VcpuId) -> Option<Mpn> {
        match self.vm.alloc_tracked_page() {
            Ok(mpn) => Some(mpn),
            Err(err) => {
                tracing::warn!(%vcpu, %err, "monitor page allocation failed");
                None
            }
        }
    }

    fn get_pte(&mut self, pt: Mpn, index: usize, vcpu: VcpuId) -> Option<PageTableEntry> {
        match Amd64::read_entry(self.vm.host(), pt, index) {
            Ok(entry) => Some(entry),
            Err(err) => {
                tracing::warn!(%vcpu, %pt, index, %err, "failed to read PTE");
                None
            }
        }
    }

    fn map_mpn_in_pte(
        &mut self,
        pt: Mpn,
        index: usize,
        flags: PteFlags,
        mpn: Mpn,
        vcpu: VcpuId,
    ) -> bool {
        let entry = PageTableEntry::new(mpn, flags);

        match Amd64::write_entry(self.vm.host(), pt, index, entry) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(%vcpu, %pt, index, %mpn, %err, "failed to write PTE");
                false
            }
        }
    }

    fn import_page(&mut self, _mpn: Mpn, _vcpu: VcpuId) -> bool {
        // Tables stay owned by whoever built them.
        true
    }

    fn fill_page(&mut self, mpn: Mpn, pattern: u8, vcpu: VcpuId) -> bool {
        match self.vm.host().fill_page(mpn, pattern) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(%vcpu, %mpn, %err, "failed to fill page");
                false
            }
        }
    }

    fn copy_from_blob(&mut self, offset: u64, len: u64, mpn: Mpn, vcpu: VcpuId) -> bool {
        match self.blob.copy_to_page(self.vm.host(), offset, len, mpn) {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(%vcpu, offset, len, %mpn, %err, "failed to copy from blob");
                false
            }
        }
    }

    fn page_root(&mut self, vcpu: VcpuId) -> Option<Mpn> {
        self.vm.page_root(vcpu)
    }

    fn shared_user_page(&mut self, sub_index: u64, page: u64, vcpu: VcpuId) -> Option<Mpn> {
        let region = self
            .regions
            .iter()
            .find(|region| region.sub_index == sub_index)?;

        let va = region.page_va(vcpu, page)?;
        self.vm.claim_user_page(va)
    }

    fn shared_host_page(&mut self, sub_index: u64, page: u64, _vcpu: VcpuId) -> Option<Mpn> {
        self.vm.host_shared_page(sub_index, page)
    }

    fn blob_mpn(&mut self, offset: u64, _vcpu: VcpuId) -> Option<Mpn> {
        self.blob.mpn_at(offset)
    }
}
