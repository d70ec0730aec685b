use vmmon_arch_amd64::{PageTableEntry, PteFlags};
use vmmon_core::{Mpn, VcpuId};

/// Environment operations the loader needs from its host.
///
/// Every callout is synchronous and reports failure through its return
/// value. The loader never retries; any failure aborts the whole run.
pub trait MonLoaderCallouts {
    /// Prepares the environment for a run over `num_vcpus` VCPUs.
    fn init(&mut self, num_vcpus: u32) -> bool;

    /// Releases whatever [`init`] set up. Called exactly once after a
    /// successful [`init`].
    ///
    /// [`init`]: Self::init
    fn cleanup(&mut self);

    /// Allocates a fresh machine page on behalf of `vcpu`.
    fn alloc_mpn(&mut self, vcpu: VcpuId) -> Option<Mpn>;

    /// Reads entry `index` of the page table at `pt`.
    fn get_pte(&mut self, pt: Mpn, index: usize, vcpu: VcpuId) -> Option<PageTableEntry>;

    /// Points entry `index` of the page table at `pt` to `mpn`.
    fn map_mpn_in_pte(
        &mut self,
        pt: Mpn,
        index: usize,
        flags: PteFlags,
        mpn: Mpn,
        vcpu: VcpuId,
    ) -> bool;

    /// Takes ownership of a page that existed before the run.
    fn import_page(&mut self, mpn: Mpn, vcpu: VcpuId) -> bool;

    /// Fills `mpn` with `pattern`.
    fn fill_page(&mut self, mpn: Mpn, pattern: u8, vcpu: VcpuId) -> bool;

    /// Copies `len` bytes (at most one page) from blob byte `offset` into
    /// `mpn`, zero-filling the rest of the page.
    fn copy_from_blob(&mut self, offset: u64, len: u64, mpn: Mpn, vcpu: VcpuId) -> bool;

    /// Returns the L4 table of `vcpu`.
    fn page_root(&mut self, vcpu: VcpuId) -> Option<Mpn>;

    /// Returns page `page` of the user-owned shared region `sub_index`.
    fn shared_user_page(&mut self, sub_index: u64, page: u64, vcpu: VcpuId) -> Option<Mpn>;

    /// Returns page `page` of the host-owned shared region `sub_index`.
    fn shared_host_page(&mut self, sub_index: u64, page: u64, vcpu: VcpuId) -> Option<Mpn>;

    /// Returns the machine page backing blob byte `offset`.
    fn blob_mpn(&mut self, offset: u64, vcpu: VcpuId) -> Option<Mpn>;
}
