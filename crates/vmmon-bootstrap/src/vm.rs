use std::sync::Arc;

use indexmap::IndexMap;
use vmmon_arch_amd64::{Amd64, VpnTranslation};
use vmmon_core::{HostMemory, MAX_VCPUS, Mpn, UserVa, VcpuId, VmLock, Vpn};
use vmmon_memtrack::MemTracker;
use vmmon_phystrack::PhysTracker;

use crate::{BootstrapError, MonLoader, SharedRegion, VmmBlob, vmmon::VmmonCallouts};

/// Driver-side state of one VM while its monitor is being bootstrapped.
///
/// The VM owns both trackers. Every locked page it allocates is recorded in
/// the pinned-memory tracker and claimed in the physical-usage tracker;
/// every user page it pins is claimed in the physical-usage tracker only.
/// [`teardown`] releases all of them in bulk.
///
/// [`teardown`]: Self::teardown
pub struct Vm<H>
where
    H: HostMemory,
{
    host: H,
    lock: Arc<VmLock>,
    memtrack: MemTracker,
    phystrack: PhysTracker,
    page_roots: Vec<Mpn>,
    host_shared: IndexMap<u64, Vec<Mpn>>,
    next_vpn: Vpn,
    blob: Option<VmmBlob>,
    num_vcpus: u32,
}

impl<H> Vm<H>
where
    H: HostMemory,
{
    /// Creates a VM with `num_vcpus` VCPUs.
    pub fn new(host: H, num_vcpus: u32) -> Result<Self, BootstrapError> {
        if num_vcpus == 0 || num_vcpus > MAX_VCPUS {
            return Err(BootstrapError::InvalidVcpuCount(num_vcpus));
        }

        let lock = Arc::new(VmLock::new());
        let memtrack =
            MemTracker::new(Arc::clone(&lock), &host).ok_or(BootstrapError::OutOfMemory)?;
        let phystrack = PhysTracker::new(Arc::clone(&lock));

        Ok(Self {
            host,
            lock,
            memtrack,
            phystrack,
            page_roots: vec![Mpn::INVALID; num_vcpus as usize],
            host_shared: IndexMap::new(),
            next_vpn: Vpn(0),
            blob: None,
            num_vcpus,
        })
    }

    /// Limits the number of locked pages the VM may hold.
    pub fn with_max_locked_pages(self, pages: u64) -> Self {
        Self {
            memtrack: self.memtrack.with_max_pages(pages),
            ..self
        }
    }

    /// Returns the host.
    pub fn host(&self) -> &H {
        &self.host
    }

    /// Returns the number of VCPUs.
    pub fn num_vcpus(&self) -> u32 {
        self.num_vcpus
    }

    /// Returns the loaded blob, if any.
    pub fn blob(&self) -> Option<&VmmBlob> {
        self.blob.as_ref()
    }

    /// Returns the number of locked pages allocated so far.
    pub fn locked_pages(&self) -> u64 {
        self.memtrack.len()
    }

    /// Copies the VMM blob from user memory.
    pub fn load_blob(
        &mut self,
        va: UserVa,
        size: u64,
        header_offset: u64,
    ) -> Result<(), BootstrapError> {
        if self.blob.is_some() {
            return Err(BootstrapError::BlobLoaded);
        }

        self.blob = Some(VmmBlob::load(&self.host, va, size, header_offset)?);
        Ok(())
    }

    /// Releases the blob. Returns `false` if none was loaded.
    pub fn release_blob(&mut self) -> bool {
        match self.blob.take() {
            Some(blob) => {
                blob.cleanup(&self.host);
                true
            }
            None => false,
        }
    }

    /// Sets the L4 table the monitor of `vcpu` runs on.
    pub fn set_page_root(&mut self, vcpu: VcpuId, mpn: Mpn) -> Result<(), BootstrapError> {
        let root = self
            .page_roots
            .get_mut(vcpu.0 as usize)
            .ok_or(BootstrapError::InvalidVcpu(vcpu))?;

        *root = mpn;
        Ok(())
    }

    /// Registers host-owned pages as shared region `sub_index`.
    ///
    /// The pages stay owned by the host; they are neither tracked nor
    /// released by the VM.
    pub fn register_host_shared_pages(&mut self, sub_index: u64, mpns: Vec<Mpn>) {
        self.host_shared.insert(sub_index, mpns);
    }

    /// Allocates one tracked locked page.
    pub fn alloc_locked_page(&mut self) -> Result<Mpn, BootstrapError> {
        let lock = Arc::clone(&self.lock);
        let _guard = lock.lock();
        self.alloc_tracked_page()
    }

    /// Returns the locked page tracked under `vpn`.
    pub fn locked_page(&self, vpn: Vpn) -> Option<Mpn> {
        let _guard = self.lock.lock();
        self.memtrack.lookup_vpn(vpn).map(|entry| entry.mpn)
    }

    /// Returns `true` if the VM has claimed `mpn`.
    pub fn is_claimed(&self, mpn: Mpn) -> bool {
        let _guard = self.lock.lock();
        self.phystrack.test(mpn)
    }

    /// Walks the monitor page tables of `vcpu` for `vpn`.
    ///
    /// Returns `None` if the VCPU has no page root.
    pub fn translate(&self, vcpu: VcpuId, vpn: Vpn) -> Option<VpnTranslation> {
        let root = self.page_root(vcpu)?;
        Some(Amd64::translation(&self.host, vpn, root))
    }

    /// Builds the monitor address space of every VCPU from the loaded blob.
    ///
    /// `regions` describes the user-owned shared regions. On success the
    /// allocation counters are written back into the blob, which stays
    /// loaded. On failure the blob is released; pages allocated before the
    /// failure remain tracked until [`teardown`].
    ///
    /// [`teardown`]: Self::teardown
    pub fn bootstrap(
        &mut self,
        loader: &MonLoader,
        regions: &[SharedRegion],
    ) -> Result<(), BootstrapError> {
        let lock = Arc::clone(&self.lock);
        let _guard = lock.lock();

        let mut blob = self.blob.take().ok_or(BootstrapError::NoBlob)?;
        let header = *blob.header();
        let mut entries = blob.entries().to_vec();
        let num_vcpus = self.num_vcpus;

        let result = {
            let mut callouts = VmmonCallouts::new(self, &blob, regions);
            loader.process(&header, &mut entries, num_vcpus, &mut callouts)
        };

        if let Err(failure) = result {
            tracing::error!(
                error = %failure.error,
                line = ?failure.line,
                vcpu = ?failure.vcpu,
                "monitor bootstrap failed"
            );
            blob.cleanup(&self.host);
            return Err(failure.into());
        }

        if let Err(err) = blob.store_entries(&self.host, &entries) {
            tracing::error!(%err, "failed to store allocation counters");
            blob.cleanup(&self.host);
            return Err(err.into());
        }

        tracing::debug!(
            num_vcpus,
            entries = entries.len(),
            allocs = entries.iter().map(|entry| u64::from(entry.allocs())).sum::<u64>(),
            locked_pages = self.memtrack.len(),
            "monitor bootstrapped"
        );

        self.blob = Some(blob);
        Ok(())
    }

    /// Releases everything the VM holds.
    ///
    /// Locked pages are freed through the pinned-memory tracker, remaining
    /// claims are user pins, and the blob goes last.
    pub fn teardown(self) {
        let Self {
            host,
            lock,
            memtrack,
            mut phystrack,
            blob,
            ..
        } = self;

        let _guard = lock.lock();

        let freed = memtrack.cleanup(&host, |entry| {
            phystrack.remove(entry.mpn);

            if let Err(err) = host.free_locked_page(entry.mpn) {
                tracing::warn!(
                    vpn = %entry.vpn,
                    mpn = %entry.mpn,
                    %err,
                    "failed to free locked page"
                );
            }
        });

        let pinned = phystrack.iter().collect::<Vec<_>>();
        for &mpn in &pinned {
            phystrack.remove(mpn);

            if let Err(err) = host.release_user_mpn(mpn) {
                tracing::warn!(%mpn, %err, "failed to unpin user page");
            }
        }

        phystrack.destroy(&host);

        if let Some(blob) = blob {
            blob.cleanup(&host);
        }

        tracing::debug!(freed, unpinned = pinned.len(), "VM torn down");
    }

    pub(crate) fn page_root(&self, vcpu: VcpuId) -> Option<Mpn> {
        self.page_roots
            .get(vcpu.0 as usize)
            .copied()
            .filter(|mpn| mpn.is_valid())
    }

    pub(crate) fn host_shared_page(&self, sub_index: u64, page: u64) -> Option<Mpn> {
        let pages = self.host_shared.get(&sub_index)?;
        pages.get(usize::try_from(page).ok()?).copied()
    }

    /// Allocates a locked page and records it in both trackers.
    ///
    /// The caller holds the VM lock.
    pub(crate) fn alloc_tracked_page(&mut self) -> Result<Mpn, BootstrapError> {
        let mpn = self.host.alloc_locked_page()?;

        if let Err(err) = self.phystrack.add(&self.host, mpn) {
            tracing::warn!(%mpn, %err, "failed to claim locked page");
            self.free_untracked(mpn);
            return Err(BootstrapError::OutOfMemory);
        }

        let vpn = self.next_vpn;
        if self.memtrack.add(&self.host, vpn, mpn).is_none() {
            tracing::warn!(
                %vpn,
                %mpn,
                capacity = self.memtrack.capacity(),
                "locked page limit reached"
            );
            self.phystrack.remove(mpn);
            self.free_untracked(mpn);
            return Err(BootstrapError::OutOfMemory);
        }

        self.next_vpn += 1;
        Ok(mpn)
    }

    /// Pins the user page at `va` and claims it.
    ///
    /// A page already claimed by this VM keeps its single pin. The caller
    /// holds the VM lock.
    pub(crate) fn claim_user_page(&mut self, va: UserVa) -> Option<Mpn> {
        let mpn = match self.host.lookup_user_mpn(va) {
            Ok(mpn) => mpn,
            Err(err) => {
                tracing::debug!(%va, %err, "user page unavailable");
                return None;
            }
        };

        if mpn > Mpn::MAX {
            tracing::warn!(%va, %mpn, "user page beyond tracked range");
            self.unpin(mpn);
            return None;
        }

        if self.phystrack.test(mpn) {
            self.unpin(mpn);
            return Some(mpn);
        }

        if let Err(err) = self.phystrack.add(&self.host, mpn) {
            tracing::warn!(%va, %mpn, %err, "failed to claim user page");
            self.unpin(mpn);
            return None;
        }

        Some(mpn)
    }

    fn free_untracked(&self, mpn: Mpn) {
        if let Err(err) = self.host.free_locked_page(mpn) {
            tracing::warn!(%mpn, %err, "failed to free locked page");
        }
    }

    fn unpin(&self, mpn: Mpn) {
        if let Err(err) = self.host.release_user_mpn(mpn) {
            tracing::warn!(%mpn, %err, "failed to unpin user page");
        }
    }
}

impl<H> std::fmt::Debug for Vm<H>
where
    H: HostMemory,
{
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("num_vcpus", &self.num_vcpus)
            .field("memtrack", &self.memtrack)
            .field("phystrack", &self.phystrack)
            .field("blob", &self.blob)
            .finish_non_exhaustive()
    }
}
