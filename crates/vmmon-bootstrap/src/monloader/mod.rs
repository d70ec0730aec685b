//! Monitor address space loader.
//!
//! The loader replays the entry table of a [`MonLoaderHeader`] once per
//! VCPU, in table order. Each entry either establishes the address space,
//! checks the page tables that back it, or fills part of it with zeroed,
//! copied or shared pages. All host interaction goes through
//! [`MonLoaderCallouts`].
//!
//! Page tables are currently never built by the loader. The host prepares
//! them, and the loader imports and verifies what it finds
//! ([`PageTableMode::Verify`]).
//!
//! # State per VCPU
//!
//! ```text
//!   no address space --ADDRSPACE--> address space established
//!                                     |  PAGETABLE_L4..L1
//!                                     |  ALLOCZERO, COPY, SHARE
//!                                     v
//!                                  end of table
//! ```
//!
//! There is no way back; a second ADDRSPACE entry is an error. The first
//! failing entry aborts the run, and the failure records the table line and
//! VCPU it happened on.

mod callouts;
mod context;
#[cfg(test)]
mod tests;

use vmmon_arch_amd64::{Amd64, PageTableLevel, PteFlags};
use vmmon_core::{MAX_VCPUS, Mpn, PAGE_SIZE, VcpuId, Vpn, bytes_to_pages, is_page_aligned};

use self::context::MonLoaderContext;
pub use self::{
    callouts::MonLoaderCallouts,
    context::{MON_PT_L1_MPNS, MON_PT_L2_MPNS, MON_PT_L3_MPNS, MON_PT_L4_MPNS},
};
use crate::{
    ContentType, MONLOADER_HEADER_MAGIC, MonLoaderEntry, MonLoaderError, MonLoaderFailure,
    MonLoaderHeader, SHARED_REGION_HV_OPTIONAL, SourceType,
};

/// How the loader treats page tables.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PageTableMode {
    /// Import and verify page tables the host has already built.
    #[default]
    Verify,

    /// Allocate and fill page tables from scratch.
    ///
    /// Not implemented. Selecting it panics as soon as an address space or
    /// page table entry is processed.
    Create,
}

/// Loader configuration.
#[derive(Debug, Clone)]
pub struct MonLoaderConfig {
    server_class_host: bool,
    require_address_space: bool,
    page_table_mode: PageTableMode,
}

impl Default for MonLoaderConfig {
    fn default() -> Self {
        Self {
            server_class_host: false,
            require_address_space: true,
            page_table_mode: PageTableMode::Verify,
        }
    }
}

impl MonLoaderConfig {
    /// Marks the host as server class.
    ///
    /// Server class hosts may leave the optional hypervisor region
    /// ([`SHARED_REGION_HV_OPTIONAL`]) without any shared page.
    pub fn with_server_class_host(self, server_class_host: bool) -> Self {
        Self {
            server_class_host,
            ..self
        }
    }

    /// Requires every VCPU to end up with an address space.
    pub fn with_require_address_space(self, require_address_space: bool) -> Self {
        Self {
            require_address_space,
            ..self
        }
    }

    /// Selects how page tables are handled.
    pub fn with_page_table_mode(self, page_table_mode: PageTableMode) -> Self {
        Self {
            page_table_mode,
            ..self
        }
    }

    /// Returns `true` for server class hosts.
    pub fn server_class_host(&self) -> bool {
        self.server_class_host
    }

    /// Returns the page table mode.
    pub fn page_table_mode(&self) -> PageTableMode {
        self.page_table_mode
    }
}

/// The monitor address space loader.
#[derive(Debug, Default, Clone)]
pub struct MonLoader {
    config: MonLoaderConfig,
}

impl MonLoader {
    /// Creates a loader with the given configuration.
    pub fn new(config: MonLoaderConfig) -> Self {
        Self { config }
    }

    /// Returns the loader configuration.
    pub fn config(&self) -> &MonLoaderConfig {
        &self.config
    }

    /// Builds the monitor address space of every VCPU.
    ///
    /// `entries` must be the entry table that follows `header`. The
    /// allocation counter of each entry accumulates across all VCPUs and
    /// includes every page allocated before a failure.
    ///
    /// [`MonLoaderCallouts::cleanup`] is called exactly once if
    /// [`MonLoaderCallouts::init`] succeeded.
    pub fn process<C>(
        &self,
        header: &MonLoaderHeader,
        entries: &mut [MonLoaderEntry],
        num_vcpus: u32,
        callouts: &mut C,
    ) -> Result<(), MonLoaderFailure>
    where
        C: MonLoaderCallouts + ?Sized,
    {
        if num_vcpus == 0 || num_vcpus > MAX_VCPUS {
            return Err(MonLoaderError::Args.into());
        }

        if header.magic() != MONLOADER_HEADER_MAGIC {
            return Err(MonLoaderError::BadMagic.into());
        }

        if header.count() == 0 {
            return Err(MonLoaderError::MissingTable.into());
        }

        if header.count() as usize != entries.len() {
            return Err(MonLoaderError::Args.into());
        }

        if !callouts.init(num_vcpus) {
            return Err(MonLoaderError::CalloutInit.into());
        }

        let result = self.process_vcpus(entries, num_vcpus, callouts);
        callouts.cleanup();
        result
    }

    fn process_vcpus<C>(
        &self,
        entries: &mut [MonLoaderEntry],
        num_vcpus: u32,
        callouts: &mut C,
    ) -> Result<(), MonLoaderFailure>
    where
        C: MonLoaderCallouts + ?Sized,
    {
        for vcpu in (0..num_vcpus).map(VcpuId) {
            let mut ctx = MonLoaderContext::new(vcpu);
            tracing::debug!(%vcpu, entries = entries.len(), "loading monitor");

            for (line, entry) in entries.iter_mut().enumerate() {
                if entry.bsp_only() && !vcpu.is_bsp() {
                    continue;
                }

                self.process_entry(&mut ctx, entry, callouts)
                    .map_err(|error| MonLoaderFailure {
                        error,
                        line: Some(line),
                        vcpu: Some(vcpu),
                    })?;
            }

            if self.config.require_address_space && !ctx.has_addr_space {
                return Err(MonLoaderFailure {
                    error: MonLoaderError::NoAddrSpace,
                    line: None,
                    vcpu: Some(vcpu),
                });
            }
        }

        Ok(())
    }

    fn process_entry<C>(
        &self,
        ctx: &mut MonLoaderContext,
        entry: &mut MonLoaderEntry,
        callouts: &mut C,
    ) -> Result<(), MonLoaderError>
    where
        C: MonLoaderCallouts + ?Sized,
    {
        let pages = entry.mon_pages();
        let last = pages
            .checked_sub(1)
            .and_then(|pages| entry.vpn().checked_add(pages))
            .filter(|&last| last <= Vpn::MAX)
            .ok_or(MonLoaderError::Size)?;

        tracing::trace!(
            vcpu = %ctx.vcpu,
            content = ?entry.content(),
            source = ?entry.source(),
            vpn = %entry.vpn(),
            %last,
            "processing entry"
        );

        match entry.content() {
            Ok(ContentType::AddrSpace) => self.create_addr_space(ctx, entry, last, callouts),
            Ok(ContentType::PageTableL4) => {
                self.map_page_tables(ctx, entry, PageTableLevel::L4, callouts)
            }
            Ok(ContentType::PageTableL3) => {
                self.map_page_tables(ctx, entry, PageTableLevel::L3, callouts)
            }
            Ok(ContentType::PageTableL2) => {
                self.map_page_tables(ctx, entry, PageTableLevel::L2, callouts)
            }
            Ok(ContentType::PageTableL1) => {
                self.map_page_tables(ctx, entry, PageTableLevel::L1, callouts)
            }
            Ok(ContentType::AllocZero) => self.alloc_zero(ctx, entry, callouts),
            Ok(ContentType::Copy) => self.copy(ctx, entry, callouts),
            Ok(ContentType::Share) => self.share(ctx, entry, callouts),
            Err(content) => {
                tracing::warn!(vcpu = %ctx.vcpu, content, "unknown content type");
                Err(MonLoaderError::InvalidContent)
            }
        }
    }

    ///////////////////////////////////////////////////////////////////////////
    // Address space
    ///////////////////////////////////////////////////////////////////////////

    fn create_addr_space<C>(
        &self,
        ctx: &mut MonLoaderContext,
        entry: &MonLoaderEntry,
        last: Vpn,
        callouts: &mut C,
    ) -> Result<(), MonLoaderError>
    where
        C: MonLoaderCallouts + ?Sized,
    {
        if ctx.has_addr_space {
            return Err(MonLoaderError::DuplicateAddrSpace);
        }

        let first = entry.vpn();
        for level in PageTableLevel::ALL {
            let span = level.pages_per_table();
            ctx.pt.reserve(level, last.0 / span - first.0 / span + 1)?;
        }

        match self.config.page_table_mode {
            PageTableMode::Verify => self.import_page_tables(ctx, first, entry.flags(), callouts)?,
            PageTableMode::Create => unimplemented!("building monitor page tables"),
        }

        ctx.has_addr_space = true;
        ctx.first = first;
        ctx.last = last;
        ctx.flags = entry.flags();

        tracing::debug!(
            vcpu = %ctx.vcpu,
            %first,
            %last,
            l1 = ctx.pt.get(PageTableLevel::L1).len(),
            "address space established"
        );

        Ok(())
    }

    /// Walks the existing tables from the VCPU's root down to the L1
    /// tables, importing every table that covers the address space.
    ///
    /// L1 tables may be missing; their slots stay [`Mpn::INVALID`].
    fn import_page_tables<C>(
        &self,
        ctx: &mut MonLoaderContext,
        first: Vpn,
        flags: PteFlags,
        callouts: &mut C,
    ) -> Result<(), MonLoaderError>
    where
        C: MonLoaderCallouts + ?Sized,
    {
        let vcpu = ctx.vcpu;
        let root = callouts
            .page_root(vcpu)
            .ok_or(MonLoaderError::CalloutPageRoot)?;

        if !callouts.import_page(root, vcpu) {
            return Err(MonLoaderError::PtImport);
        }

        ctx.pt.set(PageTableLevel::L4, 0, root);

        for level in [PageTableLevel::L3, PageTableLevel::L2, PageTableLevel::L1] {
            let Some(parent_level) = level.previous()
            else {
                continue;
            };

            let span = level.pages_per_table();
            let parent_span = parent_level.pages_per_table();
            let base = first.0 - first.0 % span;

            for index in 0..ctx.pt.get(level).len() {
                let vpn = Vpn(base + index as u64 * span);
                let parent_index = (vpn.0 / parent_span - first.0 / parent_span) as usize;
                let parent = ctx.pt.get(parent_level)[parent_index];

                if !parent.is_valid() {
                    return Err(MonLoaderError::PtImport);
                }

                let pte = callouts
                    .get_pte(parent, Amd64::vpn_index(vpn, parent_level), vcpu)
                    .ok_or(MonLoaderError::CalloutGetPte)?;

                if !pte.present() {
                    if level == PageTableLevel::L1 {
                        tracing::trace!(%vcpu, %vpn, "sparse L1 table");
                        continue;
                    }

                    tracing::warn!(%vcpu, %vpn, ?level, "page table missing");
                    return Err(MonLoaderError::PtImport);
                }

                if pte.mpn() > Mpn::MAX || !pte.permissions_match(flags) {
                    tracing::warn!(%vcpu, %vpn, ?level, ?pte, ?flags, "page table mismatch");
                    return Err(MonLoaderError::PtImport);
                }

                if !callouts.import_page(pte.mpn(), vcpu) {
                    return Err(MonLoaderError::PtImport);
                }

                ctx.pt.set(level, index, pte.mpn());
            }
        }

        Ok(())
    }

    ///////////////////////////////////////////////////////////////////////////
    // Page tables
    ///////////////////////////////////////////////////////////////////////////

    fn map_page_tables<C>(
        &self,
        ctx: &mut MonLoaderContext,
        entry: &MonLoaderEntry,
        level: PageTableLevel,
        callouts: &mut C,
    ) -> Result<(), MonLoaderError>
    where
        C: MonLoaderCallouts + ?Sized,
    {
        if !ctx.has_addr_space {
            return Err(MonLoaderError::NoAddrSpace);
        }

        if entry.mon_pages() != ctx.pt.get(level).len() as u64 {
            tracing::warn!(
                vcpu = %ctx.vcpu,
                ?level,
                requested = entry.mon_pages(),
                tables = ctx.pt.get(level).len(),
                "page table count mismatch"
            );
            return Err(MonLoaderError::PtMapSize);
        }

        match self.config.page_table_mode {
            PageTableMode::Verify => {}
            PageTableMode::Create => unimplemented!("mapping monitor page tables"),
        }

        self.verify_page_tables(ctx, entry, level, callouts)
    }

    /// Checks that each page of the entry maps the recorded table of
    /// `level` with the entry's permissions.
    fn verify_page_tables<C>(
        &self,
        ctx: &MonLoaderContext,
        entry: &MonLoaderEntry,
        level: PageTableLevel,
        callouts: &mut C,
    ) -> Result<(), MonLoaderError>
    where
        C: MonLoaderCallouts + ?Sized,
    {
        for (index, &expected) in ctx.pt.get(level).iter().enumerate() {
            if !expected.is_valid() {
                continue;
            }

            let vpn = entry.vpn() + index as u64;
            let (table, pte_index) = ctx.l1_slot(vpn)?;
            if !table.is_valid() {
                return Err(MonLoaderError::PtVerify);
            }

            let pte = callouts
                .get_pte(table, pte_index, ctx.vcpu)
                .ok_or(MonLoaderError::CalloutGetPte)?;

            if !pte.present() || pte.mpn() != expected || !pte.permissions_match(entry.flags()) {
                tracing::warn!(
                    vcpu = %ctx.vcpu,
                    %vpn,
                    ?level,
                    %expected,
                    ?pte,
                    "page table mapping mismatch"
                );
                return Err(MonLoaderError::PtVerify);
            }
        }

        Ok(())
    }

    ///////////////////////////////////////////////////////////////////////////
    // Contents
    ///////////////////////////////////////////////////////////////////////////

    fn alloc_zero<C>(
        &self,
        ctx: &mut MonLoaderContext,
        entry: &mut MonLoaderEntry,
        callouts: &mut C,
    ) -> Result<(), MonLoaderError>
    where
        C: MonLoaderCallouts + ?Sized,
    {
        let pages = match entry.source() {
            Ok(SourceType::None) => entry.mon_pages(),
            // Uninitialized data: sized by the image, not backed by it.
            Ok(SourceType::Blob) => bytes_to_pages(entry.blob_size()),
            _ => return Err(MonLoaderError::InvalidSource),
        };

        if pages == 0 || pages > entry.mon_pages() {
            return Err(MonLoaderError::Size);
        }

        for index in 0..pages {
            let mpn = callouts
                .alloc_mpn(ctx.vcpu)
                .ok_or(MonLoaderError::Alloc)?;
            entry.count_alloc();

            if !callouts.fill_page(mpn, 0, ctx.vcpu) {
                return Err(MonLoaderError::CalloutZero);
            }

            self.map(ctx, entry.vpn() + index, mpn, entry.flags(), callouts)?;
        }

        Ok(())
    }

    fn copy<C>(
        &self,
        ctx: &mut MonLoaderContext,
        entry: &mut MonLoaderEntry,
        callouts: &mut C,
    ) -> Result<(), MonLoaderError>
    where
        C: MonLoaderCallouts + ?Sized,
    {
        if entry.source() != Ok(SourceType::Blob) {
            return Err(MonLoaderError::InvalidSource);
        }

        let size = entry.blob_size();
        let capacity = entry.mon_pages().saturating_mul(PAGE_SIZE);
        if size == 0 || size > capacity || entry.blob_offset().checked_add(size).is_none() {
            return Err(MonLoaderError::Size);
        }

        let mut vpn = entry.vpn();
        let mut offset = entry.blob_offset();
        let mut remaining = size;

        while remaining > 0 {
            let len = remaining.min(PAGE_SIZE);
            let mpn = callouts
                .alloc_mpn(ctx.vcpu)
                .ok_or(MonLoaderError::Alloc)?;
            entry.count_alloc();

            self.map(ctx, vpn, mpn, entry.flags(), callouts)?;

            if !callouts.copy_from_blob(offset, len, mpn, ctx.vcpu) {
                return Err(MonLoaderError::CalloutCopy);
            }

            vpn += 1;
            offset += len;
            remaining -= len;
        }

        Ok(())
    }

    fn share<C>(
        &self,
        ctx: &mut MonLoaderContext,
        entry: &MonLoaderEntry,
        callouts: &mut C,
    ) -> Result<(), MonLoaderError>
    where
        C: MonLoaderCallouts + ?Sized,
    {
        match entry.source() {
            Ok(SourceType::User) => self.share_pages(ctx, entry, SourceType::User, callouts),
            Ok(SourceType::Host) => self.share_pages(ctx, entry, SourceType::Host, callouts),
            Ok(SourceType::Blob) => self.share_blob(ctx, entry, callouts),
            _ => Err(MonLoaderError::InvalidSource),
        }
    }

    /// Maps up to `mon_pages` pages of a user or host shared region.
    ///
    /// Running out after the first page is success; the region was simply
    /// smaller than the maximum.
    fn share_pages<C>(
        &self,
        ctx: &mut MonLoaderContext,
        entry: &MonLoaderEntry,
        source: SourceType,
        callouts: &mut C,
    ) -> Result<(), MonLoaderError>
    where
        C: MonLoaderCallouts + ?Sized,
    {
        let sub_index = entry.sub_index();

        for index in 0..entry.mon_pages() {
            let mpn = match source {
                SourceType::User => callouts.shared_user_page(sub_index, index, ctx.vcpu),
                _ => callouts.shared_host_page(sub_index, index, ctx.vcpu),
            };

            let Some(mpn) = mpn
            else {
                if index > 0 {
                    tracing::debug!(
                        vcpu = %ctx.vcpu,
                        sub_index,
                        shared = index,
                        requested = entry.mon_pages(),
                        "partial share"
                    );
                    break;
                }

                if self.config.server_class_host && sub_index == SHARED_REGION_HV_OPTIONAL {
                    tracing::debug!(vcpu = %ctx.vcpu, sub_index, "optional region absent");
                    break;
                }

                tracing::warn!(vcpu = %ctx.vcpu, sub_index, ?source, "no shared page");
                return Err(MonLoaderError::Share);
            };

            self.map(ctx, entry.vpn() + index, mpn, entry.flags(), callouts)?;
        }

        Ok(())
    }

    /// Maps pages of the blob itself, read-only.
    fn share_blob<C>(
        &self,
        ctx: &mut MonLoaderContext,
        entry: &MonLoaderEntry,
        callouts: &mut C,
    ) -> Result<(), MonLoaderError>
    where
        C: MonLoaderCallouts + ?Sized,
    {
        let offset = entry.blob_offset();
        let size = entry.blob_size();

        if !is_page_aligned(offset) || !is_page_aligned(size) {
            tracing::warn!(vcpu = %ctx.vcpu, offset, size, "unaligned blob share");
            return Err(MonLoaderError::Share);
        }

        if entry.flags().contains(PteFlags::WRITABLE) {
            tracing::warn!(vcpu = %ctx.vcpu, offset, size, "writable blob share");
            return Err(MonLoaderError::Share);
        }

        let capacity = entry.mon_pages().saturating_mul(PAGE_SIZE);
        if size == 0 || size > capacity || offset.checked_add(size).is_none() {
            return Err(MonLoaderError::Size);
        }

        for index in 0..size / PAGE_SIZE {
            let mpn = callouts
                .blob_mpn(offset + index * PAGE_SIZE, ctx.vcpu)
                .ok_or(MonLoaderError::Share)?;

            self.map(ctx, entry.vpn() + index, mpn, entry.flags(), callouts)?;
        }

        Ok(())
    }

    /// Maps `mpn` at `vpn`, which must be inside the address space and not
    /// mapped yet.
    fn map<C>(
        &self,
        ctx: &MonLoaderContext,
        vpn: Vpn,
        mpn: Mpn,
        flags: PteFlags,
        callouts: &mut C,
    ) -> Result<(), MonLoaderError>
    where
        C: MonLoaderCallouts + ?Sized,
    {
        let (table, index) = ctx.l1_slot(vpn)?;
        if !table.is_valid() {
            tracing::warn!(vcpu = %ctx.vcpu, %vpn, "no L1 table");
            return Err(MonLoaderError::Map);
        }

        let pte = callouts
            .get_pte(table, index, ctx.vcpu)
            .ok_or(MonLoaderError::CalloutGetPte)?;

        if pte.present() {
            tracing::warn!(vcpu = %ctx.vcpu, %vpn, ?pte, "already mapped");
            return Err(MonLoaderError::AlreadyMapped);
        }

        if !callouts.map_mpn_in_pte(table, index, flags, mpn, ctx.vcpu) {
            return Err(MonLoaderError::CalloutMapInPte);
        }

        tracing::trace!(vcpu = %ctx.vcpu, %vpn, %mpn, ?flags, "mapped");
        Ok(())
    }
}
