//! In-process simulated host.
//!
//! [`SimHost`] implements the host collaborator traits over ordinary heap
//! memory. Machine pages are handed out with sequential MPNs, user memory is
//! a map from page-aligned user addresses to frames, and every allocation
//! is counted so tests can verify that nothing leaks.
//!
//! An optional allocation budget makes the host fail on demand, which is
//! how the error paths of the trackers and the blob loader are exercised.

use std::cell::{Cell, RefCell};

use indexmap::IndexMap;
use vmmon_arch_amd64::{Amd64, PageTableEntry, PageTableLevel, PteFlags};
use vmmon_core::{HostError, HostMemory, Ma, Mpn, PAGE_SIZE, PageAllocator, UserVa, Vpn};
use zerocopy::FromZeros;

/// Who owns a simulated frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// A locked page allocated on behalf of a VM.
    Locked,

    /// A page backing user memory.
    User,

    /// A page owned by the host itself, such as a prebuilt page table or a
    /// host-shared region.
    Host,
}

struct Frame {
    kind: FrameKind,
    data: Box<[u8]>,
}

#[derive(Default)]
struct SimHostInner {
    frames: IndexMap<Mpn, Frame>,
    user: IndexMap<UserVa, Mpn>,
    pins: IndexMap<Mpn, usize>,
}

/// A simulated host.
pub struct SimHost {
    inner: RefCell<SimHostInner>,
    next_mpn: Cell<u64>,
    budget: Cell<Option<usize>>,
    directory_pages: Cell<usize>,
}

impl Default for SimHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SimHost {
    /// First MPN handed out by a new host.
    pub const FIRST_MPN: Mpn = Mpn(0x1000);

    /// Creates a host with unlimited memory.
    pub fn new() -> Self {
        Self {
            inner: RefCell::new(SimHostInner::default()),
            next_mpn: Cell::new(Self::FIRST_MPN.0),
            budget: Cell::new(None),
            directory_pages: Cell::new(0),
        }
    }

    /// Starts numbering machine pages at `mpn`.
    pub fn with_first_mpn(self, mpn: Mpn) -> Self {
        self.next_mpn.set(mpn.0);
        self
    }

    /// Allows only `pages` further allocations.
    pub fn with_budget(self, pages: usize) -> Self {
        self.budget.set(Some(pages));
        self
    }

    /// Replaces the allocation budget. `None` removes the limit.
    pub fn set_budget(&self, pages: Option<usize>) {
        self.budget.set(pages);
    }

    /// Returns the number of live locked pages.
    pub fn locked_pages(&self) -> usize {
        self.count_frames(FrameKind::Locked)
    }

    /// Returns the number of live host-owned pages.
    pub fn host_pages(&self) -> usize {
        self.count_frames(FrameKind::Host)
    }

    /// Returns the number of live page-sized kernel objects.
    pub fn directory_pages(&self) -> usize {
        self.directory_pages.get()
    }

    /// Returns the number of outstanding pins on user pages.
    pub fn pinned_pages(&self) -> usize {
        self.inner.borrow().pins.values().sum()
    }

    /// Returns the kind of the frame at `mpn`.
    pub fn frame_kind(&self, mpn: Mpn) -> Option<FrameKind> {
        self.inner.borrow().frames.get(&mpn).map(|frame| frame.kind)
    }

    /// Returns a copy of the page at `mpn`.
    pub fn page(&self, mpn: Mpn) -> Result<Vec<u8>, HostError> {
        let inner = self.inner.borrow();
        let frame = inner.frames.get(&mpn).ok_or(HostError::InvalidMpn(mpn))?;
        Ok(frame.data.to_vec())
    }

    /// Maps `data` into user memory starting at the page-aligned `va`.
    ///
    /// The tail of the last page is zero-filled. User pages do not count
    /// against the allocation budget.
    pub fn map_user(&self, va: UserVa, data: &[u8]) -> Result<(), HostError> {
        if va.page_offset() != 0 {
            return Err(HostError::UserFault(va));
        }

        for (index, chunk) in data.chunks(PAGE_SIZE as usize).enumerate() {
            let page_va = va + index as u64 * PAGE_SIZE;
            let mpn = self.insert_frame(FrameKind::User);

            let mut inner = self.inner.borrow_mut();
            if let Some(frame) = inner.frames.get_mut(&mpn) {
                frame.data[..chunk.len()].copy_from_slice(chunk);
            }

            if let Some(old) = inner.user.insert(page_va, mpn) {
                inner.frames.shift_remove(&old);
            }
        }

        tracing::trace!(%va, len = data.len(), "mapped user memory");
        Ok(())
    }

    /// Allocates a host-owned page, outside of any budget.
    pub fn alloc_host_page(&self) -> Mpn {
        self.insert_frame(FrameKind::Host)
    }

    /// Builds 4-level tables covering `pages` pages from `first_vpn`, with
    /// `flags` on every non-leaf entry. Leaf entries are left empty.
    ///
    /// Tables are host-owned pages.
    pub fn prebuild_address_space(
        &self,
        first_vpn: Vpn,
        pages: u64,
        flags: PteFlags,
    ) -> Result<PrebuiltAddressSpace, HostError> {
        let root = self.alloc_host_page();
        let mut result = PrebuiltAddressSpace {
            root,
            l3: Vec::new(),
            l2: Vec::new(),
            l1: Vec::new(),
        };

        if pages == 0 {
            return Ok(result);
        }

        let span = PageTableLevel::L1.pages_per_table();
        let first = first_vpn.0 / span;
        let last = (first_vpn.0 + pages - 1) / span;

        for table in first..=last {
            let vpn = Vpn(table * span);
            let mut mpn = root;

            for level in [PageTableLevel::L4, PageTableLevel::L3, PageTableLevel::L2] {
                let (next, created) = self.ensure_table(mpn, Amd64::vpn_index(vpn, level), flags)?;

                if created {
                    match level {
                        PageTableLevel::L4 => result.l3.push(next),
                        PageTableLevel::L3 => result.l2.push(next),
                        _ => result.l1.push(next),
                    }
                }

                mpn = next;
            }
        }

        tracing::debug!(
            %root,
            %first_vpn,
            pages,
            l1 = result.l1.len(),
            "prebuilt address space"
        );

        Ok(result)
    }

    /// Writes the L1 entry for `vpn` in a prebuilt address space.
    pub fn map_page(
        &self,
        space: &PrebuiltAddressSpace,
        vpn: Vpn,
        mpn: Mpn,
        flags: PteFlags,
    ) -> Result<(), HostError> {
        let translation = Amd64::translation(self, vpn, space.root);
        let entry = translation
            .entry(PageTableLevel::L1)
            .ok_or(HostError::OutOfBounds)?;

        let table = entry.entry_address.mpn();
        let index = Amd64::vpn_index(vpn, PageTableLevel::L1);
        Amd64::write_entry(self, table, index, PageTableEntry::new(mpn, flags))
    }

    /// Clears the L2 entry pointing at the L1 table for `vpn`, leaving a
    /// sparse hole in a prebuilt address space.
    pub fn remove_l1_table(&self, space: &PrebuiltAddressSpace, vpn: Vpn) -> Result<(), HostError> {
        let translation = Amd64::translation(self, vpn, space.root);
        let entry = translation
            .entry(PageTableLevel::L2)
            .ok_or(HostError::OutOfBounds)?;

        let table = entry.entry_address.mpn();
        let index = Amd64::vpn_index(vpn, PageTableLevel::L2);
        Amd64::write_entry(self, table, index, PageTableEntry::default())
    }

    fn ensure_table(
        &self,
        table: Mpn,
        index: usize,
        flags: PteFlags,
    ) -> Result<(Mpn, bool), HostError> {
        let entry = Amd64::read_entry(self, table, index)?;
        if entry.present() {
            return Ok((entry.mpn(), false));
        }

        let next = self.alloc_host_page();
        Amd64::write_entry(self, table, index, PageTableEntry::new(next, flags))?;
        Ok((next, true))
    }

    fn take_budget(&self) -> bool {
        match self.budget.get() {
            Some(0) => false,
            Some(budget) => {
                self.budget.set(Some(budget - 1));
                true
            }
            None => true,
        }
    }

    fn insert_frame(&self, kind: FrameKind) -> Mpn {
        let mpn = Mpn(self.next_mpn.get());
        self.next_mpn.set(mpn.0 + 1);

        self.inner.borrow_mut().frames.insert(
            mpn,
            Frame {
                kind,
                data: vec![0; PAGE_SIZE as usize].into_boxed_slice(),
            },
        );

        mpn
    }

    fn count_frames(&self, kind: FrameKind) -> usize {
        self.inner
            .borrow()
            .frames
            .values()
            .filter(|frame| frame.kind == kind)
            .count()
    }

    fn check_range(ma: Ma, len: usize) -> Result<(usize, usize), HostError> {
        let offset = ma.page_offset() as usize;
        let end = offset.checked_add(len).ok_or(HostError::OutOfBounds)?;

        if end > PAGE_SIZE as usize {
            return Err(HostError::OutOfBounds);
        }

        Ok((offset, end))
    }
}

impl std::fmt::Debug for SimHost {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SimHost")
            .field("locked_pages", &self.locked_pages())
            .field("directory_pages", &self.directory_pages())
            .field("pinned_pages", &self.pinned_pages())
            .finish_non_exhaustive()
    }
}

/// Tables created by [`SimHost::prebuild_address_space`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrebuiltAddressSpace {
    /// The L4 table.
    pub root: Mpn,

    /// L3 tables in VPN order.
    pub l3: Vec<Mpn>,

    /// L2 tables in VPN order.
    pub l2: Vec<Mpn>,

    /// L1 tables in VPN order.
    pub l1: Vec<Mpn>,
}

impl PageAllocator for SimHost {
    fn alloc_page<T>(&self) -> Option<Box<T>>
    where
        T: FromZeros,
    {
        if !self.take_budget() {
            tracing::debug!("page allocation denied by budget");
            return None;
        }

        let page = T::new_box_zeroed().ok()?;
        self.directory_pages.set(self.directory_pages.get() + 1);
        Some(page)
    }

    fn free_page<T>(&self, page: Box<T>) {
        self.directory_pages.set(self.directory_pages.get() - 1);
        drop(page);
    }
}

impl HostMemory for SimHost {
    fn alloc_locked_page(&self) -> Result<Mpn, HostError> {
        if !self.take_budget() {
            tracing::debug!("locked page allocation denied by budget");
            return Err(HostError::OutOfMemory);
        }

        Ok(self.insert_frame(FrameKind::Locked))
    }

    fn free_locked_page(&self, mpn: Mpn) -> Result<(), HostError> {
        if self.frame_kind(mpn) != Some(FrameKind::Locked) {
            return Err(HostError::InvalidMpn(mpn));
        }

        self.inner.borrow_mut().frames.shift_remove(&mpn);
        Ok(())
    }

    fn read_phys(&self, ma: Ma, buffer: &mut [u8]) -> Result<(), HostError> {
        let (offset, end) = Self::check_range(ma, buffer.len())?;
        let inner = self.inner.borrow();
        let frame = inner
            .frames
            .get(&ma.mpn())
            .ok_or(HostError::InvalidMpn(ma.mpn()))?;

        buffer.copy_from_slice(&frame.data[offset..end]);
        Ok(())
    }

    fn write_phys(&self, ma: Ma, data: &[u8]) -> Result<(), HostError> {
        let (offset, end) = Self::check_range(ma, data.len())?;
        let mut inner = self.inner.borrow_mut();
        let frame = inner
            .frames
            .get_mut(&ma.mpn())
            .ok_or(HostError::InvalidMpn(ma.mpn()))?;

        frame.data[offset..end].copy_from_slice(data);
        Ok(())
    }

    fn copy_from_user(&self, buffer: &mut [u8], src: UserVa) -> Result<(), HostError> {
        let inner = self.inner.borrow();
        let mut copied = 0;

        while copied < buffer.len() {
            let va = src + copied as u64;
            let mpn = inner
                .user
                .get(&va.page_align_down())
                .ok_or(HostError::UserFault(va))?;
            let frame = inner.frames.get(mpn).ok_or(HostError::UserFault(va))?;

            let offset = va.page_offset() as usize;
            let len = (PAGE_SIZE as usize - offset).min(buffer.len() - copied);
            buffer[copied..copied + len].copy_from_slice(&frame.data[offset..offset + len]);
            copied += len;
        }

        Ok(())
    }

    fn lookup_user_mpn(&self, va: UserVa) -> Result<Mpn, HostError> {
        let mut inner = self.inner.borrow_mut();
        let mpn = *inner
            .user
            .get(&va.page_align_down())
            .ok_or(HostError::UserFault(va))?;

        *inner.pins.entry(mpn).or_default() += 1;
        Ok(mpn)
    }

    fn release_user_mpn(&self, mpn: Mpn) -> Result<(), HostError> {
        let mut inner = self.inner.borrow_mut();

        match inner.pins.get_mut(&mpn) {
            Some(pins) if *pins > 1 => *pins -= 1,
            Some(_) => {
                inner.pins.shift_remove(&mpn);
            }
            None => return Err(HostError::NotPinned(mpn)),
        }

        Ok(())
    }
}
