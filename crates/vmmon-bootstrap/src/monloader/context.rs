use vmmon_arch_amd64::{PageTableLevel, PteFlags};
use vmmon_core::{Mpn, VcpuId, Vpn};

use crate::MonLoaderError;

/// L4 tables per monitor address space.
pub const MON_PT_L4_MPNS: usize = 1;

/// L3 tables per monitor address space.
pub const MON_PT_L3_MPNS: usize = 1;

/// L2 tables per monitor address space.
pub const MON_PT_L2_MPNS: usize = 1;

/// L1 tables per monitor address space, bounding it to 64MB.
pub const MON_PT_L1_MPNS: usize = 32;

/// Machine pages of the page tables backing the monitor address space.
#[derive(Debug)]
pub(super) struct MonPtMpns {
    l4: [Mpn; MON_PT_L4_MPNS],
    l3: [Mpn; MON_PT_L3_MPNS],
    l2: [Mpn; MON_PT_L2_MPNS],
    l1: [Mpn; MON_PT_L1_MPNS],
    count: [usize; 4],
}

impl MonPtMpns {
    fn new() -> Self {
        Self {
            l4: [Mpn::INVALID; MON_PT_L4_MPNS],
            l3: [Mpn::INVALID; MON_PT_L3_MPNS],
            l2: [Mpn::INVALID; MON_PT_L2_MPNS],
            l1: [Mpn::INVALID; MON_PT_L1_MPNS],
            count: [0; 4],
        }
    }

    fn slots(&self, level: PageTableLevel) -> &[Mpn] {
        match level {
            PageTableLevel::L4 => &self.l4,
            PageTableLevel::L3 => &self.l3,
            PageTableLevel::L2 => &self.l2,
            PageTableLevel::L1 => &self.l1,
        }
    }

    fn slots_mut(&mut self, level: PageTableLevel) -> &mut [Mpn] {
        match level {
            PageTableLevel::L4 => &mut self.l4,
            PageTableLevel::L3 => &mut self.l3,
            PageTableLevel::L2 => &mut self.l2,
            PageTableLevel::L1 => &mut self.l1,
        }
    }

    /// Sets the number of tables used at `level`.
    pub fn reserve(&mut self, level: PageTableLevel, count: u64) -> Result<(), MonLoaderError> {
        let capacity = self.slots(level).len();
        let count = usize::try_from(count)
            .ok()
            .filter(|&count| count <= capacity)
            .ok_or(MonLoaderError::AddrSpaceTooLarge)?;

        self.slots_mut(level).fill(Mpn::INVALID);
        self.count[level as usize - 1] = count;
        Ok(())
    }

    /// Returns the tables used at `level`, in VPN order.
    pub fn get(&self, level: PageTableLevel) -> &[Mpn] {
        &self.slots(level)[..self.count[level as usize - 1]]
    }

    pub fn set(&mut self, level: PageTableLevel, index: usize, mpn: Mpn) {
        let count = self.count[level as usize - 1];
        self.slots_mut(level)[..count][index] = mpn;
    }
}

/// Per-VCPU state of one loader pass.
#[derive(Debug)]
pub(super) struct MonLoaderContext {
    pub vcpu: VcpuId,
    pub has_addr_space: bool,
    pub first: Vpn,
    pub last: Vpn,
    pub flags: PteFlags,
    pub pt: MonPtMpns,
}

impl MonLoaderContext {
    pub fn new(vcpu: VcpuId) -> Self {
        Self {
            vcpu,
            has_addr_space: false,
            first: Vpn(0),
            last: Vpn(0),
            flags: PteFlags::empty(),
            pt: MonPtMpns::new(),
        }
    }

    /// Returns the L1 table and index holding the PTE for `vpn`.
    ///
    /// The table is [`Mpn::INVALID`] if that part of a sparse address space
    /// has no L1 table.
    pub fn l1_slot(&self, vpn: Vpn) -> Result<(Mpn, usize), MonLoaderError> {
        if !self.has_addr_space {
            return Err(MonLoaderError::NoAddrSpace);
        }

        if vpn < self.first || vpn > self.last {
            return Err(MonLoaderError::InvalidVpn);
        }

        let span = PageTableLevel::L1.pages_per_table();
        let table = (vpn.0 / span - self.first.0 / span) as usize;
        let index = (vpn.0 % span) as usize;

        match self.pt.get(PageTableLevel::L1).get(table) {
            Some(&mpn) => Ok((mpn, index)),
            None => Err(MonLoaderError::InvalidVpn),
        }
    }
}
