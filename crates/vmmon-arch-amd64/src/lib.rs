//! AMD64 paging structures for the monitor address space.
//!
//! The monitor runs under ordinary 4-level paging with 4KB pages. This crate
//! models the page table entry, the permission bits the loader compares,
//! and provides a diagnostic walk over tables living in host machine memory.

mod paging;
mod translation;

use vmmon_core::{HostError, HostMemory, Ma, Mpn, Vpn};

pub use self::{
    paging::{PT_ENTRIES, PageTableEntry, PageTableLevel, PteFlags},
    translation::{TranslationEntries, TranslationEntry, VpnTranslation},
};

/// AMD64 architecture.
#[derive(Debug)]
pub struct Amd64;

impl Amd64 {
    /// Returns the index into the table at `level` selected by `vpn`.
    pub fn vpn_index(vpn: Vpn, level: PageTableLevel) -> usize {
        ((vpn.0 >> level.vpn_shift()) & (PT_ENTRIES as u64 - 1)) as usize
    }

    /// Truncates a VPN to the 36 bits covered by 4-level paging.
    pub fn vpn_canonical(vpn: Vpn) -> Vpn {
        Vpn(vpn.0 & Vpn::MAX.0)
    }

    /// Returns the machine address of entry `index` of the table at `table`.
    pub fn entry_address(table: Mpn, index: usize) -> Ma {
        table.to_ma() + (index * size_of::<PageTableEntry>()) as u64
    }

    /// Reads entry `index` of the table at `table`.
    pub fn read_entry<H>(host: &H, table: Mpn, index: usize) -> Result<PageTableEntry, HostError>
    where
        H: HostMemory + ?Sized,
    {
        if index >= PT_ENTRIES {
            return Err(HostError::OutOfBounds);
        }

        host.read_struct(Self::entry_address(table, index))
    }

    /// Writes entry `index` of the table at `table`.
    pub fn write_entry<H>(
        host: &H,
        table: Mpn,
        index: usize,
        entry: PageTableEntry,
    ) -> Result<(), HostError>
    where
        H: HostMemory + ?Sized,
    {
        if index >= PT_ENTRIES {
            return Err(HostError::OutOfBounds);
        }

        host.write_struct(Self::entry_address(table, index), &entry)
    }

    /// Walks the page tables rooted at `root` for `vpn`.
    ///
    /// Every entry visited is recorded. The walk stops at the first entry
    /// that is not present, at a large page, or when a table cannot be read.
    pub fn translation<H>(host: &H, vpn: Vpn, root: Mpn) -> VpnTranslation
    where
        H: HostMemory + ?Sized,
    {
        let mut entries = TranslationEntries::new();
        let vpn = Self::vpn_canonical(vpn);
        let mut table = root;

        for level in PageTableLevel::ALL {
            let index = Self::vpn_index(vpn, level);
            let entry = match Self::read_entry(host, table, index) {
                Ok(entry) => entry,
                Err(_) => return VpnTranslation { entries, mpn: None },
            };

            entries.push(TranslationEntry {
                level,
                entry,
                entry_address: Self::entry_address(table, index),
            });

            if !entry.present() {
                return VpnTranslation { entries, mpn: None };
            }

            if level == PageTableLevel::L1 {
                return VpnTranslation {
                    entries,
                    mpn: Some(entry.mpn()),
                };
            }

            if entry.large() {
                let offset = vpn.0 & (level.pages_per_entry() - 1);
                return VpnTranslation {
                    entries,
                    mpn: Some(entry.mpn() + offset),
                };
            }

            table = entry.mpn();
        }

        VpnTranslation { entries, mpn: None }
    }
}
