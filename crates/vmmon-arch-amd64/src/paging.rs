use vmmon_core::Mpn;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Number of entries in one page table page.
pub const PT_ENTRIES: usize = 512;

bitflags::bitflags! {
    /// Flag bits of a 4-level page table entry.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PteFlags: u64 {
        /// The entry maps a page or a lower-level table.
        const PRESENT        = 1 << 0;

        /// Writes are allowed.
        const WRITABLE       = 1 << 1;

        /// User-mode accesses are allowed.
        const USER           = 1 << 2;

        /// Write-through caching.
        const WRITE_THROUGH  = 1 << 3;

        /// Caching is disabled.
        const CACHE_DISABLE  = 1 << 4;

        /// Set by hardware on access.
        const ACCESSED       = 1 << 5;

        /// Set by hardware on write.
        const DIRTY          = 1 << 6;

        /// The entry maps a large page.
        const LARGE          = 1 << 7;

        /// The translation is global.
        const GLOBAL         = 1 << 8;

        /// Instruction fetches are not allowed.
        const NX             = 1 << 63;
    }
}

impl PteFlags {
    /// Bits compared when checking that an entry carries the requested
    /// permissions.
    ///
    /// Accessed, dirty and software-available bits legitimately differ
    /// between a recipe and what the hardware left behind.
    pub const PERMISSION_MASK: Self = Self::PRESENT
        .union(Self::WRITABLE)
        .union(Self::USER)
        .union(Self::NX);

    /// Returns only the permission bits.
    pub fn permissions(self) -> Self {
        self.intersection(Self::PERMISSION_MASK)
    }
}

/// The levels in the page table hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PageTableLevel {
    /// Page table, pointing directly to 4KB pages.
    L1 = 1,

    /// Page directory.
    L2 = 2,

    /// Page directory pointer table.
    L3 = 3,

    /// Page map level 4, the root.
    L4 = 4,
}

impl PageTableLevel {
    /// All levels, root first.
    pub const ALL: [Self; 4] = [Self::L4, Self::L3, Self::L2, Self::L1];

    /// Returns the next lower level in the page table hierarchy.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::L1 => None,
            Self::L2 => Some(Self::L1),
            Self::L3 => Some(Self::L2),
            Self::L4 => Some(Self::L3),
        }
    }

    /// Returns the next higher level in the page table hierarchy.
    pub fn previous(self) -> Option<Self> {
        match self {
            Self::L1 => Some(Self::L2),
            Self::L2 => Some(Self::L3),
            Self::L3 => Some(Self::L4),
            Self::L4 => None,
        }
    }

    /// Returns the position of this level's index inside a VPN, in bits.
    pub fn vpn_shift(self) -> u32 {
        match self {
            Self::L1 => 0,
            Self::L2 => 9,
            Self::L3 => 18,
            Self::L4 => 27,
        }
    }

    /// Returns the number of 4KB pages covered by one entry at this level.
    pub fn pages_per_entry(self) -> u64 {
        1 << self.vpn_shift()
    }

    /// Returns the number of 4KB pages covered by one table at this level.
    pub fn pages_per_table(self) -> u64 {
        self.pages_per_entry() * PT_ENTRIES as u64
    }
}

/// A page table entry in the paging structures.
#[repr(transparent)]
#[derive(Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PageTableEntry(pub u64);

impl PageTableEntry {
    const MPN_BITS: u64 = 40;
    const MPN_MASK: u64 = ((1 << Self::MPN_BITS) - 1) << 12;

    /// Creates an entry pointing at `mpn` with the given flags.
    pub fn new(mpn: Mpn, flags: PteFlags) -> Self {
        Self(((mpn.0 << 12) & Self::MPN_MASK) | flags.bits())
    }

    /// Checks if the entry is present.
    pub fn present(self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }

    /// Checks if the page is writable.
    pub fn write(self) -> bool {
        self.flags().contains(PteFlags::WRITABLE)
    }

    /// Checks if the page is accessible in user mode.
    pub fn user(self) -> bool {
        self.flags().contains(PteFlags::USER)
    }

    /// Checks if this entry refers to a large page.
    pub fn large(self) -> bool {
        self.flags().contains(PteFlags::LARGE)
    }

    /// Checks if instruction fetches are disallowed.
    pub fn no_execute(self) -> bool {
        self.flags().contains(PteFlags::NX)
    }

    /// Extracts the machine page number from the entry.
    pub fn mpn(self) -> Mpn {
        Mpn((self.0 & Self::MPN_MASK) >> 12)
    }

    /// Returns the flag bits of the entry.
    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Returns the permission bits of the entry.
    pub fn permissions(self) -> PteFlags {
        self.flags().permissions()
    }

    /// Checks if the entry carries exactly the permissions in `flags`.
    pub fn permissions_match(self, flags: PteFlags) -> bool {
        self.permissions() == flags.permissions()
    }
}

impl std::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("present", &self.present())
            .field("write", &self.write())
            .field("user", &self.user())
            .field("large", &self.large())
            .field("nx", &self.no_execute())
            .field("mpn", &self.mpn())
            .finish()
    }
}
