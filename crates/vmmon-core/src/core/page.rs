use super::macros::impl_page_number;

/// Size of a page in bytes.
pub const PAGE_SIZE: u64 = 0x1000;

/// Number of bits to shift between a page number and an address.
pub const PAGE_SHIFT: u32 = 12;

/// Mask selecting the offset within a page.
pub const PAGE_OFFSET_MASK: u64 = PAGE_SIZE - 1;

impl_page_number!(Mpn, "Machine Page Number");
impl_page_number!(Vpn, "Virtual Page Number");
impl_page_number!(Lpn, "Linear Page Number");
impl_page_number!(Ma, "Machine Address");
impl_page_number!(UserVa, "user-space Virtual Address");

impl Mpn {
    /// Sentinel for "no machine page".
    pub const INVALID: Mpn = Mpn(u64::MAX);

    /// Highest machine page number the host driver supports.
    pub const MAX: Mpn = Mpn((1 << 32) - 1);

    /// Returns `true` unless this is [`Mpn::INVALID`].
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }

    /// Returns the machine address of the first byte of the page.
    pub const fn to_ma(self) -> Ma {
        Ma(self.0 << PAGE_SHIFT)
    }
}

impl Vpn {
    /// Highest canonical virtual page number (48-bit virtual addresses).
    pub const MAX: Vpn = Vpn((1 << 36) - 1);
}

impl Ma {
    /// Returns the machine page containing this address.
    pub const fn mpn(self) -> Mpn {
        Mpn(self.0 >> PAGE_SHIFT)
    }

    /// Returns the offset of this address within its page.
    pub const fn page_offset(self) -> u64 {
        self.0 & PAGE_OFFSET_MASK
    }
}

impl UserVa {
    /// Returns the address aligned down to its page.
    pub const fn page_align_down(self) -> UserVa {
        UserVa(self.0 & !PAGE_OFFSET_MASK)
    }

    /// Returns the offset of this address within its page.
    pub const fn page_offset(self) -> u64 {
        self.0 & PAGE_OFFSET_MASK
    }
}

/// Number of pages needed to hold `bytes` bytes.
pub const fn bytes_to_pages(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}

/// Returns `true` if `value` is a multiple of the page size.
pub const fn is_page_aligned(value: u64) -> bool {
    value & PAGE_OFFSET_MASK == 0
}

/// A virtual CPU identifier.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct VcpuId(pub u32);

impl VcpuId {
    /// The boot VCPU.
    pub const BSP: VcpuId = VcpuId(0);

    /// Returns `true` for the boot VCPU.
    pub const fn is_bsp(self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for VcpuId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<VcpuId> for u32 {
    fn from(value: VcpuId) -> Self {
        value.0
    }
}

impl std::fmt::Display for VcpuId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_mpn_is_distinct_from_zero() {
        assert!(Mpn(0).is_valid());
        assert!(!Mpn::INVALID.is_valid());
        assert!(Mpn::MAX < Mpn::INVALID);
    }

    #[test]
    fn machine_address_round_trip() {
        let ma = Mpn(0x1234).to_ma() + 0x10;
        assert_eq!(ma, Ma(0x1234010));
        assert_eq!(ma.mpn(), Mpn(0x1234));
        assert_eq!(ma.page_offset(), 0x10);
    }

    #[test]
    fn page_rounding() {
        assert_eq!(bytes_to_pages(0), 0);
        assert_eq!(bytes_to_pages(1), 1);
        assert_eq!(bytes_to_pages(PAGE_SIZE), 1);
        assert_eq!(bytes_to_pages(PAGE_SIZE + 1), 2);
        assert!(is_page_aligned(0x3000));
        assert!(!is_page_aligned(0x3001));
    }

    #[test]
    fn checked_add_detects_overflow() {
        assert_eq!(Vpn(1).checked_add(2), Some(Vpn(3)));
        assert_eq!(Vpn(u64::MAX).checked_add(1), None);
    }
}
