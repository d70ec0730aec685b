//! Loader header layout.
//!
//! The header and its entries are packed little-endian structures. An
//! offline tool patches blob-copy sources by byte offset into this exact
//! layout, so field order and sizes must not change.
//!
//! ```text
//!   MonLoaderHeader (52 bytes)
//!   +--------+--------+--------+------+--------+------+---------+---------+---------+
//!   | magic  | esize  | count  | csel | centry | ssel | sentry  | mon_lo  | mon_hi  |
//!   |   8    |   4    |   4    |  2   |   8    |  2   |   8     |   8     |   8     |
//!   +--------+--------+--------+------+--------+------+---------+---------+---------+
//!   MonLoaderEntry[count] (68 bytes each)
//! ```

use vmmon_arch_amd64::PteFlags;
use vmmon_core::{Lpn, Vpn};
use zerocopy::{
    FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned,
    little_endian::{U16, U32, U64},
};

/// Magic value identifying a loader header ("MONLDR").
pub const MONLOADER_HEADER_MAGIC: u64 = 0x0000_5244_4c4e_4f4d;

/// Sub-index of the shared region backing an optional hypervisor feature.
pub const SHARED_REGION_HV_OPTIONAL: u64 = 7;

/// What an entry asks the loader to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ContentType {
    /// Establish the address space.
    AddrSpace = 1,

    /// Allocate zero-filled pages.
    AllocZero = 2,

    /// Copy pages from a source.
    Copy = 3,

    /// Map the L4 page table.
    PageTableL4 = 4,

    /// Map the L3 page tables.
    PageTableL3 = 5,

    /// Map the L2 page tables.
    PageTableL2 = 6,

    /// Map the L1 page tables.
    PageTableL1 = 7,

    /// Share existing pages.
    Share = 8,
}

impl TryFrom<u32> for ContentType {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::AddrSpace),
            2 => Ok(Self::AllocZero),
            3 => Ok(Self::Copy),
            4 => Ok(Self::PageTableL4),
            5 => Ok(Self::PageTableL3),
            6 => Ok(Self::PageTableL2),
            7 => Ok(Self::PageTableL1),
            8 => Ok(Self::Share),
            _ => Err(value),
        }
    }
}

/// Where the contents of an entry come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SourceType {
    /// No source.
    None = 0,

    /// A range of the blob.
    Blob = 1,

    /// Pages owned by the user-space process.
    User = 2,

    /// Pages owned by the host driver.
    Host = 3,
}

impl TryFrom<u32> for SourceType {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Blob),
            2 => Ok(Self::User),
            3 => Ok(Self::Host),
            _ => Err(value),
        }
    }
}

/// Fixed part of the loader header.
#[repr(C)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned,
)]
pub struct MonLoaderHeader {
    magic: U64,
    entry_size: U32,
    count: U32,
    code_selector: U16,
    code_entry: U64,
    stack_selector: U16,
    stack_entry: U64,
    mon_start: U64,
    mon_end: U64,
}

impl MonLoaderHeader {
    /// Returns the magic value.
    pub fn magic(&self) -> u64 {
        self.magic.get()
    }

    /// Returns the recorded size of one entry.
    pub fn entry_size(&self) -> u32 {
        self.entry_size.get()
    }

    /// Returns the number of entries.
    pub fn count(&self) -> u32 {
        self.count.get()
    }

    /// Returns the code segment selector and entry point.
    pub fn code_entry(&self) -> (u16, u64) {
        (self.code_selector.get(), self.code_entry.get())
    }

    /// Returns the stack segment selector and initial stack pointer.
    pub fn stack_entry(&self) -> (u16, u64) {
        (self.stack_selector.get(), self.stack_entry.get())
    }

    /// Returns the monitor's first and last linear page.
    pub fn monitor_range(&self) -> (Lpn, Lpn) {
        (Lpn(self.mon_start.get()), Lpn(self.mon_end.get()))
    }
}

/// Byte range of the blob an entry draws from.
#[repr(C)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned,
)]
pub struct BlobSource {
    offset: U64,
    size: U64,
}

/// One step of the loader recipe.
#[repr(C)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned,
)]
pub struct MonLoaderEntry {
    content: U32,
    source: U32,
    vpn: U64,
    mon_pages: U64,
    flags: U64,
    allocs: U32,
    blob: BlobSource,
    bsp_only: U64,
    sub_index: U64,
}

impl MonLoaderEntry {
    /// Creates an entry with the given content and source and every other
    /// field zeroed.
    pub fn new(content: ContentType, source: SourceType) -> Self {
        let mut entry = Self::new_zeroed();
        entry.content.set(content as u32);
        entry.source.set(source as u32);
        entry
    }

    /// Sets the destination range.
    pub fn with_pages(mut self, vpn: Vpn, mon_pages: u64) -> Self {
        self.vpn.set(vpn.0);
        self.mon_pages.set(mon_pages);
        self
    }

    /// Sets the PTE flags.
    pub fn with_flags(mut self, flags: PteFlags) -> Self {
        self.flags.set(flags.bits());
        self
    }

    /// Sets the blob source range.
    pub fn with_blob(mut self, offset: u64, size: u64) -> Self {
        self.blob.offset.set(offset);
        self.blob.size.set(size);
        self
    }

    /// Restricts the entry to the boot VCPU.
    pub fn with_bsp_only(mut self, bsp_only: bool) -> Self {
        self.bsp_only.set(u64::from(bsp_only));
        self
    }

    /// Sets the shared region sub-index.
    pub fn with_sub_index(mut self, sub_index: u64) -> Self {
        self.sub_index.set(sub_index);
        self
    }

    /// Returns the content type, or the raw value if it is unknown.
    pub fn content(&self) -> Result<ContentType, u32> {
        ContentType::try_from(self.content.get())
    }

    /// Returns the source type, or the raw value if it is unknown.
    pub fn source(&self) -> Result<SourceType, u32> {
        SourceType::try_from(self.source.get())
    }

    /// Returns the first destination VPN.
    pub fn vpn(&self) -> Vpn {
        Vpn(self.vpn.get())
    }

    /// Returns the destination size in pages.
    pub fn mon_pages(&self) -> u64 {
        self.mon_pages.get()
    }

    /// Returns the PTE flags, including unknown bits.
    pub fn flags(&self) -> PteFlags {
        PteFlags::from_bits_retain(self.flags.get())
    }

    /// Returns the number of pages the loader allocated for this entry.
    pub fn allocs(&self) -> u32 {
        self.allocs.get()
    }

    /// Adds one to the allocation counter.
    pub fn count_alloc(&mut self) {
        self.allocs.set(self.allocs.get().wrapping_add(1));
    }

    /// Returns the byte offset into the blob.
    pub fn blob_offset(&self) -> u64 {
        self.blob.offset.get()
    }

    /// Returns the number of bytes taken from the blob.
    pub fn blob_size(&self) -> u64 {
        self.blob.size.get()
    }

    /// Returns `true` if the entry applies only to the boot VCPU.
    pub fn bsp_only(&self) -> bool {
        self.bsp_only.get() != 0
    }

    /// Returns the shared region sub-index.
    pub fn sub_index(&self) -> u64 {
        self.sub_index.get()
    }
}

/// Assembles a loader header and its entry table.
#[derive(Debug, Clone)]
pub struct MonLoaderHeaderBuilder {
    header: MonLoaderHeader,
    entries: Vec<MonLoaderEntry>,
}

impl Default for MonLoaderHeaderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MonLoaderHeaderBuilder {
    /// Creates a builder with the standard magic and no entries.
    pub fn new() -> Self {
        let mut header = MonLoaderHeader::new_zeroed();
        header.magic.set(MONLOADER_HEADER_MAGIC);
        header.entry_size.set(size_of::<MonLoaderEntry>() as u32);

        Self {
            header,
            entries: Vec::new(),
        }
    }

    /// Overrides the magic value.
    pub fn magic(mut self, magic: u64) -> Self {
        self.header.magic.set(magic);
        self
    }

    /// Sets the code entry point.
    pub fn code_entry(mut self, selector: u16, entry: u64) -> Self {
        self.header.code_selector.set(selector);
        self.header.code_entry.set(entry);
        self
    }

    /// Sets the initial stack.
    pub fn stack_entry(mut self, selector: u16, entry: u64) -> Self {
        self.header.stack_selector.set(selector);
        self.header.stack_entry.set(entry);
        self
    }

    /// Sets the monitor's linear page bounds.
    pub fn monitor_range(mut self, start: Lpn, end: Lpn) -> Self {
        self.header.mon_start.set(start.0);
        self.header.mon_end.set(end.0);
        self
    }

    /// Appends an entry.
    pub fn entry(mut self, entry: MonLoaderEntry) -> Self {
        self.entries.push(entry);
        self
    }

    /// Returns the header with the entry count filled in.
    pub fn header(&self) -> MonLoaderHeader {
        let mut header = self.header;
        header.count.set(self.entries.len() as u32);
        header
    }

    /// Returns the entries added so far.
    pub fn entries(&self) -> &[MonLoaderEntry] {
        &self.entries
    }

    /// Serializes the header followed by the entry table.
    pub fn build(&self) -> Vec<u8> {
        let mut bytes = self.header().as_bytes().to_vec();
        bytes.extend_from_slice(self.entries.as_bytes());
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_packed() {
        assert_eq!(size_of::<MonLoaderHeader>(), 52);
        assert_eq!(size_of::<MonLoaderEntry>(), 68);
        assert_eq!(MONLOADER_HEADER_MAGIC.to_le_bytes(), *b"MONLDR\0\0");
    }

    #[test]
    fn entry_field_offsets() {
        let entry = MonLoaderEntry::new(ContentType::Copy, SourceType::Blob)
            .with_pages(Vpn(0x1122), 3)
            .with_blob(0xaabb, 0xccdd)
            .with_sub_index(5);
        let bytes = entry.as_bytes();

        assert_eq!(bytes[0..4], 3u32.to_le_bytes());
        assert_eq!(bytes[4..8], 1u32.to_le_bytes());
        assert_eq!(bytes[8..16], 0x1122u64.to_le_bytes());
        assert_eq!(bytes[16..24], 3u64.to_le_bytes());
        assert_eq!(bytes[36..44], 0xaabbu64.to_le_bytes());
        assert_eq!(bytes[44..52], 0xccddu64.to_le_bytes());
        assert_eq!(bytes[60..68], 5u64.to_le_bytes());
    }

    #[test]
    fn builder_output_parses() {
        let builder = MonLoaderHeaderBuilder::new()
            .code_entry(0x10, 0xfffffffffc000000)
            .monitor_range(Lpn(0xfc00), Lpn(0xffff))
            .entry(MonLoaderEntry::new(ContentType::AddrSpace, SourceType::None))
            .entry(MonLoaderEntry::new(ContentType::Share, SourceType::User).with_bsp_only(true));
        let bytes = builder.build();

        let Ok((header, rest)) = MonLoaderHeader::read_from_prefix(&bytes)
        else {
            panic!("header does not parse");
        };

        assert_eq!(header.magic(), MONLOADER_HEADER_MAGIC);
        assert_eq!(header.count(), 2);
        assert_eq!(header.entry_size(), 68);
        assert_eq!(header.code_entry(), (0x10, 0xfffffffffc000000));
        assert_eq!(header.monitor_range(), (Lpn(0xfc00), Lpn(0xffff)));
        assert_eq!(rest.len(), 2 * size_of::<MonLoaderEntry>());

        let Ok(entries) = <[MonLoaderEntry]>::ref_from_bytes(rest)
        else {
            panic!("entries do not parse");
        };

        assert_eq!(entries[0].content(), Ok(ContentType::AddrSpace));
        assert!(entries[1].bsp_only());
        assert_eq!(MonLoaderEntry::new_zeroed().content(), Err(0));
    }
}
