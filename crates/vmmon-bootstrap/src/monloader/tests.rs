use std::collections::HashMap;

use vmmon_arch_amd64::{Amd64, PT_ENTRIES, PageTableEntry, PageTableLevel, PteFlags};
use vmmon_core::{MAX_VCPUS, Mpn, PAGE_SIZE, VcpuId, Vpn};
use zerocopy::FromZeros as _;

use super::{MonLoader, MonLoaderCallouts, MonLoaderConfig, PageTableMode};
use crate::{
    ContentType, MonLoaderEntry, MonLoaderError, MonLoaderFailure, MonLoaderHeaderBuilder,
    SHARED_REGION_HV_OPTIONAL, SourceType,
};

///////////////////////////////////////////////////////////////////////////////
// Mock Callouts
///////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Init(u32),
    Cleanup,
    AllocMpn(VcpuId),
    GetPte(Mpn, usize, VcpuId),
    MapMpnInPte(Mpn, usize, PteFlags, Mpn, VcpuId),
    ImportPage(Mpn, VcpuId),
    FillPage(Mpn, u8, VcpuId),
    CopyFromBlob(u64, u64, Mpn, VcpuId),
    PageRoot(VcpuId),
    SharedUserPage(u64, u64, VcpuId),
    SharedHostPage(u64, u64, VcpuId),
    BlobMpn(u64, VcpuId),
}

/// Records every callout and keeps one prebuilt address space per VCPU.
struct MockCallouts {
    tables: HashMap<Mpn, Vec<PageTableEntry>>,
    roots: Vec<Mpn>,
    user_regions: HashMap<u64, u64>,
    host_regions: HashMap<u64, u64>,
    blob_size: u64,
    fail_init: bool,
    alloc_limit: Option<usize>,
    allocated: usize,
    next_mpn: u64,
    calls: Vec<Call>,
}

impl MockCallouts {
    fn new(num_vcpus: u32) -> Self {
        let mut mock = Self {
            tables: HashMap::new(),
            roots: Vec::new(),
            user_regions: HashMap::new(),
            host_regions: HashMap::new(),
            blob_size: 0,
            fail_init: false,
            alloc_limit: None,
            allocated: 0,
            next_mpn: 0x10000,
            calls: Vec::new(),
        };

        for vcpu in (0..num_vcpus).map(VcpuId) {
            mock.build_tables(vcpu);
        }

        mock
    }

    fn with_user_region(mut self, sub_index: u64, pages: u64) -> Self {
        self.user_regions.insert(sub_index, pages);
        self
    }

    fn with_host_region(mut self, sub_index: u64, pages: u64) -> Self {
        self.host_regions.insert(sub_index, pages);
        self
    }

    fn with_blob_size(mut self, size: u64) -> Self {
        self.blob_size = size;
        self
    }

    fn with_alloc_limit(mut self, limit: usize) -> Self {
        self.alloc_limit = Some(limit);
        self
    }

    fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    fn table_base(vcpu: VcpuId) -> u64 {
        0x100 + u64::from(vcpu.0) * 0x10
    }

    fn root(vcpu: VcpuId) -> Mpn {
        Mpn(Self::table_base(vcpu))
    }

    fn l3_table(vcpu: VcpuId) -> Mpn {
        Mpn(Self::table_base(vcpu) + 1)
    }

    fn l2_table(vcpu: VcpuId) -> Mpn {
        Mpn(Self::table_base(vcpu) + 2)
    }

    fn l1_table(vcpu: VcpuId, table: u64) -> Mpn {
        Mpn(Self::table_base(vcpu) + 3 + table)
    }

    fn build_tables(&mut self, vcpu: VcpuId) {
        let root = Self::root(vcpu);
        let l3 = Self::l3_table(vcpu);
        let l2 = Self::l2_table(vcpu);

        for table in [root, l3, l2] {
            self.tables.insert(table, vec![PageTableEntry::default(); PT_ENTRIES]);
        }

        self.set_entry(root, Amd64::vpn_index(MON_FIRST, PageTableLevel::L4), l3);
        self.set_entry(l3, Amd64::vpn_index(MON_FIRST, PageTableLevel::L3), l2);

        for table in 0..L1_TABLES {
            let l1 = Self::l1_table(vcpu, table);
            let vpn = MON_FIRST + table * PT_ENTRIES as u64;
            self.tables.insert(l1, vec![PageTableEntry::default(); PT_ENTRIES]);
            self.set_entry(l2, Amd64::vpn_index(vpn, PageTableLevel::L2), l1);
        }

        self.roots.push(root);
    }

    fn set_entry(&mut self, table: Mpn, index: usize, mpn: Mpn) {
        let table = self
            .tables
            .get_mut(&table)
            .unwrap_or_else(|| panic!("no table at {table}"));
        table[index] = PageTableEntry::new(mpn, TABLE_FLAGS);
    }

    /// Unhooks L1 table `table` of `vcpu`, leaving a hole in the address
    /// space.
    fn remove_l1_table(&mut self, vcpu: VcpuId, table: u64) {
        let vpn = MON_FIRST + table * PT_ENTRIES as u64;
        let index = Amd64::vpn_index(vpn, PageTableLevel::L2);
        self.tables.get_mut(&Self::l2_table(vcpu)).unwrap()[index] = PageTableEntry::default();
        self.tables.remove(&Self::l1_table(vcpu, table));
    }

    /// Maps `table` into the address space of `vcpu` at `vpn`.
    fn expose_table(&mut self, vcpu: VcpuId, vpn: Vpn, table: Mpn) {
        let holder = Self::l1_table(vcpu, (vpn - MON_FIRST) / PT_ENTRIES as u64);
        self.set_entry(holder, Amd64::vpn_index(vpn, PageTableLevel::L1), table);
    }

    /// Maps the L1 tables of `vcpu` into its own address space at `vpn`.
    fn expose_l1_tables(&mut self, vcpu: VcpuId, vpn: Vpn) {
        for table in 0..L1_TABLES {
            self.expose_table(vcpu, vpn + table, Self::l1_table(vcpu, table));
        }
    }

    fn translate(&self, vcpu: VcpuId, vpn: Vpn) -> Option<Mpn> {
        let mut table = self.roots[vcpu.0 as usize];

        for level in PageTableLevel::ALL {
            let entry = self.tables.get(&table)?[Amd64::vpn_index(vpn, level)];
            if !entry.present() {
                return None;
            }

            table = entry.mpn();
        }

        Some(table)
    }

    fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.calls.iter().filter(|call| predicate(call)).count()
    }
}

impl MonLoaderCallouts for MockCallouts {
    fn init(&mut self, num_vcpus: u32) -> bool {
        self.calls.push(Call::Init(num_vcpus));
        !self.fail_init
    }

    fn cleanup(&mut self) {
        self.calls.push(Call::Cleanup);
    }

    fn alloc_mpn(&mut self, vcpu: VcpuId) -> Option<Mpn> {
        self.calls.push(Call::AllocMpn(vcpu));

        if self.alloc_limit.is_some_and(|limit| self.allocated >= limit) {
            return None;
        }

        self.allocated += 1;
        self.next_mpn += 1;
        Some(Mpn(self.next_mpn))
    }

    fn get_pte(&mut self, pt: Mpn, index: usize, vcpu: VcpuId) -> Option<PageTableEntry> {
        self.calls.push(Call::GetPte(pt, index, vcpu));
        self.tables.get(&pt).map(|table| table[index])
    }

    fn map_mpn_in_pte(
        &mut self,
        pt: Mpn,
        index: usize,
        flags: PteFlags,
        mpn: Mpn,
        vcpu: VcpuId,
    ) -> bool {
        self.calls
            .push(Call::MapMpnInPte(pt, index, flags, mpn, vcpu));

        match self.tables.get_mut(&pt) {
            Some(table) => {
                table[index] = PageTableEntry::new(mpn, flags);
                true
            }
            None => false,
        }
    }

    fn import_page(&mut self, mpn: Mpn, vcpu: VcpuId) -> bool {
        self.calls.push(Call::ImportPage(mpn, vcpu));
        self.tables.contains_key(&mpn)
    }

    fn fill_page(&mut self, mpn: Mpn, pattern: u8, vcpu: VcpuId) -> bool {
        self.calls.push(Call::FillPage(mpn, pattern, vcpu));
        true
    }

    fn copy_from_blob(&mut self, offset: u64, len: u64, mpn: Mpn, vcpu: VcpuId) -> bool {
        self.calls.push(Call::CopyFromBlob(offset, len, mpn, vcpu));
        offset + len <= self.blob_size
    }

    fn page_root(&mut self, vcpu: VcpuId) -> Option<Mpn> {
        self.calls.push(Call::PageRoot(vcpu));
        self.roots.get(vcpu.0 as usize).copied()
    }

    fn shared_user_page(&mut self, sub_index: u64, page: u64, vcpu: VcpuId) -> Option<Mpn> {
        self.calls
            .push(Call::SharedUserPage(sub_index, page, vcpu));

        let pages = self.user_regions.get(&sub_index).copied()?;
        (page < pages).then(|| Mpn(0x5_0000 + sub_index * 0x100 + page))
    }

    fn shared_host_page(&mut self, sub_index: u64, page: u64, vcpu: VcpuId) -> Option<Mpn> {
        self.calls
            .push(Call::SharedHostPage(sub_index, page, vcpu));

        let pages = self.host_regions.get(&sub_index).copied()?;
        (page < pages).then(|| Mpn(0x6_0000 + sub_index * 0x100 + page))
    }

    fn blob_mpn(&mut self, offset: u64, vcpu: VcpuId) -> Option<Mpn> {
        self.calls.push(Call::BlobMpn(offset, vcpu));
        (offset < self.blob_size).then(|| Mpn(0x7_0000 + offset / PAGE_SIZE))
    }
}

///////////////////////////////////////////////////////////////////////////////
// Test Helpers
///////////////////////////////////////////////////////////////////////////////

/// First page of the monitor address space, on an L2 table boundary.
const MON_FIRST: Vpn = Vpn(0x20_0000);

/// Two L1 tables worth of pages.
const MON_PAGES: u64 = 2 * PT_ENTRIES as u64;
const L1_TABLES: u64 = 2;

const TABLE_FLAGS: PteFlags = PteFlags::PRESENT.union(PteFlags::WRITABLE);
const DATA_FLAGS: PteFlags = TABLE_FLAGS.union(PteFlags::NX);
const CODE_FLAGS: PteFlags = PteFlags::PRESENT;

const BSP: VcpuId = VcpuId::BSP;

fn addr_space() -> MonLoaderEntry {
    MonLoaderEntry::new(ContentType::AddrSpace, SourceType::None)
        .with_pages(MON_FIRST, MON_PAGES)
        .with_flags(TABLE_FLAGS)
}

fn alloc_zero(vpn: Vpn, pages: u64) -> MonLoaderEntry {
    MonLoaderEntry::new(ContentType::AllocZero, SourceType::None)
        .with_pages(vpn, pages)
        .with_flags(DATA_FLAGS)
}

fn copy(vpn: Vpn, pages: u64, offset: u64, size: u64) -> MonLoaderEntry {
    MonLoaderEntry::new(ContentType::Copy, SourceType::Blob)
        .with_pages(vpn, pages)
        .with_flags(CODE_FLAGS)
        .with_blob(offset, size)
}

fn share(source: SourceType, vpn: Vpn, pages: u64, sub_index: u64) -> MonLoaderEntry {
    MonLoaderEntry::new(ContentType::Share, source)
        .with_pages(vpn, pages)
        .with_flags(DATA_FLAGS)
        .with_sub_index(sub_index)
}

fn share_blob(vpn: Vpn, pages: u64, offset: u64, size: u64) -> MonLoaderEntry {
    MonLoaderEntry::new(ContentType::Share, SourceType::Blob)
        .with_pages(vpn, pages)
        .with_flags(CODE_FLAGS)
        .with_blob(offset, size)
}

fn builder(entries: impl IntoIterator<Item = MonLoaderEntry>) -> MonLoaderHeaderBuilder {
    entries
        .into_iter()
        .fold(MonLoaderHeaderBuilder::new(), MonLoaderHeaderBuilder::entry)
}

/// Runs `loader` over the table in `builder`, returning the result and the
/// entries with their allocation counters.
fn run(
    loader: &MonLoader,
    builder: &MonLoaderHeaderBuilder,
    num_vcpus: u32,
    mock: &mut MockCallouts,
) -> (Result<(), MonLoaderFailure>, Vec<MonLoaderEntry>) {
    let header = builder.header();
    let mut entries = builder.entries().to_vec();
    let result = loader.process(&header, &mut entries, num_vcpus, mock);
    (result, entries)
}

fn failed_at(error: MonLoaderError, line: usize, vcpu: VcpuId) -> Result<(), MonLoaderFailure> {
    Err(MonLoaderFailure {
        error,
        line: Some(line),
        vcpu: Some(vcpu),
    })
}

///////////////////////////////////////////////////////////////////////////////
// Tests
///////////////////////////////////////////////////////////////////////////////

#[test]
fn builds_every_vcpu() {
    let table = builder([
        addr_space(),
        alloc_zero(MON_FIRST, 2),
        copy(MON_FIRST + 2, 2, 0x1000, 0x1800),
        share(SourceType::User, MON_FIRST + 4, 1, 1),
        share_blob(MON_FIRST + 8, 2, 0, 0x2000),
    ]);
    let mut mock = MockCallouts::new(2)
        .with_user_region(1, 1)
        .with_blob_size(0x4000);

    let (result, entries) = run(&MonLoader::default(), &table, 2, &mut mock);
    assert_eq!(result, Ok(()));

    assert_eq!(entries[1].allocs(), 4);
    assert_eq!(entries[2].allocs(), 4);
    assert_eq!(entries[3].allocs(), 0);

    for vcpu in [BSP, VcpuId(1)] {
        assert!(mock.translate(vcpu, MON_FIRST).is_some());
        assert!(mock.translate(vcpu, MON_FIRST + 3).is_some());
        assert_eq!(mock.translate(vcpu, MON_FIRST + 4), Some(Mpn(0x5_0100)));
        assert_eq!(mock.translate(vcpu, MON_FIRST + 9), Some(Mpn(0x7_0001)));
        assert_eq!(mock.translate(vcpu, MON_FIRST + 10), None);
    }

    let copies = mock
        .calls
        .iter()
        .filter_map(|call| match call {
            Call::CopyFromBlob(offset, len, _, BSP) => Some((*offset, *len)),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(copies, [(0x1000, 0x1000), (0x2000, 0x800)]);

    assert_eq!(mock.calls.first(), Some(&Call::Init(2)));
    assert_eq!(mock.calls.last(), Some(&Call::Cleanup));
    assert_eq!(mock.count(|call| *call == Call::Cleanup), 1);
}

#[test]
fn identical_runs_issue_identical_callouts() {
    let table = builder([
        addr_space(),
        alloc_zero(MON_FIRST, 3),
        copy(MON_FIRST + 3, 1, 0, 0x200),
        share(SourceType::Host, MON_FIRST + 4, 2, 4),
    ]);

    let mut first = MockCallouts::new(3)
        .with_host_region(4, 2)
        .with_blob_size(0x1000);
    let mut second = MockCallouts::new(3)
        .with_host_region(4, 2)
        .with_blob_size(0x1000);

    let (result1, entries1) = run(&MonLoader::default(), &table, 3, &mut first);
    let (result2, entries2) = run(&MonLoader::default(), &table, 3, &mut second);

    assert_eq!(result1, Ok(()));
    assert_eq!(result1, result2);
    assert_eq!(entries1, entries2);
    assert_eq!(first.calls, second.calls);
}

#[test]
fn bsp_only_entries_skip_other_vcpus() {
    let table = builder([
        addr_space(),
        alloc_zero(MON_FIRST, 3).with_bsp_only(true),
        alloc_zero(MON_FIRST + 3, 1),
    ]);
    let mut mock = MockCallouts::new(3);

    let (result, entries) = run(&MonLoader::default(), &table, 3, &mut mock);
    assert_eq!(result, Ok(()));

    assert_eq!(mock.count(|call| *call == Call::AllocMpn(BSP)), 4);
    assert_eq!(mock.count(|call| *call == Call::AllocMpn(VcpuId(1))), 1);
    assert_eq!(mock.count(|call| *call == Call::AllocMpn(VcpuId(2))), 1);

    assert_eq!(entries[1].allocs(), 3);
    assert_eq!(entries[2].allocs(), 3);
    assert_eq!(mock.translate(VcpuId(1), MON_FIRST), None);
}

#[test]
fn share_stops_at_first_missing_page() {
    let table = builder([addr_space(), share(SourceType::User, MON_FIRST + 16, 4, 2)]);
    let mut mock = MockCallouts::new(1).with_user_region(2, 2);

    let (result, _) = run(&MonLoader::default(), &table, 1, &mut mock);
    assert_eq!(result, Ok(()));

    let pages = mock
        .calls
        .iter()
        .filter_map(|call| match call {
            Call::SharedUserPage(2, page, BSP) => Some(*page),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(pages, [0, 1, 2]);

    assert_eq!(mock.count(|call| matches!(call, Call::MapMpnInPte(..))), 2);
    assert_eq!(mock.translate(BSP, MON_FIRST + 17), Some(Mpn(0x5_0201)));
    assert_eq!(mock.translate(BSP, MON_FIRST + 18), None);
}

#[test]
fn share_without_first_page_fails() {
    let table = builder([addr_space(), share(SourceType::Host, MON_FIRST, 2, 3)]);
    let mut mock = MockCallouts::new(1);

    let (result, _) = run(&MonLoader::default(), &table, 1, &mut mock);
    assert_eq!(result, failed_at(MonLoaderError::Share, 1, BSP));
    assert_eq!(mock.calls.last(), Some(&Call::Cleanup));
}

#[test]
fn optional_region_may_be_absent_on_server_hosts() {
    let table = builder([
        addr_space(),
        share(SourceType::Host, MON_FIRST, 2, SHARED_REGION_HV_OPTIONAL),
    ]);

    let server = MonLoader::new(MonLoaderConfig::default().with_server_class_host(true));
    assert!(server.config().server_class_host());
    assert!(!MonLoader::default().config().server_class_host());

    let mut mock = MockCallouts::new(1);
    let (result, _) = run(&server, &table, 1, &mut mock);
    assert_eq!(result, Ok(()));
    assert_eq!(mock.count(|call| matches!(call, Call::MapMpnInPte(..))), 0);

    let mut mock = MockCallouts::new(1);
    let (result, _) = run(&MonLoader::default(), &table, 1, &mut mock);
    assert_eq!(result, failed_at(MonLoaderError::Share, 1, BSP));
}

#[test]
fn second_addr_space_is_rejected() {
    let table = builder([addr_space(), addr_space()]);
    let mut mock = MockCallouts::new(1);

    let (result, _) = run(&MonLoader::default(), &table, 1, &mut mock);
    assert_eq!(result, failed_at(MonLoaderError::DuplicateAddrSpace, 1, BSP));
}

#[test]
fn blob_share_must_be_aligned_and_read_only() {
    let cases = [
        share_blob(MON_FIRST, 2, 0x800, 0x1000),
        share_blob(MON_FIRST, 2, 0x1000, 0x1800),
        share_blob(MON_FIRST, 2, 0, 0x1000).with_flags(DATA_FLAGS),
    ];

    for entry in cases {
        let table = builder([addr_space(), entry]);
        let mut mock = MockCallouts::new(1).with_blob_size(0x4000);

        let (result, _) = run(&MonLoader::default(), &table, 1, &mut mock);
        assert_eq!(result, failed_at(MonLoaderError::Share, 1, BSP));
        assert_eq!(mock.count(|call| matches!(call, Call::BlobMpn(..))), 0);
        assert_eq!(mock.count(|call| matches!(call, Call::MapMpnInPte(..))), 0);
    }
}

#[test]
fn blob_share_beyond_blob_fails() {
    let table = builder([addr_space(), share_blob(MON_FIRST, 2, 0x1000, 0x2000)]);
    let mut mock = MockCallouts::new(1).with_blob_size(0x2000);

    let (result, _) = run(&MonLoader::default(), &table, 1, &mut mock);
    assert_eq!(result, failed_at(MonLoaderError::Share, 1, BSP));
    assert_eq!(mock.translate(BSP, MON_FIRST), Some(Mpn(0x7_0001)));
}

#[test]
fn page_table_entries_verify_mappings() {
    let pt_vpn = MON_FIRST + (MON_PAGES - L1_TABLES);
    let pt_entry = MonLoaderEntry::new(ContentType::PageTableL1, SourceType::None)
        .with_pages(pt_vpn, L1_TABLES)
        .with_flags(TABLE_FLAGS);

    let table = builder([addr_space(), pt_entry]);
    let mut mock = MockCallouts::new(2);
    mock.expose_l1_tables(BSP, pt_vpn);
    mock.expose_l1_tables(VcpuId(1), pt_vpn);

    let (result, _) = run(&MonLoader::default(), &table, 2, &mut mock);
    assert_eq!(result, Ok(()));
    assert_eq!(mock.count(|call| matches!(call, Call::MapMpnInPte(..))), 0);

    // Not mapped at all.
    let mut mock = MockCallouts::new(1);
    let (result, _) = run(&MonLoader::default(), &table, 1, &mut mock);
    assert_eq!(result, failed_at(MonLoaderError::PtVerify, 1, BSP));

    // Mapped to the wrong table.
    let mut mock = MockCallouts::new(1);
    mock.expose_l1_tables(BSP, pt_vpn);
    mock.expose_table(BSP, pt_vpn + 1, MockCallouts::l1_table(BSP, 0));
    let (result, _) = run(&MonLoader::default(), &table, 1, &mut mock);
    assert_eq!(result, failed_at(MonLoaderError::PtVerify, 1, BSP));
}

#[test]
fn missing_l1_tables_are_not_verified() {
    let pt_vpn = MON_FIRST + 0x10;
    let pt_entry = MonLoaderEntry::new(ContentType::PageTableL1, SourceType::None)
        .with_pages(pt_vpn, L1_TABLES)
        .with_flags(TABLE_FLAGS);

    let table = builder([addr_space(), pt_entry]);
    let mut mock = MockCallouts::new(1);
    mock.remove_l1_table(BSP, 1);
    mock.expose_table(BSP, pt_vpn, MockCallouts::l1_table(BSP, 0));

    let (result, _) = run(&MonLoader::default(), &table, 1, &mut mock);
    assert_eq!(result, Ok(()));

    // Only the present table is looked up.
    let l1 = MockCallouts::l1_table(BSP, 0);
    assert_eq!(mock.count(|call| matches!(call, Call::GetPte(pt, ..) if *pt == l1)), 1);
}

#[test]
fn upper_page_tables_verify_mappings() {
    let pt_vpn = MON_FIRST + 0x20;
    let cases = [
        (ContentType::PageTableL4, MockCallouts::root(BSP)),
        (ContentType::PageTableL3, MockCallouts::l3_table(BSP)),
        (ContentType::PageTableL2, MockCallouts::l2_table(BSP)),
    ];

    for (content, expected) in cases {
        let pt_entry = MonLoaderEntry::new(content, SourceType::None)
            .with_pages(pt_vpn, 1)
            .with_flags(TABLE_FLAGS);
        let table = builder([addr_space(), pt_entry]);

        let mut mock = MockCallouts::new(1);
        mock.expose_table(BSP, pt_vpn, expected);
        let (result, _) = run(&MonLoader::default(), &table, 1, &mut mock);
        assert_eq!(result, Ok(()), "{content:?}");

        // Mapped to a table of another level.
        let mut mock = MockCallouts::new(1);
        mock.expose_table(BSP, pt_vpn, MockCallouts::l1_table(BSP, 0));
        let (result, _) = run(&MonLoader::default(), &table, 1, &mut mock);
        assert_eq!(result, failed_at(MonLoaderError::PtVerify, 1, BSP), "{content:?}");

        // Mapped with other permissions.
        let mut mock = MockCallouts::new(1);
        mock.expose_table(BSP, pt_vpn, expected);
        let (result, _) = run(
            &MonLoader::default(),
            &builder([addr_space(), pt_entry.with_flags(DATA_FLAGS)]),
            1,
            &mut mock,
        );
        assert_eq!(result, failed_at(MonLoaderError::PtVerify, 1, BSP), "{content:?}");
    }
}

#[test]
fn page_table_entry_must_cover_every_table() {
    let pt_entry = MonLoaderEntry::new(ContentType::PageTableL1, SourceType::None)
        .with_pages(MON_FIRST, L1_TABLES + 1)
        .with_flags(TABLE_FLAGS);

    let table = builder([addr_space(), pt_entry]);
    let mut mock = MockCallouts::new(1);

    let (result, _) = run(&MonLoader::default(), &table, 1, &mut mock);
    assert_eq!(result, failed_at(MonLoaderError::PtMapSize, 1, BSP));
}

#[test]
fn entries_need_an_address_space() {
    let pt_entry = MonLoaderEntry::new(ContentType::PageTableL2, SourceType::None)
        .with_pages(MON_FIRST, 1)
        .with_flags(TABLE_FLAGS);

    for entry in [alloc_zero(MON_FIRST, 1), pt_entry] {
        let table = builder([entry, addr_space()]);
        let mut mock = MockCallouts::new(1);

        let (result, _) = run(&MonLoader::default(), &table, 1, &mut mock);
        assert_eq!(result, failed_at(MonLoaderError::NoAddrSpace, 0, BSP));
    }
}

#[test]
fn every_vcpu_needs_an_address_space() {
    let table = builder([addr_space().with_bsp_only(true)]);

    let mut mock = MockCallouts::new(2);
    let (result, _) = run(&MonLoader::default(), &table, 2, &mut mock);
    assert_eq!(
        result,
        Err(MonLoaderFailure {
            error: MonLoaderError::NoAddrSpace,
            line: None,
            vcpu: Some(VcpuId(1)),
        })
    );

    let relaxed = MonLoader::new(MonLoaderConfig::default().with_require_address_space(false));
    let mut mock = MockCallouts::new(2);
    let (result, _) = run(&relaxed, &table, 2, &mut mock);
    assert_eq!(result, Ok(()));
}

#[test]
fn header_is_checked_before_init() {
    let table = builder([addr_space()]);

    let cases = [
        (table.clone().magic(0), 1, MonLoaderError::BadMagic),
        (MonLoaderHeaderBuilder::new(), 1, MonLoaderError::MissingTable),
        (table.clone(), 0, MonLoaderError::Args),
        (table.clone(), MAX_VCPUS + 1, MonLoaderError::Args),
    ];

    for (table, num_vcpus, error) in cases {
        let mut mock = MockCallouts::new(1);
        let (result, _) = run(&MonLoader::default(), &table, num_vcpus, &mut mock);
        assert_eq!(result, Err(MonLoaderFailure::from(error)));
        assert!(mock.calls.is_empty());
    }

    // Fewer entries than the header declares.
    let header = builder([addr_space(), addr_space()]).header();
    let mut entries = [addr_space()];
    let mut mock = MockCallouts::new(1);
    let result = MonLoader::default().process(&header, &mut entries, 1, &mut mock);
    assert_eq!(result, Err(MonLoaderFailure::from(MonLoaderError::Args)));
    assert!(mock.calls.is_empty());
}

#[test]
fn init_failure_skips_cleanup() {
    let table = builder([addr_space()]);
    let mut mock = MockCallouts::new(1).failing_init();

    let (result, _) = run(&MonLoader::default(), &table, 1, &mut mock);
    assert_eq!(result, Err(MonLoaderFailure::from(MonLoaderError::CalloutInit)));
    assert_eq!(mock.calls, [Call::Init(1)]);
}

#[test]
fn invalid_source_types() {
    let cases = [
        MonLoaderEntry::new(ContentType::Copy, SourceType::None).with_pages(MON_FIRST, 1),
        MonLoaderEntry::new(ContentType::AllocZero, SourceType::User).with_pages(MON_FIRST, 1),
        MonLoaderEntry::new(ContentType::Share, SourceType::None).with_pages(MON_FIRST, 1),
    ];

    for entry in cases {
        let table = builder([addr_space(), entry]);
        let mut mock = MockCallouts::new(1);

        let (result, _) = run(&MonLoader::default(), &table, 1, &mut mock);
        assert_eq!(result, failed_at(MonLoaderError::InvalidSource, 1, BSP));
    }
}

#[test]
fn unknown_content_type() {
    let table = builder([addr_space(), MonLoaderEntry::new_zeroed().with_pages(MON_FIRST, 1)]);
    let mut mock = MockCallouts::new(1);

    let (result, _) = run(&MonLoader::default(), &table, 1, &mut mock);
    assert_eq!(result, failed_at(MonLoaderError::InvalidContent, 1, BSP));
}

#[test]
fn sparse_address_space() {
    let table = builder([
        addr_space(),
        alloc_zero(MON_FIRST, 1),
        alloc_zero(MON_FIRST + PT_ENTRIES as u64, 1),
    ]);
    let mut mock = MockCallouts::new(1);
    mock.remove_l1_table(BSP, 1);

    let (result, entries) = run(&MonLoader::default(), &table, 1, &mut mock);
    assert_eq!(result, failed_at(MonLoaderError::Map, 2, BSP));
    assert_eq!(entries[1].allocs(), 1);

    // The page that had nowhere to go was still allocated.
    assert_eq!(entries[2].allocs(), 1);
    assert!(mock.translate(BSP, MON_FIRST).is_some());
}

#[test]
fn mapped_pages_are_not_remapped() {
    let table = builder([addr_space(), alloc_zero(MON_FIRST, 1), alloc_zero(MON_FIRST, 1)]);
    let mut mock = MockCallouts::new(1);

    let (result, _) = run(&MonLoader::default(), &table, 1, &mut mock);
    assert_eq!(result, failed_at(MonLoaderError::AlreadyMapped, 2, BSP));
}

#[test]
fn allocation_failure() {
    let table = builder([addr_space(), alloc_zero(MON_FIRST, 2)]);
    let mut mock = MockCallouts::new(1).with_alloc_limit(1);

    let (result, entries) = run(&MonLoader::default(), &table, 1, &mut mock);
    assert_eq!(result, failed_at(MonLoaderError::Alloc, 1, BSP));
    assert_eq!(entries[1].allocs(), 1);
}

#[test]
fn alloc_zero_sized_by_blob() {
    let bss = MonLoaderEntry::new(ContentType::AllocZero, SourceType::Blob)
        .with_pages(MON_FIRST, 3)
        .with_flags(DATA_FLAGS)
        .with_blob(0, 0x1800);

    let table = builder([addr_space(), bss]);
    let mut mock = MockCallouts::new(1);

    let (result, entries) = run(&MonLoader::default(), &table, 1, &mut mock);
    assert_eq!(result, Ok(()));
    assert_eq!(entries[1].allocs(), 2);
    assert_eq!(mock.count(|call| matches!(call, Call::FillPage(_, 0, BSP))), 2);
    assert_eq!(mock.translate(BSP, MON_FIRST + 2), None);

    let table = builder([addr_space(), bss.with_blob(0, 0x4000)]);
    let mut mock = MockCallouts::new(1);
    let (result, _) = run(&MonLoader::default(), &table, 1, &mut mock);
    assert_eq!(result, failed_at(MonLoaderError::Size, 1, BSP));
}

#[test]
fn import_checks_permissions() {
    let table = builder([addr_space().with_flags(TABLE_FLAGS | PteFlags::USER)]);
    let mut mock = MockCallouts::new(1);

    let (result, _) = run(&MonLoader::default(), &table, 1, &mut mock);
    assert_eq!(result, failed_at(MonLoaderError::PtImport, 0, BSP));
}

#[test]
fn missing_page_root() {
    let table = builder([addr_space()]);
    let mut mock = MockCallouts::new(1);

    let (result, _) = run(&MonLoader::default(), &table, 2, &mut mock);
    assert_eq!(result, failed_at(MonLoaderError::CalloutPageRoot, 0, VcpuId(1)));
}

#[test]
fn address_space_too_large() {
    let table = builder([addr_space().with_pages(MON_FIRST, 33 * PT_ENTRIES as u64)]);
    let mut mock = MockCallouts::new(1);

    let (result, _) = run(&MonLoader::default(), &table, 1, &mut mock);
    assert_eq!(result, failed_at(MonLoaderError::AddrSpaceTooLarge, 0, BSP));
    assert_eq!(mock.count(|call| matches!(call, Call::PageRoot(_))), 0);
}

#[test]
fn size_checks() {
    let cases = [
        (alloc_zero(MON_FIRST, 0), MonLoaderError::Size),
        (alloc_zero(Vpn::MAX, 2), MonLoaderError::Size),
        (alloc_zero(MON_FIRST + MON_PAGES, 1), MonLoaderError::InvalidVpn),
        (copy(MON_FIRST, 1, 0, PAGE_SIZE + 1), MonLoaderError::Size),
        (copy(MON_FIRST, 1, 0, 0), MonLoaderError::Size),
        (copy(MON_FIRST, 1, u64::MAX, 1), MonLoaderError::Size),
    ];

    for (entry, error) in cases {
        let table = builder([addr_space(), entry]);
        let mut mock = MockCallouts::new(1).with_blob_size(0x4000);

        let (result, _) = run(&MonLoader::default(), &table, 1, &mut mock);
        assert_eq!(result, failed_at(error, 1, BSP));
    }
}

#[test]
fn copy_failure() {
    let table = builder([addr_space(), copy(MON_FIRST, 2, 0x1000, 0x2000)]);
    let mut mock = MockCallouts::new(1).with_blob_size(0x2000);

    let (result, entries) = run(&MonLoader::default(), &table, 1, &mut mock);
    assert_eq!(result, failed_at(MonLoaderError::CalloutCopy, 1, BSP));

    // The second page was allocated and mapped before its copy failed.
    assert_eq!(entries[1].allocs(), 2);
    assert_eq!(mock.count(|call| matches!(call, Call::AllocMpn(_))), 2);
}

#[test]
#[should_panic(expected = "not implemented")]
fn create_mode_is_not_implemented() {
    let config = MonLoaderConfig::default().with_page_table_mode(PageTableMode::Create);
    assert_eq!(config.page_table_mode(), PageTableMode::Create);

    let loader = MonLoader::new(config);
    let table = builder([addr_space()]);
    let mut mock = MockCallouts::new(1);

    let _ = run(&loader, &table, 1, &mut mock);
}
