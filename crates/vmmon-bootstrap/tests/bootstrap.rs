use vmmon_arch_amd64::{PageTableLevel, PteFlags};
use vmmon_bootstrap::{
    BootstrapError, ContentType, MonLoader, MonLoaderEntry, MonLoaderError, MonLoaderFailure,
    MonLoaderHeaderBuilder, SharedRegion, SourceType, Vm,
};
use vmmon_core::{HostError, Mpn, PAGE_SIZE, UserVa, VcpuId, Vpn};
use vmmon_host_sim::{FrameKind, SimHost};

const BLOB_VA: UserVa = UserVa(0x7f00_0000_0000);
const SHARED_VA: UserVa = UserVa(0x7e00_0000_0000);

/// Last 8MB below the canonical limit.
const MON_FIRST: Vpn = Vpn(0xf_ffff_f800);
const MON_PAGES: u64 = 0x800;

const TABLE_FLAGS: PteFlags = PteFlags::PRESENT.union(PteFlags::WRITABLE);
const DATA_FLAGS: PteFlags = TABLE_FLAGS.union(PteFlags::NX);
const CODE_FLAGS: PteFlags = PteFlags::PRESENT;

const CODE_SIZE: u64 = 0x2000;
const DATA_SIZE: u64 = 0x1800;

const USER_REGION: u64 = 1;
const HOST_REGION: u64 = 2;

fn entry(content: ContentType, source: SourceType, vpn: Vpn, pages: u64) -> MonLoaderEntry {
    MonLoaderEntry::new(content, source).with_pages(vpn, pages)
}

fn monitor_table() -> MonLoaderHeaderBuilder {
    MonLoaderHeaderBuilder::new()
        .code_entry(0x10, MON_FIRST.0 << 12)
        .entry(
            entry(ContentType::AddrSpace, SourceType::None, MON_FIRST, MON_PAGES)
                .with_flags(TABLE_FLAGS),
        )
        .entry(
            entry(ContentType::Copy, SourceType::Blob, MON_FIRST, 2)
                .with_flags(CODE_FLAGS)
                .with_blob(0, CODE_SIZE),
        )
        .entry(
            entry(ContentType::Copy, SourceType::Blob, MON_FIRST + 2, 2)
                .with_flags(DATA_FLAGS)
                .with_blob(CODE_SIZE, DATA_SIZE),
        )
        .entry(
            entry(ContentType::AllocZero, SourceType::None, MON_FIRST + 4, 4)
                .with_flags(DATA_FLAGS),
        )
        .entry(
            entry(ContentType::Share, SourceType::User, MON_FIRST + 8, 2)
                .with_flags(DATA_FLAGS)
                .with_sub_index(USER_REGION),
        )
        .entry(
            entry(ContentType::Share, SourceType::Host, MON_FIRST + 10, 1)
                .with_flags(DATA_FLAGS)
                .with_sub_index(HOST_REGION),
        )
        .entry(
            entry(ContentType::Share, SourceType::Blob, MON_FIRST + 12, 2)
                .with_flags(CODE_FLAGS)
                .with_blob(0, CODE_SIZE),
        )
        .entry(
            entry(ContentType::AllocZero, SourceType::None, MON_FIRST + 16, 1)
                .with_flags(DATA_FLAGS)
                .with_bsp_only(true),
        )
}

/// Maps the monitor image followed by `table` at [`BLOB_VA`]. Returns the
/// blob size and header offset.
fn map_blob(host: &SimHost, table: &MonLoaderHeaderBuilder) -> Result<(u64, u64), HostError> {
    let mut bytes = vec![0x90; CODE_SIZE as usize];
    bytes.extend(std::iter::repeat_n(0xaa, DATA_SIZE as usize));
    let header_offset = bytes.len() as u64;
    bytes.extend_from_slice(&table.build());

    host.map_user(BLOB_VA, &bytes)?;
    Ok((bytes.len() as u64, header_offset))
}

/// Creates a VM whose VCPUs each have prebuilt monitor page tables, a
/// private user region and one host-shared page.
fn prepare(host: &SimHost, num_vcpus: u32) -> Result<Vm<&SimHost>, BootstrapError> {
    let mut vm = Vm::new(host, num_vcpus)?;

    for vcpu in (0..num_vcpus).map(VcpuId) {
        let space = host.prebuild_address_space(MON_FIRST, MON_PAGES, TABLE_FLAGS)?;
        vm.set_page_root(vcpu, space.root)?;
    }

    host.map_user(SHARED_VA, &vec![0x55; (u64::from(num_vcpus) * 2 * PAGE_SIZE) as usize])?;
    vm.register_host_shared_pages(HOST_REGION, vec![host.alloc_host_page()]);
    Ok(vm)
}

fn regions() -> [SharedRegion; 1] {
    [SharedRegion::new(USER_REGION, SHARED_VA, 2).with_per_vcpu(true)]
}

fn mapped(vm: &Vm<&SimHost>, vcpu: VcpuId, vpn: Vpn) -> Option<Mpn> {
    vm.translate(vcpu, vpn)
        .and_then(|translation| translation.mpn())
}

#[test]
fn bootstrap_and_teardown() -> Result<(), BootstrapError> {
    let host = SimHost::new();
    let mut vm = prepare(&host, 2)?;
    let (size, header_offset) = map_blob(&host, &monitor_table())?;
    vm.load_blob(BLOB_VA, size, header_offset)?;

    vm.bootstrap(&MonLoader::default(), &regions())?;

    // Per VCPU: 2 code, 2 data, 4 zeroed. The BSP gets one more.
    assert_eq!(vm.locked_pages(), 17);

    let Some(blob) = vm.blob()
    else {
        panic!("blob released after success");
    };
    let blob_pages = size.div_ceil(PAGE_SIZE) as usize;
    assert_eq!(host.locked_pages(), 17 + blob_pages);

    let allocs = blob
        .entries()
        .iter()
        .map(MonLoaderEntry::allocs)
        .collect::<Vec<_>>();
    assert_eq!(allocs, [0, 4, 4, 8, 0, 0, 0, 1]);
    let blob_first = blob.mpn(0);

    for vcpu in [VcpuId(0), VcpuId(1)] {
        let code = mapped(&vm, vcpu, MON_FIRST).ok_or(HostError::OutOfBounds)?;
        assert_eq!(host.frame_kind(code), Some(FrameKind::Locked));
        assert_eq!(host.page(code)?[0], 0x90);

        let data = mapped(&vm, vcpu, MON_FIRST + 3).ok_or(HostError::OutOfBounds)?;
        let page = host.page(data)?;
        assert!(page[..0x800].iter().all(|&byte| byte == 0xaa));
        assert!(page[0x800..].iter().all(|&byte| byte == 0));

        let shared = mapped(&vm, vcpu, MON_FIRST + 9).ok_or(HostError::OutOfBounds)?;
        assert_eq!(host.frame_kind(shared), Some(FrameKind::User));
        assert!(vm.is_claimed(shared));

        let host_page = mapped(&vm, vcpu, MON_FIRST + 10).ok_or(HostError::OutOfBounds)?;
        assert_eq!(host.frame_kind(host_page), Some(FrameKind::Host));
        assert!(!vm.is_claimed(host_page));

        assert_eq!(mapped(&vm, vcpu, MON_FIRST + 12), blob_first);
        assert_eq!(mapped(&vm, vcpu, MON_FIRST + 14), None);

        let Some(translation) = vm.translate(vcpu, MON_FIRST + 4)
        else {
            panic!("no page root for {vcpu}");
        };
        let Some(leaf) = translation.entry(PageTableLevel::L1)
        else {
            panic!("walk stopped early for {vcpu}");
        };
        assert!(leaf.entry.permissions_match(DATA_FLAGS));
    }

    assert!(mapped(&vm, VcpuId(0), MON_FIRST + 16).is_some());
    assert_eq!(mapped(&vm, VcpuId(1), MON_FIRST + 16), None);

    // Each VCPU pinned its own two user pages.
    assert_eq!(host.pinned_pages(), 4);

    vm.teardown();
    assert_eq!(host.locked_pages(), 0);
    assert_eq!(host.pinned_pages(), 0);
    assert_eq!(host.directory_pages(), 0);
    Ok(())
}

#[test]
fn failure_discards_blob() -> Result<(), BootstrapError> {
    let host = SimHost::new();
    let mut vm = prepare(&host, 2)?;
    let (size, header_offset) = map_blob(&host, &monitor_table())?;
    vm.load_blob(BLOB_VA, size, header_offset)?;

    // No user region: the share at line 4 has nothing to map.
    let result = vm.bootstrap(&MonLoader::default(), &[]);
    assert_eq!(
        result,
        Err(BootstrapError::MonLoader(MonLoaderFailure {
            error: MonLoaderError::Share,
            line: Some(4),
            vcpu: Some(VcpuId(0)),
        }))
    );

    assert!(vm.blob().is_none());
    assert_eq!(vm.locked_pages(), 8);
    assert_eq!(host.locked_pages(), 8);

    vm.teardown();
    assert_eq!(host.locked_pages(), 0);
    assert_eq!(host.directory_pages(), 0);
    Ok(())
}

#[test]
fn locked_page_limit() -> Result<(), BootstrapError> {
    let host = SimHost::new();
    let mut vm = prepare(&host, 1)?.with_max_locked_pages(5);
    let (size, header_offset) = map_blob(&host, &monitor_table())?;
    vm.load_blob(BLOB_VA, size, header_offset)?;

    let result = vm.bootstrap(&MonLoader::default(), &regions());
    assert_eq!(
        result,
        Err(BootstrapError::MonLoader(MonLoaderFailure {
            error: MonLoaderError::Alloc,
            line: Some(3),
            vcpu: Some(VcpuId(0)),
        }))
    );
    assert_eq!(vm.locked_pages(), 5);

    vm.teardown();
    assert_eq!(host.locked_pages(), 0);
    assert_eq!(host.directory_pages(), 0);
    Ok(())
}

#[test]
fn missing_page_root() -> Result<(), BootstrapError> {
    let host = SimHost::new();
    let mut vm = Vm::new(&host, 1)?;
    let (size, header_offset) = map_blob(&host, &monitor_table())?;
    vm.load_blob(BLOB_VA, size, header_offset)?;

    let result = vm.bootstrap(&MonLoader::default(), &regions());
    assert!(matches!(
        result,
        Err(BootstrapError::MonLoader(MonLoaderFailure {
            error: MonLoaderError::CalloutPageRoot,
            ..
        }))
    ));

    vm.teardown();
    assert_eq!(host.locked_pages(), 0);
    Ok(())
}

#[test]
fn blob_lifecycle() -> Result<(), BootstrapError> {
    let host = SimHost::new();
    let mut vm = Vm::new(&host, 1)?;

    assert_eq!(
        vm.bootstrap(&MonLoader::default(), &[]),
        Err(BootstrapError::NoBlob)
    );
    assert!(!vm.release_blob());

    let (size, header_offset) = map_blob(&host, &monitor_table())?;
    vm.load_blob(BLOB_VA, size, header_offset)?;
    assert_eq!(
        vm.load_blob(BLOB_VA, size, header_offset),
        Err(BootstrapError::BlobLoaded)
    );

    assert!(vm.release_blob());
    assert_eq!(host.locked_pages(), 0);

    vm.teardown();
    Ok(())
}

#[test]
fn locked_pages_are_tracked() -> Result<(), BootstrapError> {
    let host = SimHost::new();
    let mut vm = Vm::new(&host, 1)?;

    let first = vm.alloc_locked_page()?;
    let second = vm.alloc_locked_page()?;
    assert_eq!(vm.locked_page(Vpn(0)), Some(first));
    assert_eq!(vm.locked_page(Vpn(1)), Some(second));
    assert!(vm.is_claimed(first));
    assert_eq!(vm.locked_pages(), 2);

    vm.teardown();
    assert_eq!(host.locked_pages(), 0);
    assert_eq!(host.directory_pages(), 0);
    Ok(())
}

#[test]
fn vm_arguments() -> Result<(), BootstrapError> {
    let host = SimHost::new();

    assert!(matches!(
        Vm::new(&host, 0),
        Err(BootstrapError::InvalidVcpuCount(0))
    ));

    let mut vm = Vm::new(&host, 2)?;
    assert_eq!(
        vm.set_page_root(VcpuId(2), Mpn(0x1234)),
        Err(BootstrapError::InvalidVcpu(VcpuId(2)))
    );
    assert!(vm.translate(VcpuId(0), MON_FIRST).is_none());

    vm.teardown();
    assert_eq!(host.directory_pages(), 0);
    Ok(())
}
