//! Bootstraps a two-VCPU monitor on the simulated host and prints what
//! every loader entry allocated.
//!
//! Run with `RUST_LOG=trace` to see every callout.

use vmmon::{
    Mpn, PAGE_SIZE, UserVa, VcpuId, Vpn,
    arch::amd64::PteFlags,
    bootstrap::{
        ContentType, MonLoader, MonLoaderEntry, MonLoaderHeaderBuilder, SharedRegion, SourceType,
        Vm,
    },
    host_sim::SimHost,
};

const NUM_VCPUS: u32 = 2;

const BLOB_VA: UserVa = UserVa(0x7f00_0000_0000);
const SHARED_VA: UserVa = UserVa(0x7e00_0000_0000);

const MON_FIRST: Vpn = Vpn(0xf_ffff_f800);
const MON_PAGES: u64 = 0x800;

const TABLE_FLAGS: PteFlags = PteFlags::PRESENT.union(PteFlags::WRITABLE);
const DATA_FLAGS: PteFlags = TABLE_FLAGS.union(PteFlags::NX);
const CODE_FLAGS: PteFlags = PteFlags::PRESENT;

const CODE_SIZE: u64 = 0x3000;
const SHARED_REGION: u64 = 1;

fn monitor_table() -> MonLoaderHeaderBuilder {
    MonLoaderHeaderBuilder::new()
        .code_entry(0x10, MON_FIRST.0 << 12)
        .entry(
            MonLoaderEntry::new(ContentType::AddrSpace, SourceType::None)
                .with_pages(MON_FIRST, MON_PAGES)
                .with_flags(TABLE_FLAGS),
        )
        .entry(
            MonLoaderEntry::new(ContentType::Copy, SourceType::Blob)
                .with_pages(MON_FIRST, 3)
                .with_flags(CODE_FLAGS)
                .with_blob(0, CODE_SIZE),
        )
        .entry(
            MonLoaderEntry::new(ContentType::AllocZero, SourceType::None)
                .with_pages(MON_FIRST + 3, 8)
                .with_flags(DATA_FLAGS),
        )
        .entry(
            MonLoaderEntry::new(ContentType::Share, SourceType::User)
                .with_pages(MON_FIRST + 11, 1)
                .with_flags(DATA_FLAGS)
                .with_sub_index(SHARED_REGION),
        )
        .entry(
            MonLoaderEntry::new(ContentType::AllocZero, SourceType::None)
                .with_pages(MON_FIRST + 12, 4)
                .with_flags(DATA_FLAGS)
                .with_bsp_only(true),
        )
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::Level::DEBUG.into())
                .from_env_lossy(),
        )
        .with_target(false)
        .init();

    let host = SimHost::new();

    // The monitor image is followed by its loader header.
    let mut image = vec![0xcc; CODE_SIZE as usize];
    let header_offset = image.len() as u64;
    image.extend_from_slice(&monitor_table().build());
    host.map_user(BLOB_VA, &image)?;

    // One shared page per VCPU.
    host.map_user(
        SHARED_VA,
        &vec![0; (u64::from(NUM_VCPUS) * PAGE_SIZE) as usize],
    )?;

    let mut vm = Vm::new(&host, NUM_VCPUS)?;
    for vcpu in (0..NUM_VCPUS).map(VcpuId) {
        let space = host.prebuild_address_space(MON_FIRST, MON_PAGES, TABLE_FLAGS)?;
        vm.set_page_root(vcpu, space.root)?;
    }

    vm.load_blob(BLOB_VA, image.len() as u64, header_offset)?;

    let regions = [SharedRegion::new(SHARED_REGION, SHARED_VA, 1).with_per_vcpu(true)];
    vm.bootstrap(&MonLoader::default(), &regions)?;

    if let Some(blob) = vm.blob() {
        for (line, entry) in blob.entries().iter().enumerate() {
            let (Ok(content), Ok(source)) = (entry.content(), entry.source())
            else {
                continue;
            };

            println!(
                "entry {line}: {content:?} from {source:?}, {} pages, {} allocated",
                entry.mon_pages(),
                entry.allocs()
            );
        }
    }

    for vcpu in (0..NUM_VCPUS).map(VcpuId) {
        let code = vm
            .translate(vcpu, MON_FIRST)
            .and_then(|translation| translation.mpn())
            .unwrap_or(Mpn::INVALID);

        println!("{vcpu}: monitor code at {code}");
    }

    println!(
        "locked pages: {}, pinned user pages: {}",
        vm.locked_pages(),
        host.pinned_pages()
    );

    vm.teardown();
    println!(
        "after teardown: {} locked, {} pinned, {} directory pages",
        host.locked_pages(),
        host.pinned_pages(),
        host.directory_pages()
    );

    Ok(())
}
