pub(crate) mod macros;
mod page;

pub use self::page::{
    Lpn, Ma, Mpn, PAGE_OFFSET_MASK, PAGE_SHIFT, PAGE_SIZE, UserVa, VcpuId, Vpn, bytes_to_pages,
    is_page_aligned,
};
