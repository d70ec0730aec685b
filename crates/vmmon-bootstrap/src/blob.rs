//! VMM blob loader.
//!
//! The blob is the monitor image with the loader header appended. It is
//! copied from user space into locked pages once, validated, and then read
//! by the loader callouts until bootstrap completes.

use vmmon_core::{HostError, HostMemory, Mpn, PAGE_SIZE, UserVa, bytes_to_pages};
use zerocopy::{FromBytes, FromZeros, IntoBytes};

use crate::{BlobError, MonLoaderEntry, MonLoaderHeader};

/// Largest blob accepted.
///
/// Generous enough for monitor images built with coverage instrumentation.
pub const VMM_BLOB_MAX_SIZE: u64 = 64 << 20;

const HEADER_SIZE: u64 = size_of::<MonLoaderHeader>() as u64;
const ENTRY_SIZE: u64 = size_of::<MonLoaderEntry>() as u64;

/// A validated blob held in locked pages.
pub struct VmmBlob {
    bytes: Vec<u8>,
    mpns: Vec<Mpn>,
    header_offset: usize,
    header: MonLoaderHeader,
}

impl VmmBlob {
    /// Copies `size` bytes at `va` into freshly allocated locked pages.
    ///
    /// The loader header is expected at `header_offset`. Nothing is
    /// allocated before the size and offset are checked, and on any failure
    /// every page allocated so far is released.
    pub fn load<H>(host: &H, va: UserVa, size: u64, header_offset: u64) -> Result<Self, BlobError>
    where
        H: HostMemory + ?Sized,
    {
        if let Err(err) = Self::check_bounds(size, header_offset) {
            tracing::warn!(%va, size, header_offset, %err, "rejecting VMM blob");
            return Err(err);
        }

        let mut blob = Self {
            bytes: Vec::new(),
            mpns: Vec::new(),
            header_offset: header_offset as usize,
            header: MonLoaderHeader::new_zeroed(),
        };

        if let Err(err) = blob.populate(host, va, size) {
            tracing::warn!(%va, size, header_offset, %err, "failed to load VMM blob");
            blob.cleanup(host);
            return Err(err);
        }

        tracing::debug!(
            %va,
            size,
            pages = blob.mpns.len(),
            entries = blob.header.count(),
            "loaded VMM blob"
        );

        Ok(blob)
    }

    fn check_bounds(size: u64, header_offset: u64) -> Result<(), BlobError> {
        if size > VMM_BLOB_MAX_SIZE {
            return Err(BlobError::TooLarge {
                size,
                max: VMM_BLOB_MAX_SIZE,
            });
        }

        if header_offset > size {
            return Err(BlobError::BadHeaderOffset {
                offset: header_offset,
                size,
            });
        }

        if size - header_offset < HEADER_SIZE {
            return Err(BlobError::TruncatedHeader {
                offset: header_offset,
                size,
            });
        }

        Ok(())
    }

    fn populate<H>(&mut self, host: &H, va: UserVa, size: u64) -> Result<(), BlobError>
    where
        H: HostMemory + ?Sized,
    {
        let pages = bytes_to_pages(size);
        self.mpns.reserve(pages as usize);

        for _ in 0..pages {
            let mpn = host.alloc_locked_page().map_err(BlobError::Alloc)?;
            self.mpns.push(mpn);
        }

        self.bytes = vec![0; size as usize];
        host.copy_from_user(&mut self.bytes, va)
            .map_err(BlobError::UserCopy)?;

        for (chunk, &mpn) in self.bytes.chunks(PAGE_SIZE as usize).zip(&self.mpns) {
            host.write_phys(mpn.to_ma(), chunk).map_err(BlobError::Host)?;
        }

        // The entry count comes from user-controlled bytes and can only be
        // checked now that they are copied.
        let (header, _) = MonLoaderHeader::read_from_prefix(&self.bytes[self.header_offset..])
            .map_err(|_| BlobError::TruncatedHeader {
                offset: self.header_offset as u64,
                size,
            })?;

        let fits = (size - self.header_offset as u64 - HEADER_SIZE) / ENTRY_SIZE;
        if u64::from(header.count()) > fits {
            return Err(BlobError::EntryTableOverflow {
                count: header.count(),
                fits,
            });
        }

        self.header = header;
        Ok(())
    }

    /// Returns the blob contents.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Returns the blob size in bytes.
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Returns the machine page backing page `page` of the blob.
    pub fn mpn(&self, page: u64) -> Option<Mpn> {
        self.mpns.get(usize::try_from(page).ok()?).copied()
    }

    /// Returns the machine page backing byte `offset` of the blob.
    pub fn mpn_at(&self, offset: u64) -> Option<Mpn> {
        if offset >= self.size() {
            return None;
        }

        self.mpn(offset / PAGE_SIZE)
    }

    /// Returns the machine page holding the start of the header.
    pub fn header_mpn(&self) -> Option<Mpn> {
        self.mpn_at(self.header_offset as u64)
    }

    /// Returns the validated header.
    pub fn header(&self) -> &MonLoaderHeader {
        &self.header
    }

    /// Returns the entry table.
    pub fn entries(&self) -> &[MonLoaderEntry] {
        let start = self.entries_offset();

        <[MonLoaderEntry]>::ref_from_prefix_with_elems(
            &self.bytes[start..],
            self.header.count() as usize,
        )
        .map_or(&[][..], |(entries, _)| entries)
    }

    /// Writes `entries` back over the entry table, so the allocation
    /// counters recorded by the loader are visible in the blob.
    pub fn store_entries<H>(
        &mut self,
        host: &H,
        entries: &[MonLoaderEntry],
    ) -> Result<(), HostError>
    where
        H: HostMemory + ?Sized,
    {
        if entries.len() != self.header.count() as usize {
            return Err(HostError::OutOfBounds);
        }

        let start = self.entries_offset();
        let data = entries.as_bytes();
        self.bytes[start..start + data.len()].copy_from_slice(data);

        // Keep the backing pages in sync, one page at a time.
        let mut offset = start;
        let end = start + data.len();
        while offset < end {
            let page_end = ((offset / PAGE_SIZE as usize) + 1) * PAGE_SIZE as usize;
            let chunk_end = page_end.min(end);
            let mpn = self
                .mpn_at(offset as u64)
                .ok_or(HostError::OutOfBounds)?;

            host.write_phys(
                mpn.to_ma() + offset as u64 % PAGE_SIZE,
                &self.bytes[offset..chunk_end],
            )?;
            offset = chunk_end;
        }

        Ok(())
    }

    /// Copies up to one page from byte `offset` into `mpn`, zero-filling the
    /// rest of the page. Returns the number of bytes copied.
    pub fn copy_to_page<H>(
        &self,
        host: &H,
        offset: u64,
        len: u64,
        mpn: Mpn,
    ) -> Result<u64, HostError>
    where
        H: HostMemory + ?Sized,
    {
        let len = len.min(PAGE_SIZE);
        let end = offset.checked_add(len).ok_or(HostError::OutOfBounds)?;
        if end > self.size() {
            return Err(HostError::OutOfBounds);
        }

        let mut page = [0; PAGE_SIZE as usize];
        page[..len as usize].copy_from_slice(&self.bytes[offset as usize..end as usize]);
        host.write_phys(mpn.to_ma(), &page)?;
        Ok(len)
    }

    /// Releases every backing page.
    pub fn cleanup<H>(self, host: &H)
    where
        H: HostMemory + ?Sized,
    {
        for &mpn in &self.mpns {
            if let Err(err) = host.free_locked_page(mpn) {
                tracing::warn!(%mpn, %err, "failed to free blob page");
            }
        }

        tracing::debug!(pages = self.mpns.len(), "released VMM blob");
    }

    fn entries_offset(&self) -> usize {
        self.header_offset + HEADER_SIZE as usize
    }
}

impl std::fmt::Debug for VmmBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("VmmBlob")
            .field("size", &self.bytes.len())
            .field("pages", &self.mpns.len())
            .field("header_offset", &self.header_offset)
            .finish()
    }
}
