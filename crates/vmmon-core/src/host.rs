//! Host collaborator contracts.
//!
//! The bootstrap core never touches host memory directly. Everything it
//! needs from the operating system goes through the two traits defined
//! here:
//!
//! - [`PageAllocator`] hands out zeroed, page-sized kernel objects. The
//!   trackers draw every directory and hash table page from it.
//! - [`HostMemory`] extends it with locked machine pages, physical memory
//!   access and user memory access.

use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes};

use crate::{HostError, Ma, Mpn, PAGE_SIZE, UserVa};

/// Allocator for page-sized kernel objects.
pub trait PageAllocator {
    /// Allocates one zero-initialized object.
    ///
    /// Returns `None` if the host is out of memory.
    fn alloc_page<T>(&self) -> Option<Box<T>>
    where
        T: FromZeros;

    /// Releases an object obtained from [`alloc_page`].
    ///
    /// [`alloc_page`]: Self::alloc_page
    fn free_page<T>(&self, page: Box<T>);
}

impl<A> PageAllocator for &A
where
    A: PageAllocator + ?Sized,
{
    fn alloc_page<T>(&self) -> Option<Box<T>>
    where
        T: FromZeros,
    {
        (**self).alloc_page()
    }

    fn free_page<T>(&self, page: Box<T>) {
        (**self).free_page(page)
    }
}

/// [`PageAllocator`] backed by the global heap.
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelHeap;

impl PageAllocator for KernelHeap {
    fn alloc_page<T>(&self) -> Option<Box<T>>
    where
        T: FromZeros,
    {
        T::new_box_zeroed().ok()
    }

    fn free_page<T>(&self, page: Box<T>) {
        drop(page);
    }
}

/// Memory services of the host operating system.
pub trait HostMemory: PageAllocator {
    /// Allocates one locked machine page.
    fn alloc_locked_page(&self) -> Result<Mpn, HostError>;

    /// Releases a page obtained from [`alloc_locked_page`].
    ///
    /// [`alloc_locked_page`]: Self::alloc_locked_page
    fn free_locked_page(&self, mpn: Mpn) -> Result<(), HostError>;

    /// Reads machine memory. The range must not cross a page boundary.
    fn read_phys(&self, ma: Ma, buffer: &mut [u8]) -> Result<(), HostError>;

    /// Writes machine memory. The range must not cross a page boundary.
    fn write_phys(&self, ma: Ma, data: &[u8]) -> Result<(), HostError>;

    /// Copies `buffer.len()` bytes from user space.
    fn copy_from_user(&self, buffer: &mut [u8], src: UserVa) -> Result<(), HostError>;

    /// Looks up and pins the machine page backing a user address.
    fn lookup_user_mpn(&self, va: UserVa) -> Result<Mpn, HostError>;

    /// Unpins a page returned by [`lookup_user_mpn`].
    ///
    /// [`lookup_user_mpn`]: Self::lookup_user_mpn
    fn release_user_mpn(&self, mpn: Mpn) -> Result<(), HostError>;

    /// Reads a structure from machine memory.
    fn read_struct<T>(&self, ma: Ma) -> Result<T, HostError>
    where
        T: FromBytes + IntoBytes,
    {
        let mut result = T::new_zeroed();
        self.read_phys(ma, result.as_mut_bytes())?;
        Ok(result)
    }

    /// Writes a structure to machine memory.
    fn write_struct<T>(&self, ma: Ma, value: &T) -> Result<(), HostError>
    where
        T: IntoBytes + Immutable,
    {
        self.write_phys(ma, value.as_bytes())
    }

    /// Fills a whole machine page with `pattern`.
    fn fill_page(&self, mpn: Mpn, pattern: u8) -> Result<(), HostError> {
        self.write_phys(mpn.to_ma(), &[pattern; PAGE_SIZE as usize])
    }
}

impl<H> HostMemory for &H
where
    H: HostMemory + ?Sized,
{
    fn alloc_locked_page(&self) -> Result<Mpn, HostError> {
        (**self).alloc_locked_page()
    }

    fn free_locked_page(&self, mpn: Mpn) -> Result<(), HostError> {
        (**self).free_locked_page(mpn)
    }

    fn read_phys(&self, ma: Ma, buffer: &mut [u8]) -> Result<(), HostError> {
        (**self).read_phys(ma, buffer)
    }

    fn write_phys(&self, ma: Ma, data: &[u8]) -> Result<(), HostError> {
        (**self).write_phys(ma, data)
    }

    fn copy_from_user(&self, buffer: &mut [u8], src: UserVa) -> Result<(), HostError> {
        (**self).copy_from_user(buffer, src)
    }

    fn lookup_user_mpn(&self, va: UserVa) -> Result<Mpn, HostError> {
        (**self).lookup_user_mpn(va)
    }

    fn release_user_mpn(&self, mpn: Mpn) -> Result<(), HostError> {
        (**self).release_user_mpn(mpn)
    }

    fn fill_page(&self, mpn: Mpn, pattern: u8) -> Result<(), HostError> {
        (**self).fill_page(mpn, pattern)
    }
}
