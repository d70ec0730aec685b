//! Sparse, lazily allocated page directory.
//!
//! Both trackers index their storage through the same radix layout. A flat
//! leaf number is split into a top-level index and, unless the `two-level`
//! feature is enabled, a middle-level index:
//!
//! ```text
//!   3-level:  l1[leaf / DIR_ENTRIES] -> middle[leaf % DIR_ENTRIES] -> leaf page
//!   2-level:  l1[leaf]                                              -> leaf page
//! ```
//!
//! The top level is a fixed-size array sized at creation. Middle pages and
//! leaf pages are allocated on first write, one page at a time, and are
//! never moved or freed until the whole directory is released.

use zerocopy::FromZeros;

use crate::{DirectoryError, PAGE_SIZE, PageAllocator};

/// Number of leaf pointers held by one middle-level page.
pub const DIR_ENTRIES: usize = PAGE_SIZE as usize / size_of::<Option<Box<u8>>>();

#[cfg(not(feature = "two-level"))]
type Middle<L> = [Option<Box<L>>; DIR_ENTRIES];

/// A sparse directory of page-sized leaves.
pub struct SparseDirectory<L> {
    #[cfg(not(feature = "two-level"))]
    l1: Box<[Option<Box<Middle<L>>>]>,

    #[cfg(feature = "two-level")]
    l1: Box<[Option<Box<L>>]>,

    max_leaves: u64,
    pages: usize,
}

impl<L> SparseDirectory<L>
where
    L: FromZeros,
{
    /// Number of directory levels, counting the leaf level.
    #[cfg(not(feature = "two-level"))]
    pub const LEVELS: usize = 3;

    /// Number of directory levels, counting the leaf level.
    #[cfg(feature = "two-level")]
    pub const LEVELS: usize = 2;

    /// Creates an empty directory able to hold `max_leaves` leaves.
    pub fn new(max_leaves: u64) -> Self {
        const { assert!(size_of::<L>() <= PAGE_SIZE as usize) };

        #[cfg(not(feature = "two-level"))]
        let l1_entries = max_leaves.div_ceil(DIR_ENTRIES as u64);

        #[cfg(feature = "two-level")]
        let l1_entries = max_leaves;

        Self {
            l1: std::iter::repeat_with(|| None)
                .take(l1_entries as usize)
                .collect(),
            max_leaves,
            pages: 0,
        }
    }

    /// Returns the number of leaves the directory can hold.
    pub fn max_leaves(&self) -> u64 {
        self.max_leaves
    }

    /// Returns the number of middle and leaf pages currently allocated.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Returns the leaf with the given number, if it has been allocated.
    pub fn leaf(&self, leaf: u64) -> Option<&L> {
        if leaf >= self.max_leaves {
            return None;
        }

        let (i1, _i2) = Self::split(leaf);

        #[cfg(not(feature = "two-level"))]
        let slot = self.l1[i1].as_deref()?.get(_i2)?;

        #[cfg(feature = "two-level")]
        let slot = &self.l1[i1];

        slot.as_deref()
    }

    /// Returns the leaf with the given number mutably, if it has been
    /// allocated.
    pub fn leaf_mut(&mut self, leaf: u64) -> Option<&mut L> {
        if leaf >= self.max_leaves {
            return None;
        }

        let (i1, _i2) = Self::split(leaf);

        #[cfg(not(feature = "two-level"))]
        let slot = self.l1[i1].as_deref_mut()?.get_mut(_i2)?;

        #[cfg(feature = "two-level")]
        let slot = &mut self.l1[i1];

        slot.as_deref_mut()
    }

    /// Returns the leaf with the given number, allocating it and any
    /// missing middle page first.
    pub fn leaf_or_insert<A>(&mut self, leaf: u64, alloc: &A) -> Result<&mut L, DirectoryError>
    where
        A: PageAllocator,
    {
        if leaf >= self.max_leaves {
            return Err(DirectoryError::OutOfRange);
        }

        let (i1, _i2) = Self::split(leaf);

        #[cfg(not(feature = "two-level"))]
        {
            let middle = ensure_page(&mut self.l1[i1], alloc, &mut self.pages)?;
            ensure_page(&mut middle[_i2], alloc, &mut self.pages)
        }

        #[cfg(feature = "two-level")]
        {
            ensure_page(&mut self.l1[i1], alloc, &mut self.pages)
        }
    }

    /// Iterates over allocated leaves in ascending order, starting with
    /// leaf number `from`.
    pub fn leaves_from(&self, from: u64) -> impl Iterator<Item = (u64, &L)> + '_ {
        let (s1, _s2) = Self::split(from.min(self.max_leaves));

        #[cfg(not(feature = "two-level"))]
        let leaves = self
            .l1
            .iter()
            .enumerate()
            .skip(s1)
            .filter_map(|(i1, middle)| middle.as_deref().map(|middle| (i1, middle)))
            .flat_map(move |(i1, middle)| {
                let start = if i1 == s1 { _s2 } else { 0 };

                middle
                    .iter()
                    .enumerate()
                    .skip(start)
                    .filter_map(move |(i2, leaf)| {
                        leaf.as_deref().map(|leaf| (Self::join(i1, i2), leaf))
                    })
            });

        #[cfg(feature = "two-level")]
        let leaves = self
            .l1
            .iter()
            .enumerate()
            .skip(s1)
            .filter_map(|(i1, leaf)| leaf.as_deref().map(|leaf| (Self::join(i1, 0), leaf)));

        leaves
    }

    /// Releases every allocated page back to `alloc`.
    pub fn release<A>(self, alloc: &A)
    where
        A: PageAllocator,
    {
        let mut released = 0;

        for top in self.l1.into_vec().into_iter().flatten() {
            #[cfg(not(feature = "two-level"))]
            {
                let mut middle = top;
                for leaf in middle.iter_mut().filter_map(Option::take) {
                    alloc.free_page(leaf);
                    released += 1;
                }
                alloc.free_page(middle);
            }

            #[cfg(feature = "two-level")]
            alloc.free_page(top);

            released += 1;
        }

        debug_assert_eq!(released, self.pages);
        tracing::trace!(pages = released, "released sparse directory");
    }

    #[cfg(not(feature = "two-level"))]
    fn split(leaf: u64) -> (usize, usize) {
        let leaf = leaf as usize;
        (leaf / DIR_ENTRIES, leaf % DIR_ENTRIES)
    }

    #[cfg(feature = "two-level")]
    fn split(leaf: u64) -> (usize, usize) {
        (leaf as usize, 0)
    }

    #[cfg(not(feature = "two-level"))]
    fn join(i1: usize, i2: usize) -> u64 {
        (i1 * DIR_ENTRIES + i2) as u64
    }

    #[cfg(feature = "two-level")]
    fn join(i1: usize, _i2: usize) -> u64 {
        i1 as u64
    }
}

/// Returns the page in `slot`, allocating it first if the slot is empty.
fn ensure_page<'a, T, A>(
    slot: &'a mut Option<Box<T>>,
    alloc: &A,
    pages: &mut usize,
) -> Result<&'a mut T, DirectoryError>
where
    T: FromZeros,
    A: PageAllocator,
{
    match slot {
        Some(page) => Ok(&mut **page),
        None => {
            let page = alloc
                .alloc_page::<T>()
                .ok_or(DirectoryError::OutOfMemory)?;
            *pages += 1;
            Ok(&mut **slot.insert(page))
        }
    }
}
