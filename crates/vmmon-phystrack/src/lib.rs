//! Physical page usage tracker.
//!
//! Records, one bit per machine page, which host frames a VM currently
//! claims. Bitmap pages are allocated lazily through a
//! [`SparseDirectory`], so a VM that touches a few scattered frames costs
//! a few pages of bookkeeping no matter how large host memory is.
//!
//! The tracker does no locking. Every mutation must happen with the owning
//! VM's [`VmLock`] held, which debug builds assert.

use std::sync::Arc;

use vmmon_core::{DirectoryError, Mpn, PAGE_SIZE, PageAllocator, SparseDirectory, VmLock};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Number of machine pages covered by one bitmap page.
pub const BITS_PER_BITMAP: u64 = PAGE_SIZE * 8;

const WORDS_PER_BITMAP: usize = (BITS_PER_BITMAP / u64::BITS as u64) as usize;

/// Number of bitmap pages needed to cover every valid MPN.
const MAX_BITMAPS: u64 = (Mpn::MAX.0 + 1) / BITS_PER_BITMAP;

/// One page of claim bits.
#[repr(transparent)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
struct PhysTrackBitmap([u64; WORDS_PER_BITMAP]);

impl PhysTrackBitmap {
    /// Returns the index of the first set bit at or after `from`.
    fn next_set(&self, from: u64) -> Option<u64> {
        let first_word = (from / u64::BITS as u64) as usize;
        let first_mask = u64::MAX << (from % u64::BITS as u64);

        self.0
            .iter()
            .enumerate()
            .skip(first_word)
            .find_map(|(index, &word)| {
                let word = if index == first_word {
                    word & first_mask
                }
                else {
                    word
                };

                (word != 0)
                    .then(|| index as u64 * u64::BITS as u64 + word.trailing_zeros() as u64)
            })
    }
}

/// Tracks which machine pages are claimed by one VM.
pub struct PhysTracker {
    owner: Arc<VmLock>,
    dir: SparseDirectory<PhysTrackBitmap>,
}

impl PhysTracker {
    /// Creates an empty tracker owned by the VM guarded by `owner`.
    pub fn new(owner: Arc<VmLock>) -> Self {
        Self {
            owner,
            dir: SparseDirectory::new(MAX_BITMAPS),
        }
    }

    /// Marks `mpn` as claimed.
    ///
    /// Fails only if a bitmap page could not be allocated.
    ///
    /// # Panics
    ///
    /// Panics if `mpn` is beyond [`Mpn::MAX`] or already claimed.
    pub fn add<A>(&mut self, alloc: &A, mpn: Mpn) -> Result<(), DirectoryError>
    where
        A: PageAllocator,
    {
        debug_assert!(self.owner.is_held(), "VM lock not held");
        assert!(mpn <= Mpn::MAX, "MPN {mpn} beyond tracked range");

        let (leaf, word, mask) = Self::split(mpn);
        let bitmap = self.dir.leaf_or_insert(leaf, alloc)?;

        assert!(bitmap.0[word] & mask == 0, "MPN {mpn} already tracked");
        bitmap.0[word] |= mask;

        tracing::trace!(%mpn, "claimed");
        Ok(())
    }

    /// Clears the claim on `mpn`.
    ///
    /// # Panics
    ///
    /// Panics if `mpn` is not claimed.
    pub fn remove(&mut self, mpn: Mpn) {
        debug_assert!(self.owner.is_held(), "VM lock not held");
        assert!(mpn <= Mpn::MAX, "MPN {mpn} beyond tracked range");

        let (leaf, word, mask) = Self::split(mpn);
        let bitmap = match self.dir.leaf_mut(leaf) {
            Some(bitmap) => bitmap,
            None => panic!("MPN {mpn} not tracked"),
        };

        assert!(bitmap.0[word] & mask != 0, "MPN {mpn} not tracked");
        bitmap.0[word] &= !mask;

        tracing::trace!(%mpn, "released");
    }

    /// Returns `true` if `mpn` is claimed.
    ///
    /// Out-of-range MPNs are never claimed.
    pub fn test(&self, mpn: Mpn) -> bool {
        if mpn > Mpn::MAX {
            return false;
        }

        let (leaf, word, mask) = Self::split(mpn);
        self.dir
            .leaf(leaf)
            .is_some_and(|bitmap| bitmap.0[word] & mask != 0)
    }

    /// Returns the lowest claimed MPN above `after`, or [`Mpn::INVALID`]
    /// when there is none.
    ///
    /// Passing [`Mpn::INVALID`] starts from the bottom.
    pub fn get_next(&self, after: Mpn) -> Mpn {
        let start = if after.is_valid() { after.0 + 1 } else { 0 };

        if start > Mpn::MAX.0 {
            return Mpn::INVALID;
        }

        let start_leaf = start / BITS_PER_BITMAP;

        for (leaf, bitmap) in self.dir.leaves_from(start_leaf) {
            let from = if leaf == start_leaf {
                start % BITS_PER_BITMAP
            }
            else {
                0
            };

            if let Some(bit) = bitmap.next_set(from) {
                return Mpn(leaf * BITS_PER_BITMAP + bit);
            }
        }

        Mpn::INVALID
    }

    /// Iterates over claimed MPNs in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = Mpn> + '_ {
        let first = self.get_next(Mpn::INVALID);

        std::iter::successors(first.is_valid().then_some(first), move |&mpn| {
            let next = self.get_next(mpn);
            next.is_valid().then_some(next)
        })
    }

    /// Returns the number of claimed MPNs.
    pub fn count(&self) -> u64 {
        self.iter().count() as u64
    }

    /// Returns the number of directory and bitmap pages in use.
    pub fn pages(&self) -> usize {
        self.dir.pages()
    }

    /// Frees every directory page.
    ///
    /// # Panics
    ///
    /// Panics if any MPN is still claimed. Claims must be removed one by
    /// one before the tracker goes away.
    pub fn destroy<A>(self, alloc: &A)
    where
        A: PageAllocator,
    {
        if let Some(mpn) = self.iter().next() {
            panic!("physical tracker destroyed with MPN {mpn} still claimed");
        }

        tracing::debug!(pages = self.dir.pages(), "destroying physical tracker");
        self.dir.release(alloc);
    }

    fn split(mpn: Mpn) -> (u64, usize, u64) {
        let leaf = mpn.0 / BITS_PER_BITMAP;
        let bit = mpn.0 % BITS_PER_BITMAP;

        (
            leaf,
            (bit / u64::BITS as u64) as usize,
            1 << (bit % u64::BITS as u64),
        )
    }
}

impl std::fmt::Debug for PhysTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PhysTracker")
            .field("pages", &self.dir.pages())
            .finish_non_exhaustive()
    }
}
