//! Pinned memory tracker.
//!
//! Keeps the (VPN, MPN) pairs of every page a VM has pinned and answers
//! lookups in either direction. Entries live by value in the leaves of a
//! [`SparseDirectory`] and are addressed by a monotonically increasing slot
//! number, so an entry never moves once stored. Two chained hash tables,
//! one keyed by VPN and one by MPN, link slots together.
//!
//! There is no per-entry removal. The whole tracker is torn down at once
//! with [`MemTracker::cleanup`].
//!
//! Like the physical tracker, this structure does no locking of its own and
//! asserts in debug builds that the owning VM's [`VmLock`] is held.

use std::{num::NonZeroU32, sync::Arc};

use vmmon_core::{Mpn, PAGE_SIZE, PageAllocator, SparseDirectory, VmLock, Vpn};
use zerocopy::FromZeros;

/// Maximum number of pages a single VM may pin.
pub const MEMTRACK_MAX_PAGES: u64 = (119 << 30) / PAGE_SIZE;

/// Number of buckets in each hash table.
pub const MEMTRACK_HASH_BUCKETS: usize = 16384;

/// Number of entries stored in one directory leaf.
pub const ENTRIES_PER_PAGE: usize = PAGE_SIZE as usize / size_of::<MemTrackEntry>();

const BUCKETS_PER_PAGE: usize = PAGE_SIZE as usize / size_of::<Option<NonZeroU32>>();
const HASH_PAGES: usize = MEMTRACK_HASH_BUCKETS / BUCKETS_PER_PAGE;

type EntryPage = [MemTrackEntry; ENTRIES_PER_PAGE];
type HashPage = [Option<NonZeroU32>; BUCKETS_PER_PAGE];

/// A tracked (VPN, MPN) pair.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromZeros)]
pub struct MemTrackEntry {
    /// The virtual page.
    pub vpn: Vpn,

    /// The machine page backing it.
    pub mpn: Mpn,

    vpn_next: Option<NonZeroU32>,
    mpn_next: Option<NonZeroU32>,
}

/// Links are slot numbers plus one, so that zero means "end of chain".
fn link(slot: u64) -> Option<NonZeroU32> {
    NonZeroU32::new(u32::try_from(slot + 1).ok()?)
}

/// A fixed-size chained hash table whose buckets hold the head link.
struct HashTable {
    pages: Vec<Box<HashPage>>,
}

impl HashTable {
    fn new<A>(alloc: &A) -> Option<Self>
    where
        A: PageAllocator,
    {
        let mut pages = Vec::with_capacity(HASH_PAGES);

        for _ in 0..HASH_PAGES {
            match alloc.alloc_page::<HashPage>() {
                Some(page) => pages.push(page),
                None => {
                    Self { pages }.release(alloc);
                    return None;
                }
            }
        }

        Some(Self { pages })
    }

    fn bucket(key: u64) -> (usize, usize) {
        let bucket = (key % MEMTRACK_HASH_BUCKETS as u64) as usize;
        (bucket / BUCKETS_PER_PAGE, bucket % BUCKETS_PER_PAGE)
    }

    fn head(&self, key: u64) -> Option<NonZeroU32> {
        let (page, index) = Self::bucket(key);
        self.pages[page][index]
    }

    fn set_head(&mut self, key: u64, head: Option<NonZeroU32>) {
        let (page, index) = Self::bucket(key);
        self.pages[page][index] = head;
    }

    fn release<A>(self, alloc: &A)
    where
        A: PageAllocator,
    {
        for page in self.pages {
            alloc.free_page(page);
        }
    }
}

/// Bidirectional VPN/MPN index for the pages pinned by one VM.
pub struct MemTracker {
    owner: Arc<VmLock>,
    dir: SparseDirectory<EntryPage>,
    vpn_hash: HashTable,
    mpn_hash: HashTable,
    count: u64,
    max_pages: u64,
}

impl MemTracker {
    /// Creates an empty tracker owned by the VM guarded by `owner`.
    ///
    /// Both hash tables are allocated in full. Returns `None` if that
    /// fails, after releasing whatever was allocated.
    pub fn new<A>(owner: Arc<VmLock>, alloc: &A) -> Option<Self>
    where
        A: PageAllocator,
    {
        let vpn_hash = HashTable::new(alloc)?;
        let mpn_hash = match HashTable::new(alloc) {
            Some(table) => table,
            None => {
                vpn_hash.release(alloc);
                return None;
            }
        };

        Some(Self {
            owner,
            dir: SparseDirectory::new(MEMTRACK_MAX_PAGES.div_ceil(ENTRIES_PER_PAGE as u64)),
            vpn_hash,
            mpn_hash,
            count: 0,
            max_pages: MEMTRACK_MAX_PAGES,
        })
    }

    /// Lowers the number of pages the tracker accepts.
    ///
    /// Values above [`MEMTRACK_MAX_PAGES`] are clamped.
    pub fn with_max_pages(self, max_pages: u64) -> Self {
        Self {
            max_pages: max_pages.min(MEMTRACK_MAX_PAGES),
            ..self
        }
    }

    /// Returns the number of pages the tracker accepts.
    pub fn capacity(&self) -> u64 {
        self.max_pages
    }

    /// Returns the number of tracked entries.
    pub fn len(&self) -> u64 {
        self.count
    }

    /// Returns `true` if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Returns the number of directory and hash table pages in use.
    pub fn pages(&self) -> usize {
        self.dir.pages() + 2 * HASH_PAGES
    }

    /// Records that `vpn` is backed by `mpn`.
    ///
    /// Returns `None` if the tracker is full or a directory page could not
    /// be allocated.
    ///
    /// Tracking a VPN or MPN twice is a caller bug and is caught by debug
    /// assertions.
    pub fn add<A>(&mut self, alloc: &A, vpn: Vpn, mpn: Mpn) -> Option<&MemTrackEntry>
    where
        A: PageAllocator,
    {
        debug_assert!(self.owner.is_held(), "VM lock not held");
        debug_assert!(self.lookup_vpn(vpn).is_none(), "VPN {vpn} already tracked");
        debug_assert!(self.lookup_mpn(mpn).is_none(), "MPN {mpn} already tracked");

        if self.count >= self.max_pages {
            tracing::debug!(%vpn, %mpn, max_pages = self.max_pages, "tracker full");
            return None;
        }

        let slot = self.count;
        let head = link(slot)?;
        let leaf = match self.dir.leaf_or_insert(slot / ENTRIES_PER_PAGE as u64, alloc) {
            Ok(leaf) => leaf,
            Err(err) => {
                tracing::warn!(%vpn, %mpn, %err, "failed to grow tracker");
                return None;
            }
        };

        let entry = &mut leaf[(slot % ENTRIES_PER_PAGE as u64) as usize];
        *entry = MemTrackEntry {
            vpn,
            mpn,
            vpn_next: self.vpn_hash.head(vpn.0),
            mpn_next: self.mpn_hash.head(mpn.0),
        };

        self.vpn_hash.set_head(vpn.0, Some(head));
        self.mpn_hash.set_head(mpn.0, Some(head));
        self.count += 1;

        tracing::trace!(%vpn, %mpn, slot, "tracked");
        Some(entry)
    }

    /// Finds the entry for `vpn`.
    pub fn lookup_vpn(&self, vpn: Vpn) -> Option<&MemTrackEntry> {
        debug_assert!(self.owner.is_held(), "VM lock not held");

        let mut next = self.vpn_hash.head(vpn.0);
        while let Some(link) = next {
            let entry = self.entry(link)?;
            if entry.vpn == vpn {
                return Some(entry);
            }
            next = entry.vpn_next;
        }

        None
    }

    /// Finds the entry for `mpn`.
    pub fn lookup_mpn(&self, mpn: Mpn) -> Option<&MemTrackEntry> {
        debug_assert!(self.owner.is_held(), "VM lock not held");

        let mut next = self.mpn_hash.head(mpn.0);
        while let Some(link) = next {
            let entry = self.entry(link)?;
            if entry.mpn == mpn {
                return Some(entry);
            }
            next = entry.mpn_next;
        }

        None
    }

    /// Iterates over entries in the order they were added.
    pub fn iter(&self) -> impl Iterator<Item = &MemTrackEntry> + '_ {
        (0..self.count).filter_map(|slot| self.slot(slot))
    }

    /// Calls `f` once for every entry in slot order, then frees every page
    /// the tracker owns.
    ///
    /// Returns the number of entries visited.
    pub fn cleanup<A, F>(self, alloc: &A, mut f: F) -> u64
    where
        A: PageAllocator,
        F: FnMut(&MemTrackEntry),
    {
        debug_assert!(self.owner.is_held(), "VM lock not held");

        let mut visited = 0;
        for entry in self.iter() {
            f(entry);
            visited += 1;
        }

        tracing::debug!(entries = visited, pages = self.pages(), "releasing pinned tracker");

        self.dir.release(alloc);
        self.vpn_hash.release(alloc);
        self.mpn_hash.release(alloc);
        visited
    }

    fn entry(&self, link: NonZeroU32) -> Option<&MemTrackEntry> {
        self.slot(u64::from(link.get()) - 1)
    }

    fn slot(&self, slot: u64) -> Option<&MemTrackEntry> {
        if slot >= self.count {
            return None;
        }

        self.dir
            .leaf(slot / ENTRIES_PER_PAGE as u64)
            .map(|leaf| &leaf[(slot % ENTRIES_PER_PAGE as u64) as usize])
    }
}

impl std::fmt::Debug for MemTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("MemTracker")
            .field("count", &self.count)
            .field("max_pages", &self.max_pages)
            .finish_non_exhaustive()
    }
}
