use smallvec::SmallVec;
use vmmon_core::{Ma, Mpn};

use super::{PageTableEntry, PageTableLevel};

/// A single entry in the page table hierarchy visited during a walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationEntry {
    /// The level of the page table hierarchy this entry belongs to.
    pub level: PageTableLevel,

    /// The page table entry itself.
    pub entry: PageTableEntry,

    /// The machine address where this entry is located.
    pub entry_address: Ma,
}

/// Collection of translation entries, root first.
pub type TranslationEntries = SmallVec<[TranslationEntry; 4]>;

/// The result of walking the page tables for one VPN.
#[derive(Debug)]
pub struct VpnTranslation {
    pub(super) entries: TranslationEntries,
    pub(super) mpn: Option<Mpn>,
}

impl VpnTranslation {
    /// Returns the page table entries traversed during the walk.
    pub fn entries(&self) -> &[TranslationEntry] {
        &self.entries
    }

    /// Returns the entry found at `level`, if the walk got that far.
    pub fn entry(&self, level: PageTableLevel) -> Option<&TranslationEntry> {
        self.entries.iter().find(|entry| entry.level == level)
    }

    /// Returns the machine page mapped at the VPN, if the walk reached a
    /// present L1 entry.
    pub fn mpn(&self) -> Option<Mpn> {
        self.mpn
    }

    /// Checks if all entries in the translation path are present.
    pub fn present(&self) -> bool {
        self.entries.iter().all(|entry| entry.entry.present())
    }

    /// Checks if all entries in the translation path are writable.
    pub fn write(&self) -> bool {
        self.entries.iter().all(|entry| entry.entry.write())
    }
}

impl IntoIterator for VpnTranslation {
    type Item = TranslationEntry;
    type IntoIter = <TranslationEntries as IntoIterator>::IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
