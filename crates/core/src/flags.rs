//! Event flag model
//!
//! Native change notifications carry a 32-bit flag word per record. [`FlagSet`]
//! names the bits we know about and keeps every other bit untouched, so a value
//! read from the facility always round-trips exactly.

use bitflags::bitflags;
use std::fmt;

bitflags! {
    /// Conditions attached to a single change event
    ///
    /// Bit values follow the native facility's published constants.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct FlagSet: u32 {
        /// Events were coalesced; the subtree must be rescanned
        const MUST_SCAN_SUB_DIRS = 0x0000_0001;
        /// Events were dropped in user space
        const USER_DROPPED = 0x0000_0002;
        /// Events were dropped in the kernel
        const KERNEL_DROPPED = 0x0000_0004;
        /// The event id counter wrapped
        const EVENT_IDS_WRAPPED = 0x0000_0008;
        /// Marker: replay of historical events is finished
        const HISTORY_DONE = 0x0000_0010;
        /// A watched root was moved, removed or recreated
        const ROOT_CHANGED = 0x0000_0020;
        const MOUNT = 0x0000_0040;
        const UNMOUNT = 0x0000_0080;
        const ITEM_CREATED = 0x0000_0100;
        const ITEM_REMOVED = 0x0000_0200;
        const ITEM_INODE_META_MOD = 0x0000_0400;
        const ITEM_RENAMED = 0x0000_0800;
        const ITEM_MODIFIED = 0x0000_1000;
        const ITEM_FINDER_INFO_MOD = 0x0000_2000;
        const ITEM_CHANGE_OWNER = 0x0000_4000;
        const ITEM_XATTR_MOD = 0x0000_8000;
        const ITEM_IS_FILE = 0x0001_0000;
        const ITEM_IS_DIR = 0x0002_0000;
        const ITEM_IS_SYMLINK = 0x0004_0000;
        /// The event was caused by the observing process itself
        const OWN_EVENT = 0x0008_0000;
        const ITEM_IS_HARDLINK = 0x0010_0000;
        const ITEM_IS_LAST_HARDLINK = 0x0020_0000;
    }
}

/// Label produced when no bits are set
pub const NO_FLAGS_LABEL: &str = "none";

/// Named bits in decoding order
const LABELS: [(FlagSet, &str); 22] = [
    (FlagSet::MUST_SCAN_SUB_DIRS, "mustScanSubDirs"),
    (FlagSet::USER_DROPPED, "userDropped"),
    (FlagSet::KERNEL_DROPPED, "kernelDropped"),
    (FlagSet::EVENT_IDS_WRAPPED, "eventIDsWrapped"),
    (FlagSet::HISTORY_DONE, "historyDone"),
    (FlagSet::ROOT_CHANGED, "rootChanged"),
    (FlagSet::MOUNT, "mount"),
    (FlagSet::UNMOUNT, "unmount"),
    (FlagSet::ITEM_CHANGE_OWNER, "itemChangeOwner"),
    (FlagSet::ITEM_CREATED, "itemCreated"),
    (FlagSet::ITEM_FINDER_INFO_MOD, "itemFinderInfoMod"),
    (FlagSet::ITEM_INODE_META_MOD, "itemInodeMetaMod"),
    (FlagSet::ITEM_IS_DIR, "itemIsDir"),
    (FlagSet::ITEM_IS_FILE, "itemIsFile"),
    (FlagSet::ITEM_IS_HARDLINK, "itemIsHardlink"),
    (FlagSet::ITEM_IS_LAST_HARDLINK, "itemIsLastHardlink"),
    (FlagSet::ITEM_IS_SYMLINK, "itemIsSymlink"),
    (FlagSet::ITEM_MODIFIED, "itemModified"),
    (FlagSet::ITEM_REMOVED, "itemRemoved"),
    (FlagSet::ITEM_RENAMED, "itemRenamed"),
    (FlagSet::ITEM_XATTR_MOD, "itemXattrMod"),
    (FlagSet::OWN_EVENT, "ownEvent"),
];

impl FlagSet {
    /// The empty set
    pub const NONE: Self = Self::empty();

    /// Wrap a raw flag word, keeping unknown bits
    pub const fn from_raw(raw: u32) -> Self {
        Self::from_bits_retain(raw)
    }

    /// True if every bit of `self` is also set in `other`
    pub fn is_subset(&self, other: Self) -> bool {
        other.contains(*self)
    }

    /// Bits that are set but have no name
    pub fn unknown_bits(&self) -> u32 {
        self.bits() & !Self::all().bits()
    }

    /// Decode into human-readable labels
    ///
    /// Named bits come first in a fixed order, then each unnamed bit on its own
    /// as `unknown(raw: <value>)`. An empty set decodes to `["none"]`.
    pub fn decode(&self) -> Vec<String> {
        if self.is_empty() {
            return vec![NO_FLAGS_LABEL.to_string()];
        }

        let mut labels: Vec<String> = LABELS
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, label)| (*label).to_string())
            .collect();

        let unknown = self.unknown_bits();
        labels.extend(
            (0..u32::BITS)
                .map(|shift| 1u32 << shift)
                .filter(|bit| unknown & bit != 0)
                .map(|bit| format!("unknown(raw: {bit})")),
        );

        labels
    }

    /// Look up a named bit by its label
    pub fn from_label(label: &str) -> Option<Self> {
        if label == NO_FLAGS_LABEL {
            return Some(Self::NONE);
        }
        LABELS
            .iter()
            .find(|(_, name)| *name == label)
            .map(|(flag, _)| *flag)
    }

    /// Re-encode the named labels produced by [`FlagSet::decode`]
    ///
    /// Unknown labels are skipped; they carry no name to map back from.
    pub fn from_labels<'a>(labels: impl IntoIterator<Item = &'a str>) -> Self {
        labels
            .into_iter()
            .filter_map(Self::from_label)
            .fold(Self::NONE, Self::union)
    }
}

impl From<u32> for FlagSet {
    fn from(raw: u32) -> Self {
        Self::from_raw(raw)
    }
}

impl From<FlagSet> for u32 {
    fn from(flags: FlagSet) -> Self {
        flags.bits()
    }
}

impl fmt::Display for FlagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.decode().join(", "))
    }
}
