//! Change event types
//!
//! [`RawEvent`] is what the native facility hands over; [`EventRecord`] is the
//! decoded, immutable value every consumer receives.

use fsobserver_core::FlagSet;
use std::fmt;
use std::path::{Path, PathBuf};

/// One undecoded record from the native facility
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    /// Absolute path the event refers to
    pub path: PathBuf,
    /// Raw flag word
    pub flags: u32,
    /// Facility-assigned event id
    pub id: u64,
}

impl RawEvent {
    /// Create a raw record
    pub fn new(path: impl Into<PathBuf>, flags: impl Into<u32>, id: u64) -> Self {
        Self {
            path: path.into(),
            flags: flags.into(),
            id,
        }
    }
}

/// A decoded filesystem change event
///
/// Ids strictly increase within one native subscription but are not
/// continuous and may wrap (see [`FlagSet::EVENT_IDS_WRAPPED`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventRecord {
    path: PathBuf,
    flags: FlagSet,
    id: u64,
}

impl EventRecord {
    pub(crate) fn decode(raw: RawEvent) -> Self {
        Self {
            path: raw.path,
            flags: FlagSet::from_raw(raw.flags),
            id: raw.id,
        }
    }

    /// Path the event refers to
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Conditions attached to the event
    pub fn flags(&self) -> FlagSet {
        self.flags
    }

    /// Facility-assigned event id
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_dir(&self) -> bool {
        self.flags.contains(FlagSet::ITEM_IS_DIR)
    }

    pub fn is_file(&self) -> bool {
        self.flags.contains(FlagSet::ITEM_IS_FILE)
    }

    pub fn is_symlink(&self) -> bool {
        self.flags.contains(FlagSet::ITEM_IS_SYMLINK)
    }

    /// True when the facility coalesced or dropped events below this path
    pub fn needs_rescan(&self) -> bool {
        self.flags.intersects(
            FlagSet::MUST_SCAN_SUB_DIRS | FlagSet::USER_DROPPED | FlagSet::KERNEL_DROPPED,
        )
    }

    /// True for the marker ending historical replay
    pub fn is_history_done(&self) -> bool {
        self.flags.contains(FlagSet::HISTORY_DONE)
    }
}

impl fmt::Display for EventRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} ({})", self.id, self.path.display(), self.flags)
    }
}
