//! # Error kinds
//!
//! Insert outcomes follow the page-table convention: a successful insert may
//! still be a *warning* (the entry already existed, or only its rights were
//! widened). Failures are values the IPC path reports back to the sender.
//! Internal consistency violations are not errors at all; they halt.

use log::error;

/// Successful insert outcomes.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum InsertStatus {
    /// A new entry was installed.
    Ok,
    /// An identical entry was already present.
    WarnExists,
    /// An entry was present; only its rights were widened.
    WarnAttribUpgrade,
}

/// Failed inserts.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, thiserror::Error)]
pub enum InsertError {
    /// Tree array exhausted or the allocator refused to grow it.
    #[error("mapping tree exhausted")]
    NoMem,
    /// A conflicting entry (different size or resource) occupies the slot.
    #[error("conflicting mapping exists")]
    Exists,
    /// The requested size is not a configured class finer than the parent's.
    #[error("unsupported mapping size (shift {0})")]
    Size(u8),
}

/// Map operation failures, as seen by the IPC caller.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, thiserror::Error)]
pub enum MapError {
    #[error("out of memory while mapping")]
    NoMem,
    #[error("receiver slot occupied by a conflicting mapping")]
    Exists,
    #[error("unsupported mapping size (shift {0})")]
    Size(u8),
    #[error("malformed flexpage")]
    InvalidFpage,
}

impl MapError {
    /// IPC error code reported in the message tag.
    pub const IPC_MAP_FAILED: u64 = 0x16;
    pub const IPC_NO_MEM: u64 = 0x0C;

    #[must_use]
    pub const fn ipc_code(self) -> u64 {
        match self {
            Self::NoMem => Self::IPC_NO_MEM,
            Self::Exists | Self::Size(_) | Self::InvalidFpage => Self::IPC_MAP_FAILED,
        }
    }
}

impl From<InsertError> for MapError {
    fn from(value: InsertError) -> Self {
        match value {
            InsertError::NoMem => Self::NoMem,
            InsertError::Exists => Self::Exists,
            InsertError::Size(shift) => Self::Size(shift),
        }
    }
}

/// Rejected [`MapdbConfig`](crate::config::MapdbConfig).
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("no page size classes configured")]
    NoSizeClasses,
    #[error("too many page size classes ({0})")]
    TooManySizeClasses(usize),
    #[error("page size classes must be strictly decreasing")]
    UnorderedSizeClasses,
    #[error("page size class shift {0} out of range")]
    ShiftOutOfRange(u8),
    #[error("tree entry bounds {min}..={max} are invalid")]
    TreeBounds { min: usize, max: usize },
    #[error("resource end {0:#x} is not covered by any physframe")]
    EmptyResource(u64),
}

/// Halt on a broken mapping-database invariant.
///
/// Continuing would hand out memory or capabilities the tree no longer
/// accounts for, so there is no recovery path.
#[cold]
#[track_caller]
pub fn fatal(what: &str) -> ! {
    error!("mapdb: internal inconsistency: {what}");
    panic!("mapdb: internal inconsistency: {what}");
}
