//! Three-way classification of one path across local, cache and remote.

use std::fmt;

use crate::manifest::FileEntry;

/// Sync state of a single path.
///
/// The first word names the presence pattern over (local, cache, remote);
/// descriptions live in [`SyncState::describe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum SyncState {
    // 111
    AllEqual,
    RemoteChanged,
    CacheStale,
    LocalChanged,
    Conflict,
    // 110
    LocalOnlyRemoteGone,
    LocalModifiedRemoteGone,
    // 101
    InSyncNoCache,
    ConflictNoCache,
    // 011
    LocalDeletedSafe,
    LocalDeletedRemoteChanged,
    // 100, 010, 001, 000
    LocalOnly,
    CacheOnly,
    RemoteOnly,
    Nonexistent,
}

impl SyncState {
    pub const ALL: [SyncState; 15] = [
        SyncState::AllEqual,
        SyncState::RemoteChanged,
        SyncState::CacheStale,
        SyncState::LocalChanged,
        SyncState::Conflict,
        SyncState::LocalOnlyRemoteGone,
        SyncState::LocalModifiedRemoteGone,
        SyncState::InSyncNoCache,
        SyncState::ConflictNoCache,
        SyncState::LocalDeletedSafe,
        SyncState::LocalDeletedRemoteChanged,
        SyncState::LocalOnly,
        SyncState::CacheOnly,
        SyncState::RemoteOnly,
        SyncState::Nonexistent,
    ];

    /// Position in [`SyncState::ALL`], used to index lookup tables.
    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn describe(self) -> &'static str {
        DESCRIPTIONS[self.index()]
    }

    pub fn is_conflict(self) -> bool {
        matches!(self, SyncState::Conflict | SyncState::ConflictNoCache)
    }
}

const DESCRIPTIONS: [&str; 15] = [
    "in sync everywhere",
    "changed on remote",
    "uploaded the same content elsewhere, cache is stale",
    "changed locally",
    "changed locally and on remote, and both differ from the last sync",
    "deleted on remote, unchanged locally",
    "deleted on remote, but modified locally",
    "identical locally and on remote, never synced",
    "differs between local and remote, never synced",
    "deleted locally, unchanged on remote",
    "deleted locally, but changed on remote",
    "new local file",
    "deleted locally and on remote",
    "new remote file",
    "does not exist",
];

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Classify one path.
///
/// Total over every input: each presence pattern is matched explicitly and
/// within the `111` pattern the equality checks run in a fixed order, the
/// first match winning.
///
/// # Panics
///
/// Panics when local is a regular file strictly older than the cached copy
/// while remote still matches the cache. The cache records what local was
/// last synced to, so local going backwards means the cache file has been
/// tampered with.
///
/// Downloads keep the remote mtime, which another machine stamped with its
/// own clock. An edit made here under a clock behind that machine's can
/// carry an mtime older than the cached one and trip this check too; the
/// way out is to touch the file or fix the clock.
pub fn classify(
    local: Option<&FileEntry>,
    cache: Option<&FileEntry>,
    remote: Option<&FileEntry>,
) -> SyncState {
    match (local, cache, remote) {
        (Some(l), Some(c), Some(r)) => {
            let l_c = l.is_same_as(c);
            let l_r = l.is_same_as(r);
            let c_r = c.is_same_as(r);
            if l_c && l_r && c_r {
                SyncState::AllEqual
            } else if l_c {
                SyncState::RemoteChanged
            } else if l_r {
                SyncState::CacheStale
            } else if c_r {
                if let (Some(local_mtime), Some(cache_mtime)) = (l.mtime(), c.mtime()) {
                    assert!(
                        local_mtime >= cache_mtime,
                        "local copy of {} (mtime {}) is older than the cached copy (mtime {}): \
                         the cache manifest is corrupt",
                        l.path(),
                        local_mtime,
                        cache_mtime
                    );
                }
                SyncState::LocalChanged
            } else {
                SyncState::Conflict
            }
        }
        (Some(l), Some(c), None) => {
            if l.is_same_as(c) {
                SyncState::LocalOnlyRemoteGone
            } else {
                SyncState::LocalModifiedRemoteGone
            }
        }
        (Some(l), None, Some(r)) => {
            if l.is_same_as(r) {
                SyncState::InSyncNoCache
            } else {
                SyncState::ConflictNoCache
            }
        }
        (None, Some(c), Some(r)) => {
            if c.is_same_as(r) {
                SyncState::LocalDeletedSafe
            } else {
                SyncState::LocalDeletedRemoteChanged
            }
        }
        (Some(_), None, None) => SyncState::LocalOnly,
        (None, Some(_), None) => SyncState::CacheOnly,
        (None, None, Some(_)) => SyncState::RemoteOnly,
        (None, None, None) => SyncState::Nonexistent,
    }
}
