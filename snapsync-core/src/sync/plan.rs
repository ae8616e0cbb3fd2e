//! Turning classifications into actions.
//!
//! The state → action mapping is a single table indexed by
//! [`SyncState::index`]; conflict resolutions override individual items.

use std::collections::BTreeSet;
use std::fmt;

use super::conflict::{self, ConflictCase, ConflictError, Resolution, ResolutionMap};
use super::state::{classify, SyncState};
use crate::manifest::{FileEntry, Manifest};
use crate::utils::errors::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncAction {
    Upload,
    Download,
    DeleteLocal,
    DeleteRemote,
    Conflict,
    NoOp,
    /// Bring back the cached version on both sides.
    Restore,
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncAction::Upload => "upload",
            SyncAction::Download => "download",
            SyncAction::DeleteLocal => "delete local",
            SyncAction::DeleteRemote => "delete remote",
            SyncAction::Conflict => "conflict",
            SyncAction::NoOp => "no-op",
            SyncAction::Restore => "restore",
        };
        f.write_str(name)
    }
}

const ACTIONS: [SyncAction; 15] = [
    SyncAction::NoOp,         // AllEqual
    SyncAction::Download,     // RemoteChanged
    SyncAction::NoOp,         // CacheStale
    SyncAction::Upload,       // LocalChanged
    SyncAction::Conflict,     // Conflict
    SyncAction::DeleteLocal,  // LocalOnlyRemoteGone
    SyncAction::Upload,       // LocalModifiedRemoteGone
    SyncAction::NoOp,         // InSyncNoCache
    SyncAction::Conflict,     // ConflictNoCache
    SyncAction::DeleteRemote, // LocalDeletedSafe
    SyncAction::Download,     // LocalDeletedRemoteChanged
    SyncAction::Upload,       // LocalOnly
    SyncAction::NoOp,         // CacheOnly
    SyncAction::Download,     // RemoteOnly
    SyncAction::NoOp,         // Nonexistent
];

pub fn action_for(state: SyncState) -> SyncAction {
    ACTIONS[state.index()]
}

#[derive(Debug, Clone)]
pub struct PlanItem {
    pub path: String,
    pub state: SyncState,
    pub action: SyncAction,
    /// Set when a conflict was decided through the resolution file
    pub resolution: Option<Resolution>,
}

/// Per-path actions for one sync pass, in path order.
#[derive(Debug, Clone, Default)]
pub struct SyncPlan {
    pub items: Vec<PlanItem>,
}

impl SyncPlan {
    /// Classify every path present in any of the three manifests.
    pub fn build(local: &Manifest, cache: &Manifest, remote: &Manifest) -> Self {
        let paths: BTreeSet<&str> = local
            .paths()
            .chain(cache.paths())
            .chain(remote.paths())
            .collect();

        let items = paths
            .into_iter()
            .map(|path| {
                let state = classify(local.get(path), cache.get(path), remote.get(path));
                PlanItem {
                    path: path.to_string(),
                    state,
                    action: action_for(state),
                    resolution: None,
                }
            })
            .collect();

        Self { items }
    }

    pub fn with_action(&self, action: SyncAction) -> impl Iterator<Item = &PlanItem> {
        self.items.iter().filter(move |item| item.action == action)
    }

    pub fn conflicts(&self) -> impl Iterator<Item = &PlanItem> {
        self.with_action(SyncAction::Conflict)
    }

    pub fn has_conflicts(&self) -> bool {
        self.conflicts().next().is_some()
    }

    /// Nothing to transfer or delete.
    pub fn is_noop(&self) -> bool {
        self.items.iter().all(|item| item.action == SyncAction::NoOp)
    }

    pub fn conflict_cases(
        &self,
        local: &Manifest,
        cache: &Manifest,
        remote: &Manifest,
    ) -> Vec<ConflictCase> {
        self.conflicts()
            .map(|item| ConflictCase::from_manifests(&item.path, item.state, local, cache, remote))
            .collect()
    }

    /// Replace conflict actions with the user's choices.
    ///
    /// Every conflict must be resolved, and every resolution must name a
    /// conflicted path and a copy that exists.
    pub fn apply_resolutions(
        &mut self,
        resolutions: &ResolutionMap,
        cases: &[ConflictCase],
    ) -> std::result::Result<(), ConflictError> {
        conflict::validate(resolutions, cases)?;

        for item in &mut self.items {
            if item.action != SyncAction::Conflict {
                continue;
            }
            let Some(choice) = resolutions.get(&item.path) else {
                continue;
            };
            let (state, action) = match choice {
                Resolution::Remote => (SyncState::RemoteChanged, SyncAction::Download),
                Resolution::Local => (SyncState::LocalChanged, SyncAction::Upload),
                Resolution::Cache => (item.state, SyncAction::Restore),
            };
            item.state = state;
            item.action = action;
            item.resolution = Some(*choice);
        }
        Ok(())
    }

    /// The manifest both sides agree on once the plan has been applied.
    pub fn result_manifest(
        &self,
        local: &Manifest,
        cache: &Manifest,
        remote: &Manifest,
    ) -> Result<Manifest> {
        let mut result = Manifest::new();
        for item in &self.items {
            let entry: Option<&FileEntry> = match item.action {
                SyncAction::Upload => local.get(&item.path),
                SyncAction::Download => remote.get(&item.path),
                SyncAction::Restore => cache.get(&item.path),
                SyncAction::DeleteLocal | SyncAction::DeleteRemote => None,
                SyncAction::Conflict => cache.get(&item.path),
                SyncAction::NoOp => local.get(&item.path).or_else(|| remote.get(&item.path)),
            };
            if let Some(entry) = entry {
                result.insert(entry.clone())?;
            }
        }
        Ok(result)
    }

    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for item in &self.items {
            match item.action {
                SyncAction::Upload => summary.uploads += 1,
                SyncAction::Download => summary.downloads += 1,
                SyncAction::DeleteLocal => summary.local_deletes += 1,
                SyncAction::DeleteRemote => summary.remote_deletes += 1,
                SyncAction::Conflict => summary.conflicts += 1,
                SyncAction::Restore => summary.restores += 1,
                SyncAction::NoOp => summary.unchanged += 1,
            }
        }
        summary
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanSummary {
    pub uploads: usize,
    pub downloads: usize,
    pub local_deletes: usize,
    pub remote_deletes: usize,
    pub conflicts: usize,
    pub restores: usize,
    pub unchanged: usize,
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} upload(s), {} download(s), {} local delete(s), {} remote delete(s), {} restore(s), {} conflict(s), {} unchanged",
            self.uploads,
            self.downloads,
            self.local_deletes,
            self.remote_deletes,
            self.restores,
            self.conflicts,
            self.unchanged
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Digest;

    fn file(path: &str, content: &str, mtime: i64) -> FileEntry {
        FileEntry::file(path, content.len() as u64, mtime, Some(Digest::of_bytes(content.as_bytes())))
    }

    fn manifest(entries: &[FileEntry]) -> Manifest {
        let mut m = Manifest::new();
        for e in entries {
            m.insert(e.clone()).unwrap();
        }
        m
    }

    #[test]
    fn table_covers_every_state() {
        for state in SyncState::ALL {
            let action = action_for(state);
            assert_eq!(
                action == SyncAction::Conflict,
                state.is_conflict(),
                "{state:?} -> {action:?}"
            );
        }
        assert_eq!(action_for(SyncState::LocalOnlyRemoteGone), SyncAction::DeleteLocal);
        assert_eq!(action_for(SyncState::LocalDeletedSafe), SyncAction::DeleteRemote);
    }

    #[test]
    fn init_uploads_everything() {
        let local = manifest(&[file("a", "1", 1), file("b", "2", 1)]);
        let plan = SyncPlan::build(&local, &Manifest::new(), &Manifest::new());
        assert!(plan.items.iter().all(|i| i.state == SyncState::LocalOnly));
        let summary = plan.summary();
        assert_eq!(summary.uploads, 2);
        assert_eq!(summary.downloads + summary.local_deletes + summary.remote_deletes, 0);
    }

    #[test]
    fn clone_downloads_everything() {
        let remote = manifest(&[file("a", "1", 1), file("b", "2", 1)]);
        let plan = SyncPlan::build(&Manifest::new(), &Manifest::new(), &remote);
        assert!(plan.items.iter().all(|i| i.state == SyncState::RemoteOnly));
        assert_eq!(plan.summary().downloads, 2);
        assert_eq!(plan.summary().uploads, 0);
    }

    #[test]
    fn safe_delete_removes_local_copy() {
        let both = manifest(&[file("gone.txt", "x", 1)]);
        let plan = SyncPlan::build(&both, &both, &Manifest::new());
        assert_eq!(plan.items[0].state, SyncState::LocalOnlyRemoteGone);
        assert_eq!(plan.items[0].action, SyncAction::DeleteLocal);
        assert!(!plan.has_conflicts());
        let result = plan.result_manifest(&both, &both, &Manifest::new()).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn resolutions_override_conflicts() {
        let local = manifest(&[file("a", "local", 3), file("b", "local", 3), file("c", "l", 3)]);
        let cache = manifest(&[file("a", "cache", 1), file("b", "cache", 1), file("c", "c", 1)]);
        let remote = manifest(&[file("a", "remote", 2), file("b", "remote", 2), file("c", "r", 2)]);

        let mut plan = SyncPlan::build(&local, &cache, &remote);
        assert_eq!(plan.conflicts().count(), 3);
        let cases = plan.conflict_cases(&local, &cache, &remote);

        let mut choices = ResolutionMap::new();
        choices.insert("a".into(), Resolution::Remote);
        choices.insert("b".into(), Resolution::Local);
        choices.insert("c".into(), Resolution::Cache);
        plan.apply_resolutions(&choices, &cases).unwrap();

        let actions: Vec<_> = plan.items.iter().map(|i| i.action).collect();
        assert_eq!(
            actions,
            vec![SyncAction::Download, SyncAction::Upload, SyncAction::Restore]
        );
        assert_eq!(plan.items[0].state, SyncState::RemoteChanged);
        assert_eq!(plan.items[1].state, SyncState::LocalChanged);
        assert!(!plan.has_conflicts());

        let result = plan.result_manifest(&local, &cache, &remote).unwrap();
        assert!(result.get("a").unwrap().is_same_as(remote.get("a").unwrap()));
        assert!(result.get("b").unwrap().is_same_as(local.get("b").unwrap()));
        assert!(result.get("c").unwrap().is_same_as(cache.get("c").unwrap()));
    }

    #[test]
    fn partial_resolutions_are_rejected() {
        let local = manifest(&[file("a", "l", 3), file("b", "l", 3)]);
        let remote = manifest(&[file("a", "r", 2), file("b", "r", 2)]);
        let mut plan = SyncPlan::build(&local, &Manifest::new(), &remote);
        let cases = plan.conflict_cases(&local, &Manifest::new(), &remote);

        let mut choices = ResolutionMap::new();
        choices.insert("a".into(), Resolution::Local);
        let err = plan.apply_resolutions(&choices, &cases).unwrap_err();
        assert_eq!(
            err,
            ConflictError::MissingResolution {
                paths: vec!["b".into()]
            }
        );
        assert!(plan.has_conflicts());
    }
}
