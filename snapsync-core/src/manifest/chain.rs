//! Walking the snapshot chain through `snapshot_previous` pointers.

use std::collections::HashSet;

use super::Manifest;
use crate::utils::errors::Result;

/// Is `candidate` the snapshot `ancestor_id` or one of its descendants?
///
/// `load` fetches a snapshot's manifest by id and returns `Ok(None)` when the
/// snapshot no longer exists, which ends the walk. A pointer cycle also ends
/// the walk with `false`.
pub fn is_descendant<F>(candidate: &Manifest, ancestor_id: &str, mut load: F) -> Result<bool>
where
    F: FnMut(&str) -> Result<Option<Manifest>>,
{
    let Some(metadata) = candidate.metadata.as_ref() else {
        return Ok(false);
    };
    if metadata.snapshot_id == ancestor_id {
        return Ok(true);
    }

    let mut seen = HashSet::new();
    seen.insert(metadata.snapshot_id.clone());
    let mut next = metadata.snapshot_previous.clone();

    while let Some(id) = next {
        if id == ancestor_id {
            return Ok(true);
        }
        if !seen.insert(id.clone()) {
            tracing::warn!(snapshot_id = %id, "Snapshot chain contains a cycle");
            return Ok(false);
        }
        next = match load(&id)? {
            Some(manifest) => manifest.metadata.and_then(|m| m.snapshot_previous),
            None => None,
        };
    }

    Ok(false)
}
