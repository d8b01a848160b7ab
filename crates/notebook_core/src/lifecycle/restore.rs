//! Restore task.
//!
//! Holds the write lock for the whole run: nothing may edit the store that
//! is about to be replaced.

use super::{ensure_exists, LifecycleResult, OperationContext, RestoreOutcome};
use crate::tree::NotebookTree;
use log::info;
use std::path::Path;

pub(super) fn run(
    tree: &NotebookTree,
    context: &mut OperationContext,
    source: &Path,
) -> LifecycleResult<RestoreOutcome> {
    ensure_exists(source)?;
    context.check_continue()?;

    let mut storage = tree.lock_storage();
    let max_depth = tree.policy().max_depth();
    let (manifest, snapshot) = storage.restore_from(source, max_depth, context)?;
    tree.publish(snapshot);
    info!(
        "event=restore_publish module=lifecycle status=ok notes={} folders={}",
        manifest.note_count, manifest.folder_count
    );
    Ok(RestoreOutcome { manifest })
}
