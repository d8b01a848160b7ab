//! Relocate task.

use super::{LifecycleResult, OperationContext, RelocateOutcome};
use crate::config::{AppSettings, SettingsStore};
use crate::tree::NotebookTree;
use log::error;
use std::path::Path;

pub(super) fn run(
    tree: &NotebookTree,
    context: &mut OperationContext,
    new_root: &Path,
    overwrite: bool,
    settings: Option<&SettingsStore>,
) -> LifecycleResult<RelocateOutcome> {
    context.check_continue()?;
    let mut storage = tree.lock_storage();
    let previous_root = storage.layout().root().to_path_buf();
    storage.relocate(new_root, overwrite, context)?;
    let new_root = storage.layout().root().to_path_buf();

    if let Some(settings) = settings {
        let saved = settings.load().and_then(|current| {
            let mut next = current.unwrap_or_else(|| AppSettings::new(&new_root));
            next.notebook_location = new_root.clone();
            settings.save(&next)
        });
        if let Err(err) = saved {
            // The store already moved; the caller must persist the location.
            error!(
                "event=relocate_settings module=lifecycle status=error path={} error={}",
                settings.path().display(),
                err
            );
            return Err(err.into());
        }
    }
    Ok(RelocateOutcome {
        previous_root,
        new_root,
    })
}
