//! On-disk layout of a notebook directory.
//!
//! ```text
//! <root>/
//!   notes.db            record store (plus -wal / -shm while open)
//!   notes_media/        content-addressed media files
//!   .staging-<uuid>/    in-flight restore/relocate copy
//!   .swap-previous/     previous store while a swap is in progress
//! ```

use std::path::{Path, PathBuf};

pub const RECORD_STORE_FILE: &str = "notes.db";
pub const MEDIA_DIR: &str = "notes_media";
pub const MANIFEST_FILE: &str = "manifest.json";
pub(crate) const STAGING_PREFIX: &str = ".staging-";
pub(crate) const SWAP_PREVIOUS_DIR: &str = ".swap-previous";
pub(crate) const SWAP_MARKER_FILE: &str = "SWAP_IN_PROGRESS";

/// SQLite side files that travel with the record store.
pub(crate) const RECORD_STORE_SIDE_SUFFIXES: &[&str] = &["-wal", "-shm"];

/// Paths of one notebook directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotebookLayout {
    root: PathBuf,
}

impl NotebookLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn record_store(&self) -> PathBuf {
        self.root.join(RECORD_STORE_FILE)
    }

    pub fn media_dir(&self) -> PathBuf {
        self.root.join(MEDIA_DIR)
    }

    pub fn manifest(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    /// Record store plus its SQLite side files, in that order.
    pub(crate) fn record_store_files(&self) -> Vec<PathBuf> {
        let mut files = vec![self.record_store()];
        for suffix in RECORD_STORE_SIDE_SUFFIXES {
            files.push(self.root.join(format!("{RECORD_STORE_FILE}{suffix}")));
        }
        files
    }

    /// Whether a record store file exists under the root.
    pub fn has_record_store(&self) -> bool {
        self.record_store().is_file()
    }

    pub(crate) fn swap_previous_dir(&self) -> PathBuf {
        self.root.join(SWAP_PREVIOUS_DIR)
    }
}

#[cfg(test)]
mod tests {
    use super::NotebookLayout;
    use std::path::Path;

    #[test]
    fn paths_hang_off_root() {
        let layout = NotebookLayout::new("/data/book");
        assert_eq!(layout.record_store(), Path::new("/data/book/notes.db"));
        assert_eq!(layout.media_dir(), Path::new("/data/book/notes_media"));
        let files = layout.record_store_files();
        assert_eq!(files[1], Path::new("/data/book/notes.db-wal"));
        assert_eq!(files.len(), 3);
    }
}
