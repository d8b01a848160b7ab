//! Content-addressed media directory.
//!
//! # Responsibility
//! - Ingest files under their SHA-256 content address.
//! - Delete released files, deferring deletes while a snapshot pins the
//!   directory.
//!
//! # Invariants
//! - A file name is `<sha256 hex>[.<ext>]`; equal bytes share one file.
//! - While any `MediaPin` is alive no file is removed; deferred removals
//!   run when the last pin drops.
//! - Re-ingesting a file cancels its deferred removal.

use crate::model::media::{is_valid_media_id, MediaAsset};
use log::{info, warn};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

const COPY_BUFFER_BYTES: usize = 64 * 1024;
const MAX_EXTENSION_CHARS: usize = 10;

/// Outcome of one ingest call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestedMedia {
    pub asset: MediaAsset,
    /// `false` when identical bytes were already stored.
    pub created: bool,
}

#[derive(Debug, Default)]
struct PinState {
    active: usize,
    deferred: BTreeSet<String>,
}

/// Media directory of one notebook.
#[derive(Debug)]
pub struct MediaStore {
    dir: PathBuf,
    pins: Mutex<PinState>,
}

impl MediaStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            pins: Mutex::new(PinState::default()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_of(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }

    /// Copies `source` into the store under its content address.
    pub fn ingest(&self, source: &Path) -> io::Result<IngestedMedia> {
        fs::create_dir_all(&self.dir)?;
        let temp_path = self.dir.join(format!(".ingest-{}.tmp", Uuid::new_v4()));
        let hashed = copy_hashing(source, &temp_path);
        let (media_id, byte_len) = match hashed {
            Ok(value) => value,
            Err(err) => {
                let _ = fs::remove_file(&temp_path);
                return Err(err);
            }
        };

        let file_name = media_file_name(&media_id, source);
        let target = self.path_of(&file_name);
        let mut pins = self.lock_pins();
        pins.deferred.remove(&file_name);
        let created = if target.is_file() {
            fs::remove_file(&temp_path)?;
            false
        } else {
            fs::rename(&temp_path, &target)?;
            true
        };
        drop(pins);

        info!(
            "event=media_ingest module=storage status=ok media_id={} bytes={} created={}",
            media_id, byte_len, created
        );
        Ok(IngestedMedia {
            asset: MediaAsset {
                media_id,
                file_name,
                byte_len,
            },
            created,
        })
    }

    /// Deletes files whose last reference is gone, or defers the delete
    /// while pinned.
    pub fn release<'a>(&self, file_names: impl IntoIterator<Item = &'a str>) {
        let mut pins = self.lock_pins();
        if pins.active > 0 {
            for name in file_names {
                pins.deferred.insert(name.to_string());
            }
            return;
        }
        drop(pins);
        for name in file_names {
            self.remove_file(name);
        }
    }

    /// Keeps every current file on disk until the returned pin drops.
    pub fn pin(self: &Arc<Self>) -> MediaPin {
        self.lock_pins().active += 1;
        MediaPin {
            store: Arc::clone(self),
        }
    }

    /// Names of regular files in the directory, ignoring temp files.
    pub fn list_files(&self) -> io::Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn remove_file(&self, name: &str) {
        match fs::remove_file(self.path_of(name)) {
            Ok(()) => info!(
                "event=media_release module=storage status=ok file_name={}",
                name
            ),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                "event=media_release module=storage status=error file_name={} error={}",
                name, err
            ),
        }
    }

    fn lock_pins(&self) -> MutexGuard<'_, PinState> {
        match self.pins.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Guard that keeps media files in place while a snapshot reads them.
#[derive(Debug)]
pub struct MediaPin {
    store: Arc<MediaStore>,
}

impl Drop for MediaPin {
    fn drop(&mut self) {
        let deferred = {
            let mut pins = self.store.lock_pins();
            pins.active = pins.active.saturating_sub(1);
            if pins.active > 0 {
                return;
            }
            std::mem::take(&mut pins.deferred)
        };
        for name in &deferred {
            self.store.remove_file(name);
        }
    }
}

/// Streams `source` to `target`, returning the hex digest and byte count.
pub(crate) fn copy_hashing(source: &Path, target: &Path) -> io::Result<(String, u64)> {
    let mut input = File::open(source)?;
    let mut output = File::create(target)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0_u8; COPY_BUFFER_BYTES];
    let mut total = 0_u64;
    loop {
        let read = input.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        output.write_all(&buffer[..read])?;
        total += read as u64;
    }
    output.sync_all()?;
    Ok((hex::encode(hasher.finalize()), total))
}

/// Hashes one file, returning the hex digest and byte count.
pub(crate) fn hash_file(path: &Path) -> io::Result<(String, u64)> {
    let mut input = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0_u8; COPY_BUFFER_BYTES];
    let mut total = 0_u64;
    loop {
        let read = input.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        total += read as u64;
    }
    Ok((hex::encode(hasher.finalize()), total))
}

/// Checks that a media file name is `<media_id>` optionally followed by a
/// short alphanumeric extension.
pub(crate) fn file_name_matches(asset: &MediaAsset) -> bool {
    if !is_valid_media_id(&asset.media_id) {
        return false;
    }
    match asset.file_name.strip_prefix(asset.media_id.as_str()) {
        Some("") => true,
        Some(rest) => rest
            .strip_prefix('.')
            .is_some_and(|ext| !ext.is_empty() && ext.chars().all(|ch| ch.is_ascii_alphanumeric())),
        None => false,
    }
}

fn media_file_name(media_id: &str, source: &Path) -> String {
    let extension = source
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .filter(|ext| {
            !ext.is_empty()
                && ext.len() <= MAX_EXTENSION_CHARS
                && ext.chars().all(|ch| ch.is_ascii_alphanumeric())
        });
    match extension {
        Some(ext) => format!("{media_id}.{ext}"),
        None => media_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::{file_name_matches, MediaStore};
    use std::fs;
    use std::sync::Arc;

    #[test]
    fn ingest_deduplicates_identical_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::new(dir.path().join("media"));
        let a = dir.path().join("a.PNG");
        let b = dir.path().join("b.png");
        fs::write(&a, b"pixels").unwrap();
        fs::write(&b, b"pixels").unwrap();

        let first = store.ingest(&a).unwrap();
        let second = store.ingest(&b).unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.asset, second.asset);
        assert!(first.asset.file_name.ends_with(".png"));
        assert!(file_name_matches(&first.asset));
        assert_eq!(store.list_files().unwrap(), vec![first.asset.file_name.clone()]);
    }

    #[test]
    fn pinned_release_is_deferred_until_last_pin_drops() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MediaStore::new(dir.path().join("media")));
        let source = dir.path().join("clip.bin");
        fs::write(&source, b"audio").unwrap();
        let ingested = store.ingest(&source).unwrap();
        let path = store.path_of(&ingested.asset.file_name);

        let first = store.pin();
        let second = store.pin();
        store.release([ingested.asset.file_name.as_str()]);
        drop(first);
        assert!(path.exists());
        drop(second);
        assert!(!path.exists());
    }

    #[test]
    fn reingest_cancels_deferred_release() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MediaStore::new(dir.path().join("media")));
        let source = dir.path().join("clip.bin");
        fs::write(&source, b"audio").unwrap();
        let ingested = store.ingest(&source).unwrap();

        let pin = store.pin();
        store.release([ingested.asset.file_name.as_str()]);
        store.ingest(&source).unwrap();
        drop(pin);
        assert!(store.path_of(&ingested.asset.file_name).exists());
    }
}
