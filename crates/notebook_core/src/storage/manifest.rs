//! Backup manifest and store verification.
//!
//! # Responsibility
//! - Describe a backup (`manifest.json`): format, schema, counts and the
//!   media files it must contain.
//! - Verify that a store directory matches its manifest before it is ever
//!   made live.
//!
//! # Invariants
//! - A directory passes `verify_store` only if SQLite integrity check, item
//!   tree shape, counts, and every media file's size and hash all agree.

use super::layout::{NotebookLayout, MANIFEST_FILE};
use super::media::{file_name_matches, hash_file};
use super::{io_error, StorageError, StorageResult};
use crate::db::migrations::{current_user_version, latest_version};
use crate::db::open_reader;
use crate::model::media::MediaAsset;
use crate::repo::item_repo::{ItemRepository, SqliteItemRepository, StoreCounts};
use crate::tree::snapshot::TreeSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Manifest layout version this binary writes and accepts.
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

/// Contents of `manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub format_version: u32,
    pub app_version: String,
    pub schema_version: u32,
    pub created_at: DateTime<Utc>,
    pub folder_count: u64,
    pub note_count: u64,
    pub media_count: u64,
    pub media: Vec<MediaAsset>,
}

impl BackupManifest {
    pub fn new(counts: StoreCounts, media: Vec<MediaAsset>) -> Self {
        Self {
            format_version: MANIFEST_FORMAT_VERSION,
            app_version: crate::core_version().to_string(),
            schema_version: latest_version(),
            created_at: Utc::now(),
            folder_count: counts.folders,
            note_count: counts.notes,
            media_count: counts.media,
            media,
        }
    }

    pub fn counts(&self) -> StoreCounts {
        StoreCounts {
            folders: self.folder_count,
            notes: self.note_count,
            media: self.media_count,
        }
    }

    /// Sum of all media file sizes.
    pub fn media_bytes(&self) -> u64 {
        self.media.iter().map(|asset| asset.byte_len).sum()
    }

    /// Reads `manifest.json` from `dir`.
    pub fn load(dir: &Path) -> StorageResult<Self> {
        let path = dir.join(MANIFEST_FILE);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::Integrity(format!(
                    "backup manifest missing at `{}`",
                    path.display()
                )))
            }
            Err(err) => return Err(io_error(format!("read {}", path.display()), err)),
        };
        serde_json::from_str(&text).map_err(|err| {
            StorageError::Integrity(format!("backup manifest is not valid: {err}"))
        })
    }

    /// Writes `manifest.json` into `dir`.
    pub fn save(&self, dir: &Path) -> StorageResult<()> {
        let path = dir.join(MANIFEST_FILE);
        let payload = serde_json::to_vec_pretty(self)
            .map_err(|err| StorageError::InvalidData(format!("manifest encoding: {err}")))?;
        fs::write(&path, payload).map_err(|err| io_error(format!("write {}", path.display()), err))
    }

    /// Cheap structural checks on a backup directory before copying it.
    pub fn validate_source(dir: &Path) -> StorageResult<Self> {
        let manifest = Self::load(dir)?;
        if manifest.format_version != MANIFEST_FORMAT_VERSION {
            return Err(StorageError::Integrity(format!(
                "unsupported backup format version {}",
                manifest.format_version
            )));
        }
        if manifest.schema_version > latest_version() {
            return Err(StorageError::Integrity(format!(
                "backup schema version {} is newer than supported {}",
                manifest.schema_version,
                latest_version()
            )));
        }
        if manifest.media.len() as u64 != manifest.media_count {
            return Err(StorageError::Integrity(
                "backup manifest media list does not match media_count".to_string(),
            ));
        }
        let layout = NotebookLayout::new(dir);
        if !layout.has_record_store() {
            return Err(StorageError::Integrity(
                "backup is missing notes.db".to_string(),
            ));
        }
        if !layout.media_dir().is_dir() {
            return Err(StorageError::Integrity(
                "backup is missing notes_media".to_string(),
            ));
        }
        for asset in &manifest.media {
            if !file_name_matches(asset) {
                return Err(StorageError::Integrity(format!(
                    "backup lists invalid media file `{}`",
                    asset.file_name
                )));
            }
            let path = layout.media_dir().join(&asset.file_name);
            let metadata = fs::metadata(&path).map_err(|_| {
                StorageError::Integrity(format!("backup is missing media `{}`", asset.file_name))
            })?;
            if metadata.len() != asset.byte_len {
                return Err(StorageError::Integrity(format!(
                    "backup media `{}` has {} bytes, manifest says {}",
                    asset.file_name,
                    metadata.len(),
                    asset.byte_len
                )));
            }
        }
        Ok(manifest)
    }
}

/// Full verification of a migrated store directory against `expected`.
///
/// Returns the validated item tree so callers can also check nesting.
pub(crate) fn verify_store(
    layout: &NotebookLayout,
    expected: &BackupManifest,
) -> StorageResult<TreeSnapshot> {
    let conn = open_reader(layout.record_store())?;

    let check: String = conn
        .query_row("PRAGMA integrity_check;", [], |row| row.get(0))
        .map_err(crate::db::DbError::from)?;
    if check != "ok" {
        return Err(StorageError::Integrity(format!(
            "record store integrity check failed: {check}"
        )));
    }
    let version = current_user_version(&conn)?;
    if version != latest_version() {
        return Err(StorageError::Integrity(format!(
            "record store schema version {version}, expected {}",
            latest_version()
        )));
    }

    let repo = SqliteItemRepository::try_new(&conn)?;
    let snapshot = TreeSnapshot::from_items(repo.load_items()?)
        .map_err(|message| StorageError::Integrity(format!("item tree is invalid: {message}")))?;

    let counts = repo.counts()?;
    if counts != expected.counts() {
        return Err(StorageError::Integrity(format!(
            "record counts {counts:?} do not match manifest {:?}",
            expected.counts()
        )));
    }

    let listed: BTreeMap<&str, &MediaAsset> = expected
        .media
        .iter()
        .map(|asset| (asset.media_id.as_str(), asset))
        .collect();
    for asset in repo.media_assets()? {
        let Some(entry) = listed.get(asset.media_id.as_str()) else {
            return Err(StorageError::Integrity(format!(
                "media `{}` is not listed in the manifest",
                asset.media_id
            )));
        };
        if **entry != asset {
            return Err(StorageError::Integrity(format!(
                "media `{}` differs from its manifest entry",
                asset.media_id
            )));
        }
        let path = layout.media_dir().join(&asset.file_name);
        let (digest, byte_len) = hash_file(&path).map_err(|_| {
            StorageError::Integrity(format!("media file `{}` is unreadable", asset.file_name))
        })?;
        if digest != asset.media_id || byte_len != asset.byte_len {
            return Err(StorageError::Integrity(format!(
                "media file `{}` does not match its content address",
                asset.file_name
            )));
        }
    }

    Ok(snapshot)
}
