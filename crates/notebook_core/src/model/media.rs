//! Media asset model.

use crate::model::item::ItemId;
use serde::{Deserialize, Serialize};

/// Content address of a media asset: lowercase SHA-256 hex of its bytes.
pub type MediaId = String;

/// One binary asset stored in the media directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaAsset {
    pub media_id: MediaId,
    /// File name relative to the media directory.
    pub file_name: String,
    pub byte_len: u64,
}

/// A note's reference to one media asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRef {
    pub note_uuid: ItemId,
    pub asset: MediaAsset,
}

/// Returns whether `value` looks like a SHA-256 hex content address.
pub fn is_valid_media_id(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
