//! Item, note-body and media-reference persistence.
//!
//! # Responsibility
//! - Persist folder/note rows and note bodies.
//! - Track which notes reference which media assets and report assets that
//!   lost their last reference.
//!
//! # Invariants
//! - Child listing is deterministic: `sort_order ASC, item_uuid ASC`.
//! - Subtree mutations (delete, move) touch every descendant in the same
//!   transaction as the subtree root.
//! - A media asset row exists only while at least one note references it.

use super::{RepoError, RepoResult};
use crate::db::migrations::latest_version;
use crate::model::item::{ItemId, ItemKind, NotebookItem, ROOT_DEPTH, ROOT_DISPLAY_NAME};
use crate::model::media::{MediaAsset, MediaId};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use uuid::Uuid;

const SUBTREE_CTE: &str = "WITH RECURSIVE subtree(item_uuid) AS (
        SELECT item_uuid FROM items WHERE item_uuid = ?1
        UNION
        SELECT child.item_uuid
        FROM items child
        INNER JOIN subtree parent ON child.parent_uuid = parent.item_uuid
    )";

/// Row counts used by manifests and verification. The root folder is not
/// counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub folders: u64,
    pub notes: u64,
    pub media: u64,
}

/// Result of removing one subtree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletedSubtree {
    pub item_ids: Vec<ItemId>,
    /// Assets that no remaining note references; their rows are gone and
    /// their files may be released.
    pub released_media: Vec<MediaAsset>,
}

/// One item of a batch insert, with the body of a note.
#[derive(Debug, Clone)]
pub struct NewItem<'a> {
    pub item: &'a NotebookItem,
    pub body: Option<&'a str>,
}

/// Repository interface for notebook records.
pub trait ItemRepository {
    /// Loads every item, ordered by depth, then sibling order.
    fn load_items(&self) -> RepoResult<Vec<NotebookItem>>;
    /// Returns the root folder, creating it in an empty store.
    fn ensure_root(&self, now_ms: i64) -> RepoResult<NotebookItem>;
    /// Inserts one item; notes get an empty body.
    fn insert_item(&self, item: &NotebookItem) -> RepoResult<()>;
    /// Inserts a batch of items in one transaction, parents first.
    fn insert_items(&self, items: &[NewItem<'_>]) -> RepoResult<()>;
    fn rename_item(&self, item_uuid: ItemId, display_name: &str, now_ms: i64) -> RepoResult<()>;
    /// Reparents one item and shifts the depth of its whole subtree.
    fn move_subtree(
        &self,
        item_uuid: ItemId,
        new_parent_uuid: ItemId,
        sort_order: i64,
        depth_delta: i32,
        now_ms: i64,
    ) -> RepoResult<()>;
    /// Removes one item and all descendants.
    fn delete_subtree(&self, item_uuid: ItemId) -> RepoResult<DeletedSubtree>;
    fn note_body(&self, note_uuid: ItemId) -> RepoResult<String>;
    fn set_note_body(&self, note_uuid: ItemId, body: &str, now_ms: i64) -> RepoResult<()>;
    /// Registers `asset` (if new) and references it from the note.
    /// References `asset` from the note. Returns the asset row as stored,
    /// which keeps the first file name recorded for these bytes.
    fn attach_media(
        &self,
        note_uuid: ItemId,
        asset: &MediaAsset,
        now_ms: i64,
    ) -> RepoResult<MediaAsset>;
    /// Drops one reference. Returns the asset when no reference remains.
    fn detach_media(&self, note_uuid: ItemId, media_id: &str) -> RepoResult<Option<MediaAsset>>;
    fn note_media(&self, note_uuid: ItemId) -> RepoResult<Vec<MediaAsset>>;
    /// Lists every registered asset ordered by id.
    fn media_assets(&self) -> RepoResult<Vec<MediaAsset>>;
    fn counts(&self) -> RepoResult<StoreCounts>;
}

/// SQLite-backed notebook record repository.
pub struct SqliteItemRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteItemRepository<'conn> {
    /// Creates repository from a migrated connection.
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        ensure_connection_ready(conn)?;
        Ok(Self { conn })
    }
}

impl ItemRepository for SqliteItemRepository<'_> {
    fn load_items(&self) -> RepoResult<Vec<NotebookItem>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                item_uuid,
                kind,
                parent_uuid,
                display_name,
                depth,
                sort_order,
                created_at,
                updated_at
             FROM items
             ORDER BY depth ASC, sort_order ASC, item_uuid ASC;",
        )?;
        let mut rows = stmt.query([])?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            items.push(parse_item_row(row)?);
        }
        Ok(items)
    }

    fn ensure_root(&self, now_ms: i64) -> RepoResult<NotebookItem> {
        if let Some(root) = load_root(self.conn)? {
            return Ok(root);
        }
        let root = NotebookItem {
            item_uuid: Uuid::new_v4(),
            parent_uuid: None,
            display_name: ROOT_DISPLAY_NAME.to_string(),
            kind: ItemKind::Folder,
            depth: ROOT_DEPTH,
            sort_order: 0,
            created_at: now_ms,
            updated_at: now_ms,
        };
        insert_item_row(self.conn, &root, None)?;
        Ok(root)
    }

    fn insert_item(&self, item: &NotebookItem) -> RepoResult<()> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        insert_item_row(&tx, item, None)?;
        tx.commit()?;
        Ok(())
    }

    fn insert_items(&self, items: &[NewItem<'_>]) -> RepoResult<()> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        for entry in items {
            insert_item_row(&tx, entry.item, entry.body)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn rename_item(&self, item_uuid: ItemId, display_name: &str, now_ms: i64) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE items
             SET display_name = ?2,
                 updated_at = ?3
             WHERE item_uuid = ?1;",
            params![item_uuid.to_string(), display_name, now_ms],
        )?;
        if changed == 0 {
            return Err(RepoError::NotFound(item_uuid));
        }
        Ok(())
    }

    fn move_subtree(
        &self,
        item_uuid: ItemId,
        new_parent_uuid: ItemId,
        sort_order: i64,
        depth_delta: i32,
        now_ms: i64,
    ) -> RepoResult<()> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE items
             SET parent_uuid = ?2,
                 sort_order = ?3,
                 updated_at = ?4
             WHERE item_uuid = ?1
               AND parent_uuid IS NOT NULL;",
            params![
                item_uuid.to_string(),
                new_parent_uuid.to_string(),
                sort_order,
                now_ms
            ],
        )?;
        if changed == 0 {
            return Err(RepoError::NotFound(item_uuid));
        }
        if depth_delta != 0 {
            tx.execute(
                &format!(
                    "{SUBTREE_CTE}
                     UPDATE items
                     SET depth = depth + ?2
                     WHERE item_uuid IN (SELECT item_uuid FROM subtree);"
                ),
                params![item_uuid.to_string(), depth_delta],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn delete_subtree(&self, item_uuid: ItemId) -> RepoResult<DeletedSubtree> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let item_ids = list_subtree_ids(&tx, item_uuid)?;
        if item_ids.is_empty() {
            return Err(RepoError::NotFound(item_uuid));
        }

        let candidates = {
            let mut stmt = tx.prepare(&format!(
                "{SUBTREE_CTE}
                 SELECT DISTINCT media_id
                 FROM note_media
                 WHERE item_uuid IN (SELECT item_uuid FROM subtree)
                 ORDER BY media_id ASC;"
            ))?;
            let mut rows = stmt.query([item_uuid.to_string()])?;
            let mut ids: Vec<MediaId> = Vec::new();
            while let Some(row) = rows.next()? {
                ids.push(row.get(0)?);
            }
            ids
        };

        tx.execute(
            &format!(
                "{SUBTREE_CTE}
                 DELETE FROM items
                 WHERE item_uuid IN (SELECT item_uuid FROM subtree);"
            ),
            [item_uuid.to_string()],
        )?;

        let mut released_media = Vec::new();
        for media_id in candidates {
            if let Some(asset) = release_if_unreferenced(&tx, &media_id)? {
                released_media.push(asset);
            }
        }
        tx.commit()?;

        Ok(DeletedSubtree {
            item_ids,
            released_media,
        })
    }

    fn note_body(&self, note_uuid: ItemId) -> RepoResult<String> {
        self.conn
            .query_row(
                "SELECT body FROM note_contents WHERE item_uuid = ?1;",
                [note_uuid.to_string()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(RepoError::NotFound(note_uuid))
    }

    fn set_note_body(&self, note_uuid: ItemId, body: &str, now_ms: i64) -> RepoResult<()> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE note_contents SET body = ?2 WHERE item_uuid = ?1;",
            params![note_uuid.to_string(), body],
        )?;
        if changed == 0 {
            return Err(RepoError::NotFound(note_uuid));
        }
        touch_item(&tx, note_uuid, now_ms)?;
        tx.commit()?;
        Ok(())
    }

    fn attach_media(
        &self,
        note_uuid: ItemId,
        asset: &MediaAsset,
        now_ms: i64,
    ) -> RepoResult<MediaAsset> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        ensure_note_exists(&tx, note_uuid)?;
        tx.execute(
            "INSERT OR IGNORE INTO media_assets (media_id, file_name, byte_len, created_at)
             VALUES (?1, ?2, ?3, ?4);",
            params![asset.media_id, asset.file_name, asset.byte_len as i64, now_ms],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO note_media (item_uuid, media_id) VALUES (?1, ?2);",
            params![note_uuid.to_string(), asset.media_id],
        )?;
        let stored = media_asset_by_id(&tx, &asset.media_id)?.ok_or_else(|| {
            RepoError::InvalidData(format!("media asset `{}` vanished", asset.media_id))
        })?;
        touch_item(&tx, note_uuid, now_ms)?;
        tx.commit()?;
        Ok(stored)
    }

    fn detach_media(&self, note_uuid: ItemId, media_id: &str) -> RepoResult<Option<MediaAsset>> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let removed = tx.execute(
            "DELETE FROM note_media WHERE item_uuid = ?1 AND media_id = ?2;",
            params![note_uuid.to_string(), media_id],
        )?;
        if removed == 0 {
            return Ok(None);
        }
        let released = release_if_unreferenced(&tx, media_id)?;
        tx.commit()?;
        Ok(released)
    }

    fn note_media(&self, note_uuid: ItemId) -> RepoResult<Vec<MediaAsset>> {
        let mut stmt = self.conn.prepare(
            "SELECT assets.media_id, assets.file_name, assets.byte_len
             FROM note_media refs
             INNER JOIN media_assets assets ON assets.media_id = refs.media_id
             WHERE refs.item_uuid = ?1
             ORDER BY assets.media_id ASC;",
        )?;
        let mut rows = stmt.query([note_uuid.to_string()])?;
        let mut assets = Vec::new();
        while let Some(row) = rows.next()? {
            assets.push(parse_media_row(row)?);
        }
        Ok(assets)
    }

    fn media_assets(&self) -> RepoResult<Vec<MediaAsset>> {
        let mut stmt = self.conn.prepare(
            "SELECT media_id, file_name, byte_len
             FROM media_assets
             ORDER BY media_id ASC;",
        )?;
        let mut rows = stmt.query([])?;
        let mut assets = Vec::new();
        while let Some(row) = rows.next()? {
            assets.push(parse_media_row(row)?);
        }
        Ok(assets)
    }

    fn counts(&self) -> RepoResult<StoreCounts> {
        let (folders, notes): (i64, i64) = self.conn.query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN kind = 'folder' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN kind = 'note' THEN 1 ELSE 0 END), 0)
             FROM items
             WHERE parent_uuid IS NOT NULL;",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let media: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM media_assets;", [], |row| row.get(0))?;
        Ok(StoreCounts {
            folders: folders as u64,
            notes: notes as u64,
            media: media as u64,
        })
    }
}

fn insert_item_row(conn: &Connection, item: &NotebookItem, body: Option<&str>) -> RepoResult<()> {
    conn.execute(
        "INSERT INTO items (
            item_uuid,
            kind,
            parent_uuid,
            display_name,
            depth,
            sort_order,
            created_at,
            updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);",
        params![
            item.item_uuid.to_string(),
            item.kind.as_str(),
            item.parent_uuid.map(|id| id.to_string()),
            item.display_name,
            item.depth,
            item.sort_order,
            item.created_at,
            item.updated_at
        ],
    )?;
    if item.is_note() {
        conn.execute(
            "INSERT INTO note_contents (item_uuid, body) VALUES (?1, ?2);",
            params![item.item_uuid.to_string(), body.unwrap_or_default()],
        )?;
    }
    Ok(())
}

fn load_root(conn: &Connection) -> RepoResult<Option<NotebookItem>> {
    let mut stmt = conn.prepare(
        "SELECT
            item_uuid,
            kind,
            parent_uuid,
            display_name,
            depth,
            sort_order,
            created_at,
            updated_at
         FROM items
         WHERE parent_uuid IS NULL;",
    )?;
    let mut rows = stmt.query([])?;
    if let Some(row) = rows.next()? {
        return parse_item_row(row).map(Some);
    }
    Ok(None)
}

fn list_subtree_ids(conn: &Connection, item_uuid: ItemId) -> RepoResult<Vec<ItemId>> {
    let mut stmt = conn.prepare(&format!(
        "{SUBTREE_CTE}
         SELECT item_uuid FROM subtree;"
    ))?;
    let mut rows = stmt.query([item_uuid.to_string()])?;
    let mut ids = Vec::new();
    while let Some(row) = rows.next()? {
        let value: String = row.get(0)?;
        ids.push(parse_uuid(&value, "items.item_uuid")?);
    }
    Ok(ids)
}

fn release_if_unreferenced(conn: &Connection, media_id: &str) -> RepoResult<Option<MediaAsset>> {
    let remaining: i64 = conn.query_row(
        "SELECT COUNT(*) FROM note_media WHERE media_id = ?1;",
        [media_id],
        |row| row.get(0),
    )?;
    if remaining > 0 {
        return Ok(None);
    }
    let Some(asset) = media_asset_by_id(conn, media_id)? else {
        return Ok(None);
    };
    conn.execute("DELETE FROM media_assets WHERE media_id = ?1;", [media_id])?;
    Ok(Some(asset))
}

fn media_asset_by_id(conn: &Connection, media_id: &str) -> RepoResult<Option<MediaAsset>> {
    let mut stmt = conn.prepare(
        "SELECT media_id, file_name, byte_len FROM media_assets WHERE media_id = ?1;",
    )?;
    let mut rows = stmt.query([media_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(parse_media_row(row)?)),
        None => Ok(None),
    }
}

fn ensure_note_exists(conn: &Connection, note_uuid: ItemId) -> RepoResult<()> {
    let kind: Option<String> = conn
        .query_row(
            "SELECT kind FROM items WHERE item_uuid = ?1;",
            [note_uuid.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    match kind.as_deref() {
        Some("note") => Ok(()),
        Some(other) => Err(RepoError::InvalidData(format!(
            "item {note_uuid} is a {other}, expected a note"
        ))),
        None => Err(RepoError::NotFound(note_uuid)),
    }
}

fn touch_item(conn: &Connection, item_uuid: ItemId, now_ms: i64) -> RepoResult<()> {
    conn.execute(
        "UPDATE items SET updated_at = ?2 WHERE item_uuid = ?1;",
        params![item_uuid.to_string(), now_ms],
    )?;
    Ok(())
}

fn parse_item_row(row: &Row<'_>) -> RepoResult<NotebookItem> {
    let item_uuid_text: String = row.get("item_uuid")?;
    let item_uuid = parse_uuid(&item_uuid_text, "items.item_uuid")?;

    let parent_uuid = row
        .get::<_, Option<String>>("parent_uuid")?
        .map(|value| parse_uuid(&value, "items.parent_uuid"))
        .transpose()?;

    let kind_text: String = row.get("kind")?;
    let kind = ItemKind::parse(&kind_text).ok_or_else(|| {
        RepoError::InvalidData(format!("invalid item kind `{kind_text}` in items.kind"))
    })?;

    Ok(NotebookItem {
        item_uuid,
        parent_uuid,
        display_name: row.get("display_name")?,
        kind,
        depth: row.get("depth")?,
        sort_order: row.get("sort_order")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn parse_media_row(row: &Row<'_>) -> RepoResult<MediaAsset> {
    let byte_len: i64 = row.get(2)?;
    let byte_len = u64::try_from(byte_len).map_err(|_| {
        RepoError::InvalidData(format!("negative byte_len `{byte_len}` in media_assets"))
    })?;
    Ok(MediaAsset {
        media_id: row.get(0)?,
        file_name: row.get(1)?,
        byte_len,
    })
}

fn parse_uuid(value: &str, column: &'static str) -> RepoResult<Uuid> {
    Uuid::parse_str(value)
        .map_err(|_| RepoError::InvalidData(format!("invalid uuid `{value}` in {column}")))
}

fn ensure_connection_ready(conn: &Connection) -> RepoResult<()> {
    let expected_version = latest_version();
    let actual_version: u32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    if actual_version != expected_version {
        return Err(RepoError::UninitializedConnection {
            expected_version,
            actual_version,
        });
    }

    for table in ["items", "note_contents", "media_assets", "note_media"] {
        if !table_exists(conn, table)? {
            return Err(RepoError::MissingRequiredTable(table));
        }
    }
    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> RepoResult<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(
            SELECT 1
            FROM sqlite_master
            WHERE type = 'table' AND name = ?1
        );",
        [table],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}
