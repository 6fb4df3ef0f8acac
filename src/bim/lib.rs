use libsql::Connection;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::db::{NamedLocks, Pool};

use super::allocator::BlockAllocator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockType {
    Text,
    Image,
    Code,
    H1,
    H2,
}

impl BlockType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockType::Text => "text",
            BlockType::Image => "image",
            BlockType::Code => "code",
            BlockType::H1 => "h1",
            BlockType::H2 => "h2",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "text" => Some(BlockType::Text),
            "image" => Some(BlockType::Image),
            "code" => Some(BlockType::Code),
            "h1" => Some(BlockType::H1),
            "h2" => Some(BlockType::H2),
            _ => None,
        }
    }
}

/// A block in canonical stored form. `language` is set only for code
/// blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    #[serde(rename = "type")]
    pub block_type: BlockType,
    pub value: String,
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: i64,
    pub title: String,
    pub created_at: String,
    pub tags: Vec<String>,
    pub blocks: Vec<Block>,
}

/// Client-supplied block payload, before normalization. The type is kept
/// as a raw string so unknown values fail with our own validation error
/// instead of a deserializer rejection.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockPayload {
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateEntry {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub blocks: Vec<BlockPayload>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateEntry {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub blocks: Option<Vec<BlockPayload>>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

/// Normalized partial update. `None` fields keep the current value;
/// `blocks: Some(..)` triggers a full replace of the block list.
#[derive(Debug, Default)]
pub struct EntryPatch {
    pub title: Option<String>,
    pub tags: Option<Vec<String>>,
    pub blocks: Option<Vec<Block>>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("could not allocate unique id")]
    AllocationExhausted,
    #[error(transparent)]
    Db(#[from] libsql::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Internal(String),
}

const LIST_SQL: &str = r#"
SELECT
    e.id,
    e.title,
    e.created_at,
    e.tags,
    COALESCE((
        SELECT json_group_array(json_object('type', b.type, 'value', b.value, 'language', b.language))
        FROM (
            SELECT type, value, language FROM bim_blocks WHERE entry_id = e.id ORDER BY idx
        ) b
    ), '[]') AS blocks
FROM bim_entries e
ORDER BY e.created_at DESC, e.id DESC
"#;

const GET_ONE_SQL: &str = r#"
SELECT
    e.id,
    e.title,
    e.created_at,
    e.tags,
    COALESCE((
        SELECT json_group_array(json_object('type', b.type, 'value', b.value, 'language', b.language))
        FROM (
            SELECT type, value, language FROM bim_blocks WHERE entry_id = e.id ORDER BY idx
        ) b
    ), '[]') AS blocks
FROM bim_entries e
WHERE e.id = ?
"#;

pub struct BimStore {
    conn: Connection,
    tx_lock: Arc<Mutex<()>>,
    locks: Arc<NamedLocks>,
}

impl BimStore {
    /// Takes one connection from the ready pool for the lifetime of this
    /// store (one logical operation).
    pub fn new(pool: &Pool) -> Result<Self, StoreError> {
        Ok(BimStore {
            conn: pool.connect()?,
            tx_lock: pool.tx_lock(),
            locks: pool.locks(),
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Commits the open transaction. A failed commit is rolled back so
    /// the shared connection never stays inside a dead transaction.
    async fn commit(&self) -> Result<(), StoreError> {
        if let Err(e) = self.conn.execute("COMMIT", ()).await {
            let _ = self.conn.execute("ROLLBACK", ()).await;
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn list_entries(&self) -> Result<Vec<Entry>, StoreError> {
        let mut rows = self.conn.query(LIST_SQL, ()).await?;
        let mut entries = Vec::new();

        while let Some(row) = rows.next().await? {
            entries.push(Self::row_to_entry(&row)?);
        }

        Ok(entries)
    }

    pub async fn get_entry(&self, id: i64) -> Result<Option<Entry>, StoreError> {
        let mut rows = self.conn.query(GET_ONE_SQL, libsql::params![id]).await?;

        if let Some(row) = rows.next().await? {
            Ok(Some(Self::row_to_entry(&row)?))
        } else {
            Ok(None)
        }
    }

    pub async fn create_entry(
        &self,
        title: &str,
        tags: &[String],
        blocks: &[Block],
    ) -> Result<Entry, StoreError> {
        let _tx_guard = self.tx_lock.lock().await;
        self.conn.execute("BEGIN TRANSACTION", ()).await?;

        let mut alloc = BlockAllocator::new(&self.conn, &self.locks);
        let result = self.create_entry_tx(&mut alloc, title, tags, blocks).await;

        let entry_id = match result {
            Ok(entry_id) => {
                self.commit().await?;
                entry_id
            }
            Err(e) => {
                let _ = self.conn.execute("ROLLBACK", ()).await;
                return Err(e);
            }
        };
        drop(alloc);

        self.get_entry(entry_id).await?.ok_or_else(|| {
            StoreError::Internal(format!("entry {entry_id} vanished after create"))
        })
    }

    async fn create_entry_tx(
        &self,
        alloc: &mut BlockAllocator<'_>,
        title: &str,
        tags: &[String],
        blocks: &[Block],
    ) -> Result<i64, StoreError> {
        let tags_json = serde_json::to_string(tags)?;

        let mut rows = self
            .conn
            .query(
                "INSERT INTO bim_entries (title, tags) VALUES (?, ?) RETURNING id",
                libsql::params![title, tags_json],
            )
            .await?;

        let entry_id: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => return Err(StoreError::Internal("failed to create entry".to_string())),
        };

        for (idx, block) in blocks.iter().enumerate() {
            alloc.insert(entry_id, idx as i64, block).await?;
        }

        Ok(entry_id)
    }

    /// Full replace: title and tags are overwritten and the whole block
    /// list is deleted and reinserted. Returns `None` when the entry does
    /// not exist.
    pub async fn replace_entry(
        &self,
        id: i64,
        title: &str,
        tags: &[String],
        blocks: &[Block],
    ) -> Result<Option<Entry>, StoreError> {
        if !self.entry_exists(id).await? {
            return Ok(None);
        }

        let _tx_guard = self.tx_lock.lock().await;
        self.conn.execute("BEGIN TRANSACTION", ()).await?;

        let mut alloc = BlockAllocator::new(&self.conn, &self.locks);
        let result = self.replace_entry_tx(&mut alloc, id, title, tags, blocks).await;

        match result {
            Ok(()) => {
                self.commit().await?;
            }
            Err(e) => {
                let _ = self.conn.execute("ROLLBACK", ()).await;
                return Err(e);
            }
        }
        drop(alloc);

        self.get_entry(id).await
    }

    async fn replace_entry_tx(
        &self,
        alloc: &mut BlockAllocator<'_>,
        id: i64,
        title: &str,
        tags: &[String],
        blocks: &[Block],
    ) -> Result<(), StoreError> {
        let tags_json = serde_json::to_string(tags)?;

        self.conn
            .execute(
                "UPDATE bim_entries SET title = ?, tags = ? WHERE id = ?",
                libsql::params![title, tags_json, id],
            )
            .await?;
        self.conn
            .execute("DELETE FROM bim_blocks WHERE entry_id = ?", libsql::params![id])
            .await?;

        for (idx, block) in blocks.iter().enumerate() {
            alloc.insert(id, idx as i64, block).await?;
        }

        Ok(())
    }

    /// Partial update. Absent fields keep their current values; a present
    /// block list goes through the same delete-then-reinsert as replace.
    pub async fn patch_entry(&self, id: i64, patch: EntryPatch) -> Result<Option<Entry>, StoreError> {
        match self.get_entry(id).await? {
            Some(current) => Ok(Some(self.apply_patch(current, patch).await?)),
            None => Ok(None),
        }
    }

    /// Applies a patch against an already-loaded entry, so a caller that
    /// read it for an existence check does not pay a second read.
    pub async fn apply_patch(&self, current: Entry, patch: EntryPatch) -> Result<Entry, StoreError> {
        let id = current.id;
        let title = patch.title.unwrap_or(current.title);
        let tags = patch.tags.unwrap_or(current.tags);

        let _tx_guard = self.tx_lock.lock().await;
        self.conn.execute("BEGIN TRANSACTION", ()).await?;

        let mut alloc = BlockAllocator::new(&self.conn, &self.locks);
        let result = async {
            let tags_json = serde_json::to_string(&tags)?;
            self.conn
                .execute(
                    "UPDATE bim_entries SET title = ?, tags = ? WHERE id = ?",
                    libsql::params![title.clone(), tags_json, id],
                )
                .await?;

            if let Some(blocks) = &patch.blocks {
                self.conn
                    .execute("DELETE FROM bim_blocks WHERE entry_id = ?", libsql::params![id])
                    .await?;
                for (idx, block) in blocks.iter().enumerate() {
                    alloc.insert(id, idx as i64, block).await?;
                }
            }

            Ok::<(), StoreError>(())
        }
        .await;

        match result {
            Ok(()) => {
                self.commit().await?;
            }
            Err(e) => {
                let _ = self.conn.execute("ROLLBACK", ()).await;
                return Err(e);
            }
        }
        drop(alloc);

        self.get_entry(id).await?.ok_or_else(|| {
            StoreError::Internal(format!("entry {id} vanished after patch"))
        })
    }

    /// Deletes the entry and all of its blocks. A missing entry is a
    /// no-op, not an error.
    pub async fn delete_entry(&self, id: i64) -> Result<(), StoreError> {
        let _tx_guard = self.tx_lock.lock().await;
        self.conn.execute("BEGIN TRANSACTION", ()).await?;

        let result = async {
            self.conn
                .execute("DELETE FROM bim_blocks WHERE entry_id = ?", libsql::params![id])
                .await?;
            self.conn
                .execute("DELETE FROM bim_entries WHERE id = ?", libsql::params![id])
                .await?;
            Ok::<(), StoreError>(())
        }
        .await;

        match result {
            Ok(()) => {
                self.commit().await?;
                Ok(())
            }
            Err(e) => {
                let _ = self.conn.execute("ROLLBACK", ()).await;
                Err(e)
            }
        }
    }

    async fn entry_exists(&self, id: i64) -> Result<bool, StoreError> {
        let mut rows = self
            .conn
            .query("SELECT id FROM bim_entries WHERE id = ?", libsql::params![id])
            .await?;
        Ok(rows.next().await?.is_some())
    }

    fn row_to_entry(row: &libsql::Row) -> Result<Entry, StoreError> {
        let tags_json: String = row.get(3)?;
        let blocks_json: String = row.get(4)?;

        // Both columns are produced database-side as JSON text; idx order
        // is baked into the blocks array before it leaves the store.
        let tags: Vec<String> = serde_json::from_str(&tags_json)?;
        let blocks: Vec<Block> = serde_json::from_str(&blocks_json)?;

        Ok(Entry {
            id: row.get(0)?,
            title: row.get(1)?,
            created_at: row.get(2)?,
            tags,
            blocks,
        })
    }
}
