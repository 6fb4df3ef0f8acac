//! Collision-safe insertion for the blocks table.
//!
//! Block ids come from the `bim_sequences` counter row, which can drift
//! below the true stored maximum after external restores or explicit-id
//! inserts. The allocator detects the resulting primary-key collision and
//! recovers: repair the counter and retry once, then fall back to explicit
//! allocation under an advisory lock. Only the id collision is handled
//! here; every other database error propagates to the caller and aborts
//! the surrounding transaction.

use libsql::Connection;
use tokio::sync::OwnedMutexGuard;

use crate::db::NamedLocks;

use super::{Block, StoreError};

/// Counter row name for the blocks table.
const BLOCKS_SEQUENCE: &str = "bim_blocks";

/// Advisory lock key serializing concurrent fallback allocations. Only
/// taken on the slow path, so the common case carries no locking cost.
const ALLOC_LOCK_KEY: &str = "bim.blocks.id";

/// Widening offsets for the explicit-id attempts. A race-avoidance
/// heuristic, not a guarantee.
const FALLBACK_OFFSETS: [i64; 3] = [0, 10, 100];

const INSERT_SQL: &str =
    "INSERT INTO bim_blocks (id, entry_id, idx, type, value, language) VALUES (?, ?, ?, ?, ?, ?)";

/// Per-transaction block inserter. Construct one after `BEGIN`, drop it
/// after `COMMIT`/`ROLLBACK`; a fallback advisory-lock guard acquired along
/// the way lives exactly that long.
pub struct BlockAllocator<'a> {
    conn: &'a Connection,
    locks: &'a NamedLocks,
    fallback_guard: Option<OwnedMutexGuard<()>>,
}

impl<'a> BlockAllocator<'a> {
    pub fn new(conn: &'a Connection, locks: &'a NamedLocks) -> Self {
        BlockAllocator {
            conn,
            locks,
            fallback_guard: None,
        }
    }

    /// Inserts one normalized block row with a unique id, resolving
    /// counter drift if the fast path collides.
    pub async fn insert(
        &mut self,
        entry_id: i64,
        idx: i64,
        block: &Block,
    ) -> Result<i64, StoreError> {
        // Fast path: the counter assigns the id.
        if let Some(id) = self.next_counter_value().await? {
            match self.insert_row(id, entry_id, idx, block).await {
                Ok(()) => return Ok(id),
                Err(e) if is_block_id_collision(&e) => {
                    tracing::warn!(id, entry_id, "block id collision, repairing counter drift");
                }
                Err(e) => return Err(e.into()),
            }

            // Counter repair: bring the counter past the stored maximum
            // and retry exactly once. Never moves the counter backwards.
            let next = self.max_stored_id().await? + 1;
            self.conn
                .execute(
                    "UPDATE bim_sequences SET next_id = MAX(next_id, ?) WHERE name = ?",
                    libsql::params![next, BLOCKS_SEQUENCE],
                )
                .await?;
            tracing::info!(next, "block id counter repaired");

            if let Some(id) = self.next_counter_value().await? {
                match self.insert_row(id, entry_id, idx, block).await {
                    Ok(()) => return Ok(id),
                    Err(e) if is_block_id_collision(&e) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        self.insert_fallback(entry_id, idx, block).await
    }

    /// Explicit allocation under the advisory lock: probe past both the
    /// stored maximum and the counter, widening on each collision.
    async fn insert_fallback(
        &mut self,
        entry_id: i64,
        idx: i64,
        block: &Block,
    ) -> Result<i64, StoreError> {
        if self.fallback_guard.is_none() {
            self.fallback_guard = Some(self.locks.acquire(ALLOC_LOCK_KEY).await);
        }

        let max_id = self.max_stored_id().await?;
        let counter = self.counter_value().await?.unwrap_or(0);
        let candidate = max_id.max(counter) + 1;

        for offset in FALLBACK_OFFSETS {
            let id = candidate + offset;
            match self.insert_row(id, entry_id, idx, block).await {
                Ok(()) => {
                    tracing::warn!(id, entry_id, "allocated block id via fallback");
                    return Ok(id);
                }
                Err(e) if is_block_id_collision(&e) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(StoreError::AllocationExhausted)
    }

    async fn insert_row(
        &self,
        id: i64,
        entry_id: i64,
        idx: i64,
        block: &Block,
    ) -> Result<(), libsql::Error> {
        self.conn
            .execute(
                INSERT_SQL,
                libsql::params![
                    id,
                    entry_id,
                    idx,
                    block.block_type.as_str(),
                    block.value.clone(),
                    block.language.clone()
                ],
            )
            .await
            .map(|_| ())
    }

    /// Draws the next id from the counter, or `None` when no counter row
    /// is bound to the blocks table.
    async fn next_counter_value(&self) -> Result<Option<i64>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "UPDATE bim_sequences SET next_id = next_id + 1 WHERE name = ? RETURNING next_id - 1",
                libsql::params![BLOCKS_SEQUENCE],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    async fn counter_value(&self) -> Result<Option<i64>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT next_id FROM bim_sequences WHERE name = ?",
                libsql::params![BLOCKS_SEQUENCE],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    async fn max_stored_id(&self) -> Result<i64, StoreError> {
        let mut rows = self
            .conn
            .query("SELECT COALESCE(MAX(id), 0) FROM bim_blocks", ())
            .await?;

        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(0),
        }
    }
}

/// True only for a primary-key collision on `bim_blocks.id`. The
/// composite `(entry_id, idx)` violation lists `bim_blocks.idx`, which
/// this must not match.
fn is_block_id_collision(err: &libsql::Error) -> bool {
    let msg = err.to_string();
    msg.contains("UNIQUE constraint failed: bim_blocks.id") && !msg.contains("bim_blocks.idx")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bim::BlockType;
    use crate::db::test_support::memory_pool;
    use crate::db::Pool;

    fn block(value: &str) -> Block {
        Block {
            block_type: BlockType::Text,
            value: value.to_string(),
            language: None,
        }
    }

    async fn seeded_entry(conn: &Connection) -> i64 {
        let mut rows = conn
            .query(
                "INSERT INTO bim_entries (title, tags) VALUES ('t', '[]') RETURNING id",
                (),
            )
            .await
            .unwrap();
        rows.next().await.unwrap().unwrap().get(0).unwrap()
    }

    async fn stored_ids(conn: &Connection) -> Vec<i64> {
        let mut rows = conn
            .query("SELECT id FROM bim_blocks ORDER BY id", ())
            .await
            .unwrap();
        let mut ids = Vec::new();
        while let Some(row) = rows.next().await.unwrap() {
            ids.push(row.get::<i64>(0).unwrap());
        }
        ids
    }

    async fn setup() -> (Pool, Connection, i64) {
        let pool = memory_pool().await;
        let conn = pool.connect().unwrap();
        let entry_id = seeded_entry(&conn).await;
        (pool, conn, entry_id)
    }

    #[tokio::test]
    async fn fast_path_hands_out_sequential_ids() {
        let (pool, conn, entry_id) = setup().await;
        let locks = pool.locks();
        let mut alloc = BlockAllocator::new(&conn, &locks);

        let a = alloc.insert(entry_id, 0, &block("a")).await.unwrap();
        let b = alloc.insert(entry_id, 1, &block("b")).await.unwrap();

        assert_eq!(b, a + 1);
        assert_eq!(stored_ids(&conn).await, vec![a, b]);
    }

    #[tokio::test]
    async fn repairs_counter_wound_below_stored_maximum() {
        let (pool, conn, entry_id) = setup().await;
        let locks = pool.locks();
        let mut alloc = BlockAllocator::new(&conn, &locks);

        for idx in 0..3 {
            alloc.insert(entry_id, idx, &block("x")).await.unwrap();
        }

        // Simulate drift: the counter falls back behind the stored rows.
        conn.execute("UPDATE bim_sequences SET next_id = 1 WHERE name = 'bim_blocks'", ())
            .await
            .unwrap();

        let id = alloc.insert(entry_id, 3, &block("y")).await.unwrap();
        assert_eq!(id, 4, "repair should continue past the stored maximum");

        // The counter is consistent again afterwards.
        let next = alloc.counter_value().await.unwrap().unwrap();
        assert_eq!(next, 5);
    }

    #[tokio::test]
    async fn survives_external_explicit_id_insert() {
        let (pool, conn, entry_id) = setup().await;
        let locks = pool.locks();
        let mut alloc = BlockAllocator::new(&conn, &locks);

        alloc.insert(entry_id, 0, &block("a")).await.unwrap();

        // A row restored out-of-band far above the counter.
        conn.execute(
            "INSERT INTO bim_blocks (id, entry_id, idx, type, value, language) VALUES (500, ?, 1, 'text', 'alien', NULL)",
            libsql::params![entry_id],
        )
        .await
        .unwrap();
        // And the counter wound onto the occupied id.
        conn.execute(
            "UPDATE bim_sequences SET next_id = 500 WHERE name = 'bim_blocks'",
            (),
        )
        .await
        .unwrap();

        let id = alloc.insert(entry_id, 2, &block("b")).await.unwrap();
        assert_eq!(id, 501);
    }

    #[tokio::test]
    async fn falls_back_when_counter_row_is_missing() {
        let (pool, conn, entry_id) = setup().await;
        let locks = pool.locks();
        let mut alloc = BlockAllocator::new(&conn, &locks);

        alloc.insert(entry_id, 0, &block("a")).await.unwrap();
        conn.execute("DELETE FROM bim_sequences WHERE name = 'bim_blocks'", ())
            .await
            .unwrap();

        let id = alloc.insert(entry_id, 1, &block("b")).await.unwrap();
        assert_eq!(id, 2, "fallback allocates just past the stored maximum");
        assert!(
            alloc.fallback_guard.is_some(),
            "fallback holds the advisory lock for the rest of the transaction"
        );
    }

    #[tokio::test]
    async fn only_id_collisions_are_intercepted() {
        let (pool, conn, entry_id) = setup().await;
        let locks = pool.locks();
        let mut alloc = BlockAllocator::new(&conn, &locks);

        alloc.insert(entry_id, 0, &block("a")).await.unwrap();

        // Duplicate idx violates the composite constraint; that error must
        // propagate, not trigger recovery.
        let err = alloc.insert(entry_id, 0, &block("b")).await.unwrap_err();
        match err {
            StoreError::Db(e) => {
                assert!(!is_block_id_collision(&e));
                assert!(e.to_string().contains("UNIQUE constraint failed"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
