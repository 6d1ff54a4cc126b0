//! SQLite persistence shared by the checkpoint store and the order store.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

/// Async-safe handle to the database.
///
/// Wraps [`Database`] behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`. The single mutex also makes the
/// connection the only writer, so checkpoint appends for an order are ordered.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<Database>>,
}

impl DbHandle {
    pub fn new(db: Database) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Open (or create) the database file and wrap it.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(Database::new(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(Database::new_in_memory()?))
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Database) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&mut guard)
        })
        .await
        .context("DB task panicked")?
    }
}

/// A stored checkpoint row with the state still encoded.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointRow {
    pub order_id: String,
    pub seq: u64,
    pub stage: Option<String>,
    pub status: String,
    pub state_json: String,
    pub created_at: String,
}

/// Result of an append attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    Rejected { latest: u64 },
}

pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init(true)?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init(false)?;
        Ok(db)
    }

    fn init(&self, durable: bool) -> Result<()> {
        if durable {
            let mode: String = self
                .conn
                .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
                .context("Failed to enable WAL")?;
            tracing::debug!(journal_mode = %mode, "SQLite journal mode");
            self.conn
                .pragma_update(None, "synchronous", "FULL")
                .context("Failed to set synchronous=FULL")?;
        }
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS checkpoints (
                    order_id TEXT NOT NULL,
                    seq INTEGER NOT NULL,
                    stage TEXT,
                    status TEXT NOT NULL,
                    state TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                    PRIMARY KEY (order_id, seq)
                );

                CREATE TABLE IF NOT EXISTS orders (
                    order_id TEXT PRIMARY KEY,
                    status TEXT NOT NULL,
                    record TEXT NOT NULL,
                    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
                );

                CREATE INDEX IF NOT EXISTS idx_checkpoints_status ON checkpoints(status);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Checkpoints ───────────────────────────────────────────────────

    /// Append a checkpoint if `seq` is strictly after the latest stored one.
    pub fn append_checkpoint(
        &mut self,
        order_id: &str,
        seq: u64,
        stage: Option<&str>,
        status: &str,
        state_json: &str,
    ) -> Result<AppendOutcome> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin checkpoint transaction")?;

        let latest: Option<i64> = tx
            .query_row(
                "SELECT MAX(seq) FROM checkpoints WHERE order_id = ?1",
                params![order_id],
                |row| row.get(0),
            )
            .context("Failed to read latest checkpoint sequence")?;

        if let Some(latest) = latest.map(|l| l as u64) {
            if seq <= latest {
                return Ok(AppendOutcome::Rejected { latest });
            }
        }

        tx.execute(
            "INSERT INTO checkpoints (order_id, seq, stage, status, state) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![order_id, seq as i64, stage, status, state_json],
        )
        .context("Failed to insert checkpoint")?;
        tx.commit().context("Failed to commit checkpoint")?;
        Ok(AppendOutcome::Appended)
    }

    pub fn latest_checkpoint(&self, order_id: &str) -> Result<Option<CheckpointRow>> {
        self.conn
            .query_row(
                "SELECT order_id, seq, stage, status, state, created_at FROM checkpoints
                 WHERE order_id = ?1 ORDER BY seq DESC LIMIT 1",
                params![order_id],
                read_checkpoint_row,
            )
            .optional()
            .context("Failed to query latest checkpoint")
    }

    pub fn checkpoint_at(&self, order_id: &str, seq: u64) -> Result<Option<CheckpointRow>> {
        self.conn
            .query_row(
                "SELECT order_id, seq, stage, status, state, created_at FROM checkpoints
                 WHERE order_id = ?1 AND seq = ?2",
                params![order_id, seq as i64],
                read_checkpoint_row,
            )
            .optional()
            .context("Failed to query checkpoint")
    }

    pub fn checkpoint_history(&self, order_id: &str) -> Result<Vec<CheckpointRow>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT order_id, seq, stage, status, state, created_at FROM checkpoints
                 WHERE order_id = ?1 ORDER BY seq ASC",
            )
            .context("Failed to prepare checkpoint_history")?;
        let rows = stmt
            .query_map(params![order_id], read_checkpoint_row)
            .context("Failed to query checkpoint history")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read checkpoint row")
    }

    /// Orders whose most recent checkpoint is still running.
    pub fn active_order_ids(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT c.order_id FROM checkpoints c
                 JOIN (SELECT order_id, MAX(seq) AS latest FROM checkpoints GROUP BY order_id) l
                   ON c.order_id = l.order_id AND c.seq = l.latest
                 WHERE c.status = 'running'
                 ORDER BY c.order_id",
            )
            .context("Failed to prepare active_order_ids")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("Failed to query active orders")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read active order row")
    }

    // ── Orders ────────────────────────────────────────────────────────

    pub fn upsert_order(&self, order_id: &str, status: &str, record_json: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO orders (order_id, status, record) VALUES (?1, ?2, ?3)
                 ON CONFLICT(order_id) DO UPDATE SET
                    status = excluded.status,
                    record = excluded.record,
                    updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
                params![order_id, status, record_json],
            )
            .context("Failed to upsert order")?;
        Ok(())
    }

    pub fn get_order(&self, order_id: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT record FROM orders WHERE order_id = ?1",
                params![order_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query order")
    }

    pub fn list_orders(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT record FROM orders ORDER BY order_id")
            .context("Failed to prepare list_orders")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("Failed to query orders")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read order row")
    }

    pub fn delete_order(&self, order_id: &str) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM orders WHERE order_id = ?1", params![order_id])
            .context("Failed to delete order")?;
        Ok(affected > 0)
    }
}

fn read_checkpoint_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CheckpointRow> {
    Ok(CheckpointRow {
        order_id: row.get(0)?,
        seq: row.get::<_, i64>(1)? as u64,
        stage: row.get(2)?,
        status: row.get(3)?,
        state_json: row.get(4)?,
        created_at: row.get(5)?,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_create_tables() -> Result<()> {
        let db = Database::new_in_memory()?;
        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('checkpoints', 'orders')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 2);
        Ok(())
    }

    #[test]
    fn test_append_rejects_stale_sequence() -> Result<()> {
        let mut db = Database::new_in_memory()?;
        assert_eq!(
            db.append_checkpoint("A-1", 0, None, "running", "{}")?,
            AppendOutcome::Appended
        );
        assert_eq!(
            db.append_checkpoint("A-1", 1, Some("write_draft"), "running", "{}")?,
            AppendOutcome::Appended
        );
        assert_eq!(
            db.append_checkpoint("A-1", 1, Some("write_draft"), "running", "{\"x\":1}")?,
            AppendOutcome::Rejected { latest: 1 }
        );
        assert_eq!(
            db.append_checkpoint("A-1", 0, None, "running", "{}")?,
            AppendOutcome::Rejected { latest: 1 }
        );

        let latest = db.latest_checkpoint("A-1")?.expect("latest");
        assert_eq!(latest.seq, 1);
        assert_eq!(latest.state_json, "{}");
        Ok(())
    }

    #[test]
    fn test_sequences_are_per_order() -> Result<()> {
        let mut db = Database::new_in_memory()?;
        db.append_checkpoint("A-1", 0, None, "running", "{}")?;
        db.append_checkpoint("A-1", 1, Some("s"), "running", "{}")?;
        assert_eq!(
            db.append_checkpoint("B-2", 0, None, "running", "{}")?,
            AppendOutcome::Appended
        );
        assert_eq!(db.checkpoint_history("A-1")?.len(), 2);
        assert_eq!(db.checkpoint_history("B-2")?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_active_orders_use_latest_status() -> Result<()> {
        let mut db = Database::new_in_memory()?;
        db.append_checkpoint("A-1", 0, None, "running", "{}")?;
        db.append_checkpoint("A-1", 1, Some("finish"), "completed", "{}")?;
        db.append_checkpoint("B-2", 0, None, "running", "{}")?;
        db.append_checkpoint("B-2", 1, Some("write_draft"), "running", "{}")?;
        db.append_checkpoint("C-3", 0, None, "running", "{}")?;
        db.append_checkpoint("C-3", 1, None, "failed", "{}")?;

        assert_eq!(db.active_order_ids()?, vec!["B-2".to_string()]);
        Ok(())
    }

    #[test]
    fn test_order_upsert_and_delete() -> Result<()> {
        let db = Database::new_in_memory()?;
        db.upsert_order("A-1", "running", "{\"v\":1}")?;
        db.upsert_order("A-1", "completed", "{\"v\":2}")?;
        assert_eq!(db.get_order("A-1")?.as_deref(), Some("{\"v\":2}"));
        assert_eq!(db.list_orders()?.len(), 1);
        assert!(db.delete_order("A-1")?);
        assert!(!db.delete_order("A-1")?);
        assert!(db.get_order("A-1")?.is_none());
        Ok(())
    }

    #[test]
    fn test_file_database_survives_reopen() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("nested").join("draftline.db");
        {
            let mut db = Database::new(&path)?;
            db.append_checkpoint("A-1", 0, None, "running", "{\"a\":1}")?;
        }
        let db = Database::new(&path)?;
        let row = db.checkpoint_at("A-1", 0)?.expect("row after reopen");
        assert_eq!(row.state_json, "{\"a\":1}");
        Ok(())
    }
}
