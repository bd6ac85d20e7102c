// Durable work queue - SQLite-backed, at-least-once
//
// dequeue() leases the oldest visible item; an item whose lease runs out
// without ack() becomes visible again, so a crashed worker's item is redelivered.
// reject() parks an item permanently with its reason.

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::reconciliation::SyncItem;

const READY: &str = "ready";
const LEASED: &str = "leased";
const REJECTED: &str = "rejected";

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedItem {
    pub id: String,
    pub item: SyncItem,

    /// Deliveries so far, including this one
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedItem {
    pub id: String,
    pub reason: String,
    pub attempts: u32,
}

pub struct SqliteQueue {
    conn: Mutex<Connection>,
}

impl SqliteQueue {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> anyhow::Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_millis(250))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS sync_queue (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                payload TEXT NOT NULL,
                status TEXT NOT NULL,
                visible_at INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                reason TEXT,
                enqueued_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sync_queue_visible ON sync_queue(status, visible_at)",
            [],
        )?;

        Ok(SqliteQueue {
            conn: Mutex::new(conn),
        })
    }

    pub fn enqueue(&self, item: &SyncItem) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        let payload = serde_json::to_string(item)?;
        let now = Utc::now();

        self.conn.lock().execute(
            "INSERT INTO sync_queue (id, payload, status, visible_at, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, payload, READY, now.timestamp_millis(), now.to_rfc3339()],
        )?;

        debug!(id = %id, entity = %item.entity.key(), "enqueued");
        Ok(id)
    }

    /// Lease the oldest visible item for `lease`. Items whose payload no
    /// longer deserialises are rejected on the way, in the same transaction.
    pub fn dequeue(&self, lease: Duration) -> Result<Option<QueuedItem>, StoreError> {
        let now = Utc::now().timestamp_millis();
        let until = now + lease.as_millis() as i64;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let leased = loop {
            let row: Option<(String, String, u32)> = tx
                .query_row(
                    "SELECT id, payload, attempts FROM sync_queue
                     WHERE status != ?1 AND visible_at <= ?2
                     ORDER BY seq LIMIT 1",
                    params![REJECTED, now],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            let Some((id, payload, attempts)) = row else {
                break None;
            };

            match serde_json::from_str::<SyncItem>(&payload) {
                Ok(item) => {
                    tx.execute(
                        "UPDATE sync_queue SET status = ?1, visible_at = ?2, attempts = attempts + 1 WHERE id = ?3",
                        params![LEASED, until, id],
                    )?;
                    break Some(QueuedItem {
                        id,
                        item,
                        attempts: attempts + 1,
                    });
                }
                Err(err) => {
                    let reason = format!("unreadable payload: {}", err);
                    warn!(id = %id, reason = %reason, "rejecting queue item");
                    tx.execute(
                        "UPDATE sync_queue SET status = ?1, reason = ?2, attempts = attempts + 1 WHERE id = ?3",
                        params![REJECTED, reason, id],
                    )?;
                }
            }
        };

        tx.commit()?;
        Ok(leased)
    }

    /// Processed; remove for good
    pub fn ack(&self, id: &str) -> Result<(), StoreError> {
        self.conn
            .lock()
            .execute("DELETE FROM sync_queue WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Make the item visible again immediately
    pub fn release(&self, id: &str) -> Result<(), StoreError> {
        self.conn.lock().execute(
            "UPDATE sync_queue SET status = ?1, visible_at = ?2 WHERE id = ?3 AND status != ?4",
            params![READY, Utc::now().timestamp_millis(), id, REJECTED],
        )?;
        Ok(())
    }

    pub fn reject(&self, id: &str, reason: &str) -> Result<(), StoreError> {
        warn!(id = %id, reason = %reason, "rejecting queue item");
        self.conn.lock().execute(
            "UPDATE sync_queue SET status = ?1, reason = ?2 WHERE id = ?3",
            params![REJECTED, reason, id],
        )?;
        Ok(())
    }

    /// Items still to be processed (ready or leased)
    pub fn depth(&self) -> Result<usize, StoreError> {
        let count: i64 = self.conn.lock().query_row(
            "SELECT COUNT(*) FROM sync_queue WHERE status != ?1",
            params![REJECTED],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn rejected(&self) -> Result<Vec<RejectedItem>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, COALESCE(reason, ''), attempts FROM sync_queue WHERE status = ?1 ORDER BY seq",
        )?;
        let items = stmt
            .query_map(params![REJECTED], |row| {
                Ok(RejectedItem {
                    id: row.get(0)?,
                    reason: row.get(1)?,
                    attempts: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }
}
