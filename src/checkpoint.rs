//! Stream resume position tracking
//!
//! The stream reports a cursor with every event. Persisting each one would put a
//! write on every event, so a checkpoint is only written once the cursor has
//! moved more than `threshold` past the last persisted value. After a crash the
//! stream resumes up to `threshold` behind where it really was; event
//! application is idempotent, so the replay only overwrites rows with the same
//! values.
//!
//! Checkpoints form an append-only log. Each write prunes entries older than
//! the retention window, so the table stays small but a recent position always
//! survives.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::db::{cursor, LedgerDb};
use crate::error::LedgerError;

pub struct CursorCheckpointStore {
    db: Arc<LedgerDb>,
    threshold: i64,
    retention: Duration,
    last_persisted: Option<i64>,
}

impl CursorCheckpointStore {
    /// Open the store, picking up the newest persisted cursor
    pub fn open(db: Arc<LedgerDb>, threshold: i64, retention: Duration) -> Result<Self, LedgerError> {
        let last_persisted = db.with_conn(|conn| cursor::latest_cursor(conn))?;
        debug!(cursor = ?last_persisted, "Loaded latest cursor checkpoint");

        Ok(Self {
            db,
            threshold,
            retention,
            last_persisted,
        })
    }

    pub fn last_persisted(&self) -> Option<i64> {
        self.last_persisted
    }

    /// Note a cursor reported by the stream. Returns true if a checkpoint was written.
    pub fn observe(&mut self, cursor: i64) -> Result<bool, LedgerError> {
        self.observe_at(cursor, chrono::Utc::now().timestamp_millis())
    }

    pub fn observe_at(&mut self, cursor: i64, now_ms: i64) -> Result<bool, LedgerError> {
        let due = match self.last_persisted {
            None => true,
            Some(last) => cursor.saturating_sub(last) > self.threshold,
        };
        if !due {
            return Ok(false);
        }

        let cutoff = now_ms.saturating_sub(self.retention.as_millis() as i64);
        let pruned = self.db.with_conn_mut(|conn| {
            let tx = conn
                .transaction()
                .map_err(|e| LedgerError::Database(format!("Transaction failed: {}", e)))?;
            cursor::insert_checkpoint(&tx, now_ms, cursor)?;
            let pruned = cursor::prune_checkpoints(&tx, cutoff)?;
            tx.commit()
                .map_err(|e| LedgerError::Database(format!("Commit failed: {}", e)))?;
            Ok(pruned)
        })?;

        trace!(cursor, pruned, "Persisted cursor checkpoint");
        self.last_persisted = Some(cursor);
        Ok(true)
    }
}
