//! SQLite store for pallet records and the sync queue.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use kegwatch_pallet::PalletRecord;
use kegwatch_protocol::{DeliveryKey, PalletId, PalletState, TaskStatus};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use thiserror::Error;
use tracing::{debug, info};

/// Store failures. `Corruption` is fatal for that pallet and must surface
/// to the operator; it never panics the process.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("persisted state unreadable for pallet {pallet_id}: {detail}")]
    Corruption { pallet_id: String, detail: String },

    #[error("record has no pallet identity yet")]
    MissingIdentity,
}

/// One claimed delivery task.
#[derive(Debug, Clone)]
pub struct SyncTask {
    pub id: i64,
    pub pallet_id: PalletId,
    pub version: i64,
    pub delivery_key: DeliveryKey,
    pub payload_json: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub pending: i64,
    pub in_flight: i64,
    pub acked: i64,
    pub failed: i64,
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Handle to the station database.
#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

impl Store {
    /// Open (and create if missing) the station database file.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .busy_timeout(Duration::from_millis(5000));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// In-memory database for tests. Single connection, so every query
    /// sees the same memory.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(":memory:")
            .await?;
        Ok(Self { pool })
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kw_pallets (
                pallet_id TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                state TEXT NOT NULL,
                sync_status TEXT NOT NULL,
                running_total INTEGER NOT NULL,
                record_json TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                last_modified INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kw_sync_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pallet_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                delivery_key TEXT NOT NULL UNIQUE,
                payload_json TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                attempts INTEGER NOT NULL DEFAULT 0,
                next_attempt_at INTEGER NOT NULL,
                last_error TEXT,
                claimed_at INTEGER,
                acked_at INTEGER,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS ix_sync_queue_due \
             ON kw_sync_queue(status, next_attempt_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ========================================================================
    // Pallet records
    // ========================================================================

    /// Persist a record snapshot, bumping its monotonic version.
    /// Read-modify-write runs in one transaction.
    pub async fn save_record(&self, record: &PalletRecord) -> Result<i64, StoreError> {
        let pallet_id = record
            .pallet_id
            .as_ref()
            .ok_or(StoreError::MissingIdentity)?;

        let record_json = serde_json::to_string(record).map_err(|e| StoreError::Corruption {
            pallet_id: pallet_id.as_str().to_string(),
            detail: e.to_string(),
        })?;

        let mut tx = self.pool.begin().await?;
        let current: Option<i64> =
            sqlx::query_scalar("SELECT version FROM kw_pallets WHERE pallet_id = ?")
                .bind(pallet_id.as_str())
                .fetch_optional(&mut *tx)
                .await?;
        let version = current.unwrap_or(0) + 1;

        sqlx::query(
            r#"
            INSERT INTO kw_pallets
                (pallet_id, version, state, sync_status, running_total, record_json,
                 created_at, last_modified)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(pallet_id) DO UPDATE SET
                version = excluded.version,
                state = excluded.state,
                sync_status = excluded.sync_status,
                running_total = excluded.running_total,
                record_json = excluded.record_json,
                last_modified = excluded.last_modified
            "#,
        )
        .bind(pallet_id.as_str())
        .bind(version)
        .bind(record.state.as_str())
        .bind(record.sync_status.as_str())
        .bind(record.running_total as i64)
        .bind(&record_json)
        .bind(record.created_at.timestamp_millis())
        .bind(now_millis())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(pallet_id = %pallet_id, version, state = %record.state, "record saved");
        Ok(version)
    }

    /// Load a record and its current version.
    pub async fn load_record(
        &self,
        pallet_id: &PalletId,
    ) -> Result<Option<(PalletRecord, i64)>, StoreError> {
        let row = sqlx::query("SELECT record_json, version FROM kw_pallets WHERE pallet_id = ?")
            .bind(pallet_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let json: String = row.try_get("record_json")?;
        let version: i64 = row.try_get("version")?;
        let record = parse_record(pallet_id.as_str(), &json)?;
        Ok(Some((record, version)))
    }

    /// Records in non-terminal states, for rehydration at startup.
    pub async fn load_active_records(&self) -> Result<Vec<(PalletRecord, i64)>, StoreError> {
        let rows = sqlx::query(
            "SELECT pallet_id, record_json, version FROM kw_pallets \
             WHERE state NOT IN ('SYNCED', 'ABANDONED') \
             ORDER BY last_modified ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("pallet_id")?;
            let json: String = row.try_get("record_json")?;
            let version: i64 = row.try_get("version")?;
            records.push((parse_record(&id, &json)?, version));
        }
        Ok(records)
    }

    /// Counts of stored pallets by lifecycle state.
    pub async fn count_pallets_by_state(
        &self,
    ) -> Result<HashMap<PalletState, i64>, StoreError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM kw_pallets GROUP BY state")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = HashMap::new();
        for row in rows {
            let state_raw: String = row.try_get("state")?;
            let n: i64 = row.try_get("n")?;
            if let Ok(state) = PalletState::from_str(&state_raw) {
                counts.insert(state, n);
            }
        }
        Ok(counts)
    }

    /// Did this pallet id ever reach an acked delivery? Used for the
    /// duplicate-completion warning.
    pub async fn was_synced(&self, pallet_id: &PalletId) -> Result<bool, StoreError> {
        let exists: i64 = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM kw_sync_queue WHERE pallet_id = ? AND status = 'ACKED')",
        )
        .bind(pallet_id.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(exists != 0)
    }

    // ========================================================================
    // Sync queue
    // ========================================================================

    /// Enqueue a delivery for a record version. Any earlier unresolved
    /// task for the same pallet is replaced, keeping at most one live
    /// task per pallet.
    pub async fn enqueue_delivery(
        &self,
        record: &PalletRecord,
        version: i64,
    ) -> Result<DeliveryKey, StoreError> {
        let pallet_id = record
            .pallet_id
            .as_ref()
            .ok_or(StoreError::MissingIdentity)?;
        let payload = record
            .cloud_payload(version)
            .ok_or(StoreError::MissingIdentity)?;
        let payload_json =
            serde_json::to_string(&payload).map_err(|e| StoreError::Corruption {
                pallet_id: pallet_id.as_str().to_string(),
                detail: e.to_string(),
            })?;
        let key = payload.delivery_key.clone();
        let now = now_millis();

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM kw_sync_queue WHERE pallet_id = ? AND status != 'ACKED'")
            .bind(pallet_id.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO kw_sync_queue
                (pallet_id, version, delivery_key, payload_json, status,
                 attempts, next_attempt_at, created_at)
            VALUES (?, ?, ?, ?, 'PENDING', 0, ?, ?)
            "#,
        )
        .bind(pallet_id.as_str())
        .bind(version)
        .bind(key.as_str())
        .bind(&payload_json)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(pallet_id = %pallet_id, version, key = %key, "delivery enqueued");
        Ok(key)
    }

    /// Atomically claim the next due task, moving it PENDING -> IN_FLIGHT.
    pub async fn claim_due_task(&self) -> Result<Option<SyncTask>, StoreError> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        let task_id: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM kw_sync_queue
            WHERE status = 'PENDING' AND next_attempt_at <= ?
            ORDER BY next_attempt_at ASC, id ASC
            LIMIT 1
            "#,
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(task_id) = task_id else {
            tx.commit().await?;
            return Ok(None);
        };

        let claimed = sqlx::query(
            "UPDATE kw_sync_queue SET status = 'IN_FLIGHT', claimed_at = ? \
             WHERE id = ? AND status = 'PENDING'",
        )
        .bind(now)
        .bind(task_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if claimed == 0 {
            tx.commit().await?;
            return Ok(None);
        }

        let row = sqlx::query(
            "SELECT id, pallet_id, version, delivery_key, payload_json, attempts \
             FROM kw_sync_queue WHERE id = ?",
        )
        .bind(task_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        let pallet_raw: String = row.try_get("pallet_id")?;
        let pallet_id = PalletId::parse(&pallet_raw).ok_or_else(|| StoreError::Corruption {
            pallet_id: pallet_raw.clone(),
            detail: "empty pallet id in queue row".to_string(),
        })?;
        let attempts: i64 = row.try_get("attempts")?;

        Ok(Some(SyncTask {
            id: row.try_get("id")?,
            pallet_id,
            version: row.try_get("version")?,
            delivery_key: DeliveryKey::from_raw(row.try_get::<String, _>("delivery_key")?),
            payload_json: row.try_get("payload_json")?,
            attempts: attempts.max(0) as u32,
        }))
    }

    /// Cloud acknowledged: retire the task. The caller persists the
    /// record's own Synced transition separately via `save_record`.
    pub async fn ack_task(&self, task_id: i64) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE kw_sync_queue SET status = 'ACKED', acked_at = ?, last_error = NULL \
             WHERE id = ?",
        )
        .bind(now_millis())
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Transient failure: return the task to PENDING with a future due
    /// time and the bumped attempt count.
    pub async fn retry_task(
        &self,
        task_id: i64,
        attempts: u32,
        next_attempt_at: i64,
        error: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE kw_sync_queue SET status = 'PENDING', attempts = ?, \
             next_attempt_at = ?, last_error = ?, claimed_at = NULL WHERE id = ?",
        )
        .bind(attempts as i64)
        .bind(next_attempt_at)
        .bind(error)
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Retry budget exhausted: park the task for manual resync. Never
    /// deleted here - losing the payload would break at-least-once.
    pub async fn fail_task(&self, task_id: i64, error: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE kw_sync_queue SET status = 'FAILED', last_error = ?, claimed_at = NULL \
             WHERE id = ?",
        )
        .bind(error)
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Operator-requested resync of a failed delivery. Returns false if
    /// there was nothing to re-arm.
    pub async fn resync(&self, pallet_id: &PalletId) -> Result<bool, StoreError> {
        let affected = sqlx::query(
            "UPDATE kw_sync_queue SET status = 'PENDING', attempts = 0, \
             next_attempt_at = ?, last_error = NULL WHERE pallet_id = ? AND status = 'FAILED'",
        )
        .bind(now_millis())
        .bind(pallet_id.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    /// Is there an unresolved (pending/in-flight/failed) task for this
    /// pallet?
    pub async fn has_unresolved_task(&self, pallet_id: &PalletId) -> Result<bool, StoreError> {
        let exists: i64 = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM kw_sync_queue WHERE pallet_id = ? \
             AND status IN ('PENDING', 'IN_FLIGHT', 'FAILED'))",
        )
        .bind(pallet_id.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(exists != 0)
    }

    /// Queue statistics for the operator status view.
    pub async fn queue_stats(&self) -> Result<QueueStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'PENDING') AS pending,
                COUNT(*) FILTER (WHERE status = 'IN_FLIGHT') AS in_flight,
                COUNT(*) FILTER (WHERE status = 'ACKED') AS acked,
                COUNT(*) FILTER (WHERE status = 'FAILED') AS failed
            FROM kw_sync_queue
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(QueueStats {
            pending: row.try_get("pending")?,
            in_flight: row.try_get("in_flight")?,
            acked: row.try_get("acked")?,
            failed: row.try_get("failed")?,
        })
    }

    /// Status of the most recent task for a pallet, if any.
    pub async fn task_status(
        &self,
        pallet_id: &PalletId,
    ) -> Result<Option<TaskStatus>, StoreError> {
        let raw: Option<String> = sqlx::query_scalar(
            "SELECT status FROM kw_sync_queue WHERE pallet_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(pallet_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(raw.and_then(|s| TaskStatus::from_str(&s).ok()))
    }

    // ========================================================================
    // Recovery hooks
    // ========================================================================

    /// Tasks claimed but never resolved (crash mid-delivery) go back to
    /// PENDING, attempts and delivery key intact.
    pub(crate) async fn reset_in_flight(&self) -> Result<u64, StoreError> {
        let affected = sqlx::query(
            "UPDATE kw_sync_queue SET status = 'PENDING', claimed_at = NULL, \
             next_attempt_at = ? WHERE status = 'IN_FLIGHT'",
        )
        .bind(now_millis())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected)
    }

    /// Complete-but-unsynced records, for recovery re-enqueueing.
    pub(crate) async fn complete_unsynced(
        &self,
    ) -> Result<Vec<(PalletRecord, i64)>, StoreError> {
        let rows = sqlx::query(
            "SELECT pallet_id, record_json, version FROM kw_pallets \
             WHERE state = 'COMPLETE' AND sync_status != 'SYNCED'",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("pallet_id")?;
            let json: String = row.try_get("record_json")?;
            let version: i64 = row.try_get("version")?;
            records.push((parse_record(&id, &json)?, version));
        }
        Ok(records)
    }

    /// Drop failed tasks older than the retention cutoff.
    pub(crate) async fn purge_failed_before(&self, cutoff: i64) -> Result<u64, StoreError> {
        let affected =
            sqlx::query("DELETE FROM kw_sync_queue WHERE status = 'FAILED' AND created_at < ?")
                .bind(cutoff)
                .execute(&self.pool)
                .await?
                .rows_affected();
        Ok(affected)
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

fn parse_record(pallet_id: &str, json: &str) -> Result<PalletRecord, StoreError> {
    serde_json::from_str(json).map_err(|e| StoreError::Corruption {
        pallet_id: pallet_id.to_string(),
        detail: e.to_string(),
    })
}
