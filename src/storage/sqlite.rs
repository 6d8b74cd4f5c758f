//! SQLite Persistent Storage for the Deposit Ledger
//!
//! Provides durable storage for deposit records that survives service restarts.
//! Uses connection pooling via r2d2 for concurrent access.

use async_trait::async_trait;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::time::Duration;

use super::traits::{validate_new_record, InsertOutcome, LedgerStore, StorageError, StorageResult};
use crate::types::deposit::{unix_now, DepositRecord, DepositStatus, LedgerStats};

/// How long a connection waits on a locked database before giving up
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed deposit ledger with connection pooling
pub struct SqliteLedgerStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteLedgerStore {
    /// Create a new store with the given database path
    ///
    /// Creates the database file and runs migrations if needed.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::Connection(e.to_string()))?;
            }
        }

        let manager = SqliteConnectionManager::file(db_path)
            .with_init(|conn| conn.busy_timeout(BUSY_TIMEOUT));
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations()?;

        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations()?;

        Ok(store)
    }

    /// Open a store from a `DATABASE_URL`-style string
    ///
    /// Accepts a plain path, a `sqlite://` prefixed path, or `:memory:`.
    pub fn open(database_url: &str) -> Result<Self, StorageError> {
        let path = database_url
            .strip_prefix("sqlite://")
            .or_else(|| database_url.strip_prefix("sqlite:"))
            .unwrap_or(database_url);

        if path == ":memory:" {
            Self::in_memory()
        } else {
            Self::new(path)
        }
    }

    /// Get a connection from the pool
    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StorageError> {
        self.pool
            .get()
            .map_err(|e| StorageError::Connection(e.to_string()))
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS deposits (
                signature TEXT PRIMARY KEY,
                sender TEXT NOT NULL,
                amount INTEGER NOT NULL CHECK (amount > 0),
                observed_at INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                payout_signature TEXT,
                payout_valid_until INTEGER,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_deposits_status ON deposits(status);
            CREATE INDEX IF NOT EXISTS idx_deposits_observed_at ON deposits(observed_at);
            "#,
        )
        .map_err(|e| StorageError::Database(e.to_string()))?;

        // Ledgers created before in-flight payouts were tracked
        let has_valid_until: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM pragma_table_info('deposits') WHERE name = 'payout_valid_until'",
                [],
                |row| row.get(0),
            )
            .map_err(|e| StorageError::Database(e.to_string()))?;
        if !has_valid_until {
            conn.execute("ALTER TABLE deposits ADD COLUMN payout_valid_until INTEGER", [])
                .map_err(|e| StorageError::Database(e.to_string()))?;
        }

        Ok(())
    }

    /// Convert a database row to DepositRecord
    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<DepositRecord> {
        let status_str: String = row.get("status")?;
        let status = status_str.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                e.into(),
            )
        })?;

        Ok(DepositRecord {
            signature: row.get("signature")?,
            sender: row.get("sender")?,
            amount: row.get::<_, i64>("amount")? as u64,
            observed_at: row.get("observed_at")?,
            status,
            payout_signature: row.get("payout_signature")?,
            payout_valid_until: row
                .get::<_, Option<i64>>("payout_valid_until")?
                .map(|v| v as u64),
            attempts: row.get::<_, i64>("attempts")? as u32,
            last_error: row.get("last_error")?,
            created_at: row.get::<_, i64>("created_at")? as u64,
            updated_at: row.get::<_, i64>("updated_at")? as u64,
        })
    }

    // Synchronous helper methods for the trait implementations

    fn insert_if_absent_sync(&self, record: &DepositRecord) -> Result<InsertOutcome, StorageError> {
        validate_new_record(record)?;
        let conn = self.conn()?;

        let rows_affected = conn
            .execute(
                r#"
            INSERT INTO deposits (
                signature, sender, amount, observed_at, status, payout_signature,
                payout_valid_until, attempts, last_error, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(signature) DO NOTHING
            "#,
                params![
                    record.signature,
                    record.sender,
                    record.amount as i64,
                    record.observed_at,
                    record.status.to_string(),
                    record.payout_signature,
                    record.payout_valid_until.map(|v| v as i64),
                    record.attempts as i64,
                    record.last_error,
                    record.created_at as i64,
                    record.updated_at as i64,
                ],
            )
            .map_err(|e| StorageError::Database(e.to_string()))?;

        if rows_affected == 0 {
            Ok(InsertOutcome::Duplicate)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }

    fn claim_pending_sync(&self, limit: usize) -> Result<Vec<DepositRecord>, StorageError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn()?;
        // IMMEDIATE takes the write lock up front so two claimers serialize here
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let candidates = {
            let mut stmt = tx
                .prepare(
                    r#"
                SELECT * FROM deposits
                WHERE status = 'pending'
                ORDER BY observed_at ASC, signature ASC
                LIMIT ?1
                "#,
                )
                .map_err(|e| StorageError::Database(e.to_string()))?;

            let rows = stmt
                .query_map(params![limit as i64], |row| Self::row_to_record(row))
                .map_err(|e| StorageError::Database(e.to_string()))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| StorageError::Database(e.to_string()))?;
            rows
        };

        let now = unix_now() as i64;
        let mut claimed = Vec::with_capacity(candidates.len());

        for mut record in candidates {
            let rows_affected = tx
                .execute(
                    r#"
                UPDATE deposits SET
                    status = 'in_progress',
                    attempts = attempts + 1,
                    updated_at = ?2
                WHERE signature = ?1 AND status = 'pending'
                "#,
                    params![record.signature, now],
                )
                .map_err(|e| StorageError::Database(e.to_string()))?;

            if rows_affected == 1 {
                record.mark_claimed();
                claimed.push(record);
            }
        }

        tx.commit()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(claimed)
    }

    fn record_payout_sync(
        &self,
        signatures: &[String],
        payout_signature: &str,
        valid_until: u64,
    ) -> Result<(), StorageError> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| StorageError::Database(e.to_string()))?;
        let now = unix_now() as i64;

        for signature in signatures {
            let rows_affected = tx
                .execute(
                    r#"
                UPDATE deposits SET
                    payout_signature = ?2,
                    payout_valid_until = ?3,
                    updated_at = ?4
                WHERE signature = ?1 AND status = 'in_progress' AND payout_signature IS NULL
                "#,
                    params![signature, payout_signature, valid_until as i64, now],
                )
                .map_err(|e| StorageError::Database(e.to_string()))?;

            if rows_affected == 1 {
                continue;
            }

            // Dropping the transaction rolls back the records already updated
            let current = tx
                .query_row(
                    "SELECT status, payout_signature FROM deposits WHERE signature = ?1",
                    params![signature],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)),
                )
                .optional()
                .map_err(|e| StorageError::Database(e.to_string()))?;

            return Err(match current {
                None => StorageError::NotFound(signature.clone()),
                Some((status, _)) if status != "in_progress" => StorageError::InvalidTransition {
                    signature: signature.clone(),
                    from: status.parse().map_err(StorageError::InvalidData)?,
                    to: DepositStatus::InProgress,
                },
                Some(_) => StorageError::PayoutAlreadyRecorded(signature.clone()),
            });
        }

        tx.commit()
            .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(())
    }

    /// Move a record out of in_progress, failing on any other state
    fn finish_claim_sync(
        &self,
        signature: &str,
        to: DepositStatus,
        payout_signature: Option<&str>,
        reason: Option<&str>,
    ) -> Result<(), StorageError> {
        let conn = self.conn()?;

        let rows_affected = conn
            .execute(
                r#"
            UPDATE deposits SET
                status = ?2,
                payout_signature = ?3,
                payout_valid_until = NULL,
                last_error = ?4,
                updated_at = ?5
            WHERE signature = ?1 AND status = 'in_progress'
            "#,
                params![
                    signature,
                    to.to_string(),
                    payout_signature,
                    reason,
                    unix_now() as i64,
                ],
            )
            .map_err(|e| StorageError::Database(e.to_string()))?;

        if rows_affected == 1 {
            return Ok(());
        }
        drop(conn);

        match self.get_sync(signature)? {
            Some(record) => Err(StorageError::InvalidTransition {
                signature: signature.to_string(),
                from: record.status,
                to,
            }),
            None => Err(StorageError::NotFound(signature.to_string())),
        }
    }

    fn get_sync(&self, signature: &str) -> Result<Option<DepositRecord>, StorageError> {
        let conn = self.conn()?;

        let record = conn
            .query_row(
                "SELECT * FROM deposits WHERE signature = ?1",
                params![signature],
                |row| Self::row_to_record(row),
            )
            .optional()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(record)
    }

    fn get_by_status_sync(&self, status: DepositStatus) -> Result<Vec<DepositRecord>, StorageError> {
        let conn = self.conn()?;

        let mut stmt = conn
            .prepare(
                "SELECT * FROM deposits WHERE status = ?1 ORDER BY observed_at ASC, signature ASC",
            )
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let records = stmt
            .query_map(params![status.to_string()], |row| Self::row_to_record(row))
            .map_err(|e| StorageError::Database(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(records)
    }

    fn count_by_status_sync(&self) -> Result<LedgerStats, StorageError> {
        let conn = self.conn()?;

        let mut stmt = conn
            .prepare("SELECT status, COUNT(*), COALESCE(SUM(amount), 0) FROM deposits GROUP BY status")
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let mut stats = LedgerStats::default();
        for row in rows {
            let (status, count, lamports) = row.map_err(|e| StorageError::Database(e.to_string()))?;
            let (count, lamports) = (count as u64, lamports as u64);

            stats.total += count;
            stats.total_lamports += lamports;
            match status.parse::<DepositStatus>() {
                Ok(DepositStatus::Pending) => stats.pending += count,
                Ok(DepositStatus::InProgress) => stats.in_progress += count,
                Ok(DepositStatus::Settled) => {
                    stats.settled += count;
                    stats.settled_lamports += lamports;
                }
                Err(e) => return Err(StorageError::InvalidData(e)),
            }
        }

        Ok(stats)
    }
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn insert_if_absent(&self, record: &DepositRecord) -> StorageResult<InsertOutcome> {
        self.insert_if_absent_sync(record)
    }

    async fn claim_pending(&self, limit: usize) -> StorageResult<Vec<DepositRecord>> {
        self.claim_pending_sync(limit)
    }

    async fn record_payout(
        &self,
        signatures: &[String],
        payout_signature: &str,
        valid_until: u64,
    ) -> StorageResult<()> {
        self.record_payout_sync(signatures, payout_signature, valid_until)
    }

    async fn mark_settled(&self, signature: &str, payout_signature: &str) -> StorageResult<()> {
        self.finish_claim_sync(signature, DepositStatus::Settled, Some(payout_signature), None)
    }

    async fn mark_failed(&self, signature: &str, reason: &str) -> StorageResult<()> {
        self.finish_claim_sync(signature, DepositStatus::Pending, None, Some(reason))
    }

    async fn get(&self, signature: &str) -> StorageResult<Option<DepositRecord>> {
        self.get_sync(signature)
    }

    async fn get_by_status(&self, status: DepositStatus) -> StorageResult<Vec<DepositRecord>> {
        self.get_by_status_sync(status)
    }

    async fn count_by_status(&self) -> StorageResult<LedgerStats> {
        self.count_by_status_sync()
    }
}
