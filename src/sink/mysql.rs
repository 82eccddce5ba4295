//! MySQL sink
//!
//! Commits a batch as one transaction on the `hornethashes (date, sha1)`
//! table. Rows are inserted with multi-row `INSERT ... VALUES (?, ?), ...`
//! statements of at most [`WRITE_BATCH_SIZE`] rows each, all inside the same
//! transaction, so a batch is either fully visible or not at all.
//!
//! Schema creation is left to the deployment.

use super::{BatchSink, DailyCount, SinkError, SinkFuture};
use crate::clock::{ReceiptClock, SystemClock};
use crate::config::StorageConfig;
use crate::fingerprint::Fingerprint;
use chrono::NaiveDate;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use sqlx::Row;
use tracing::{debug, instrument};

/// Rows per INSERT statement; keeps placeholder count well under MySQL's limit
pub const WRITE_BATCH_SIZE: usize = 1000;

const INSERT_PREFIX: &str = "INSERT INTO hornethashes (date, sha1) VALUES ";
const DAILY_COUNTS_QUERY: &str =
    "SELECT date, COUNT(*) AS count FROM hornethashes GROUP BY date ORDER BY date";

pub struct MySqlSink<C: ReceiptClock = SystemClock> {
    pool: MySqlPool,
    clock: C,
}

impl MySqlSink<SystemClock> {
    pub fn new(pool: MySqlPool) -> Self {
        MySqlSink {
            pool,
            clock: SystemClock,
        }
    }

    #[instrument(skip(config))]
    pub async fn from_config(config: &StorageConfig) -> Result<Self, SinkError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(std::time::Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.database_url)
            .await
            .map_err(|e| SinkError::Connection(e.to_string()))?;
        Ok(Self::new(pool))
    }
}

impl<C: ReceiptClock> MySqlSink<C> {
    pub fn with_clock(pool: MySqlPool, clock: C) -> Self {
        MySqlSink { pool, clock }
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    async fn insert_all(&self, date: NaiveDate, fingerprints: &[Fingerprint]) -> Result<(), SinkError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SinkError::Connection(format!("failed to begin transaction: {}", e)))?;

        for chunk in fingerprints.chunks(WRITE_BATCH_SIZE) {
            let sql = insert_statement(chunk.len());
            let mut query = sqlx::query(&sql);
            for fingerprint in chunk {
                query = query.bind(date).bind(fingerprint.as_str());
            }
            query
                .execute(&mut *tx)
                .await
                .map_err(|e| SinkError::Rejected(format!("failed to insert batch: {}", e)))?;
        }

        // Dropping an uncommitted transaction rolls it back
        tx.commit()
            .await
            .map_err(|e| SinkError::Rejected(format!("failed to commit transaction: {}", e)))?;
        Ok(())
    }
}

/// `INSERT ... VALUES (?, ?), (?, ?), ...` for `rows` rows
fn insert_statement(rows: usize) -> String {
    let mut sql = String::with_capacity(INSERT_PREFIX.len() + rows * 8);
    sql.push_str(INSERT_PREFIX);
    for i in 0..rows {
        if i > 0 {
            sql.push_str(", ");
        }
        sql.push_str("(?, ?)");
    }
    sql
}

impl<C: ReceiptClock> BatchSink for MySqlSink<C> {
    fn commit_batch<'a>(&'a self, fingerprints: &'a [Fingerprint]) -> SinkFuture<'a, NaiveDate> {
        Box::pin(async move {
            let date = self.clock.today();
            if fingerprints.is_empty() {
                return Ok(date);
            }
            self.insert_all(date, fingerprints).await?;
            debug!(rows = fingerprints.len(), %date, "batch inserted");
            Ok(date)
        })
    }

    fn daily_counts(&self) -> SinkFuture<'_, Vec<DailyCount>> {
        Box::pin(async move {
            let rows = sqlx::query(DAILY_COUNTS_QUERY)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| SinkError::Backend(format!("failed to count rows: {}", e)))?;

            rows.iter()
                .map(|row| {
                    let date: NaiveDate = row
                        .try_get("date")
                        .map_err(|e| SinkError::Backend(e.to_string()))?;
                    let count: i64 = row
                        .try_get("count")
                        .map_err(|e| SinkError::Backend(e.to_string()))?;
                    Ok(DailyCount {
                        date,
                        count: row_count(date, count)?,
                    })
                })
                .collect()
        })
    }
}

/// `COUNT(*)` comes back signed; a negative value means a broken driver or
/// schema, not an empty day
fn row_count(date: NaiveDate, count: i64) -> Result<u64, SinkError> {
    u64::try_from(count)
        .map_err(|_| SinkError::Backend(format!("negative row count {} for {}", count, date)))
}

impl<C: ReceiptClock> std::fmt::Debug for MySqlSink<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlSink").field("pool", &"MySqlPool").finish()
    }
}
