use std::collections::BTreeMap;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use blackraven_transfer::{format_timestamp, parse_timestamp, DeliveryStatus, TransferStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("sql/schema.sql");

const TRANSFER_COLUMNS: &str = "transfer_id, owner_id, owner_email, payload_path, filename, media_type, size_bytes, message, start_date, end_date, recipients_json, passphrase_hash, status, failed_attempts, dispatch_attempts, claim_token, claimed_at, failure_reason, created_at, updated_at, sent_at";

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub sqlite_path: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct BlackravenStorage {
    pool: SqlitePool,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TransferRecord {
    pub transfer_id: String,
    pub owner_id: String,
    pub owner_email: String,
    pub payload_path: String,
    pub filename: String,
    pub media_type: String,
    pub size_bytes: i64,
    pub message: Option<String>,
    pub start_date: String,
    pub end_date: String,
    pub recipients_json: String,
    #[serde(skip_serializing)]
    pub passphrase_hash: String,
    pub status: String,
    pub failed_attempts: i64,
    pub dispatch_attempts: i64,
    pub claim_token: Option<String>,
    pub claimed_at: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub sent_at: Option<String>,
}

impl TransferRecord {
    pub fn status(&self) -> Result<TransferStatus> {
        TransferStatus::parse(&self.status)
            .ok_or_else(|| anyhow!("transfer {} has unknown status {:?}", self.transfer_id, self.status))
    }

    pub fn recipients(&self) -> Result<BTreeMap<String, String>> {
        serde_json::from_str(&self.recipients_json)
            .with_context(|| format!("parse recipients of transfer {}", self.transfer_id))
    }

    pub fn end_date(&self) -> Result<DateTime<Utc>> {
        parse_timestamp(&self.end_date)
            .with_context(|| format!("parse end_date of transfer {}", self.transfer_id))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DeliveryRecord {
    pub transfer_id: String,
    pub platform: String,
    pub recipient: String,
    pub status: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub receipt: Option<String>,
    pub delivered_at: Option<String>,
    pub updated_at: String,
}

impl DeliveryRecord {
    pub fn status(&self) -> Result<DeliveryStatus> {
        DeliveryStatus::parse(&self.status).ok_or_else(|| {
            anyhow!(
                "delivery {}/{} has unknown status {:?}",
                self.transfer_id,
                self.platform,
                self.status
            )
        })
    }

    pub fn is_delivered(&self) -> bool {
        self.status == DeliveryStatus::Delivered.as_str()
    }
}

#[derive(Debug, Clone)]
pub struct NewTransfer {
    pub owner_id: String,
    pub owner_email: String,
    pub payload_path: String,
    pub filename: String,
    pub media_type: String,
    pub size_bytes: i64,
    pub message: Option<String>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub recipients: BTreeMap<String, String>,
    pub passphrase_hash: String,
}

/// Proof that this caller moved a row into `dispatching`. Finishing the
/// dispatch requires presenting the same token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchClaim {
    pub transfer_id: String,
    pub token: String,
    pub dispatch_attempts: i64,
}

impl BlackravenStorage {
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        let in_memory = is_memory_path(&config.sqlite_path);
        let uri = normalize_sqlite_uri(&config.sqlite_path);
        let mut options = SqliteConnectOptions::from_str(&uri)
            .with_context(|| format!("invalid sqlite URI: {}", uri))?
            .create_if_missing(true)
            .foreign_keys(true);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // each in-memory connection is its own database, so pin a single one
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(config.max_connections.max(1))
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .context("failed to connect sqlite pool")?;

        let storage = Self { pool };
        storage.migrate().await?;
        Ok(storage)
    }

    pub async fn in_memory() -> Result<Self> {
        Self::connect(&StorageConfig {
            sqlite_path: ":memory:".to_string(),
            max_connections: 1,
        })
        .await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA_SQL.split(';') {
            let sql = statement.trim();
            if sql.is_empty() {
                continue;
            }
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .with_context(|| format!("migration failed for statement: {sql}"))?;
        }
        info!("blackraven sqlite schema ready");
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping")?;
        Ok(())
    }

    pub async fn insert_transfer(&self, new: &NewTransfer) -> Result<TransferRecord> {
        let transfer_id = Uuid::now_v7().to_string();
        let now = format_timestamp(Utc::now());
        let recipients_json =
            serde_json::to_string(&new.recipients).context("serialize transfer recipients")?;

        sqlx::query(
            "INSERT INTO transfers(transfer_id, owner_id, owner_email, payload_path, filename, media_type, size_bytes, message, start_date, end_date, recipients_json, passphrase_hash, status, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&transfer_id)
        .bind(&new.owner_id)
        .bind(&new.owner_email)
        .bind(&new.payload_path)
        .bind(&new.filename)
        .bind(&new.media_type)
        .bind(new.size_bytes)
        .bind(&new.message)
        .bind(format_timestamp(new.start_date))
        .bind(format_timestamp(new.end_date))
        .bind(&recipients_json)
        .bind(&new.passphrase_hash)
        .bind(TransferStatus::Pending.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("insert transfer")?;

        self.get_transfer(&transfer_id)
            .await?
            .context("transfer missing after insert")
    }

    pub async fn get_transfer(&self, transfer_id: &str) -> Result<Option<TransferRecord>> {
        sqlx::query_as::<_, TransferRecord>(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers WHERE transfer_id = ?"
        ))
        .bind(transfer_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("query transfer {transfer_id}"))
    }

    pub async fn get_transfer_for_owner(
        &self,
        transfer_id: &str,
        owner_id: &str,
    ) -> Result<Option<TransferRecord>> {
        sqlx::query_as::<_, TransferRecord>(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers WHERE transfer_id = ? AND owner_id = ?"
        ))
        .bind(transfer_id)
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("query transfer {transfer_id}"))
    }

    pub async fn list_transfers_for_owner(&self, owner_id: &str) -> Result<Vec<TransferRecord>> {
        sqlx::query_as::<_, TransferRecord>(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers WHERE owner_id = ? ORDER BY created_at DESC, transfer_id DESC"
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("list transfers for owner {owner_id}"))
    }

    pub async fn list_deliveries(&self, transfer_id: &str) -> Result<Vec<DeliveryRecord>> {
        sqlx::query_as::<_, DeliveryRecord>(
            "SELECT transfer_id, platform, recipient, status, attempts, last_error, receipt, delivered_at, updated_at FROM deliveries WHERE transfer_id = ? ORDER BY platform ASC",
        )
        .bind(transfer_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("list deliveries for transfer {transfer_id}"))
    }

    /// Rows the sweeper should look at: pending and due, plus dispatching
    /// rows whose claim went stale (the claiming sweep died mid-flight).
    pub async fn list_due(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<TransferRecord>> {
        sqlx::query_as::<_, TransferRecord>(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers WHERE end_date <= ? AND (status = 'pending' OR (status = 'dispatching' AND claimed_at <= ?)) ORDER BY end_date ASC"
        ))
        .bind(format_timestamp(now))
        .bind(format_timestamp(stale_before))
        .fetch_all(&self.pool)
        .await
        .context("query due transfers")
    }

    pub async fn claim_due(
        &self,
        transfer_id: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<DispatchClaim>> {
        let token = Uuid::now_v7().to_string();
        let stamp = format_timestamp(now);
        let attempts = sqlx::query_scalar::<_, i64>(
            "UPDATE transfers SET status = 'dispatching', claim_token = ?, claimed_at = ?, dispatch_attempts = dispatch_attempts + 1, updated_at = ? WHERE transfer_id = ? AND end_date <= ? AND (status = 'pending' OR (status = 'dispatching' AND claimed_at <= ?)) RETURNING dispatch_attempts",
        )
        .bind(&token)
        .bind(&stamp)
        .bind(&stamp)
        .bind(transfer_id)
        .bind(&stamp)
        .bind(format_timestamp(stale_before))
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("claim due transfer {transfer_id}"))?;

        Ok(attempts.map(|dispatch_attempts| DispatchClaim {
            transfer_id: transfer_id.to_string(),
            token,
            dispatch_attempts,
        }))
    }

    /// Claims a pending row for immediate delivery, pulling `end_date` back to
    /// `now` so that any recipient left undelivered is picked up by the next
    /// sweep.
    pub async fn claim_for_owner(
        &self,
        transfer_id: &str,
        owner_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DispatchClaim>> {
        let token = Uuid::now_v7().to_string();
        let stamp = format_timestamp(now);
        let attempts = sqlx::query_scalar::<_, i64>(
            "UPDATE transfers SET status = 'dispatching', claim_token = ?, claimed_at = ?, dispatch_attempts = dispatch_attempts + 1, end_date = CASE WHEN end_date > ? THEN ? ELSE end_date END, updated_at = ? WHERE transfer_id = ? AND owner_id = ? AND status = 'pending' RETURNING dispatch_attempts",
        )
        .bind(&token)
        .bind(&stamp)
        .bind(&stamp)
        .bind(&stamp)
        .bind(&stamp)
        .bind(transfer_id)
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("claim transfer {transfer_id} for immediate send"))?;

        Ok(attempts.map(|dispatch_attempts| DispatchClaim {
            transfer_id: transfer_id.to_string(),
            token,
            dispatch_attempts,
        }))
    }

    pub async fn record_delivery(
        &self,
        transfer_id: &str,
        platform: &str,
        recipient: &str,
        outcome: std::result::Result<&str, &str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let stamp = format_timestamp(now);
        let (status, last_error, receipt, delivered_at) = match outcome {
            Ok(receipt) => (DeliveryStatus::Delivered, None, Some(receipt), Some(stamp.clone())),
            Err(reason) => (DeliveryStatus::Failed, Some(reason), None, None),
        };

        sqlx::query(
            "INSERT INTO deliveries(transfer_id, platform, recipient, status, attempts, last_error, receipt, delivered_at, updated_at) VALUES (?, ?, ?, ?, 1, ?, ?, ?, ?) ON CONFLICT(transfer_id, platform) DO UPDATE SET recipient = excluded.recipient, status = excluded.status, attempts = deliveries.attempts + 1, last_error = excluded.last_error, receipt = COALESCE(excluded.receipt, deliveries.receipt), delivered_at = COALESCE(excluded.delivered_at, deliveries.delivered_at), updated_at = excluded.updated_at",
        )
        .bind(transfer_id)
        .bind(platform)
        .bind(recipient)
        .bind(status.as_str())
        .bind(last_error)
        .bind(receipt)
        .bind(delivered_at)
        .bind(&stamp)
        .execute(&self.pool)
        .await
        .with_context(|| format!("record delivery {transfer_id}/{platform}"))?;
        Ok(())
    }

    /// `dispatching` → `sent`. Returns false when the claim was lost.
    pub async fn complete_dispatch(
        &self,
        claim: &DispatchClaim,
        now: DateTime<Utc>,
        failure_reason: Option<&str>,
    ) -> Result<bool> {
        let stamp = format_timestamp(now);
        let result = sqlx::query(
            "UPDATE transfers SET status = 'sent', sent_at = ?, updated_at = ?, failure_reason = ?, claim_token = NULL, claimed_at = NULL WHERE transfer_id = ? AND claim_token = ? AND status = 'dispatching'",
        )
        .bind(&stamp)
        .bind(&stamp)
        .bind(failure_reason)
        .bind(&claim.transfer_id)
        .bind(&claim.token)
        .execute(&self.pool)
        .await
        .with_context(|| format!("complete dispatch of {}", claim.transfer_id))?;
        Ok(result.rows_affected() == 1)
    }

    /// `dispatching` → `pending`, keeping the failure reason for the owner.
    pub async fn release_claim(
        &self,
        claim: &DispatchClaim,
        now: DateTime<Utc>,
        failure_reason: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE transfers SET status = 'pending', updated_at = ?, failure_reason = ?, claim_token = NULL, claimed_at = NULL WHERE transfer_id = ? AND claim_token = ? AND status = 'dispatching'",
        )
        .bind(format_timestamp(now))
        .bind(failure_reason)
        .bind(&claim.transfer_id)
        .bind(&claim.token)
        .execute(&self.pool)
        .await
        .with_context(|| format!("release claim on {}", claim.transfer_id))?;
        Ok(result.rows_affected() == 1)
    }

    /// Atomically bumps the wrong-passphrase counter of a pending transfer
    /// and returns the new value. `None` when the row is gone, not owned by
    /// `owner_id`, no longer pending, already dispatched once, or already at
    /// `max_attempts`.
    pub async fn record_failed_attempt(
        &self,
        transfer_id: &str,
        owner_id: &str,
        max_attempts: i64,
    ) -> Result<Option<i64>> {
        sqlx::query_scalar::<_, i64>(
            "UPDATE transfers SET failed_attempts = failed_attempts + 1, updated_at = ? WHERE transfer_id = ? AND owner_id = ? AND status = 'pending' AND dispatch_attempts = 0 AND failed_attempts < ? RETURNING failed_attempts",
        )
        .bind(format_timestamp(Utc::now()))
        .bind(transfer_id)
        .bind(owner_id)
        .bind(max_attempts)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("record failed deactivation attempt on {transfer_id}"))
    }

    /// `pending` → `cancelled`. Returns false if a sweep claimed the row
    /// first, any dispatch was ever attempted, or the attempt budget is spent.
    pub async fn mark_cancelled(
        &self,
        transfer_id: &str,
        owner_id: &str,
        max_attempts: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE transfers SET status = 'cancelled', updated_at = ? WHERE transfer_id = ? AND owner_id = ? AND status = 'pending' AND dispatch_attempts = 0 AND failed_attempts < ?",
        )
        .bind(format_timestamp(Utc::now()))
        .bind(transfer_id)
        .bind(owner_id)
        .bind(max_attempts)
        .execute(&self.pool)
        .await
        .with_context(|| format!("cancel transfer {transfer_id}"))?;
        Ok(result.rows_affected() == 1)
    }

    /// Removes a transfer and its delivery history. Rows mid-dispatch are
    /// left alone.
    pub async fn delete_transfer(&self, transfer_id: &str, owner_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("begin delete transaction")?;

        let result = sqlx::query(
            "DELETE FROM transfers WHERE transfer_id = ? AND owner_id = ? AND status != 'dispatching'",
        )
        .bind(transfer_id)
        .bind(owner_id)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("delete transfer {transfer_id}"))?;

        if result.rows_affected() == 0 {
            tx.rollback().await.context("rollback delete transaction")?;
            return Ok(false);
        }

        sqlx::query("DELETE FROM deliveries WHERE transfer_id = ?")
            .bind(transfer_id)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("delete deliveries of {transfer_id}"))?;

        tx.commit().await.context("commit delete transaction")?;
        debug!(transfer_id = %transfer_id, "transfer row deleted");
        Ok(true)
    }
}

fn is_memory_path(raw: &str) -> bool {
    matches!(raw, ":memory:" | "sqlite::memory:" | "sqlite://:memory:")
}

fn normalize_sqlite_uri(raw: &str) -> String {
    if is_memory_path(raw) {
        "sqlite::memory:".to_string()
    } else if raw.starts_with("sqlite:") {
        raw.to_string()
    } else {
        format!("sqlite://{raw}")
    }
}
