//! PostgresWorkStore - 本番用の WorkStore 実装
//!
//! 行ロックで atomicity を担保します。
//!
//! | 操作 | 方式 |
//! |------|------|
//! | claim | CTE + `FOR UPDATE SKIP LOCKED` + `UPDATE ... RETURNING` |
//! | ack / nack | `SELECT ... FOR UPDATE NOWAIT` で行を取り、domain の遷移を適用して書き戻す |
//! | reap / retry cap / stale | CTE + `SKIP LOCKED`、UPDATE 側で述語を再チェック |
//! | archive | `INSERT ... ON CONFLICT DO NOTHING` の後に `DELETE ... USING archive` |
//!
//! 時刻は全て DB の `now()` を使います（worker 間の時計ずれを持ち込まない）。
//!
//! ## Error Mapping
//!
//! | SQLx Error | SQLSTATE | QueueError |
//! |------------|----------|------------|
//! | Database (unique violation) | `23505` | `DuplicateWorkItem` |
//! | Database (check violation) | `23514` | `Corrupt` |
//! | Database (other, incl. `40001` / `40P01` / `55P03`) | any | `Store` (transient) |
//! | Decode / ColumnDecode / ColumnNotFound | N/A | `Corrupt` |
//! | Io / PoolTimedOut / PoolClosed / other | N/A | `Store` (transient) |

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Executor, FromRow, PgPool, Row};
use tracing::instrument;

use crate::app::status::QueueCounts;
use crate::config::QueueConfig;
use crate::domain::item::{LEASE_EXPIRED_ERROR, RETRY_CAP_ERROR, STALE_PENDING_ERROR};
use crate::domain::{
    ArchiveRecord, ItemStatus, LeasePolicy, LeaseToken, NewWorkItem, PayloadRef, QueueError,
    RetryPolicy, Settlement, SettlementKind, WorkItem, WorkItemId,
};
use crate::ports::{ClaimedItem, IdGenerator, Receipt, WorkStore};

const COLUMNS: &str = "id, subject_id, owner_id, payload, scheduled_for, status, \
     lease_expires_at, lease_token, retry_count, error, posted_at, created_at";

const SCHEMA_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS work_items (
    id               TEXT PRIMARY KEY,
    subject_id       TEXT NOT NULL,
    owner_id         TEXT NOT NULL,
    payload          JSONB NOT NULL DEFAULT 'null'::jsonb,
    scheduled_for    TIMESTAMPTZ NOT NULL,
    status           TEXT NOT NULL DEFAULT 'pending'
                     CHECK (status IN ('pending', 'processing', 'sent', 'failed')),
    lease_expires_at TIMESTAMPTZ,
    lease_token      TEXT,
    retry_count      INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
    error            TEXT,
    posted_at        TIMESTAMPTZ,
    created_at       TIMESTAMPTZ NOT NULL DEFAULT now(),
    CHECK ((status = 'processing') = (lease_expires_at IS NOT NULL)),
    CHECK ((status IN ('sent', 'failed')) = (posted_at IS NOT NULL))
);

CREATE INDEX IF NOT EXISTS work_items_claim_idx
    ON work_items (status, scheduled_for);

CREATE INDEX IF NOT EXISTS work_items_reaper_idx
    ON work_items (status, lease_expires_at);

CREATE UNIQUE INDEX IF NOT EXISTS work_items_subject_uncompleted_idx
    ON work_items (subject_id)
    WHERE status IN ('pending', 'processing');

CREATE TABLE IF NOT EXISTS work_items_archive (
    id               TEXT PRIMARY KEY,
    subject_id       TEXT NOT NULL,
    owner_id         TEXT NOT NULL,
    payload          JSONB NOT NULL,
    scheduled_for    TIMESTAMPTZ NOT NULL,
    status           TEXT NOT NULL,
    lease_expires_at TIMESTAMPTZ,
    lease_token      TEXT,
    retry_count      INTEGER NOT NULL,
    error            TEXT,
    posted_at        TIMESTAMPTZ,
    created_at       TIMESTAMPTZ NOT NULL,
    archived_at      TIMESTAMPTZ NOT NULL DEFAULT now()
);
"#;

/// Open a pool for `config`, pinning `search_path` to the configured schema.
pub async fn connect_pool(config: &QueueConfig) -> Result<PgPool, QueueError> {
    config.validate()?;
    let url = config
        .database_url
        .as_deref()
        .ok_or_else(|| QueueError::Config("database_url is not set".into()))?;
    let set_search_path = format!("SET search_path TO \"{}\"", config.schema);

    PgPoolOptions::new()
        .max_connections(config.pool_max_size)
        .after_connect(move |conn, _meta| {
            let stmt = set_search_path.clone();
            Box::pin(async move {
                conn.execute(stmt.as_str()).await?;
                Ok(())
            })
        })
        .connect(url)
        .await
        .map_err(|e| map_sqlx_error("connect", e))
}

#[derive(Clone)]
pub struct PostgresWorkStore {
    pool: PgPool,
    ids: Arc<dyn IdGenerator>,
    schema: String,
}

impl PostgresWorkStore {
    pub fn new(pool: PgPool, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            pool,
            ids,
            schema: "public".to_string(),
        }
    }

    /// Schema created by [`PostgresWorkStore::migrate`]. Must match the
    /// `search_path` the pool was opened with.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the hot table, the archive table and their indexes. Idempotent.
    #[instrument(skip(self), fields(schema = %self.schema), err)]
    pub async fn migrate(&self) -> Result<(), QueueError> {
        if !crate::config::is_identifier(&self.schema) {
            return Err(QueueError::Config(format!(
                "schema {:?} is not a plain SQL identifier",
                self.schema
            )));
        }
        let ddl = format!(
            "CREATE SCHEMA IF NOT EXISTS \"{}\";\n{SCHEMA_DDL}",
            self.schema
        );
        sqlx::raw_sql(&ddl)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    async fn fetch_for_update(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        id: WorkItemId,
        operation: &str,
    ) -> Result<(WorkItem, DateTime<Utc>), QueueError> {
        let sql = format!("SELECT {COLUMNS}, now() AS db_now FROM work_items WHERE id = $1 FOR UPDATE NOWAIT");
        let row = sqlx::query(&sql)
            .bind(id.to_storage())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?
            .ok_or(QueueError::NotFound(id))?;
        let now: DateTime<Utc> = row
            .try_get("db_now")
            .map_err(|e| map_sqlx_error(operation, e))?;
        Ok((decode_item(&row)?, now))
    }

    async fn write_back(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        item: &WorkItem,
        operation: &str,
    ) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            UPDATE work_items
            SET status = $2,
                scheduled_for = $3,
                lease_expires_at = $4,
                lease_token = $5,
                retry_count = $6,
                error = $7,
                posted_at = $8
            WHERE id = $1
            "#,
        )
        .bind(item.id.to_storage())
        .bind(item.status.as_str())
        .bind(item.scheduled_for)
        .bind(item.lease_expires_at)
        .bind(item.lease_token.map(|t| t.to_storage()))
        .bind(to_db_count(item.retry_count))
        .bind(item.error.as_deref())
        .bind(item.posted_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;
        Ok(())
    }

    /// Load, apply one FSM transition, write back. One short transaction.
    async fn settle<F>(&self, id: WorkItemId, operation: &str, apply: F) -> Result<Settlement, QueueError>
    where
        F: FnOnce(&mut WorkItem, DateTime<Utc>) -> Settlement + Send,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        let (mut item, now) = Self::fetch_for_update(&mut tx, id, operation).await?;
        let settlement = apply(&mut item, now);
        if settlement.kind != SettlementKind::AlreadyTerminal {
            Self::write_back(&mut tx, &item, operation).await?;
        }
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        Ok(settlement)
    }
}

#[async_trait]
impl WorkStore for PostgresWorkStore {
    #[instrument(skip(self, new), fields(subject_id = %new.payload_ref.subject_id), err)]
    async fn enqueue(&self, new: NewWorkItem) -> Result<WorkItemId, QueueError> {
        let id = self.ids.generate_item_id();
        let result = sqlx::query(
            r#"
            INSERT INTO work_items (id, subject_id, owner_id, payload, scheduled_for, status)
            VALUES ($1, $2, $3, $4, $5, 'pending')
            "#,
        )
        .bind(id.to_storage())
        .bind(&new.payload_ref.subject_id)
        .bind(&new.payload_ref.owner_id)
        .bind(&new.payload)
        .bind(new.scheduled_for)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(id),
            Err(e) => match map_sqlx_error("enqueue", e) {
                QueueError::DuplicateWorkItem { .. } => Err(QueueError::DuplicateWorkItem {
                    subject_id: new.payload_ref.subject_id,
                }),
                other => Err(other),
            },
        }
    }

    #[instrument(skip(self, lease, retry), err)]
    async fn claim(
        &self,
        capacity: usize,
        lease: &LeasePolicy,
        retry: &RetryPolicy,
    ) -> Result<Vec<ClaimedItem>, QueueError> {
        if capacity == 0 {
            return Ok(Vec::new());
        }
        let token = self.ids.generate_lease_token();
        let limit = i64::try_from(capacity).unwrap_or(i64::MAX);
        let sql = format!(
            r#"
            WITH due AS (
                SELECT id
                FROM work_items
                WHERE status = 'pending'
                  AND scheduled_for <= now()
                  AND retry_count < $1
                ORDER BY scheduled_for, id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE work_items w
            SET status = 'processing',
                lease_expires_at = now() + make_interval(secs => $3),
                lease_token = $4
            FROM due
            WHERE w.id = due.id
            RETURNING {}
            "#,
            prefixed_columns("w")
        );
        let rows = sqlx::query(&sql)
            .bind(to_db_count(retry.max_retry))
            .bind(limit)
            .bind(lease.duration.as_secs_f64())
            .bind(token.to_storage())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim", e))?;

        // UPDATE ... RETURNING does not keep the CTE order.
        let mut items = rows.iter().map(decode_item).collect::<Result<Vec<_>, _>>()?;
        items.sort_by(|a, b| (a.scheduled_for, a.id).cmp(&(b.scheduled_for, b.id)));

        tracing::debug!(count = items.len(), token = %token, "claimed");
        Ok(items
            .into_iter()
            .map(|item| ClaimedItem { item, token })
            .collect())
    }

    #[instrument(skip(self, receipt), fields(item_id = %receipt.id), err)]
    async fn ack(&self, receipt: &Receipt) -> Result<Settlement, QueueError> {
        let token = receipt.token;
        self.settle(receipt.id, "ack", move |item, now| item.ack(token, now))
            .await
    }

    #[instrument(skip(self, receipt, error, retry), fields(item_id = %receipt.id), err)]
    async fn nack(
        &self,
        receipt: &Receipt,
        error: &str,
        retry: &RetryPolicy,
    ) -> Result<Settlement, QueueError> {
        let token = receipt.token;
        self.settle(receipt.id, "nack", move |item, now| {
            item.nack(token, error, now, retry)
        })
        .await
    }

    #[instrument(skip(self, retry), err)]
    async fn reap_expired(&self, retry: &RetryPolicy) -> Result<u64, QueueError> {
        let result = sqlx::query(
            r#"
            WITH expired AS (
                SELECT id
                FROM work_items
                WHERE status = 'processing'
                  AND lease_expires_at < now()
                FOR UPDATE SKIP LOCKED
            )
            UPDATE work_items w
            SET retry_count = w.retry_count + 1,
                status = CASE WHEN w.retry_count + 1 >= $1 THEN 'failed' ELSE 'pending' END,
                posted_at = CASE WHEN w.retry_count + 1 >= $1 THEN now() ELSE NULL END,
                error = $2,
                lease_expires_at = NULL,
                lease_token = NULL
            FROM expired
            WHERE w.id = expired.id
              AND w.status = 'processing'
              AND w.lease_expires_at < now()
            "#,
        )
        .bind(to_db_count(retry.max_retry))
        .bind(LEASE_EXPIRED_ERROR)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("reap_expired", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, retry), err)]
    async fn enforce_retry_cap(&self, retry: &RetryPolicy) -> Result<u64, QueueError> {
        let result = sqlx::query(
            r#"
            WITH capped AS (
                SELECT id
                FROM work_items
                WHERE status IN ('pending', 'processing')
                  AND retry_count >= $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE work_items w
            SET status = 'failed',
                error = $2,
                posted_at = now(),
                lease_expires_at = NULL,
                lease_token = NULL
            FROM capped
            WHERE w.id = capped.id
              AND w.status IN ('pending', 'processing')
              AND w.retry_count >= $1
            "#,
        )
        .bind(to_db_count(retry.max_retry))
        .bind(RETRY_CAP_ERROR)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("enforce_retry_cap", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn expire_stale(&self, cutoff: DateTime<Utc>) -> Result<u64, QueueError> {
        let result = sqlx::query(
            r#"
            WITH stale AS (
                SELECT id
                FROM work_items
                WHERE status = 'pending'
                  AND created_at < $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE work_items w
            SET status = 'failed',
                error = $2,
                posted_at = now()
            FROM stale
            WHERE w.id = stale.id
              AND w.status = 'pending'
              AND w.created_at < $1
            "#,
        )
        .bind(cutoff)
        .bind(STALE_PENDING_ERROR)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("expire_stale", e))?;
        Ok(result.rows_affected())
    }

    /// Two statements, each its own transaction. A crash between them leaves
    /// rows in both tables, and the next run's copy is a no-op for them.
    #[instrument(skip(self), err)]
    async fn archive_terminal(&self, cutoff: DateTime<Utc>) -> Result<u64, QueueError> {
        let copy = format!(
            r#"
            INSERT INTO work_items_archive ({COLUMNS}, archived_at)
            SELECT {COLUMNS}, now()
            FROM work_items
            WHERE status IN ('sent', 'failed')
              AND posted_at < $1
            ON CONFLICT (id) DO NOTHING
            "#
        );
        let copied = sqlx::query(&copy)
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("archive_copy", e))?
            .rows_affected();

        let deleted = sqlx::query(
            r#"
            DELETE FROM work_items w
            USING work_items_archive a
            WHERE a.id = w.id
              AND w.status IN ('sent', 'failed')
              AND w.posted_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("archive_delete", e))?
        .rows_affected();

        tracing::debug!(copied, deleted, "archived terminal items");
        Ok(deleted)
    }

    async fn now(&self) -> Result<DateTime<Utc>, QueueError> {
        sqlx::query_scalar::<_, DateTime<Utc>>("SELECT now()")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("now", e))
    }

    async fn get(&self, id: WorkItemId) -> Result<Option<WorkItem>, QueueError> {
        let sql = format!("SELECT {COLUMNS} FROM work_items WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.to_storage())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(decode_item).transpose()
    }

    async fn archived(&self, id: WorkItemId) -> Result<Option<ArchiveRecord>, QueueError> {
        let sql = format!("SELECT {COLUMNS}, archived_at FROM work_items_archive WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.to_storage())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("archived", e))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let archived_at: DateTime<Utc> = row
            .try_get("archived_at")
            .map_err(|e| map_sqlx_error("archived", e))?;
        Ok(Some(ArchiveRecord::new(decode_item(&row)?, archived_at)))
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let rows = sqlx::query("SELECT status, count(*) AS n FROM work_items GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("counts", e))?;
        let mut counts = QueueCounts::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("counts", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("counts", e))?;
            let n = u64::try_from(n).unwrap_or(0);
            match ItemStatus::from_str(&status).map_err(QueueError::Corrupt)? {
                ItemStatus::Pending => counts.pending = n,
                ItemStatus::Processing => counts.processing = n,
                ItemStatus::Sent => counts.sent = n,
                ItemStatus::Failed => counts.failed = n,
            }
        }
        let archived: i64 = sqlx::query_scalar("SELECT count(*) FROM work_items_archive")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("counts", e))?;
        counts.archived = u64::try_from(archived).unwrap_or(0);
        Ok(counts)
    }
}

fn prefixed_columns(alias: &str) -> String {
    COLUMNS
        .split(',')
        .map(|c| format!("{alias}.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn to_db_count(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

// SQLx row types

#[derive(Debug)]
struct WorkItemRow {
    id: String,
    subject_id: String,
    owner_id: String,
    payload: serde_json::Value,
    scheduled_for: DateTime<Utc>,
    status: String,
    lease_expires_at: Option<DateTime<Utc>>,
    lease_token: Option<String>,
    retry_count: i32,
    error: Option<String>,
    posted_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for WorkItemRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(WorkItemRow {
            id: row.try_get("id")?,
            subject_id: row.try_get("subject_id")?,
            owner_id: row.try_get("owner_id")?,
            payload: row.try_get("payload")?,
            scheduled_for: row.try_get("scheduled_for")?,
            status: row.try_get("status")?,
            lease_expires_at: row.try_get("lease_expires_at")?,
            lease_token: row.try_get("lease_token")?,
            retry_count: row.try_get("retry_count")?,
            error: row.try_get("error")?,
            posted_at: row.try_get("posted_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<WorkItemRow> for WorkItem {
    type Error = QueueError;

    fn try_from(row: WorkItemRow) -> Result<Self, Self::Error> {
        let id = WorkItemId::from_str(&row.id).map_err(|e| QueueError::Corrupt(e.to_string()))?;
        let status = ItemStatus::from_str(&row.status)
            .map_err(|e| QueueError::Corrupt(format!("{id}: {e}")))?;
        let lease_token = row
            .lease_token
            .as_deref()
            .map(LeaseToken::from_str)
            .transpose()
            .map_err(|e| QueueError::Corrupt(format!("{id}: {e}")))?;
        let retry_count = u32::try_from(row.retry_count)
            .map_err(|_| QueueError::Corrupt(format!("{id}: negative retry_count")))?;

        Ok(WorkItem {
            id,
            payload_ref: PayloadRef::new(row.subject_id, row.owner_id),
            payload: row.payload,
            scheduled_for: row.scheduled_for,
            status,
            lease_expires_at: row.lease_expires_at,
            lease_token,
            retry_count,
            error: row.error,
            posted_at: row.posted_at,
            created_at: row.created_at,
        })
    }
}

fn decode_item(row: &PgRow) -> Result<WorkItem, QueueError> {
    let raw = WorkItemRow::from_row(row).map_err(|e| map_sqlx_error("decode", e))?;
    WorkItem::try_from(raw)
}

/// Map a sqlx error to [`QueueError`]. See the table in the module docs.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => QueueError::DuplicateWorkItem {
                    subject_id: db_err.constraint().unwrap_or("unknown").to_string(),
                },
                Some("23514") => QueueError::Corrupt(msg),
                Some(code) => QueueError::store(operation, format!("{msg} (SQLSTATE {code})")),
                None => QueueError::store(operation, msg),
            }
        }
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::ColumnNotFound(_) => {
            QueueError::Corrupt(format!("{operation}: {err}"))
        }
        _ => QueueError::store(operation, err.to_string()),
    }
}
