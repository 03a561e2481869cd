//! Postgres-backed object storage.
//!
//! One table per object type. The `payload` column holds the serde form of the
//! whole object and is the source of truth; the typed columns mirror the
//! processing fields so claims can be filtered, ordered and locked in SQL.
//!
//! ## Claim
//!
//! `claim` runs `SELECT ... FOR UPDATE SKIP LOCKED` inside a transaction, so
//! concurrent engines (threads or processes) skip rows another transaction is
//! claiming instead of blocking on them. Each selected row is re-checked
//! against the decoded payload, stamped, and written back before commit.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StorageError |
//! |------------|----------------------|--------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` |
//! | Database (other) | Any other | `Backend` |
//! | PoolClosed / other | N/A | `Backend` |
//!
//! ## Runtime bridging
//!
//! [`ObjectStorage`] is synchronous because the engine runs on plain OS
//! threads. The trait impl drives the async methods with the
//! `tokio::runtime::Handle` given at construction, so it must not be called
//! from inside that runtime's async context.

use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::{Span, debug, instrument};
use uuid::Uuid;

use objproc_core::{ObjectLock, ProcessableObject, ProcessingStatus};

use super::r#trait::{ClaimRequest, Claimed, Finalization, ObjectStorage};
use crate::error::{StorageError, StorageResult};

pub const DEFAULT_TABLE: &str = "processable_objects";

/// Postgres storage for objects of type `O`.
pub struct PostgresObjectStorage<O> {
    pool: Arc<PgPool>,
    runtime: Handle,
    table: String,
    _object: PhantomData<fn() -> O>,
}

impl<O> Clone for PostgresObjectStorage<O> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            runtime: self.runtime.clone(),
            table: self.table.clone(),
            _object: PhantomData,
        }
    }
}

impl<O> std::fmt::Debug for PostgresObjectStorage<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresObjectStorage")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

impl<O> PostgresObjectStorage<O>
where
    O: ProcessableObject + Serialize + DeserializeOwned,
    O::Id: Into<Uuid> + From<Uuid>,
{
    /// Storage over [`DEFAULT_TABLE`].
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
            table: DEFAULT_TABLE.to_string(),
            _object: PhantomData,
        }
    }

    /// Use a different table. Only lowercase SQL identifiers are accepted.
    pub fn with_table(mut self, table: impl Into<String>) -> StorageResult<Self> {
        let table = table.into();
        validate_identifier(&table)?;
        self.table = table;
        Ok(self)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the table and its claim index if absent.
    #[instrument(skip(self), fields(table = %self.table), err)]
    pub async fn ensure_schema(&self) -> StorageResult<()> {
        let create_table = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {t} (
                id UUID PRIMARY KEY,
                status TEXT NOT NULL,
                processing_attempts INTEGER NOT NULL DEFAULT 0,
                next_processed TIMESTAMPTZ NULL,
                processing_suspended BOOLEAN NOT NULL DEFAULT FALSE,
                lock_owner TEXT NULL,
                lock_claim UUID NULL,
                locked_at TIMESTAMPTZ NULL,
                last_error TEXT NULL,
                payload JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            t = self.table
        );
        let create_index = format!(
            "CREATE INDEX IF NOT EXISTS {t}_claim_idx ON {t} (status, next_processed)",
            t = self.table
        );

        sqlx::query(&create_table)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        sqlx::query(&create_index)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    #[instrument(skip(self, object), fields(table = %self.table, object_id = %object.id()), err)]
    pub async fn insert_object(&self, object: &O) -> StorageResult<()> {
        let sql = format!(
            r#"
            INSERT INTO {t} (
                id, status, processing_attempts, next_processed, processing_suspended,
                lock_owner, lock_claim, locked_at, last_error, payload
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
            t = self.table
        );
        let row = ObjectRow::encode(object)?;
        sqlx::query(&sql)
            .bind(row.id)
            .bind(row.status)
            .bind(row.processing_attempts)
            .bind(row.next_processed)
            .bind(row.processing_suspended)
            .bind(row.lock_owner)
            .bind(row.lock_claim)
            .bind(row.locked_at)
            .bind(row.last_error)
            .bind(row.payload)
            .execute(&*self.pool)
            .await
            .map_err(|e| match map_sqlx_error("insert", e) {
                StorageError::AlreadyExists(_) => StorageError::AlreadyExists(object.id().to_string()),
                other => other,
            })?;
        Ok(())
    }

    #[instrument(skip(self), fields(table = %self.table, object_id = %id), err)]
    pub async fn fetch(&self, id: O::Id) -> StorageResult<Option<O>> {
        let sql = format!("SELECT payload FROM {t} WHERE id = $1", t = self.table);
        let uuid: Uuid = id.into();
        let row = sqlx::query(&sql)
            .bind(uuid)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch", e))?;
        row.map(|r| decode_payload(&r)).transpose()
    }

    #[instrument(skip(self, mutate), fields(table = %self.table, object_id = %id), err)]
    pub async fn modify_unlocked(
        &self,
        id: O::Id,
        mutate: &mut dyn FnMut(&mut O),
    ) -> StorageResult<O> {
        let mut tx = self.begin("update_unlocked").await?;
        let mut object = self
            .select_for_update(&mut tx, id)
            .await?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        if object.is_locked() {
            return Err(StorageError::Locked(id.to_string()));
        }
        mutate(&mut object);
        self.write(&mut tx, &object).await?;
        commit(tx, "update_unlocked").await?;
        Ok(object)
    }

    /// Claim up to `request.limit` eligible rows for `request.owner`.
    #[instrument(
        skip(self, request),
        fields(
            table = %self.table,
            owner = %request.owner,
            limit = request.limit,
            claimed = tracing::field::Empty
        ),
        err
    )]
    pub async fn claim(&self, request: &ClaimRequest<O::Status>) -> StorageResult<Vec<Claimed<O>>> {
        if request.limit == 0 {
            return Ok(Vec::new());
        }

        let fresh: Vec<String> = request
            .pending_statuses
            .iter()
            .map(|s| s.code().to_string())
            .collect();
        let reclaimable: Vec<String> = request
            .pending_statuses
            .iter()
            .chain(request.stale_reversions.keys())
            .map(|s| s.code().to_string())
            .collect();
        let stale_before = request.now - request.lock_timeout;
        let limit = i64::try_from(request.limit).unwrap_or(i64::MAX);

        let sql = format!(
            r#"
            SELECT payload
            FROM {t}
            WHERE processing_suspended = FALSE
              AND (
                    (lock_owner IS NULL
                        AND status = ANY($1)
                        AND (next_processed IS NULL OR next_processed <= $2))
                 OR (lock_owner IS NOT NULL
                        AND locked_at < $3
                        AND status = ANY($4))
              )
            ORDER BY next_processed ASC NULLS FIRST, id ASC
            LIMIT $5
            FOR UPDATE SKIP LOCKED
            "#,
            t = self.table
        );

        let mut tx = self.begin("claim").await?;
        let rows = sqlx::query(&sql)
            .bind(fresh)
            .bind(request.now)
            .bind(stale_before)
            .bind(reclaimable)
            .bind(limit)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("claim", e))?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let mut object: O = decode_payload(&row)?;
            if !request.is_eligible(&object) {
                continue;
            }
            let previous_status = request.apply(&mut object);
            self.write(&mut tx, &object).await?;
            claimed.push(Claimed {
                object,
                previous_status,
            });
        }
        commit(tx, "claim").await?;

        Span::current().record("claimed", claimed.len());
        debug!(table = %self.table, claimed = claimed.len(), "claimed batch");
        Ok(claimed)
    }

    #[instrument(
        skip(self, claim, finalization),
        fields(table = %self.table, object_id = %id, status = %finalization.status),
        err
    )]
    pub async fn finalize_claim(
        &self,
        id: O::Id,
        claim: &ObjectLock,
        finalization: &Finalization<O::Status>,
    ) -> StorageResult<()> {
        let mut tx = self.begin("finalize").await?;
        let mut object = self
            .select_for_update(&mut tx, id)
            .await?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;

        if object.lock().is_some_and(|lock| lock.is_same_claim(claim)) {
            finalization.apply_to(&mut object);
            self.write(&mut tx, &object).await?;
            return commit(tx, "finalize").await;
        }
        if finalization.is_reflected_in(&object) {
            return Ok(());
        }
        match object.lock() {
            Some(lock) if lock.is_held_by(&claim.owner) => {
                Err(StorageError::lock_lost(id, "superseded by a newer claim"))
            }
            Some(lock) => Err(StorageError::lock_lost(id, format!("held by {}", lock.owner))),
            None => Err(StorageError::lock_lost(id, "object is not locked")),
        }
    }

    #[instrument(skip(self), fields(table = %self.table, from = %from, to = %to), err)]
    pub async fn reset_locks(&self, from: O::Status, to: O::Status) -> StorageResult<u64> {
        let sql = format!(
            "SELECT payload FROM {t} WHERE status = $1 FOR UPDATE",
            t = self.table
        );
        let mut tx = self.begin("reset_stale_locks").await?;
        let rows = sqlx::query(&sql)
            .bind(from.code())
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("reset_stale_locks", e))?;

        let mut reset = 0;
        for row in rows {
            let mut object: O = decode_payload(&row)?;
            object.set_status(to);
            object.set_lock(None);
            self.write(&mut tx, &object).await?;
            reset += 1;
        }
        commit(tx, "reset_stale_locks").await?;
        Ok(reset)
    }

    async fn begin(&self, operation: &str) -> StorageResult<Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(operation, e))
    }

    async fn select_for_update(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        id: O::Id,
    ) -> StorageResult<Option<O>> {
        let sql = format!("SELECT payload FROM {t} WHERE id = $1 FOR UPDATE", t = self.table);
        let uuid: Uuid = id.into();
        let row = sqlx::query(&sql)
            .bind(uuid)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("select_for_update", e))?;
        row.map(|r| decode_payload(&r)).transpose()
    }

    async fn write(&self, tx: &mut Transaction<'static, Postgres>, object: &O) -> StorageResult<()> {
        let sql = format!(
            r#"
            UPDATE {t}
            SET status = $2,
                processing_attempts = $3,
                next_processed = $4,
                processing_suspended = $5,
                lock_owner = $6,
                lock_claim = $7,
                locked_at = $8,
                last_error = $9,
                payload = $10,
                updated_at = NOW()
            WHERE id = $1
            "#,
            t = self.table
        );
        let row = ObjectRow::encode(object)?;
        sqlx::query(&sql)
            .bind(row.id)
            .bind(row.status)
            .bind(row.processing_attempts)
            .bind(row.next_processed)
            .bind(row.processing_suspended)
            .bind(row.lock_owner)
            .bind(row.lock_claim)
            .bind(row.locked_at)
            .bind(row.last_error)
            .bind(row.payload)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("write", e))?;
        Ok(())
    }
}

impl<O> ObjectStorage<O> for PostgresObjectStorage<O>
where
    O: ProcessableObject + Serialize + DeserializeOwned,
    O::Id: Into<Uuid> + From<Uuid>,
{
    fn insert(&self, object: O) -> StorageResult<()> {
        self.runtime.block_on(self.insert_object(&object))
    }

    fn find_by_id(&self, id: O::Id) -> StorageResult<Option<O>> {
        self.runtime.block_on(self.fetch(id))
    }

    fn update_unlocked(&self, id: O::Id, mutate: &mut dyn FnMut(&mut O)) -> StorageResult<O> {
        self.runtime.block_on(self.modify_unlocked(id, mutate))
    }

    fn claim_batch(&self, request: &ClaimRequest<O::Status>) -> StorageResult<Vec<Claimed<O>>> {
        self.runtime.block_on(self.claim(request))
    }

    fn finalize(
        &self,
        id: O::Id,
        claim: &ObjectLock,
        finalization: &Finalization<O::Status>,
    ) -> StorageResult<()> {
        self.runtime
            .block_on(self.finalize_claim(id, claim, finalization))
    }

    fn reset_stale_locks(&self, from: O::Status, to: O::Status) -> StorageResult<u64> {
        self.runtime.block_on(self.reset_locks(from, to))
    }
}

/// Column values written for one object.
struct ObjectRow {
    id: Uuid,
    status: &'static str,
    processing_attempts: i32,
    next_processed: Option<DateTime<Utc>>,
    processing_suspended: bool,
    lock_owner: Option<String>,
    lock_claim: Option<Uuid>,
    locked_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    payload: serde_json::Value,
}

impl ObjectRow {
    fn encode<O>(object: &O) -> StorageResult<Self>
    where
        O: ProcessableObject + Serialize,
        O::Id: Into<Uuid>,
    {
        let payload = serde_json::to_value(object)
            .map_err(|e| StorageError::Serialization(format!("encode {}: {}", object.id(), e)))?;
        let lock = object.lock();
        Ok(Self {
            id: object.id().into(),
            status: object.status().code(),
            processing_attempts: i32::try_from(object.processing_attempts()).unwrap_or(i32::MAX),
            next_processed: object.next_processed(),
            processing_suspended: object.processing_suspended(),
            lock_owner: lock.map(|l| l.owner.as_str().to_string()),
            lock_claim: lock.map(|l| l.claim),
            locked_at: lock.map(|l| l.locked_at),
            last_error: object.last_error().map(str::to_string),
            payload,
        })
    }
}

fn decode_payload<O: DeserializeOwned>(row: &sqlx::postgres::PgRow) -> StorageResult<O> {
    let payload: serde_json::Value = row
        .try_get("payload")
        .map_err(|e| StorageError::Serialization(format!("read payload column: {}", e)))?;
    serde_json::from_value(payload)
        .map_err(|e| StorageError::Serialization(format!("decode payload: {}", e)))
}

async fn commit(tx: Transaction<'static, Postgres>, operation: &str) -> StorageResult<()> {
    tx.commit().await.map_err(|e| map_sqlx_error(operation, e))
}

fn validate_identifier(name: &str) -> StorageResult<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid_start && valid_rest && name.len() <= 48 {
        Ok(())
    } else {
        Err(StorageError::backend(format!("invalid table name: {name:?}")))
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StorageError::AlreadyExists(msg),
                _ => StorageError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StorageError::Backend(format!("connection pool closed in {}", operation))
        }
        _ => StorageError::Backend(format!("sqlx error in {}: {}", operation, err)),
    }
}
