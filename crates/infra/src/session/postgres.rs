//! Postgres-backed sessions.
//!
//! Each [`PgSession`] holds at most one open `sqlx` transaction, begun lazily on first
//! use. The unit of work is synchronous, so the factory owns a small tokio runtime and
//! sessions `block_on` it; call them from plain threads, not from async tasks.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Constraint` |
//! | Database (foreign key violation) | `23503` | `Constraint` |
//! | Database (check constraint violation) | `23514` | `Constraint` |
//! | Database (serialization failure / deadlock) | `40001` / `40P01` | `Serialization` |
//! | Database (other) | Any other | `Backend` |
//! | PoolClosed / PoolTimedOut / Io | N/A | `Connection` |
//! | Other | N/A | `Backend` |
//!
//! ## Optimistic Concurrency
//!
//! `UpdateProductVersion` is a conditional `UPDATE ... WHERE version_number = $expected`.
//! Under READ COMMITTED a concurrent writer's row lock makes the second update wait;
//! once the first transaction commits the predicate is re-evaluated, matches zero
//! rows, and the repository reports a stale version.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tokio::runtime::Runtime;
use tracing::{debug, instrument, warn};

use allocation_core::{BatchReference, OrderId, Sku};
use allocation_domain::{Batch, OrderLine, Product};

use super::{Session, SessionFactory, Statement};
use crate::config::PostgresConfig;
use crate::error::{StoreError, StoreResult};

const SCHEMA: &str = include_str!("../../migrations/0001_allocation_schema.sql");

/// Factory of Postgres sessions sharing one connection pool.
#[derive(Debug, Clone)]
pub struct PgSessionFactory {
    pool: PgPool,
    runtime: Arc<Runtime>,
}

impl PgSessionFactory {
    /// Build the runtime and connect the pool.
    #[instrument(skip(config), fields(url = %config.redacted_url()), err)]
    pub fn connect(config: &PostgresConfig) -> StoreResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("allocation-pg")
            .enable_all()
            .build()
            .map_err(|e| StoreError::Backend(format!("failed to build runtime: {e}")))?;

        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(config.max_connections)
                    .connect(&config.url),
            )
            .map_err(|e| map_sqlx_error("connect", e))?;

        Ok(Self {
            pool,
            runtime: Arc::new(runtime),
        })
    }

    /// Create the allocation tables if they do not exist.
    pub fn migrate(&self) -> StoreResult<()> {
        self.runtime
            .block_on(sqlx::raw_sql(SCHEMA).execute(&self.pool))
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }
}

impl SessionFactory for PgSessionFactory {
    type Session = PgSession;

    fn open(&self) -> StoreResult<Self::Session> {
        Ok(PgSession {
            pool: self.pool.clone(),
            runtime: Arc::clone(&self.runtime),
            tx: None,
        })
    }
}

/// Session bound to one Postgres transaction.
pub struct PgSession {
    pool: PgPool,
    runtime: Arc<Runtime>,
    tx: Option<Transaction<'static, Postgres>>,
}

impl core::fmt::Debug for PgSession {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PgSession")
            .field("in_transaction", &self.tx.is_some())
            .finish()
    }
}

impl PgSession {
    fn transaction(&mut self) -> StoreResult<&mut Transaction<'static, Postgres>> {
        let tx = match self.tx.take() {
            Some(tx) => tx,
            None => self
                .runtime
                .block_on(self.pool.begin())
                .map_err(|e| map_sqlx_error("begin_transaction", e))?,
        };
        Ok(self.tx.insert(tx))
    }
}

impl Session for PgSession {
    fn execute(&mut self, statement: Statement) -> StoreResult<u64> {
        let runtime = Arc::clone(&self.runtime);
        let tx = self.transaction()?;
        runtime.block_on(execute_statement(tx, &statement))
    }

    fn load_product(&mut self, sku: &Sku) -> StoreResult<Option<Product>> {
        let runtime = Arc::clone(&self.runtime);
        let tx = self.transaction()?;
        runtime.block_on(load_product(tx, sku))
    }

    fn allocated_batch_ref(
        &mut self,
        orderid: &OrderId,
        sku: &Sku,
    ) -> StoreResult<Option<BatchReference>> {
        let runtime = Arc::clone(&self.runtime);
        let tx = self.transaction()?;
        let row = runtime
            .block_on(
                sqlx::query(
                    r#"
                    SELECT a.batch_reference
                    FROM allocations a
                    JOIN order_lines ol ON ol.id = a.orderline_id
                    WHERE ol.orderid = $1 AND ol.sku = $2
                    "#,
                )
                .bind(orderid.as_str())
                .bind(sku.as_str())
                .fetch_optional(&mut **tx),
            )
            .map_err(|e| map_sqlx_error("allocated_batch_ref", e))?;

        row.map(|r| {
            r.try_get::<String, _>("batch_reference")
                .map(BatchReference::from)
                .map_err(|e| map_sqlx_error("read_batch_reference", e))
        })
        .transpose()
    }

    fn batches(&mut self) -> StoreResult<Vec<Batch>> {
        let runtime = Arc::clone(&self.runtime);
        let tx = self.transaction()?;
        runtime.block_on(load_batches(tx, None))
    }

    fn commit(&mut self) -> StoreResult<()> {
        if let Some(tx) = self.tx.take() {
            self.runtime
                .block_on(tx.commit())
                .map_err(|e| map_sqlx_error("commit_transaction", e))?;
            debug!("postgres transaction committed");
        }
        Ok(())
    }

    fn rollback(&mut self) -> StoreResult<()> {
        if let Some(tx) = self.tx.take() {
            self.runtime
                .block_on(tx.rollback())
                .map_err(|e| map_sqlx_error("rollback_transaction", e))?;
            debug!("postgres transaction rolled back");
        }
        Ok(())
    }
}

impl Drop for PgSession {
    fn drop(&mut self) {
        // Returning the connection to the pool needs the runtime context.
        if let Err(err) = self.rollback() {
            warn!(error = %err, "rollback of abandoned postgres session failed");
        }
    }
}

async fn execute_statement(
    tx: &mut Transaction<'static, Postgres>,
    statement: &Statement,
) -> StoreResult<u64> {
    let operation = statement.kind();
    let result = match statement {
        Statement::InsertProduct {
            sku,
            version_number,
        } => {
            sqlx::query("INSERT INTO products (sku, version_number) VALUES ($1, $2)")
                .bind(sku.as_str())
                .bind(sql_bigint("version_number", *version_number)?)
                .execute(&mut **tx)
                .await
        }
        Statement::InsertBatch {
            reference,
            sku,
            purchased_quantity,
            eta,
        } => {
            sqlx::query(
                "INSERT INTO batches (reference, sku, purchased_quantity, eta) VALUES ($1, $2, $3, $4)",
            )
            .bind(reference.as_str())
            .bind(sku.as_str())
            .bind(sql_int("purchased_quantity", *purchased_quantity)?)
            .bind(*eta)
            .execute(&mut **tx)
            .await
        }
        Statement::UpdateProductVersion { sku, expected, new } => {
            sqlx::query(
                "UPDATE products SET version_number = $1 WHERE sku = $2 AND version_number = $3",
            )
            .bind(sql_bigint("version_number", *new)?)
            .bind(sku.as_str())
            .bind(sql_bigint("version_number", *expected)?)
            .execute(&mut **tx)
            .await
        }
        Statement::InsertAllocation { line, batch } => {
            let row = sqlx::query(
                "INSERT INTO order_lines (orderid, sku, qty) VALUES ($1, $2, $3) RETURNING id",
            )
            .bind(line.orderid.as_str())
            .bind(line.sku.as_str())
            .bind(sql_int("qty", line.qty)?)
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
            let orderline_id: i64 = row
                .try_get("id")
                .map_err(|e| map_sqlx_error(operation, e))?;

            sqlx::query("INSERT INTO allocations (orderline_id, batch_reference) VALUES ($1, $2)")
                .bind(orderline_id)
                .bind(batch.as_str())
                .execute(&mut **tx)
                .await
        }
        Statement::DeleteAllocation { line, batch } => {
            sqlx::query(
                r#"
                DELETE FROM order_lines ol
                USING allocations a
                WHERE a.orderline_id = ol.id
                  AND ol.orderid = $1
                  AND ol.sku = $2
                  AND a.batch_reference = $3
                "#,
            )
            .bind(line.orderid.as_str())
            .bind(line.sku.as_str())
            .bind(batch.as_str())
            .execute(&mut **tx)
            .await
        }
    };

    result
        .map(|r| r.rows_affected())
        .map_err(|e| map_sqlx_error(operation, e))
}

async fn load_product(
    tx: &mut Transaction<'static, Postgres>,
    sku: &Sku,
) -> StoreResult<Option<Product>> {
    let row = sqlx::query("SELECT version_number FROM products WHERE sku = $1")
        .bind(sku.as_str())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("load_product", e))?;

    let Some(row) = row else {
        return Ok(None);
    };
    let version: i64 = row
        .try_get("version_number")
        .map_err(|e| map_sqlx_error("read_version_number", e))?;

    let batches = load_batches(tx, Some(sku)).await?;
    Product::new(sku.clone(), batches, from_sql_bigint("version_number", version)?)
        .map(Some)
        .map_err(|e| StoreError::Backend(format!("corrupt product rows for {sku}: {e}")))
}

/// Load batches (all of them, or those of one SKU) with their allocated lines.
async fn load_batches(
    tx: &mut Transaction<'static, Postgres>,
    sku: Option<&Sku>,
) -> StoreResult<Vec<Batch>> {
    let sku_param: Option<&str> = sku.map(Sku::as_str);

    let batch_rows = sqlx::query(
        r#"
        SELECT reference, sku, purchased_quantity, eta
        FROM batches
        WHERE ($1::text IS NULL OR sku = $1)
        ORDER BY reference ASC
        "#,
    )
    .bind(sku_param)
    .fetch_all(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("load_batches", e))?;

    let line_rows = sqlx::query(
        r#"
        SELECT a.batch_reference, ol.orderid, ol.sku, ol.qty
        FROM allocations a
        JOIN order_lines ol ON ol.id = a.orderline_id
        JOIN batches b ON b.reference = a.batch_reference
        WHERE ($1::text IS NULL OR b.sku = $1)
        "#,
    )
    .bind(sku_param)
    .fetch_all(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("load_allocations", e))?;

    let mut lines: BTreeMap<String, Vec<OrderLine>> = BTreeMap::new();
    for row in &line_rows {
        let (batch, line) = allocation_row(row)?;
        lines.entry(batch).or_default().push(line);
    }

    batch_rows
        .iter()
        .map(|row| {
            let row = BatchRow::from_row(row).map_err(|e| map_sqlx_error("read_batch", e))?;
            let allocated = lines.remove(&row.reference).unwrap_or_default();
            Ok(Batch::restore(
                BatchReference::from(row.reference),
                Sku::from(row.sku),
                from_sql_int("purchased_quantity", row.purchased_quantity)?,
                row.eta,
                allocated,
            ))
        })
        .collect()
}

fn allocation_row(row: &PgRow) -> StoreResult<(String, OrderLine)> {
    let read = |e: sqlx::Error| map_sqlx_error("read_allocation", e);
    let batch: String = row.try_get("batch_reference").map_err(read)?;
    let orderid: String = row.try_get("orderid").map_err(read)?;
    let sku: String = row.try_get("sku").map_err(read)?;
    let qty: i32 = row.try_get("qty").map_err(read)?;
    Ok((batch, OrderLine::new(orderid, sku, from_sql_int("qty", qty)?)))
}

// Column conversions. Postgres INTEGER/BIGINT are signed, domain quantities and
// versions are not; out-of-range values are rejected instead of wrapping.

fn sql_int(column: &str, value: u32) -> StoreResult<i32> {
    i32::try_from(value).map_err(|_| {
        StoreError::Constraint(format!("{column} {value} does not fit an INTEGER column"))
    })
}

fn sql_bigint(column: &str, value: u64) -> StoreResult<i64> {
    i64::try_from(value).map_err(|_| {
        StoreError::Constraint(format!("{column} {value} does not fit a BIGINT column"))
    })
}

fn from_sql_int(column: &str, value: i32) -> StoreResult<u32> {
    u32::try_from(value).map_err(|_| StoreError::Backend(format!("corrupt {column} {value}")))
}

fn from_sql_bigint(column: &str, value: i64) -> StoreResult<u64> {
    u64::try_from(value).map_err(|_| StoreError::Backend(format!("corrupt {column} {value}")))
}

// SQLx row types

#[derive(Debug)]
struct BatchRow {
    reference: String,
    sku: String,
    purchased_quantity: i32,
    eta: Option<NaiveDate>,
}

impl<'r> FromRow<'r, PgRow> for BatchRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(BatchRow {
            reference: row.try_get("reference")?,
            sku: row.try_get("sku")?,
            purchased_quantity: row.try_get("purchased_quantity")?,
            eta: row.try_get("eta")?,
        })
    }
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") | Some("23503") | Some("23514") => StoreError::Constraint(msg),
                Some("40001") | Some("40P01") => StoreError::Serialization(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
            StoreError::Connection(format!("connection pool unavailable in {}", operation))
        }
        sqlx::Error::Io(e) => StoreError::Connection(format!("io error in {}: {}", operation, e)),
        _ => StoreError::Backend(format!("sqlx error in {}: {}", operation, err)),
    }
}
