//! Session boundary: one connection bound to one transaction.
//!
//! A [`SessionFactory`] hands out sessions; the unit of work owns exactly one of them
//! for its whole scope. Sessions begin their transaction implicitly on first use and
//! keep it open until `commit`, `rollback` or `close`.
//!
//! Writes go through [`Statement`]s so that every backend speaks the same small
//! vocabulary over the four relations (`products`, `batches`, `order_lines`,
//! `allocations`).

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use chrono::NaiveDate;

use allocation_core::{BatchReference, OrderId, Sku};
use allocation_domain::{Batch, OrderLine, Product};

use crate::error::StoreResult;

pub use in_memory::{InMemorySession, InMemoryStore};
pub use postgres::{PgSession, PgSessionFactory};

/// A write against the allocation schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    /// `INSERT INTO products`.
    InsertProduct { sku: Sku, version_number: u64 },

    /// `INSERT INTO batches`.
    InsertBatch {
        reference: BatchReference,
        sku: Sku,
        purchased_quantity: u32,
        eta: Option<NaiveDate>,
    },

    /// `UPDATE products SET version_number = new WHERE sku = .. AND version_number = expected`.
    ///
    /// Zero affected rows means another transaction moved the version.
    UpdateProductVersion { sku: Sku, expected: u64, new: u64 },

    /// Insert the order line and its allocation row.
    InsertAllocation { line: OrderLine, batch: BatchReference },

    /// Delete the order line (and, by cascade, its allocation) from `batch`.
    DeleteAllocation { line: OrderLine, batch: BatchReference },
}

impl Statement {
    pub fn insert_product(sku: impl Into<Sku>, version_number: u64) -> Self {
        Statement::InsertProduct {
            sku: sku.into(),
            version_number,
        }
    }

    pub fn insert_batch(
        reference: impl Into<BatchReference>,
        sku: impl Into<Sku>,
        purchased_quantity: u32,
        eta: Option<NaiveDate>,
    ) -> Self {
        Statement::InsertBatch {
            reference: reference.into(),
            sku: sku.into(),
            purchased_quantity,
            eta,
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Statement::InsertProduct { .. } => "insert_product",
            Statement::InsertBatch { .. } => "insert_batch",
            Statement::UpdateProductVersion { .. } => "update_product_version",
            Statement::InsertAllocation { .. } => "insert_allocation",
            Statement::DeleteAllocation { .. } => "delete_allocation",
        }
    }
}

/// A connection bound to one transaction.
///
/// Sessions are owned by a single unit of work and are never shared between threads
/// while a transaction is open; `Send` lets a worker thread own one.
pub trait Session: Send {
    /// Execute a write inside the current transaction; returns the affected row count.
    fn execute(&mut self, statement: Statement) -> StoreResult<u64>;

    /// Load a product with its batches and their allocations.
    fn load_product(&mut self, sku: &Sku) -> StoreResult<Option<Product>>;

    /// Batch currently holding the order line `(orderid, sku)`, if any.
    fn allocated_batch_ref(
        &mut self,
        orderid: &OrderId,
        sku: &Sku,
    ) -> StoreResult<Option<BatchReference>>;

    /// Every batch row (with allocations), ordered by reference.
    fn batches(&mut self) -> StoreResult<Vec<Batch>>;

    /// Make the transaction's writes durable and visible to other sessions.
    fn commit(&mut self) -> StoreResult<()>;

    /// Discard the transaction's writes. A no-op when nothing is pending.
    fn rollback(&mut self) -> StoreResult<()>;

    /// Release the session; an open transaction is rolled back.
    fn close(&mut self) -> StoreResult<()> {
        self.rollback()
    }
}

/// Produces sessions bound to the same underlying store.
pub trait SessionFactory: Send + Sync {
    type Session: Session;

    fn open(&self) -> StoreResult<Self::Session>;
}

impl<F> SessionFactory for Arc<F>
where
    F: SessionFactory + ?Sized,
{
    type Session = F::Session;

    fn open(&self) -> StoreResult<Self::Session> {
        (**self).open()
    }
}

impl<F> SessionFactory for &F
where
    F: SessionFactory + ?Sized,
{
    type Session = F::Session;

    fn open(&self) -> StoreResult<Self::Session> {
        (**self).open()
    }
}
