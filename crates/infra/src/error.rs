//! Error model of the persistence layer.
//!
//! Two levels:
//!
//! - [`StoreError`]: what a [`Session`](crate::session::Session) reports (storage,
//!   constraints, version conflicts detected by the store itself).
//! - [`UnitOfWorkError`]: what callers of a unit of work see. Domain failures, storage
//!   failures and lifecycle misuse all surface here; the unit of work never retries.

use thiserror::Error;

use allocation_core::{DomainError, Sku};

/// Result type of session operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Session-level storage error.
///
/// ## Error Categories
///
/// - **StaleVersion**: a version-checked product update found another writer's version
/// - **Serialization**: the backend aborted the transaction to keep it serializable
/// - **Constraint**: uniqueness / foreign key / check violation
/// - **Connection**: the connection or pool is unavailable
/// - **Backend**: anything else the backend reports
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("stale version for product {sku}: expected version {expected}")]
    StaleVersion { sku: Sku, expected: u64 },

    #[error("serialization failure: {0}")]
    Serialization(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("connection failure: {0}")]
    Connection(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::StaleVersion { .. } | StoreError::Serialization(_))
    }
}

/// Lifecycle of one unit of work.
///
/// `Unopened → Active → {Committed, RolledBack}`; both terminal states are final.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum UnitOfWorkState {
    Unopened,
    Active,
    Committed,
    RolledBack,
}

impl UnitOfWorkState {
    pub fn is_terminal(self) -> bool {
        matches!(self, UnitOfWorkState::Committed | UnitOfWorkState::RolledBack)
    }
}

impl core::fmt::Display for UnitOfWorkState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            UnitOfWorkState::Unopened => "unopened",
            UnitOfWorkState::Active => "active",
            UnitOfWorkState::Committed => "committed",
            UnitOfWorkState::RolledBack => "rolled back",
        };
        f.write_str(s)
    }
}

/// Error surfaced by units of work, repositories and services.
#[derive(Debug, Error)]
pub enum UnitOfWorkError {
    /// `get(sku)` found no product row.
    #[error("product {sku} not found")]
    ProductNotFound { sku: Sku },

    /// `add(product)` for a SKU this unit of work already tracks.
    #[error("product {sku} is already tracked by this unit of work")]
    DuplicateProduct { sku: Sku },

    /// A service was asked to allocate against a SKU nobody stocks.
    #[error("invalid sku {sku}")]
    InvalidSku { sku: Sku },

    /// Another unit of work committed a newer version of the product first.
    #[error("concurrent update of product {sku}: expected version {expected}")]
    StaleVersion { sku: Sku, expected: u64 },

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("storage failure: {0}")]
    Storage(StoreError),

    /// The operation is not allowed in the current lifecycle state.
    #[error("cannot {operation} a unit of work that is {state}")]
    InvalidState {
        state: UnitOfWorkState,
        operation: &'static str,
    },
}

impl UnitOfWorkError {
    /// Whether the failure was caused by a concurrent writer.
    ///
    /// Callers that want to retry should reload the aggregate in a fresh unit of work.
    pub fn is_conflict(&self) -> bool {
        match self {
            UnitOfWorkError::StaleVersion { .. } => true,
            UnitOfWorkError::Storage(e) => e.is_conflict(),
            _ => false,
        }
    }
}

impl From<StoreError> for UnitOfWorkError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::StaleVersion { sku, expected } => {
                UnitOfWorkError::StaleVersion { sku, expected }
            }
            other => UnitOfWorkError::Storage(other),
        }
    }
}
