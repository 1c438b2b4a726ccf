//! Errors raised by the allocation rules.

use thiserror::Error;

use crate::id::{BatchReference, OrderId, Sku};

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Why the domain refused an operation.
///
/// Every variant is deterministic: retrying the same call on the same state fails
/// the same way. Storage and concurrency failures live in the infrastructure crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// An identifier was blank.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("order line {orderid} must request a positive quantity")]
    InvalidQuantity { orderid: OrderId },

    /// A line or batch was handed to an aggregate of another SKU.
    #[error("sku mismatch: expected {expected}, got {actual}")]
    SkuMismatch { expected: Sku, actual: Sku },

    #[error("batch {reference} already exists")]
    DuplicateBatch { reference: BatchReference },

    /// No batch of the product can absorb the order line.
    #[error("out of stock for sku {sku}")]
    OutOfStock { sku: Sku },
}

impl DomainError {
    pub fn sku_mismatch(expected: &Sku, actual: &Sku) -> Self {
        Self::SkuMismatch {
            expected: expected.clone(),
            actual: actual.clone(),
        }
    }

    pub fn out_of_stock(sku: Sku) -> Self {
        Self::OutOfStock { sku }
    }
}
