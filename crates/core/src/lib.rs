//! `allocation-core`: identifiers, errors and aggregate plumbing shared by the
//! allocation crates. No IO lives here.

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::{AggregateRoot, ExpectedVersion};
pub use error::{DomainError, DomainResult};
pub use id::{BatchReference, OrderId, Sku};
