//! Allocation domain module.
//!
//! This crate contains the business rules for allocating order lines to batches
//! of stock, implemented as deterministic domain logic (no IO, no storage).

pub mod batch;
pub mod order_line;
pub mod product;

pub use batch::Batch;
pub use order_line::OrderLine;
pub use product::Product;
