use serde::{Deserialize, Serialize};

use allocation_core::{DomainError, DomainResult, OrderId, Sku};

/// A line of a customer order: some quantity of one SKU.
///
/// Lines are values; two lines with equal fields are the same line.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OrderLine {
    pub orderid: OrderId,
    pub sku: Sku,
    pub qty: u32,
}

impl OrderLine {
    pub fn new(orderid: impl Into<OrderId>, sku: impl Into<Sku>, qty: u32) -> Self {
        Self {
            orderid: orderid.into(),
            sku: sku.into(),
            qty,
        }
    }

    /// Build a line from untrusted input.
    pub fn parse(orderid: &str, sku: &str, qty: u32) -> DomainResult<Self> {
        let orderid = OrderId::parse(orderid)?;
        if qty == 0 {
            return Err(DomainError::InvalidQuantity { orderid });
        }
        Ok(Self {
            orderid,
            sku: Sku::parse(sku)?,
            qty,
        })
    }

    /// Whether `other` is the same line of the same order, whatever its quantity.
    pub fn same_line(&self, other: &OrderLine) -> bool {
        self.orderid == other.orderid && self.sku == other.sku
    }
}
