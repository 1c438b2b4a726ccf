use std::collections::BTreeSet;

use chrono::NaiveDate;

use allocation_core::{BatchReference, DomainError, DomainResult, Sku};

use crate::order_line::OrderLine;

/// A purchased batch of stock for one SKU.
///
/// A batch without an ETA is already in the warehouse; one with an ETA is still
/// shipping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    reference: BatchReference,
    sku: Sku,
    eta: Option<NaiveDate>,
    purchased_quantity: u32,
    allocations: BTreeSet<OrderLine>,
}

impl Batch {
    pub fn new(
        reference: impl Into<BatchReference>,
        sku: impl Into<Sku>,
        purchased_quantity: u32,
        eta: Option<NaiveDate>,
    ) -> Self {
        Self {
            reference: reference.into(),
            sku: sku.into(),
            eta,
            purchased_quantity,
            allocations: BTreeSet::new(),
        }
    }

    /// Rebuild a batch from persisted rows.
    ///
    /// Skips capacity checks: the rows were written by earlier allocations.
    pub fn restore(
        reference: BatchReference,
        sku: Sku,
        purchased_quantity: u32,
        eta: Option<NaiveDate>,
        allocations: impl IntoIterator<Item = OrderLine>,
    ) -> Self {
        Self {
            reference,
            sku,
            eta,
            purchased_quantity,
            allocations: allocations.into_iter().collect(),
        }
    }

    pub fn reference(&self) -> &BatchReference {
        &self.reference
    }

    pub fn sku(&self) -> &Sku {
        &self.sku
    }

    pub fn eta(&self) -> Option<NaiveDate> {
        self.eta
    }

    pub fn purchased_quantity(&self) -> u32 {
        self.purchased_quantity
    }

    pub fn allocations(&self) -> impl Iterator<Item = &OrderLine> {
        self.allocations.iter()
    }

    pub fn allocated_quantity(&self) -> u32 {
        self.allocations.iter().map(|l| l.qty).sum()
    }

    pub fn available_quantity(&self) -> u32 {
        self.purchased_quantity.saturating_sub(self.allocated_quantity())
    }

    pub fn holds(&self, line: &OrderLine) -> bool {
        self.allocations.iter().any(|l| l.same_line(line))
    }

    pub fn can_allocate(&self, line: &OrderLine) -> bool {
        self.sku == line.sku && self.available_quantity() >= line.qty
    }

    /// Allocate `line` to this batch.
    ///
    /// Allocating a line the batch already holds is a no-op.
    pub fn allocate(&mut self, line: OrderLine) -> DomainResult<()> {
        if self.holds(&line) {
            return Ok(());
        }
        if line.sku != self.sku {
            return Err(DomainError::sku_mismatch(&self.sku, &line.sku));
        }
        if !self.can_allocate(&line) {
            return Err(DomainError::out_of_stock(line.sku));
        }
        self.allocations.insert(line);
        Ok(())
    }

    /// Remove the allocation of `line` (matched by order id and SKU).
    ///
    /// Returns the removed line, if the batch held it.
    pub fn deallocate(&mut self, line: &OrderLine) -> Option<OrderLine> {
        let held = self.allocations.iter().find(|l| l.same_line(line)).cloned()?;
        self.allocations.remove(&held);
        Some(held)
    }

    /// Preference order: in-stock batches first, then by earliest ETA.
    pub(crate) fn preference_key(&self) -> (bool, Option<NaiveDate>) {
        (self.eta.is_some(), self.eta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(orderid: &str, qty: u32) -> OrderLine {
        OrderLine::new(orderid, "SMALL-TABLE", qty)
    }

    #[test]
    fn allocating_reduces_available_quantity() {
        let mut batch = Batch::new("batch-001", "SMALL-TABLE", 20, None);
        batch.allocate(line("order-ref", 2)).unwrap();
        assert_eq!(batch.available_quantity(), 18);
        assert_eq!(batch.allocated_quantity(), 2);
    }

    #[test]
    fn cannot_allocate_more_than_available() {
        let mut batch = Batch::new("batch-001", "BLUE-CUSHION", 1, None);
        let err = batch
            .allocate(OrderLine::new("order-123", "BLUE-CUSHION", 2))
            .unwrap_err();
        assert_eq!(err, DomainError::out_of_stock(Sku::from("BLUE-CUSHION")));
        assert_eq!(batch.available_quantity(), 1);
    }

    #[test]
    fn cannot_allocate_other_sku() {
        let mut batch = Batch::new("batch-001", "UNCOMFORTABLE-CHAIR", 100, None);
        let err = batch
            .allocate(OrderLine::new("order-123", "EXPENSIVE-TOASTER", 10))
            .unwrap_err();
        assert!(matches!(err, DomainError::SkuMismatch { .. }));
    }

    #[test]
    fn allocation_is_idempotent() {
        let mut batch = Batch::new("batch-001", "SMALL-TABLE", 20, None);
        batch.allocate(line("order-ref", 2)).unwrap();
        batch.allocate(line("order-ref", 2)).unwrap();
        assert_eq!(batch.available_quantity(), 18);
    }

    #[test]
    fn deallocate_only_removes_held_lines() {
        let mut batch = Batch::new("batch-001", "SMALL-TABLE", 20, None);
        assert!(batch.deallocate(&line("unallocated", 2)).is_none());

        batch.allocate(line("order-ref", 2)).unwrap();
        assert_eq!(batch.deallocate(&line("order-ref", 2)), Some(line("order-ref", 2)));
        assert_eq!(batch.available_quantity(), 20);
    }

    #[test]
    fn in_stock_batches_sort_before_shipments() {
        let tomorrow = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let later = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        let in_stock = Batch::new("in-stock", "CLOCK", 10, None);
        let soon = Batch::new("soon", "CLOCK", 10, Some(tomorrow));
        let late = Batch::new("late", "CLOCK", 10, Some(later));

        assert!(in_stock.preference_key() < soon.preference_key());
        assert!(soon.preference_key() < late.preference_key());
    }
}
