use allocation_core::{AggregateRoot, BatchReference, DomainError, DomainResult, Sku};

use crate::batch::Batch;
use crate::order_line::OrderLine;

/// Aggregate root: Product.
///
/// A product owns every batch of its SKU. Allocations only happen through the
/// product, so a single version number guards all of its batches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Product {
    sku: Sku,
    batches: Vec<Batch>,
    version_number: u64,
}

impl Product {
    /// Create a product from its batches.
    ///
    /// Every batch must belong to `sku`.
    pub fn new(sku: impl Into<Sku>, batches: Vec<Batch>, version_number: u64) -> DomainResult<Self> {
        let sku = sku.into();
        if let Some(stray) = batches.iter().find(|b| b.sku() != &sku) {
            return Err(DomainError::sku_mismatch(&sku, stray.sku()));
        }
        Ok(Self {
            sku,
            batches,
            version_number,
        })
    }

    pub fn sku(&self) -> &Sku {
        &self.sku
    }

    pub fn version_number(&self) -> u64 {
        self.version_number
    }

    /// Record the version the product was persisted at.
    ///
    /// Called by repositories once a commit has advanced the stored row.
    pub fn set_version_number(&mut self, version_number: u64) {
        self.version_number = version_number;
    }

    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    pub fn batch(&self, reference: &BatchReference) -> Option<&Batch> {
        self.batches.iter().find(|b| b.reference() == reference)
    }

    /// Add a new batch of this SKU.
    pub fn add_batch(&mut self, batch: Batch) -> DomainResult<()> {
        if batch.sku() != &self.sku {
            return Err(DomainError::sku_mismatch(&self.sku, batch.sku()));
        }
        if self.batch(batch.reference()).is_some() {
            return Err(DomainError::DuplicateBatch {
                reference: batch.reference().clone(),
            });
        }
        self.batches.push(batch);
        Ok(())
    }

    /// Every `(batch, line)` allocation currently held by the product.
    pub fn allocations(&self) -> impl Iterator<Item = (&BatchReference, &OrderLine)> {
        self.batches
            .iter()
            .flat_map(|b| b.allocations().map(move |l| (b.reference(), l)))
    }

    /// Allocate `line` to the preferred batch that can absorb it.
    ///
    /// In-stock batches are preferred over shipments, then the earliest ETA wins.
    /// A line already allocated to one of the batches stays where it is.
    pub fn allocate(&mut self, line: OrderLine) -> DomainResult<BatchReference> {
        if line.sku != self.sku {
            return Err(DomainError::sku_mismatch(&self.sku, &line.sku));
        }
        if line.qty == 0 {
            return Err(DomainError::InvalidQuantity {
                orderid: line.orderid,
            });
        }
        if let Some(holder) = self.batches.iter().find(|b| b.holds(&line)) {
            return Ok(holder.reference().clone());
        }

        let mut candidates: Vec<usize> = (0..self.batches.len()).collect();
        candidates.sort_by_key(|&i| self.batches[i].preference_key());

        let chosen = candidates
            .into_iter()
            .find(|&i| self.batches[i].can_allocate(&line))
            .ok_or_else(|| DomainError::out_of_stock(line.sku.clone()))?;

        let batch = &mut self.batches[chosen];
        batch.allocate(line)?;
        Ok(batch.reference().clone())
    }

    /// Release `line` from whichever batch holds it.
    pub fn deallocate(&mut self, line: &OrderLine) -> Option<BatchReference> {
        self.batches
            .iter_mut()
            .find_map(|b| b.deallocate(line).map(|_| b.reference().clone()))
    }
}

impl AggregateRoot for Product {
    type Id = Sku;

    fn id(&self) -> &Self::Id {
        &self.sku
    }

    fn version(&self) -> u64 {
        self.version_number
    }
}
