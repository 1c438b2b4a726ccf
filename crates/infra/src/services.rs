//! Application services: one unit of work per use case.
//!
//! Each service loads what it needs through the unit of work, calls the domain, and
//! commits. Errors leave the unit of work uncommitted; the caller's scope rolls it
//! back.

use chrono::NaiveDate;
use tracing::{info, instrument};

use allocation_core::{BatchReference, OrderId, Sku};
use allocation_domain::{Batch, OrderLine, Product};

use crate::error::UnitOfWorkError;
use crate::repository::ProductRepository;
use crate::unit_of_work::UnitOfWork;

/// Register a new batch, creating its product on first sight of the SKU.
#[instrument(skip(uow), fields(reference = %reference, sku = %sku), err)]
pub fn add_batch<U: UnitOfWork>(
    uow: &mut U,
    reference: BatchReference,
    sku: Sku,
    purchased_quantity: u32,
    eta: Option<NaiveDate>,
) -> Result<(), UnitOfWorkError> {
    let batch = Batch::new(reference, sku.clone(), purchased_quantity, eta);
    let products = uow.products()?;

    let known = match products.get(&sku) {
        Ok(_) => true,
        Err(UnitOfWorkError::ProductNotFound { .. }) => false,
        Err(err) => return Err(err),
    };
    if known {
        products.get(&sku)?.add_batch(batch)?;
    } else {
        products.add(Product::new(sku, vec![batch], 0)?)?;
    }

    uow.commit()?;
    info!("batch added");
    Ok(())
}

/// Allocate an order line to the preferred batch of its product.
///
/// Fails with [`UnitOfWorkError::InvalidSku`] when no product exists for `sku`.
#[instrument(skip(uow), fields(orderid = %orderid, sku = %sku), err)]
pub fn allocate<U: UnitOfWork>(
    uow: &mut U,
    orderid: OrderId,
    sku: Sku,
    qty: u32,
) -> Result<BatchReference, UnitOfWorkError> {
    let line = OrderLine::new(orderid, sku.clone(), qty);
    let product = match uow.products()?.get(&sku) {
        Ok(product) => product,
        Err(UnitOfWorkError::ProductNotFound { sku }) => {
            return Err(UnitOfWorkError::InvalidSku { sku });
        }
        Err(err) => return Err(err),
    };
    let batchref = product.allocate(line)?;

    uow.commit()?;
    info!(batchref = %batchref, "order line allocated");
    Ok(batchref)
}

/// Release an order line from whichever batch holds it.
///
/// Returns the batch that held the line, or `None` if it was not allocated.
/// Nothing is written when the line was not allocated.
#[instrument(skip(uow), fields(orderid = %orderid, sku = %sku), err)]
pub fn deallocate<U: UnitOfWork>(
    uow: &mut U,
    orderid: OrderId,
    sku: Sku,
    qty: u32,
) -> Result<Option<BatchReference>, UnitOfWorkError> {
    let line = OrderLine::new(orderid, sku.clone(), qty);
    let product = match uow.products()?.get(&sku) {
        Ok(product) => product,
        Err(UnitOfWorkError::ProductNotFound { sku }) => {
            return Err(UnitOfWorkError::InvalidSku { sku });
        }
        Err(err) => return Err(err),
    };
    let released = product.deallocate(&line);

    uow.commit()?;
    if let Some(batchref) = &released {
        info!(batchref = %batchref, "order line deallocated");
    }
    Ok(released)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::InMemoryStore;
    use crate::unit_of_work::SqlUnitOfWork;
    use allocation_core::DomainError;

    fn day(d: u32) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(2011, 1, d)
    }

    #[test]
    fn add_batch_creates_then_extends_product() {
        let store = InMemoryStore::new();
        let mut uow = SqlUnitOfWork::begin(&store).unwrap();
        add_batch(&mut uow, "b1".into(), "CRUNCHY-ARMCHAIR".into(), 100, None).unwrap();

        let mut uow = SqlUnitOfWork::begin(&store).unwrap();
        add_batch(&mut uow, "b2".into(), "CRUNCHY-ARMCHAIR".into(), 100, day(2)).unwrap();

        let sku = Sku::from("CRUNCHY-ARMCHAIR");
        assert_eq!(store.product_version(&sku).unwrap(), Some(2));
        let mut uow = SqlUnitOfWork::begin(&store).unwrap();
        assert_eq!(uow.products().unwrap().get(&sku).unwrap().batches().len(), 2);
    }

    #[test]
    fn allocate_prefers_warehouse_stock() {
        let store = InMemoryStore::new();
        let mut uow = SqlUnitOfWork::begin(&store).unwrap();
        add_batch(&mut uow, "shipment".into(), "CLOCK".into(), 100, day(3)).unwrap();
        let mut uow = SqlUnitOfWork::begin(&store).unwrap();
        add_batch(&mut uow, "warehouse".into(), "CLOCK".into(), 100, None).unwrap();

        let mut uow = SqlUnitOfWork::begin(&store).unwrap();
        let batchref = allocate(&mut uow, "o1".into(), "CLOCK".into(), 10).unwrap();
        assert_eq!(batchref, BatchReference::from("warehouse"));
    }

    #[test]
    fn allocate_unknown_sku_is_invalid() {
        let store = InMemoryStore::new();
        let mut uow = SqlUnitOfWork::begin(&store).unwrap();
        let err = allocate(&mut uow, "o1".into(), "NONEXISTENT".into(), 10).unwrap_err();
        assert!(matches!(err, UnitOfWorkError::InvalidSku { .. }));
        assert_eq!(err.to_string(), "invalid sku NONEXISTENT");
    }

    #[test]
    fn out_of_stock_leaves_product_unchanged() {
        let store = InMemoryStore::new();
        let mut uow = SqlUnitOfWork::begin(&store).unwrap();
        add_batch(&mut uow, "b1".into(), "SMALL-FORK".into(), 5, None).unwrap();

        let mut uow = SqlUnitOfWork::begin(&store).unwrap();
        let err = allocate(&mut uow, "o1".into(), "SMALL-FORK".into(), 10).unwrap_err();
        assert!(matches!(
            err,
            UnitOfWorkError::Domain(DomainError::OutOfStock { .. })
        ));
        drop(uow);
        assert_eq!(store.product_version(&Sku::from("SMALL-FORK")).unwrap(), Some(1));
    }

    #[test]
    fn deallocate_releases_the_line() {
        let store = InMemoryStore::new();
        let mut uow = SqlUnitOfWork::begin(&store).unwrap();
        add_batch(&mut uow, "b1".into(), "LAMP".into(), 20, None).unwrap();
        let mut uow = SqlUnitOfWork::begin(&store).unwrap();
        allocate(&mut uow, "o1".into(), "LAMP".into(), 10).unwrap();

        let mut uow = SqlUnitOfWork::begin(&store).unwrap();
        let released = deallocate(&mut uow, "o1".into(), "LAMP".into(), 10).unwrap();
        assert_eq!(released, Some(BatchReference::from("b1")));

        let mut uow = SqlUnitOfWork::begin(&store).unwrap();
        assert_eq!(deallocate(&mut uow, "o1".into(), "LAMP".into(), 10).unwrap(), None);
        assert_eq!(store.product_version(&Sku::from("LAMP")).unwrap(), Some(3));
    }
}
