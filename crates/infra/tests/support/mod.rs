//! Store-independent unit of work scenarios.
//!
//! Every scenario runs against any [`SessionFactory`]; the in-memory and Postgres
//! suites only differ in how they build the factory. Names get a per-fixture suffix
//! so scenarios can share one database.

#![allow(dead_code)]

use std::sync::Barrier;
use std::thread;

use thiserror::Error;
use uuid::Uuid;

use allocation_core::{BatchReference, OrderId, Sku};
use allocation_domain::OrderLine;
use allocation_infra::{
    scoped, ProductRepository, Session, SessionFactory, SqlUnitOfWork, Statement, UnitOfWork,
    UnitOfWorkError, UnitOfWorkState,
};

/// Error raised by scenario code inside a unit of work scope.
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("scenario aborted: {0}")]
    Aborted(String),

    #[error(transparent)]
    UnitOfWork(#[from] UnitOfWorkError),
}

pub struct Fixture<F> {
    pub factory: F,
    suffix: String,
}

impl<F: SessionFactory> Fixture<F> {
    /// Fixture with plain names, for a store owned by one test.
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            suffix: String::new(),
        }
    }

    /// Fixture whose names are unique across runs, for a shared database.
    pub fn isolated(factory: F) -> Self {
        Self {
            factory,
            suffix: format!("-{}", Uuid::now_v7().simple()),
        }
    }

    pub fn sku(&self, name: &str) -> Sku {
        Sku::from(format!("{name}{}", self.suffix))
    }

    pub fn batch(&self, name: &str) -> BatchReference {
        BatchReference::from(format!("{name}{}", self.suffix))
    }

    pub fn order(&self, name: &str) -> OrderId {
        OrderId::from(format!("{name}{}", self.suffix))
    }

    /// Commit a product at version 1 with one batch, outside any unit of work.
    pub fn insert_batch(&self, reference: &BatchReference, sku: &Sku, qty: u32) {
        let mut session = self.factory.open().unwrap();
        write_batch(&mut session, reference, sku, qty).unwrap();
        session.commit().unwrap();
    }

    pub fn allocated_batch_ref(&self, orderid: &OrderId, sku: &Sku) -> Option<BatchReference> {
        let mut session = self.factory.open().unwrap();
        let found = session.allocated_batch_ref(orderid, sku).unwrap();
        session.close().unwrap();
        found
    }

    pub fn batch_refs(&self) -> Vec<BatchReference> {
        let mut session = self.factory.open().unwrap();
        let refs = session
            .batches()
            .unwrap()
            .into_iter()
            .map(|b| b.reference().clone())
            .collect();
        session.close().unwrap();
        refs
    }

    pub fn product_version(&self, sku: &Sku) -> Option<u64> {
        let mut session = self.factory.open().unwrap();
        let version = session
            .load_product(sku)
            .unwrap()
            .map(|p| p.version_number());
        session.close().unwrap();
        version
    }

    /// Allocation committed through a unit of work is readable from a new session.
    pub fn basic_commit(&self) {
        let sku = self.sku("HIPSTER-WORKBENCH");
        let batch = self.batch("batch1");
        let orderid = self.order("o1");
        self.insert_batch(&batch, &sku, 100);

        let mut uow = SqlUnitOfWork::begin(&self.factory).unwrap();
        let product = uow.products().unwrap().get(&sku).unwrap();
        product
            .allocate(OrderLine::new(orderid.clone(), sku.clone(), 10))
            .unwrap();
        uow.commit().unwrap();
        drop(uow);

        assert_eq!(self.allocated_batch_ref(&orderid, &sku), Some(batch));
        assert_eq!(self.product_version(&sku), Some(2));
    }

    /// Leaving the scope without commit discards the batch written inside it.
    pub fn default_rollback(&self) {
        let sku = self.sku("MEDIUM-PLINTH");
        let batch = self.batch("batch1");

        let mut uow = SqlUnitOfWork::begin(&self.factory).unwrap();
        write_batch(uow.session().unwrap(), &batch, &sku, 100).unwrap();
        drop(uow);

        assert!(!self.batch_refs().contains(&batch));
        assert_eq!(self.product_version(&sku), None);
    }

    /// An error raised in scope comes back unchanged and nothing persists.
    pub fn rollback_on_error(&self) {
        let sku = self.sku("LARGE-FORK");
        let batch = self.batch("batch1");

        let result: Result<(), ScenarioError> = scoped(&self.factory, |uow| {
            write_batch(uow.session()?, &batch, &sku, 100)?;
            Err(ScenarioError::Aborted("my exception".to_string()))
        });

        match result {
            Err(ScenarioError::Aborted(msg)) => assert_eq!(msg, "my exception"),
            other => panic!("expected the scenario error back, got {other:?}"),
        }
        assert!(!self.batch_refs().contains(&batch));
    }

    /// Rolling back twice, or with nothing pending, changes nothing.
    pub fn rollback_is_idempotent(&self) {
        let sku = self.sku("QUIET-LAMP");
        let batch = self.batch("lamp-batch");
        self.insert_batch(&batch, &sku, 20);

        let mut idle = SqlUnitOfWork::begin(&self.factory).unwrap();
        idle.rollback().unwrap();
        idle.rollback().unwrap();
        assert_eq!(idle.state(), UnitOfWorkState::RolledBack);

        let mut uow = SqlUnitOfWork::begin(&self.factory).unwrap();
        uow.products()
            .unwrap()
            .get(&sku)
            .unwrap()
            .allocate(OrderLine::new(self.order("o1"), sku.clone(), 5))
            .unwrap();
        uow.rollback().unwrap();
        uow.rollback().unwrap();
        uow.exit().unwrap();

        assert_eq!(self.allocated_batch_ref(&self.order("o1"), &sku), None);
        assert_eq!(self.product_version(&sku), Some(1));
        assert!(self.batch_refs().contains(&batch));
    }

    /// Two units of work allocate against the same product version; one wins.
    pub fn concurrent_allocations_conflict(&self) {
        let sku = self.sku("RACING-STOOL");
        let batch = self.batch("stool-batch");
        self.insert_batch(&batch, &sku, 100);

        let orders = [self.order("o-a"), self.order("o-b")];
        let barrier = Barrier::new(orders.len());
        let outcomes: Vec<Result<(), UnitOfWorkError>> = thread::scope(|scope| {
            let handles: Vec<_> = orders
                .iter()
                .map(|orderid| {
                    let (factory, barrier, sku) = (&self.factory, &barrier, &sku);
                    scope.spawn(move || {
                        let line = OrderLine::new(orderid.clone(), sku.clone(), 10);
                        let attempt = SqlUnitOfWork::begin(factory).and_then(|mut uow| {
                            uow.products()?.get(sku)?.allocate(line)?;
                            Ok(uow)
                        });
                        barrier.wait();
                        attempt?.commit()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let winners = outcomes.iter().filter(|o| o.is_ok()).count();
        assert_eq!(winners, 1, "outcomes: {outcomes:?}");
        let loser = outcomes.into_iter().find_map(Result::err).unwrap();
        assert!(loser.is_conflict(), "unexpected failure: {loser}");
        assert!(matches!(loser, UnitOfWorkError::StaleVersion { expected: 1, .. }));

        assert_eq!(self.product_version(&sku), Some(2));
        let persisted = orders
            .iter()
            .filter_map(|o| self.allocated_batch_ref(o, &sku))
            .count();
        assert_eq!(persisted, 1);
    }
}

fn write_batch<S: Session>(
    session: &mut S,
    reference: &BatchReference,
    sku: &Sku,
    qty: u32,
) -> Result<(), UnitOfWorkError> {
    session.execute(Statement::insert_product(sku.clone(), 1))?;
    session.execute(Statement::insert_batch(reference.clone(), sku.clone(), qty, None))?;
    Ok(())
}
