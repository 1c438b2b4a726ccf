//! Allocation demo: seeds a batch and races two allocations against it.
//!
//! Store selection follows `ALLOCATION_STORE` (see `allocation_infra::config`).

use std::sync::Barrier;
use std::thread;

use anyhow::Context;
use uuid::Uuid;

use allocation_core::{OrderId, Sku};
use allocation_domain::OrderLine;
use allocation_infra::{
    services, InMemoryStore, PgSessionFactory, ProductRepository, SessionFactory, SqlUnitOfWork,
    StoreConfig, UnitOfWork, UnitOfWorkError,
};

fn main() -> anyhow::Result<()> {
    allocation_observability::init();

    let config = StoreConfig::from_env().context("invalid store configuration")?;
    match config {
        StoreConfig::Memory => {
            tracing::info!("using in-memory store");
            run_demo(&InMemoryStore::new())
        }
        StoreConfig::Postgres(pg) => {
            tracing::info!(url = %pg.redacted_url(), "using postgres store");
            let factory = PgSessionFactory::connect(&pg).context("failed to connect to postgres")?;
            factory.migrate().context("failed to apply schema")?;
            run_demo(&factory)
        }
    }
}

fn run_demo<F: SessionFactory>(factory: &F) -> anyhow::Result<()> {
    let run = Uuid::now_v7().simple().to_string();
    let sku = Sku::from(format!("DEMO-TABLE-{run}"));

    let mut uow = SqlUnitOfWork::begin(factory)?;
    services::add_batch(&mut uow, format!("demo-batch-{run}").into(), sku.clone(), 100, None)?;
    drop(uow);

    // Both workers load version 1 before either commits; only one commit can win.
    let barrier = Barrier::new(2);
    let outcomes: Vec<(OrderId, Result<(), UnitOfWorkError>)> = thread::scope(|scope| {
        let handles: Vec<_> = ["order-a", "order-b"]
            .into_iter()
            .map(|orderid| {
                let sku = sku.clone();
                let barrier = &barrier;
                scope.spawn(move || {
                    let orderid = OrderId::from(orderid);
                    let outcome = race_allocation(factory, barrier, orderid.clone(), sku);
                    (orderid, outcome)
                })
            })
            .collect();
        handles
            .into_iter()
            .filter_map(|handle| handle.join().ok())
            .collect()
    });

    for (orderid, outcome) in &outcomes {
        match outcome {
            Ok(()) => tracing::info!(orderid = %orderid, "allocation committed"),
            Err(err) if err.is_conflict() => {
                tracing::warn!(orderid = %orderid, error = %err, "allocation lost the race")
            }
            Err(err) => tracing::error!(orderid = %orderid, error = %err, "allocation failed"),
        }
    }

    let mut uow = SqlUnitOfWork::begin(factory)?;
    let product = uow.products()?.get(&sku)?;
    tracing::info!(
        sku = %sku,
        version = product.version_number(),
        allocations = product.allocations().count(),
        "final product state"
    );
    Ok(())
}

fn race_allocation<F: SessionFactory>(
    factory: &F,
    barrier: &Barrier,
    orderid: OrderId,
    sku: Sku,
) -> Result<(), UnitOfWorkError> {
    let line = OrderLine::new(orderid, sku.clone(), 10);
    let attempt = SqlUnitOfWork::begin(factory).and_then(|mut uow| {
        uow.products()?.get(&sku)?.allocate(line)?;
        Ok(uow)
    });
    barrier.wait();
    attempt?.commit()
}
