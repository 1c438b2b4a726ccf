//! Product repository: loads and tracks aggregates for one unit of work.
//!
//! The repository is an identity map over the products a unit of work touched.
//! `get` loads a product once and hands out the same instance afterwards; `flush`
//! turns the difference between what was loaded and what is held now into
//! [`Statement`]s on the bound session.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, instrument, warn};

use allocation_core::{AggregateRoot, BatchReference, ExpectedVersion, Sku};
use allocation_domain::{OrderLine, Product};

use crate::error::UnitOfWorkError;
use crate::session::{Session, Statement};

/// Collection-like access to Product aggregates.
pub trait ProductRepository {
    /// Register a new product (with its batches) for insertion on commit.
    fn add(&mut self, product: Product) -> Result<(), UnitOfWorkError>;

    /// Load the product for `sku`, or return the instance already loaded.
    fn get(&mut self, sku: &Sku) -> Result<&mut Product, UnitOfWorkError>;

    /// Every product returned by `get` or passed to `add`, in SKU order.
    fn seen(&self) -> Vec<&Product>;
}

type AllocationSet = BTreeSet<(BatchReference, OrderLine)>;

/// What a tracked product looked like when the unit of work first saw it.
#[derive(Debug)]
enum Origin {
    Added,
    Loaded {
        version: u64,
        batches: BTreeSet<BatchReference>,
        allocations: AllocationSet,
    },
}

#[derive(Debug)]
struct Tracked {
    product: Product,
    origin: Origin,
}

impl Tracked {
    fn loaded(product: Product) -> Self {
        let origin = Origin::Loaded {
            version: product.version(),
            batches: batch_refs(&product),
            allocations: allocation_set(&product),
        };
        Self { product, origin }
    }

    fn is_dirty(&self) -> bool {
        match &self.origin {
            Origin::Added => true,
            Origin::Loaded {
                batches,
                allocations,
                ..
            } => *batches != batch_refs(&self.product) || *allocations != allocation_set(&self.product),
        }
    }

    fn expected_version(&self) -> ExpectedVersion {
        match &self.origin {
            Origin::Added => ExpectedVersion::Any,
            Origin::Loaded { version, .. } => ExpectedVersion::Exact(*version),
        }
    }

    /// Version the row will carry once the pending flush commits.
    fn committed_version(&self) -> u64 {
        if self.is_dirty() {
            self.expected_version().next()
        } else {
            self.product.version()
        }
    }
}

fn batch_refs(product: &Product) -> BTreeSet<BatchReference> {
    product.batches().iter().map(|b| b.reference().clone()).collect()
}

fn allocation_set(product: &Product) -> AllocationSet {
    product
        .allocations()
        .map(|(batch, line)| (batch.clone(), line.clone()))
        .collect()
}

/// Repository over a [`Session`].
#[derive(Debug)]
pub struct SqlProductRepository<S> {
    session: S,
    seen: BTreeMap<Sku, Tracked>,
}

impl<S: Session> SqlProductRepository<S> {
    pub fn new(session: S) -> Self {
        Self {
            session,
            seen: BTreeMap::new(),
        }
    }

    pub fn session(&mut self) -> &mut S {
        &mut self.session
    }

    /// Write every pending change to the session (without committing).
    ///
    /// Loaded products that changed get a version-checked update first; zero affected
    /// rows aborts the flush with [`UnitOfWorkError::StaleVersion`].
    #[instrument(skip(self), fields(tracked = self.seen.len()), err)]
    pub fn flush(&mut self) -> Result<(), UnitOfWorkError> {
        for (sku, tracked) in &self.seen {
            if !tracked.is_dirty() {
                continue;
            }
            let statements = match &tracked.origin {
                Origin::Added => insert_statements(&tracked.product),
                Origin::Loaded {
                    version,
                    batches,
                    allocations,
                } => {
                    let bumped = self.session.execute(Statement::UpdateProductVersion {
                        sku: sku.clone(),
                        expected: *version,
                        new: tracked.expected_version().next(),
                    })?;
                    if bumped == 0 {
                        debug!(sku = %sku, expected = *version, "version-checked update matched no row");
                        return Err(UnitOfWorkError::StaleVersion {
                            sku: sku.clone(),
                            expected: *version,
                        });
                    }
                    change_statements(&tracked.product, batches, allocations)
                }
            };

            debug!(sku = %sku, statements = statements.len(), "flushing product");
            for statement in statements {
                self.session.execute(statement)?;
            }
        }
        Ok(())
    }

    /// Record that the flushed state is now the committed state.
    pub fn mark_committed(&mut self) {
        for tracked in self.seen.values_mut() {
            let version = tracked.committed_version();
            tracked.product.set_version_number(version);
            *tracked = Tracked::loaded(tracked.product.clone());
        }
    }
}

fn insert_statements(product: &Product) -> Vec<Statement> {
    let mut statements = vec![Statement::InsertProduct {
        sku: product.sku().clone(),
        version_number: ExpectedVersion::Any.next(),
    }];
    for batch in product.batches() {
        statements.push(Statement::InsertBatch {
            reference: batch.reference().clone(),
            sku: batch.sku().clone(),
            purchased_quantity: batch.purchased_quantity(),
            eta: batch.eta(),
        });
    }
    for (batch, line) in product.allocations() {
        statements.push(Statement::InsertAllocation {
            line: line.clone(),
            batch: batch.clone(),
        });
    }
    statements
}

fn change_statements(
    product: &Product,
    loaded_batches: &BTreeSet<BatchReference>,
    loaded_allocations: &AllocationSet,
) -> Vec<Statement> {
    let current = allocation_set(product);
    let mut statements = Vec::new();

    for batch in product.batches() {
        if !loaded_batches.contains(batch.reference()) {
            statements.push(Statement::InsertBatch {
                reference: batch.reference().clone(),
                sku: batch.sku().clone(),
                purchased_quantity: batch.purchased_quantity(),
                eta: batch.eta(),
            });
        }
    }
    // Deletes before inserts: a line moved between batches keeps one row.
    for (batch, line) in loaded_allocations.difference(&current) {
        statements.push(Statement::DeleteAllocation {
            line: line.clone(),
            batch: batch.clone(),
        });
    }
    for (batch, line) in current.difference(loaded_allocations) {
        statements.push(Statement::InsertAllocation {
            line: line.clone(),
            batch: batch.clone(),
        });
    }
    statements
}

impl<S: Session> ProductRepository for SqlProductRepository<S> {
    fn add(&mut self, product: Product) -> Result<(), UnitOfWorkError> {
        match self.seen.entry(product.sku().clone()) {
            Entry::Occupied(e) => Err(UnitOfWorkError::DuplicateProduct {
                sku: e.key().clone(),
            }),
            Entry::Vacant(e) => {
                debug!(sku = %e.key(), "tracking new product");
                e.insert(Tracked {
                    product,
                    origin: Origin::Added,
                });
                Ok(())
            }
        }
    }

    #[instrument(skip(self), fields(sku = %sku))]
    fn get(&mut self, sku: &Sku) -> Result<&mut Product, UnitOfWorkError> {
        let tracked = match self.seen.entry(sku.clone()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                let Some(product) = self.session.load_product(sku)? else {
                    warn!("product not found");
                    return Err(UnitOfWorkError::ProductNotFound { sku: sku.clone() });
                };
                debug!(version = product.version_number(), "loaded product");
                e.insert(Tracked::loaded(product))
            }
        };
        Ok(&mut tracked.product)
    }

    fn seen(&self) -> Vec<&Product> {
        self.seen.values().map(|t| &t.product).collect()
    }
}
