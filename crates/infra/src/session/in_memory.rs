use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use chrono::NaiveDate;
use tracing::debug;

use allocation_core::{BatchReference, ExpectedVersion, OrderId, Sku};
use allocation_domain::{Batch, OrderLine, Product};

use super::{Session, SessionFactory, Statement};
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone, PartialEq, Eq)]
struct BatchRow {
    sku: Sku,
    purchased_quantity: u32,
    eta: Option<NaiveDate>,
}

/// The four relations of the allocation schema.
#[derive(Debug, Clone, Default)]
struct Tables {
    products: BTreeMap<Sku, u64>,
    batches: BTreeMap<BatchReference, BatchRow>,
    order_lines: BTreeMap<u64, OrderLine>,
    /// `orderline_id -> batch_reference`; the key makes one allocation per line.
    allocations: BTreeMap<u64, BatchReference>,
    next_orderline_id: u64,
}

impl Tables {
    /// Apply one statement. Checks run before any mutation, so a failed statement
    /// leaves the tables untouched.
    fn apply(&mut self, statement: &Statement) -> StoreResult<u64> {
        match statement {
            Statement::InsertProduct {
                sku,
                version_number,
            } => {
                if self.products.contains_key(sku) {
                    return Err(StoreError::Constraint(format!(
                        "duplicate key products.sku = {sku}"
                    )));
                }
                self.products.insert(sku.clone(), *version_number);
                Ok(1)
            }
            Statement::InsertBatch {
                reference,
                sku,
                purchased_quantity,
                eta,
            } => {
                if self.batches.contains_key(reference) {
                    return Err(StoreError::Constraint(format!(
                        "duplicate key batches.reference = {reference}"
                    )));
                }
                if !self.products.contains_key(sku) {
                    return Err(StoreError::Constraint(format!(
                        "batches.sku = {sku} references a missing product"
                    )));
                }
                self.batches.insert(
                    reference.clone(),
                    BatchRow {
                        sku: sku.clone(),
                        purchased_quantity: *purchased_quantity,
                        eta: *eta,
                    },
                );
                Ok(1)
            }
            Statement::UpdateProductVersion { sku, expected, new } => {
                match self.products.get_mut(sku) {
                    Some(version) if ExpectedVersion::Exact(*expected).matches(*version) => {
                        *version = *new;
                        Ok(1)
                    }
                    _ => Ok(0),
                }
            }
            Statement::InsertAllocation { line, batch } => {
                match self.batches.get(batch) {
                    Some(row) if row.sku == line.sku => {}
                    Some(row) => {
                        return Err(StoreError::Constraint(format!(
                            "line sku {} cannot be allocated to batch {batch} of sku {}",
                            line.sku, row.sku
                        )));
                    }
                    None => {
                        return Err(StoreError::Constraint(format!(
                            "allocations.batch_reference = {batch} references a missing batch"
                        )));
                    }
                }
                if self.order_line_id(&line.orderid, &line.sku).is_some() {
                    return Err(StoreError::Constraint(format!(
                        "duplicate key order_lines (orderid, sku) = ({}, {})",
                        line.orderid, line.sku
                    )));
                }
                self.next_orderline_id += 1;
                let id = self.next_orderline_id;
                self.order_lines.insert(id, line.clone());
                self.allocations.insert(id, batch.clone());
                Ok(1)
            }
            Statement::DeleteAllocation { line, batch } => {
                let Some(id) = self.order_line_id(&line.orderid, &line.sku) else {
                    return Ok(0);
                };
                if self.allocations.get(&id) != Some(batch) {
                    return Ok(0);
                }
                self.allocations.remove(&id);
                self.order_lines.remove(&id);
                Ok(1)
            }
        }
    }

    fn order_line_id(&self, orderid: &OrderId, sku: &Sku) -> Option<u64> {
        self.order_lines
            .iter()
            .find(|(_, l)| &l.orderid == orderid && &l.sku == sku)
            .map(|(id, _)| *id)
    }

    fn lines_of(&self, batch: &BatchReference) -> Vec<OrderLine> {
        self.allocations
            .iter()
            .filter(|(_, b)| *b == batch)
            .filter_map(|(id, _)| self.order_lines.get(id).cloned())
            .collect()
    }

    fn restore_batch(&self, reference: &BatchReference, row: &BatchRow) -> Batch {
        Batch::restore(
            reference.clone(),
            row.sku.clone(),
            row.purchased_quantity,
            row.eta,
            self.lines_of(reference),
        )
    }

    fn product(&self, sku: &Sku) -> StoreResult<Option<Product>> {
        let Some(version) = self.products.get(sku) else {
            return Ok(None);
        };
        let batches = self
            .batches
            .iter()
            .filter(|(_, row)| &row.sku == sku)
            .map(|(reference, row)| self.restore_batch(reference, row))
            .collect();
        Product::new(sku.clone(), batches, *version)
            .map(Some)
            .map_err(|e| StoreError::Backend(format!("corrupt product rows for {sku}: {e}")))
    }

    fn allocated_batch_ref(&self, orderid: &OrderId, sku: &Sku) -> Option<BatchReference> {
        self.order_line_id(orderid, sku)
            .and_then(|id| self.allocations.get(&id).cloned())
    }

    fn batches(&self) -> Vec<Batch> {
        self.batches
            .iter()
            .map(|(reference, row)| self.restore_batch(reference, row))
            .collect()
    }
}

/// In-memory relational store.
///
/// Intended for tests/dev. Not optimized for performance: every commit clones the
/// committed tables.
///
/// ## Isolation
///
/// Each session works on a snapshot taken when its transaction begins and records
/// the statements it executed. `commit` replays the log against the latest committed
/// tables under the write lock; a version-checked update that no longer matches fails
/// the whole commit with [`StoreError::StaleVersion`] (first committer wins).
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    committed: Arc<RwLock<Tables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed version of a product, if it exists.
    pub fn product_version(&self, sku: &Sku) -> StoreResult<Option<u64>> {
        let tables = read(&self.committed)?;
        Ok(tables.products.get(sku).copied())
    }
}

impl SessionFactory for InMemoryStore {
    type Session = InMemorySession;

    fn open(&self) -> StoreResult<Self::Session> {
        Ok(InMemorySession {
            committed: Arc::clone(&self.committed),
            tx: None,
        })
    }
}

#[derive(Debug)]
struct PendingTransaction {
    snapshot: Tables,
    log: Vec<Statement>,
}

/// Session over an [`InMemoryStore`].
#[derive(Debug)]
pub struct InMemorySession {
    committed: Arc<RwLock<Tables>>,
    tx: Option<PendingTransaction>,
}

impl InMemorySession {
    fn transaction(&mut self) -> StoreResult<&mut PendingTransaction> {
        let tx = match self.tx.take() {
            Some(tx) => tx,
            None => PendingTransaction {
                snapshot: read(&self.committed)?.clone(),
                log: Vec::new(),
            },
        };
        Ok(self.tx.insert(tx))
    }
}

impl Session for InMemorySession {
    fn execute(&mut self, statement: Statement) -> StoreResult<u64> {
        let tx = self.transaction()?;
        let affected = tx.snapshot.apply(&statement)?;
        tx.log.push(statement);
        Ok(affected)
    }

    fn load_product(&mut self, sku: &Sku) -> StoreResult<Option<Product>> {
        self.transaction()?.snapshot.product(sku)
    }

    fn allocated_batch_ref(
        &mut self,
        orderid: &OrderId,
        sku: &Sku,
    ) -> StoreResult<Option<BatchReference>> {
        Ok(self.transaction()?.snapshot.allocated_batch_ref(orderid, sku))
    }

    fn batches(&mut self) -> StoreResult<Vec<Batch>> {
        Ok(self.transaction()?.snapshot.batches())
    }

    fn commit(&mut self) -> StoreResult<()> {
        let Some(tx) = self.tx.take() else {
            return Ok(());
        };
        if tx.log.is_empty() {
            return Ok(());
        }

        let mut committed = self
            .committed
            .write()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))?;

        let mut next = committed.clone();
        for statement in &tx.log {
            let affected = next.apply(statement)?;
            if let Statement::UpdateProductVersion { sku, expected, .. } = statement {
                if affected == 0 {
                    return Err(StoreError::StaleVersion {
                        sku: sku.clone(),
                        expected: *expected,
                    });
                }
            }
        }
        *committed = next;

        debug!(statements = tx.log.len(), "in-memory transaction committed");
        Ok(())
    }

    fn rollback(&mut self) -> StoreResult<()> {
        if let Some(tx) = self.tx.take() {
            debug!(statements = tx.log.len(), "in-memory transaction rolled back");
        }
        Ok(())
    }
}

fn read(tables: &RwLock<Tables>) -> StoreResult<std::sync::RwLockReadGuard<'_, Tables>> {
    tables
        .read()
        .map_err(|_| StoreError::Backend("lock poisoned".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(store: &InMemoryStore, sku: &str, batch: &str, qty: u32) {
        let mut session = store.open().unwrap();
        session.execute(Statement::insert_product(sku, 1)).unwrap();
        session
            .execute(Statement::insert_batch(batch, sku, qty, None))
            .unwrap();
        session.commit().unwrap();
    }

    #[test]
    fn uncommitted_writes_are_invisible_to_other_sessions() {
        let store = InMemoryStore::new();
        let mut writer = store.open().unwrap();
        writer.execute(Statement::insert_product("LAMP", 1)).unwrap();

        let mut reader = store.open().unwrap();
        assert!(reader.load_product(&Sku::from("LAMP")).unwrap().is_none());
        assert!(writer.load_product(&Sku::from("LAMP")).unwrap().is_some());

        writer.rollback().unwrap();
        assert_eq!(store.product_version(&Sku::from("LAMP")).unwrap(), None);
    }

    #[test]
    fn committed_writes_are_visible_to_new_transactions() {
        let store = InMemoryStore::new();
        seed(&store, "LAMP", "b1", 10);

        let mut reader = store.open().unwrap();
        let product = reader.load_product(&Sku::from("LAMP")).unwrap().unwrap();
        assert_eq!(product.version_number(), 1);
        assert_eq!(product.batches().len(), 1);
    }

    #[test]
    fn version_checked_update_fails_at_commit_when_stale() {
        let store = InMemoryStore::new();
        seed(&store, "LAMP", "b1", 10);
        let sku = Sku::from("LAMP");

        let mut first = store.open().unwrap();
        let mut second = store.open().unwrap();
        let bump = Statement::UpdateProductVersion {
            sku: sku.clone(),
            expected: 1,
            new: 2,
        };
        assert_eq!(first.execute(bump.clone()).unwrap(), 1);
        assert_eq!(second.execute(bump).unwrap(), 1);

        first.commit().unwrap();
        let err = second.commit().unwrap_err();
        assert!(matches!(err, StoreError::StaleVersion { expected: 1, .. }));
        assert_eq!(store.product_version(&sku).unwrap(), Some(2));
    }

    #[test]
    fn one_allocation_per_order_line() {
        let store = InMemoryStore::new();
        seed(&store, "LAMP", "b1", 10);
        let mut session = store.open().unwrap();
        let line = OrderLine::new("o1", "LAMP", 1);

        session
            .execute(Statement::InsertAllocation {
                line: line.clone(),
                batch: BatchReference::from("b1"),
            })
            .unwrap();
        let err = session
            .execute(Statement::InsertAllocation {
                line,
                batch: BatchReference::from("b1"),
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));
    }

    #[test]
    fn batches_need_an_existing_product() {
        let store = InMemoryStore::new();
        let mut session = store.open().unwrap();
        let err = session
            .execute(Statement::insert_batch("b1", "GHOST", 1, None))
            .unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));
    }

    #[test]
    fn delete_allocation_removes_line() {
        let store = InMemoryStore::new();
        seed(&store, "LAMP", "b1", 10);
        let mut session = store.open().unwrap();
        let line = OrderLine::new("o1", "LAMP", 3);
        let batch = BatchReference::from("b1");
        session
            .execute(Statement::InsertAllocation {
                line: line.clone(),
                batch: batch.clone(),
            })
            .unwrap();

        let removed = session
            .execute(Statement::DeleteAllocation { line, batch })
            .unwrap();
        assert_eq!(removed, 1);
        let orderid = OrderId::from("o1");
        assert_eq!(
            session
                .allocated_batch_ref(&orderid, &Sku::from("LAMP"))
                .unwrap(),
            None
        );
    }
}
