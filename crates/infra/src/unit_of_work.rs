//! Unit of Work: one transactional boundary around one session and one repository.
//!
//! ## Lifecycle
//!
//! ```text
//! Unopened --enter--> Active --commit--> Committed
//!                        \----rollback / drop / failed commit--> RolledBack
//! ```
//!
//! - Nothing written inside the scope is visible to other sessions until `commit`.
//! - Leaving the scope without `commit` rolls back: dropping an active unit of work
//!   runs `rollback`, and [`scoped`] rolls back before handing the closure's error back.
//! - The unit of work never retries. A conflicting commit fails with
//!   [`UnitOfWorkError::StaleVersion`]; whether to reload and try again is the
//!   caller's decision.
//!
//! A unit of work owns its session exclusively; concurrent operations each build
//! their own from a shared [`SessionFactory`].

use std::fmt;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use allocation_domain::Product;

use crate::error::{UnitOfWorkError, UnitOfWorkState};
use crate::repository::{ProductRepository, SqlProductRepository};
use crate::session::{Session, SessionFactory};

/// Transactional scope exposing a product repository.
pub trait UnitOfWork {
    type Products: ProductRepository;

    /// The repository bound to this unit of work's session.
    fn products(&mut self) -> Result<&mut Self::Products, UnitOfWorkError>;

    /// Atomically persist everything changed since `enter`.
    fn commit(&mut self) -> Result<(), UnitOfWorkError>;

    /// Discard everything changed since `enter`. Idempotent.
    fn rollback(&mut self) -> Result<(), UnitOfWorkError>;

    fn state(&self) -> UnitOfWorkState;
}

/// Unit of work over any [`SessionFactory`].
pub struct SqlUnitOfWork<F: SessionFactory> {
    id: Uuid,
    factory: F,
    state: UnitOfWorkState,
    products: Option<SqlProductRepository<F::Session>>,
    closed: bool,
}

impl<F: SessionFactory> fmt::Debug for SqlUnitOfWork<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlUnitOfWork")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("seen", &self.seen().len())
            .field("closed", &self.closed)
            .finish()
    }
}

impl<F: SessionFactory> SqlUnitOfWork<F> {
    pub fn new(factory: F) -> Self {
        Self {
            id: Uuid::now_v7(),
            factory,
            state: UnitOfWorkState::Unopened,
            products: None,
            closed: false,
        }
    }

    /// `new` followed by `enter`.
    pub fn begin(factory: F) -> Result<Self, UnitOfWorkError> {
        let mut uow = Self::new(factory);
        uow.enter()?;
        Ok(uow)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Open a session and bind a fresh repository to it.
    #[instrument(skip(self), fields(uow_id = %self.id))]
    pub fn enter(&mut self) -> Result<&mut Self, UnitOfWorkError> {
        if self.state != UnitOfWorkState::Unopened {
            warn!(state = %self.state, "unit of work entered twice");
            return Err(UnitOfWorkError::InvalidState {
                state: self.state,
                operation: "enter",
            });
        }
        let session = self.factory.open()?;
        self.products = Some(SqlProductRepository::new(session));
        self.state = UnitOfWorkState::Active;
        debug!("unit of work entered");
        Ok(self)
    }

    /// The bound session, for statements outside the repository.
    pub fn session(&mut self) -> Result<&mut F::Session, UnitOfWorkError> {
        Ok(self.active_repository("use the session of")?.session())
    }

    /// Products touched by this unit of work, available in every state after `enter`.
    pub fn seen(&self) -> Vec<&Product> {
        self.products
            .as_ref()
            .map(|repo| repo.seen())
            .unwrap_or_default()
    }

    /// Leave the scope: roll back unless committed, then release the session.
    pub fn exit(&mut self) -> Result<(), UnitOfWorkError> {
        let rolled_back = self.rollback();
        let closed = self.close_session();
        rolled_back.and(closed)
    }

    fn active_repository(
        &mut self,
        operation: &'static str,
    ) -> Result<&mut SqlProductRepository<F::Session>, UnitOfWorkError> {
        let state = self.state;
        match (state, self.products.as_mut()) {
            (UnitOfWorkState::Active, Some(repo)) => Ok(repo),
            _ => Err(UnitOfWorkError::InvalidState { state, operation }),
        }
    }

    fn close_session(&mut self) -> Result<(), UnitOfWorkError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.products.as_mut() {
            Some(repo) => Ok(repo.session().close()?),
            None => Ok(()),
        }
    }
}

impl<F: SessionFactory> UnitOfWork for SqlUnitOfWork<F> {
    type Products = SqlProductRepository<F::Session>;

    fn products(&mut self) -> Result<&mut Self::Products, UnitOfWorkError> {
        self.active_repository("load products from")
    }

    #[instrument(skip(self), fields(uow_id = %self.id), err)]
    fn commit(&mut self) -> Result<(), UnitOfWorkError> {
        match self.state {
            UnitOfWorkState::Active => {}
            UnitOfWorkState::Committed => {
                debug!("already committed; nothing to do");
                return Ok(());
            }
            state => {
                return Err(UnitOfWorkError::InvalidState {
                    state,
                    operation: "commit",
                });
            }
        }

        let repo = self.active_repository("commit")?;
        let outcome = repo
            .flush()
            .and_then(|()| repo.session().commit().map_err(UnitOfWorkError::from));

        match outcome {
            Ok(()) => {
                repo.mark_committed();
                self.state = UnitOfWorkState::Committed;
                info!("unit of work committed");
                Ok(())
            }
            Err(err) => {
                if let Err(rollback_err) = repo.session().rollback() {
                    warn!(error = %rollback_err, "rollback after failed commit also failed");
                }
                self.state = UnitOfWorkState::RolledBack;
                if err.is_conflict() {
                    warn!(error = %err, "commit lost an optimistic concurrency race");
                }
                Err(err)
            }
        }
    }

    #[instrument(skip(self), fields(uow_id = %self.id), err)]
    fn rollback(&mut self) -> Result<(), UnitOfWorkError> {
        if self.state != UnitOfWorkState::Active {
            return Ok(());
        }
        let outcome = self.active_repository("roll back")?.session().rollback();
        self.state = UnitOfWorkState::RolledBack;
        debug!("unit of work rolled back");
        Ok(outcome?)
    }

    fn state(&self) -> UnitOfWorkState {
        self.state
    }
}

impl<F: SessionFactory> Drop for SqlUnitOfWork<F> {
    fn drop(&mut self) {
        if self.state == UnitOfWorkState::Active {
            debug!(uow_id = %self.id, "unit of work dropped without commit; rolling back");
        }
        if let Err(err) = self.exit() {
            warn!(uow_id = %self.id, error = %err, "cleanup of dropped unit of work failed");
        }
    }
}

/// Run `body` inside a fresh unit of work.
///
/// The closure commits explicitly. Whatever it returns, the unit of work is exited
/// afterwards, which rolls back anything left uncommitted, even when the closure
/// returned `Ok`. An `Err` from the closure is returned unchanged after the
/// rollback; a failing rollback is only logged then.
pub fn scoped<F, T, E>(
    factory: F,
    body: impl FnOnce(&mut SqlUnitOfWork<F>) -> Result<T, E>,
) -> Result<T, E>
where
    F: SessionFactory,
    E: From<UnitOfWorkError>,
{
    let mut uow = SqlUnitOfWork::begin(factory)?;
    let outcome = body(&mut uow);
    let exited = uow.exit();

    match (outcome, exited) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(exit_err)) => Err(exit_err.into()),
        (Err(err), exited) => {
            if let Err(exit_err) = exited {
                warn!(uow_id = %uow.id(), error = %exit_err, "rollback after failed scope also failed");
            }
            Err(err)
        }
    }
}
