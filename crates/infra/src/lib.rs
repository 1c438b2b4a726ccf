//! Persistence layer of the allocation service.
//!
//! - [`session`]: transactional sessions over the store (in-memory or Postgres)
//! - [`repository`]: product repository tracking the aggregates a unit of work touched
//! - [`unit_of_work`]: atomic commit / rollback boundary with optimistic version checks
//! - [`services`]: allocation use cases, each run inside one unit of work
//! - [`config`]: environment-driven store selection

pub mod config;
pub mod error;
pub mod repository;
pub mod services;
pub mod session;
pub mod unit_of_work;

pub use config::{ConfigError, PostgresConfig, StoreConfig};
pub use error::{StoreError, StoreResult, UnitOfWorkError, UnitOfWorkState};
pub use repository::{ProductRepository, SqlProductRepository};
pub use session::{InMemorySession, InMemoryStore, PgSession, PgSessionFactory, Session, SessionFactory, Statement};
pub use unit_of_work::{scoped, SqlUnitOfWork, UnitOfWork};
