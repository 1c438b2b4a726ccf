//! Unit of work behaviour against Postgres.
//!
//! Needs a reachable database: set `DATABASE_URL` (or the `DB_*` variables) and run
//! `cargo test -p allocation-infra --test postgres_unit_of_work -- --ignored`.

mod support;

use std::sync::Mutex;

use allocation_infra::{PgSessionFactory, PostgresConfig};

use support::Fixture;

// Concurrent `CREATE TABLE IF NOT EXISTS` can still collide in the catalog.
static MIGRATION: Mutex<()> = Mutex::new(());

fn fixture() -> Fixture<PgSessionFactory> {
    allocation_observability::init_with_default("warn");
    let config = PostgresConfig::from_env().unwrap();
    let factory = PgSessionFactory::connect(&config).unwrap();
    {
        let _guard = MIGRATION.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        factory.migrate().unwrap();
    }
    Fixture::isolated(factory)
}

#[test]
#[ignore = "requires DATABASE_URL"]
fn committed_allocation_is_visible_to_new_sessions() {
    fixture().basic_commit();
}

#[test]
#[ignore = "requires DATABASE_URL"]
fn uncommitted_work_is_rolled_back_on_drop() {
    fixture().default_rollback();
}

#[test]
#[ignore = "requires DATABASE_URL"]
fn errors_in_scope_propagate_and_roll_back() {
    fixture().rollback_on_error();
}

#[test]
#[ignore = "requires DATABASE_URL"]
fn rollback_is_idempotent() {
    fixture().rollback_is_idempotent();
}

#[test]
#[ignore = "requires DATABASE_URL"]
fn only_one_concurrent_allocation_commits() {
    fixture().concurrent_allocations_conflict();
}
