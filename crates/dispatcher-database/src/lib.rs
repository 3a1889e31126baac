//! SQLite-backed Event Store Gateway for the outbox dispatcher.
//!
//! This crate provides:
//! - Database: connection wrapper with WAL mode and migrations
//! - queries: claim/settle SQL, one statement per state transition
//! - SqliteEventStore: the [`dispatcher_core::EventStore`] adapter
//!
//! The claim statement is a single conditional `UPDATE … RETURNING`, so
//! concurrent dispatcher processes sharing one database file never claim
//! the same event twice.

mod db;
mod error;
mod migrations;
pub mod queries;
mod store;

pub use db::Database;
pub use error::{DatabaseError, DatabaseResult};
pub use migrations::run_migrations;
pub use store::SqliteEventStore;
