//! SQLite backend for the Tally usage-metering engine.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated thread
//! pool without blocking the async runtime. Supplies the two consistency
//! primitives the ledger relies on: guarded `UPDATE ... WHERE used < quota`
//! increments and composite-key uniqueness with conflict detection.

mod encode;
mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use store::SqliteStore;

#[cfg(test)]
mod tests;
