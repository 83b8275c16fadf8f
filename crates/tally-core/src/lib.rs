//! Core types and trait definitions for the Tally usage-metering engine.
//!
//! This crate is deliberately free of HTTP and database dependencies.
//! All other crates depend on it; it depends on nothing proprietary.

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod capability;
pub mod error;
pub mod ledger;
pub mod limits;
pub mod plan;
pub mod store;
pub mod subscription;
pub mod usage;
pub mod window;

pub use error::{Error, Result};
pub use ledger::UsageLedger;
