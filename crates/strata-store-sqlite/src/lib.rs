//! SQLite backend for strata.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated thread
//! without blocking the async runtime. Every mutating operation is a single
//! `BEGIN IMMEDIATE` transaction; file cleanup, change notifications and
//! after-hooks run only once it committed.

mod cache;
mod collections;
mod encode;
mod files;
mod records;
mod schema;
mod store;
mod sync;
mod values;
mod view;

pub mod error;
pub mod migrate;

pub use cache::SchemaCache;
pub use error::{Error, Result};
pub use files::LocalFileStore;
pub use migrate::{MigrationsList, Runner};
pub use store::{SqliteStore, StoreConfig};

#[cfg(test)]
mod tests;
