//! Core types and trait definitions for strata.
//!
//! Collections, fields, records, validation errors and hook chains live here,
//! free of HTTP and database dependencies. Every other crate depends on it.

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod collection;
pub mod error;
pub mod external;
pub mod field;
pub mod hooks;
pub mod index;
pub mod record;
pub mod request;
pub mod security;
pub mod store;
pub mod time;
pub mod validation;

pub use collection::{Collection, CollectionType, Schema, ValidationContext};
pub use error::{Classify, Error, ErrorKind, Result};
pub use field::{Field, FieldOptions, FieldType};
pub use record::Record;
pub use request::{Auth, RequestInfo};
pub use validation::{Errors, FieldError};
