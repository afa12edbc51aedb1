//! Rule expression evaluator for strata.
//!
//! Turns access rules and request filters such as
//! `@request.auth.id = author && status = "active"` into a parameterized SQL
//! predicate plus the `LEFT JOIN`s it needs. Pure and synchronous: the
//! pipeline is tokenizer → parser → immutable [`ast::Expr`] → [`Compiler`].
//!
//! ```no_run
//! use strata_core::{Collection, CollectionType, Field, FieldType};
//! use strata_rules::compile;
//!
//! let mut posts = Collection::new("posts", CollectionType::Base);
//! posts.schema.add_field(Field::new("title", FieldType::Text));
//! let others: Vec<Collection> = Vec::new();
//! let compiled = compile(&posts, &others, None, "title ~ 'rust'").unwrap();
//! println!("{} {:?}", compiled.sql, compiled.params);
//! ```

pub mod ast;
pub mod compile;
pub mod error;
mod lexer;
mod parse;

pub use compile::{
  CollectionResolver,
  CompiledFilter,
  Compiler,
  Join,
  MAX_PATH_DEPTH,
  check,
  compile,
};
pub use error::{Error, Result};
pub use parse::parse;
