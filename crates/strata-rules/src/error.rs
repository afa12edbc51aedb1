//! Error types for the rule expression evaluator.
//!
//! Every variant is an "invalid filter": callers surface them uniformly.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
  #[error("syntax error at {pos}: {message}")]
  Syntax { pos: usize, message: String },

  #[error("unknown field {0:?}")]
  UnknownField(String),

  #[error("unknown collection {0:?}")]
  UnknownCollection(String),

  #[error("invalid modifier {modifier:?} for {path:?}")]
  InvalidModifier { path: String, modifier: String },

  #[error("{0:?} is only allowed in admin filters")]
  Restricted(String),

  #[error("relation path {0:?} is too deep")]
  TooDeep(String),
}

impl Error {
  pub(crate) fn syntax(pos: usize, message: impl Into<String>) -> Self {
    Self::Syntax { pos, message: message.into() }
  }
}

impl From<Error> for strata_core::Error {
  fn from(e: Error) -> Self { strata_core::Error::InvalidFilter(e.to_string()) }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
