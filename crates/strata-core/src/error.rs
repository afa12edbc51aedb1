//! Error types for `strata-core`.

use thiserror::Error;

use crate::validation::Errors;

/// Coarse classification used by transports to pick a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  /// Input failed validation; carries a field-path error map.
  Validation,
  /// Malformed request or an operation that is refused as a whole.
  BadRequest,
  /// A filter/sort expression could not be compiled.
  InvalidFilter,
  /// Admin-only access (nil rule) for a non-admin caller.
  Forbidden,
  /// Missing entity, or a rule mismatch on an existing one.
  NotFound,
  /// Timeouts and busy databases; the caller may retry.
  Transient,
  Internal,
}

#[derive(Debug, Error)]
pub enum Error {
  #[error("validation failed: {0}")]
  Validation(Errors),

  #[error("invalid filter: {0}")]
  InvalidFilter(String),

  #[error("collection not found: {0}")]
  CollectionNotFound(String),

  #[error("record not found: {0}")]
  RecordNotFound(String),

  #[error("only admins can perform this action")]
  Forbidden,

  #[error("{0}")]
  BadRequest(String),

  #[error("hook failed: {0}")]
  Hook(#[source] Box<dyn std::error::Error + Send + Sync>),

  #[error("password hash error: {0}")]
  PasswordHash(String),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl Error {
  pub fn kind(&self) -> ErrorKind {
    match self {
      Self::Validation(_) => ErrorKind::Validation,
      Self::InvalidFilter(_) => ErrorKind::InvalidFilter,
      Self::CollectionNotFound(_) | Self::RecordNotFound(_) => ErrorKind::NotFound,
      Self::Forbidden => ErrorKind::Forbidden,
      Self::BadRequest(_) => ErrorKind::BadRequest,
      Self::Hook(_) => ErrorKind::BadRequest,
      Self::PasswordHash(_) | Self::Serialization(_) => ErrorKind::Internal,
    }
  }

  pub fn validation_errors(&self) -> Option<&Errors> {
    match self {
      Self::Validation(errors) => Some(errors),
      _ => None,
    }
  }
}

impl From<Errors> for Error {
  fn from(errors: Errors) -> Self { Self::Validation(errors) }
}

/// Implemented by every backend error so transports can classify failures
/// without knowing the concrete storage engine.
pub trait Classify {
  fn kind(&self) -> ErrorKind;

  fn validation_errors(&self) -> Option<&Errors> { None }
}

impl Classify for Error {
  fn kind(&self) -> ErrorKind { Error::kind(self) }

  fn validation_errors(&self) -> Option<&Errors> { Error::validation_errors(self) }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
