//! Error type for `strata-store-sqlite`.

use std::time::Duration;

use strata_core::{Classify, ErrorKind, Errors};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error(transparent)]
  Core(#[from] strata_core::Error),

  #[error(transparent)]
  Rules(#[from] strata_rules::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  /// A read query exceeded the configured timeout and was interrupted.
  #[error("query timed out after {0:?}")]
  Timeout(Duration),

  #[error("migration {file} failed: {source}")]
  Migration {
    file:   String,
    #[source]
    source: Box<Error>,
  },

  #[error("migration {0} has no down function")]
  MissingDown(String),

  #[error("date/time parse error: {0}")]
  DateParse(String),
}

impl From<Errors> for Error {
  fn from(errors: Errors) -> Self { Self::Core(strata_core::Error::Validation(errors)) }
}

impl Error {
  /// Shorthand for a single-key validation error.
  pub(crate) fn validation(
    key: &str,
    code: &str,
    message: impl Into<String>,
  ) -> Self {
    let mut errors = Errors::new();
    errors.add(key, code, message);
    errors.into()
  }

  pub(crate) fn bad_request(message: impl Into<String>) -> Self {
    Self::Core(strata_core::Error::BadRequest(message.into()))
  }
}

fn sqlite_kind(err: &rusqlite::Error) -> ErrorKind {
  match err.sqlite_error_code() {
    Some(rusqlite::ErrorCode::ConstraintViolation) => ErrorKind::BadRequest,
    Some(
      rusqlite::ErrorCode::DatabaseBusy
      | rusqlite::ErrorCode::DatabaseLocked
      | rusqlite::ErrorCode::OperationInterrupted,
    ) => ErrorKind::Transient,
    _ => ErrorKind::Internal,
  }
}

impl Classify for Error {
  fn kind(&self) -> ErrorKind {
    match self {
      Self::Core(e) => e.kind(),
      Self::Rules(_) => ErrorKind::InvalidFilter,
      Self::Sqlite(e) => sqlite_kind(e),
      Self::Database(tokio_rusqlite::Error::Rusqlite(e)) => sqlite_kind(e),
      Self::Timeout(_) => ErrorKind::Transient,
      Self::Migration { source, .. } => source.kind(),
      _ => ErrorKind::Internal,
    }
  }

  fn validation_errors(&self) -> Option<&Errors> {
    match self {
      Self::Core(e) => e.validation_errors(),
      _ => None,
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
