//! API error type and [`axum::response::IntoResponse`] implementation.
//!
//! Every failure renders as `{"code": <status>, "message": ..., "data": {...}}`
//! where `data` carries the field-path validation map (empty otherwise).

use axum::{
  Json,
  http::StatusCode,
  response::{IntoResponse, Response},
};
use serde_json::json;
use strata_core::{Classify, ErrorKind, Errors};
use thiserror::Error;
use tracing::error;

const GENERIC_MESSAGE: &str = "Something went wrong while processing your request.";

/// An error returned by an API handler.
#[derive(Debug, Error)]
pub enum ApiError {
  #[error("The request requires admin authorization.")]
  Unauthorized,

  #[error("{0}")]
  BadRequest(String),

  /// A classified store (or hook) failure.
  #[error("{message}")]
  Store {
    kind:    ErrorKind,
    message: String,
    data:    Option<Errors>,
  },
}

impl ApiError {
  pub fn store<E>(err: E) -> Self
  where
    E: std::error::Error + Classify,
  {
    let kind = err.kind();
    let message = match kind {
      ErrorKind::Validation => "Failed to validate the submitted data.".to_string(),
      ErrorKind::InvalidFilter => format!("Invalid filter or sort expression: {err}"),
      ErrorKind::Forbidden => "Only admins can perform this action.".to_string(),
      ErrorKind::NotFound => "The requested resource wasn't found.".to_string(),
      ErrorKind::BadRequest => err.to_string(),
      // Infrastructure details stay in the log.
      ErrorKind::Transient | ErrorKind::Internal => {
        error!(error = %err, ?kind, "request failed");
        GENERIC_MESSAGE.to_string()
      }
    };
    Self::Store { kind, message, data: err.validation_errors().cloned() }
  }

  pub fn status(&self) -> StatusCode {
    match self {
      ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
      ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
      ApiError::Store { kind, .. } => match kind {
        ErrorKind::Validation
        | ErrorKind::BadRequest
        | ErrorKind::InvalidFilter
        | ErrorKind::Transient => StatusCode::BAD_REQUEST,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
      },
    }
  }
}

impl From<strata_core::Error> for ApiError {
  fn from(err: strata_core::Error) -> Self { Self::store(err) }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let status = self.status();
    let data = match &self {
      ApiError::Store { data: Some(errors), .. } => json!(errors),
      _ => json!({}),
    };
    let body = json!({
      "code":    status.as_u16(),
      "message": self.to_string(),
      "data":    data,
    });
    (status, Json(body)).into_response()
  }
}
