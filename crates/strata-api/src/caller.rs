//! Request context extraction.
//!
//! The embedding server authenticates the request and stores a
//! [`strata_core::Auth`] in the request extensions; without one the caller is
//! a guest.

use std::convert::Infallible;

use axum::{
  Json,
  extract::{FromRequestParts, Query, rejection::JsonRejection},
  http::request::Parts,
};
use serde_json::{Map, Value};
use strata_core::{Auth, RequestInfo};

use crate::error::ApiError;

/// The `@request` context of the current request, minus the body.
#[derive(Debug, Clone)]
pub struct Caller(pub RequestInfo);

impl Caller {
  pub fn is_admin(&self) -> bool { self.0.is_admin() }

  pub fn require_admin(&self) -> Result<(), ApiError> {
    if self.is_admin() { Ok(()) } else { Err(ApiError::Unauthorized) }
  }

  /// The request info with `data` attached.
  pub fn with_data(self, data: Map<String, Value>) -> RequestInfo { self.0.with_data(data) }
}

impl<S> FromRequestParts<S> for Caller
where
  S: Send + Sync,
{
  type Rejection = Infallible;

  async fn from_request_parts(parts: &mut Parts, _: &S) -> Result<Self, Self::Rejection> {
    let auth = parts.extensions.get::<Auth>().cloned().unwrap_or_default();

    let query = Query::<Vec<(String, String)>>::try_from_uri(&parts.uri)
      .map(|Query(pairs)| {
        pairs.into_iter().map(|(k, v)| (k, Value::String(v))).collect::<Map<_, _>>()
      })
      .unwrap_or_default();

    let headers = parts
      .headers
      .iter()
      .filter_map(|(name, value)| {
        let value = value.to_str().ok()?;
        Some((RequestInfo::header_key(name.as_str()), Value::String(value.to_string())))
      })
      .collect();

    Ok(Caller(RequestInfo {
      method: parts.method.as_str().to_string(),
      query,
      data: Map::new(),
      headers,
      auth,
    }))
  }
}

/// Unwrap a JSON object body; anything else is a 400.
pub fn object_body(
  body: Result<Json<Value>, JsonRejection>,
) -> Result<Map<String, Value>, ApiError> {
  match body {
    Ok(Json(Value::Object(map))) => Ok(map),
    Ok(Json(_)) => Err(ApiError::BadRequest("The request body must be a JSON object.".into())),
    Err(e) => Err(ApiError::BadRequest(format!(
      "Failed to load the submitted data due to invalid formatting: {}",
      e.body_text()
    ))),
  }
}
