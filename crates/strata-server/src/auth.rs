//! HTTP Basic auth for the admin account.
//!
//! Requests without an `Authorization` header pass through as guests. A
//! header that is present but wrong is rejected outright.

use std::sync::Arc;

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use axum::{
  Json,
  extract::{Request, State},
  http::{HeaderMap, StatusCode, header},
  middleware::Next,
  response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use serde_json::json;
use strata_core::Auth;

/// Credentials of the single admin account.
#[derive(Clone)]
pub struct AuthConfig {
  pub username:      String,
  /// PHC string produced by argon2, e.g. `$argon2id$v=19$…`
  pub password_hash: String,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("invalid admin credentials")]
  Unauthorized,
}

impl IntoResponse for Error {
  fn into_response(self) -> Response {
    let status = StatusCode::UNAUTHORIZED;
    let body = json!({ "code": status.as_u16(), "message": self.to_string(), "data": {} });
    (status, [(header::WWW_AUTHENTICATE, r#"Basic realm="strata""#)], Json(body)).into_response()
  }
}

/// Check a Basic `Authorization` header against `config`.
///
/// Returns `Ok(None)` when no header was sent.
pub fn verify_admin(headers: &HeaderMap, config: &AuthConfig) -> Result<Option<Auth>, Error> {
  let Some(value) = headers.get(header::AUTHORIZATION) else {
    return Ok(None);
  };
  let value = value.to_str().map_err(|_| Error::Unauthorized)?;
  let encoded = value.strip_prefix("Basic ").ok_or(Error::Unauthorized)?;

  let decoded = B64.decode(encoded).map_err(|_| Error::Unauthorized)?;
  let creds = std::str::from_utf8(&decoded).map_err(|_| Error::Unauthorized)?;
  let (username, password) = creds.split_once(':').ok_or(Error::Unauthorized)?;

  if username != config.username {
    return Err(Error::Unauthorized);
  }

  let parsed_hash = PasswordHash::new(&config.password_hash).map_err(|_| Error::Unauthorized)?;
  Argon2::default()
    .verify_password(password.as_bytes(), &parsed_hash)
    .map_err(|_| Error::Unauthorized)?;

  Ok(Some(Auth::Admin { id: username.to_string() }))
}

/// Middleware: resolve the caller and store it as an [`Auth`] extension.
pub async fn authenticate(
  State(config): State<Arc<AuthConfig>>,
  mut req: Request,
  next: Next,
) -> Result<Response, Error> {
  let auth = verify_admin(req.headers(), &config)?.unwrap_or_default();
  if matches!(auth, Auth::Admin { .. }) {
    tracing::debug!(path = %req.uri().path(), "admin request");
  }
  req.extensions_mut().insert(auth);
  Ok(next.run(req).await)
}
