//! HTTP server wiring for strata: configuration, admin auth and the router.

pub mod auth;

use std::{
  path::{Path, PathBuf},
  sync::Arc,
  time::Duration,
};

use axum::{Router, middleware};
use serde::Deserialize;
use strata_store_sqlite::{SqliteStore, StoreConfig};
use tower_http::trace::TraceLayer;

use auth::AuthConfig;

// ─── Configuration ────────────────────────────────────────────────────────────

/// Runtime server configuration, deserialised from `config.toml` and
/// `STRATA_*` environment variables.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
  #[serde(default = "default_host")]
  pub host:                String,
  #[serde(default = "default_port")]
  pub port:                u16,
  /// Holds `data.db` and the `storage/` directory.
  #[serde(default = "default_data_dir")]
  pub data_dir:            PathBuf,
  pub admin_username:      String,
  pub admin_password_hash: String,
  #[serde(default = "default_query_timeout_ms")]
  pub query_timeout_ms:    u64,
}

fn default_host() -> String { "127.0.0.1".to_string() }
fn default_port() -> u16 { 8090 }
fn default_data_dir() -> PathBuf { PathBuf::from("strata_data") }
fn default_query_timeout_ms() -> u64 { 30_000 }

impl ServerConfig {
  pub fn database_path(&self) -> PathBuf { self.data_dir.join("data.db") }

  pub fn store_config(&self) -> StoreConfig {
    StoreConfig {
      query_timeout: Duration::from_millis(self.query_timeout_ms),
      storage_dir:   Some(self.data_dir.join("storage")),
    }
  }

  pub fn auth_config(&self) -> AuthConfig {
    AuthConfig {
      username:      self.admin_username.clone(),
      password_hash: self.admin_password_hash.clone(),
    }
  }

  /// Copy with a leading `~` in `data_dir` expanded.
  pub fn expanded(mut self) -> Self {
    self.data_dir = expand_tilde(&self.data_dir);
    self
  }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}

// ─── Router ───────────────────────────────────────────────────────────────────

/// The API mounted under `/api`, behind admin auth and request tracing.
pub fn app(store: Arc<SqliteStore>, auth: AuthConfig) -> Router {
  Router::new()
    .nest("/api", strata_api::api_router(store))
    .layer(middleware::from_fn_with_state(Arc::new(auth), auth::authenticate))
    .layer(TraceLayer::new_for_http())
}
