//! JSON REST API for strata.
//!
//! Exposes an axum [`Router`] backed by any [`strata_core::store::Store`].
//! Authentication is the caller's responsibility: the embedding server puts a
//! [`strata_core::Auth`] into the request extensions before the router runs.
//!
//! # Mounting
//!
//! ```rust,ignore
//! .nest("/api", strata_api::api_router(store.clone()))
//! ```

pub mod caller;
pub mod collections;
pub mod error;
pub mod records;

use std::sync::Arc;

use axum::{
  Router,
  routing::{get, put},
};
use strata_core::store::Store;

pub use caller::Caller;
pub use error::ApiError;

/// Build a fully-materialised API router for `store`.
///
/// The returned `Router<()>` can be nested into any parent router regardless
/// of its own state type.
pub fn api_router<S>(store: Arc<S>) -> Router<()>
where
  S: Store + 'static,
{
  Router::new()
    // Collections
    .route(
      "/collections",
      get(collections::list::<S>).post(collections::create::<S>),
    )
    .route("/collections/import", put(collections::import::<S>))
    .route(
      "/collections/{collection}",
      get(collections::view::<S>)
        .patch(collections::update::<S>)
        .delete(collections::delete::<S>),
    )
    // Records
    .route(
      "/collections/{collection}/records",
      get(records::list::<S>).post(records::create::<S>),
    )
    .route(
      "/collections/{collection}/records/{id}",
      get(records::view::<S>)
        .patch(records::update::<S>)
        .delete(records::delete::<S>),
    )
    .with_state(store)
}
