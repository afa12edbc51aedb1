//! Handlers for `/collections` endpoints. All of them are admin only.
//!
//! | Method   | Path | Notes |
//! |----------|------|-------|
//! | `GET`    | `/collections` | `?page=&perPage=` |
//! | `POST`   | `/collections` | Body: collection JSON |
//! | `GET`    | `/collections/{idOrName}` | 404 if not found |
//! | `PATCH`  | `/collections/{idOrName}` | Body: keys to change |
//! | `DELETE` | `/collections/{idOrName}` | 204 |
//! | `PUT`    | `/collections/import` | Body: `{"collections":[...],"deleteMissing":false}` |

use std::sync::Arc;

use axum::{
  Json,
  extract::{Path, Query, State, rejection::JsonRejection},
  http::StatusCode,
  response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strata_core::{
  Collection,
  Errors,
  hooks::{CollectionRequestEvent, CollectionsImportEvent},
  store::{RecordQuery, Store},
};

use crate::{
  caller::{Caller, object_body},
  error::ApiError,
};

fn invalid_body(err: serde_json::Error) -> ApiError {
  ApiError::BadRequest(format!("Failed to load the submitted data due to invalid formatting: {err}"))
}

fn parse_collection(data: Map<String, Value>) -> Result<Collection, ApiError> {
  serde_json::from_value(Value::Object(data)).map_err(invalid_body)
}

// ─── List ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageParams {
  pub page:     Option<usize>,
  pub per_page: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionList {
  pub page:        usize,
  pub per_page:    usize,
  pub total_items: usize,
  pub total_pages: usize,
  pub items:       Vec<Collection>,
}

/// `GET /collections`
pub async fn list<S>(
  State(store): State<Arc<S>>,
  caller: Caller,
  Query(params): Query<PageParams>,
) -> Result<Json<CollectionList>, ApiError>
where
  S: Store,
{
  caller.require_admin()?;
  let all = store.list_collections().await.map_err(ApiError::store)?;

  let paging = RecordQuery { page: params.page, per_page: params.per_page, ..Default::default() };
  let (page, per_page) = (paging.page(), paging.per_page());
  let total_items = all.len();
  let items = all.into_iter().skip(paging.offset()).take(per_page).collect();
  Ok(Json(CollectionList {
    page,
    per_page,
    total_items,
    total_pages: total_items.div_ceil(per_page),
    items,
  }))
}

// ─── View ────────────────────────────────────────────────────────────────────

/// `GET /collections/{idOrName}`
pub async fn view<S>(
  State(store): State<Arc<S>>,
  caller: Caller,
  Path(name): Path<String>,
) -> Result<Json<Collection>, ApiError>
where
  S: Store,
{
  caller.require_admin()?;
  let collection = store.find_collection(&name).await.map_err(ApiError::store)?;
  Ok(Json(collection))
}

// ─── Create ──────────────────────────────────────────────────────────────────

/// `POST /collections`
pub async fn create<S>(
  State(store): State<Arc<S>>,
  caller: Caller,
  body: Result<Json<Value>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError>
where
  S: Store,
{
  caller.require_admin()?;
  let data = object_body(body)?;
  let request = caller.with_data(data.clone());
  let collection = parse_collection(data)?;

  if !collection.id.is_empty() && store.find_collection(&collection.id).await.is_ok() {
    let mut errors = Errors::new();
    errors.add("id", "validation_invalid_id", "The id is invalid or already exists.");
    return Err(strata_core::Error::Validation(errors).into());
  }

  let hooks = store.hooks();
  let mut event = CollectionRequestEvent { collection, request };
  hooks.collection_before_create_request.trigger(&mut event)?;

  let saved = store.save_collection(event.collection).await.map_err(ApiError::store)?;

  let mut event = CollectionRequestEvent { collection: saved, request: event.request };
  hooks.collection_after_create_request.trigger(&mut event)?;
  Ok(Json(event.collection))
}

// ─── Update ──────────────────────────────────────────────────────────────────

/// `PATCH /collections/{idOrName}`: submitted top-level keys replace the
/// stored ones.
pub async fn update<S>(
  State(store): State<Arc<S>>,
  caller: Caller,
  Path(name): Path<String>,
  body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Collection>, ApiError>
where
  S: Store,
{
  caller.require_admin()?;
  let data = object_body(body)?;
  let existing = store.find_collection(&name).await.map_err(ApiError::store)?;

  let mut merged = match serde_json::to_value(&existing).map_err(strata_core::Error::from)? {
    Value::Object(map) => map,
    _ => Map::new(),
  };
  for (key, value) in &data {
    if key != "id" {
      merged.insert(key.clone(), value.clone());
    }
  }
  let collection = parse_collection(merged)?;

  let hooks = store.hooks();
  let mut event = CollectionRequestEvent { collection, request: caller.with_data(data) };
  hooks.collection_before_update_request.trigger(&mut event)?;

  let saved = store.save_collection(event.collection).await.map_err(ApiError::store)?;

  let mut event = CollectionRequestEvent { collection: saved, request: event.request };
  hooks.collection_after_update_request.trigger(&mut event)?;
  Ok(Json(event.collection))
}

// ─── Delete ──────────────────────────────────────────────────────────────────

/// `DELETE /collections/{idOrName}`
pub async fn delete<S>(
  State(store): State<Arc<S>>,
  caller: Caller,
  Path(name): Path<String>,
) -> Result<StatusCode, ApiError>
where
  S: Store,
{
  caller.require_admin()?;
  let collection = store.find_collection(&name).await.map_err(ApiError::store)?;

  let hooks = store.hooks();
  let mut event = CollectionRequestEvent { collection, request: caller.0 };
  hooks.collection_before_delete_request.trigger(&mut event)?;

  store.delete_collection(&event.collection.id).await.map_err(ApiError::store)?;

  hooks.collection_after_delete_request.trigger(&mut event)?;
  Ok(StatusCode::NO_CONTENT)
}

// ─── Import ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportBody {
  #[serde(default)]
  pub collections:    Vec<Collection>,
  #[serde(default)]
  pub delete_missing: bool,
}

/// `PUT /collections/import`
pub async fn import<S>(
  State(store): State<Arc<S>>,
  caller: Caller,
  body: Result<Json<Value>, JsonRejection>,
) -> Result<StatusCode, ApiError>
where
  S: Store,
{
  caller.require_admin()?;
  let data = object_body(body)?;
  let body: ImportBody = serde_json::from_value(Value::Object(data)).map_err(invalid_body)?;

  let hooks = store.hooks();
  let mut event =
    CollectionsImportEvent { collections: body.collections, delete_missing: body.delete_missing };
  hooks.collections_before_import_request.trigger(&mut event)?;

  store
    .import_collections(event.collections.clone(), event.delete_missing)
    .await
    .map_err(ApiError::store)?;

  hooks.collections_after_import_request.trigger(&mut event)?;
  Ok(StatusCode::NO_CONTENT)
}
