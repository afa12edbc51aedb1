//! Handlers for `/collections/{collection}/records` endpoints.
//!
//! Access is decided by the collection's rules inside the store; these
//! handlers only shape the request and fire the request hooks.

use std::sync::Arc;

use axum::{
  Json,
  extract::{Path, Query, State, rejection::JsonRejection},
  http::StatusCode,
  response::IntoResponse,
};
use serde::Deserialize;
use serde_json::Value;
use strata_core::{
  Record,
  RequestInfo,
  hooks::RecordRequestEvent,
  store::{RecordList, RecordQuery, Store},
};

use crate::{
  caller::{Caller, object_body},
  error::ApiError,
};

// ─── List ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
  pub filter:     Option<String>,
  pub sort:       Option<String>,
  pub page:       Option<usize>,
  pub per_page:   Option<usize>,
  pub expand:     Option<String>,
  #[serde(default)]
  pub skip_total: bool,
}

impl From<ListParams> for RecordQuery {
  fn from(p: ListParams) -> Self {
    RecordQuery {
      filter:     p.filter,
      sort:       p.sort,
      page:       p.page,
      per_page:   p.per_page,
      expand:     p.expand,
      skip_total: p.skip_total,
    }
  }
}

/// `GET /collections/{collection}/records`
pub async fn list<S>(
  State(store): State<Arc<S>>,
  caller: Caller,
  Path(collection): Path<String>,
  Query(params): Query<ListParams>,
) -> Result<Json<RecordList>, ApiError>
where
  S: Store,
{
  let list = store
    .list_records(&collection, params.into(), caller.0)
    .await
    .map_err(ApiError::store)?;
  Ok(Json(list))
}

// ─── View ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ExpandParams {
  pub expand: Option<String>,
}

/// `GET /collections/{collection}/records/{id}`
pub async fn view<S>(
  State(store): State<Arc<S>>,
  caller: Caller,
  Path((collection, id)): Path<(String, String)>,
  Query(params): Query<ExpandParams>,
) -> Result<Json<Record>, ApiError>
where
  S: Store,
{
  let record = store
    .view_record(&collection, &id, params.expand, caller.0)
    .await
    .map_err(ApiError::store)?;
  Ok(Json(record))
}

// ─── Create ──────────────────────────────────────────────────────────────────

/// `POST /collections/{collection}/records`
pub async fn create<S>(
  State(store): State<Arc<S>>,
  caller: Caller,
  Path(collection): Path<String>,
  Query(params): Query<ExpandParams>,
  body: Result<Json<Value>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError>
where
  S: Store,
{
  let data = object_body(body)?;
  let collection = store.find_collection(&collection).await.map_err(ApiError::store)?;

  let mut record = Record::new(&collection);
  record.data = data.clone();
  let hooks = store.hooks();
  let mut event = RecordRequestEvent { collection, record, request: caller.with_data(data) };
  hooks.record_before_create_request.trigger(&mut event)?;

  let created = store
    .create_record(&event.collection.name, event.request.clone(), params.expand)
    .await
    .map_err(ApiError::store)?;

  event.record = created;
  hooks.record_after_create_request.trigger(&mut event)?;
  Ok(Json(event.record))
}

// ─── Update ──────────────────────────────────────────────────────────────────

/// `PATCH /collections/{collection}/records/{id}`
pub async fn update<S>(
  State(store): State<Arc<S>>,
  caller: Caller,
  Path((collection, id)): Path<(String, String)>,
  Query(params): Query<ExpandParams>,
  body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Record>, ApiError>
where
  S: Store,
{
  let data = object_body(body)?;
  let collection = store.find_collection(&collection).await.map_err(ApiError::store)?;
  // The update rule is enforced by the store; this load only feeds the hook.
  let record = store
    .view_record(&collection.name, &id, None, RequestInfo::admin())
    .await
    .map_err(ApiError::store)?;

  let hooks = store.hooks();
  let mut event = RecordRequestEvent { collection, record, request: caller.with_data(data) };
  hooks.record_before_update_request.trigger(&mut event)?;

  let updated = store
    .update_record(&event.collection.name, &id, event.request.clone(), params.expand)
    .await
    .map_err(ApiError::store)?;

  event.record = updated;
  hooks.record_after_update_request.trigger(&mut event)?;
  Ok(Json(event.record))
}

// ─── Delete ──────────────────────────────────────────────────────────────────

/// `DELETE /collections/{collection}/records/{id}`
pub async fn delete<S>(
  State(store): State<Arc<S>>,
  caller: Caller,
  Path((collection, id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError>
where
  S: Store,
{
  let collection = store.find_collection(&collection).await.map_err(ApiError::store)?;
  let record = store
    .view_record(&collection.name, &id, None, RequestInfo::admin())
    .await
    .map_err(ApiError::store)?;

  let hooks = store.hooks();
  let mut event = RecordRequestEvent { collection, record, request: caller.0 };
  hooks.record_before_delete_request.trigger(&mut event)?;

  store
    .delete_record(&event.collection.name, &id, event.request.clone())
    .await
    .map_err(ApiError::store)?;

  hooks.record_after_delete_request.trigger(&mut event)?;
  Ok(StatusCode::NO_CONTENT)
}
