//! The [`Store`] trait and supporting query types.
//!
//! Implemented by storage backends (e.g. `strata-store-sqlite`). The HTTP
//! layer depends on this abstraction, not on a concrete database.

use std::future::Future;

use serde::Serialize;

use crate::{
  collection::Collection,
  error::Classify,
  hooks::Hooks,
  record::Record,
  request::RequestInfo,
};

pub const DEFAULT_PER_PAGE: usize = 30;
pub const MAX_PER_PAGE: usize = 500;
/// Keeps `(page - 1) * per_page` inside SQLite's 64-bit `OFFSET`.
pub const MAX_PAGE: usize = u32::MAX as usize;

// ─── Query types ─────────────────────────────────────────────────────────────

/// Parameters for [`Store::list_records`].
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
  pub filter:     Option<String>,
  pub sort:       Option<String>,
  pub page:       Option<usize>,
  pub per_page:   Option<usize>,
  /// Comma separated relation paths, e.g. `author,comments.user`.
  pub expand:     Option<String>,
  pub skip_total: bool,
}

impl RecordQuery {
  pub fn page(&self) -> usize { self.page.filter(|p| *p > 0).unwrap_or(1).min(MAX_PAGE) }

  /// Rows skipped before the current page.
  pub fn offset(&self) -> usize { (self.page() - 1).saturating_mul(self.per_page()) }

  pub fn per_page(&self) -> usize {
    self
      .per_page
      .filter(|p| *p > 0)
      .unwrap_or(DEFAULT_PER_PAGE)
      .min(MAX_PER_PAGE)
  }

  pub fn expand_paths(&self) -> Vec<String> {
    self
      .expand
      .as_deref()
      .unwrap_or_default()
      .split(',')
      .map(str::trim)
      .filter(|s| !s.is_empty())
      .map(str::to_string)
      .collect()
  }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordList {
  pub page:        usize,
  pub per_page:    usize,
  /// `-1` when the total was skipped.
  pub total_items: i64,
  pub total_pages: i64,
  pub items:       Vec<Record>,
}

/// Outcome of a bulk import.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
  pub created: Vec<String>,
  pub updated: Vec<String>,
  pub deleted: Vec<String>,
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over a schema-and-record store backend.
///
/// Every mutating method runs in a single transaction: either all of its
/// effects (DDL, rows, cascades) are visible afterwards or none are.
pub trait Store: Send + Sync {
  type Error: std::error::Error + Classify + Send + Sync + 'static;

  fn hooks(&self) -> &Hooks;

  // ── Collections ───────────────────────────────────────────────────────

  /// Look up a collection by id or (case-insensitive) name.
  fn find_collection<'a>(
    &'a self,
    name_or_id: &'a str,
  ) -> impl Future<Output = Result<Collection, Self::Error>> + Send + 'a;

  fn list_collections(
    &self,
  ) -> impl Future<Output = Result<Vec<Collection>, Self::Error>> + Send + '_;

  /// Validate, then create or update a collection and sync its table.
  fn save_collection(
    &self,
    collection: Collection,
  ) -> impl Future<Output = Result<Collection, Self::Error>> + Send + '_;

  fn delete_collection<'a>(
    &'a self,
    name_or_id: &'a str,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  /// Replace the schema with `collections` in one transaction.
  fn import_collections(
    &self,
    collections: Vec<Collection>,
    delete_missing: bool,
  ) -> impl Future<Output = Result<ImportSummary, Self::Error>> + Send + '_;

  // ── Records ───────────────────────────────────────────────────────────

  fn list_records<'a>(
    &'a self,
    collection: &'a str,
    query: RecordQuery,
    request: RequestInfo,
  ) -> impl Future<Output = Result<RecordList, Self::Error>> + Send + 'a;

  fn view_record<'a>(
    &'a self,
    collection: &'a str,
    id: &'a str,
    expand: Option<String>,
    request: RequestInfo,
  ) -> impl Future<Output = Result<Record, Self::Error>> + Send + 'a;

  /// Create a record from `request.data`.
  fn create_record<'a>(
    &'a self,
    collection: &'a str,
    request: RequestInfo,
    expand: Option<String>,
  ) -> impl Future<Output = Result<Record, Self::Error>> + Send + 'a;

  /// Update a record from `request.data`.
  fn update_record<'a>(
    &'a self,
    collection: &'a str,
    id: &'a str,
    request: RequestInfo,
    expand: Option<String>,
  ) -> impl Future<Output = Result<Record, Self::Error>> + Send + 'a;

  /// Delete a record and cascade through relations.
  fn delete_record<'a>(
    &'a self,
    collection: &'a str,
    id: &'a str,
    request: RequestInfo,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;
}
