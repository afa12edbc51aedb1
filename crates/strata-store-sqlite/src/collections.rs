//! Collection persistence: validate, sync the table or view, write the
//! `_collections` row, and keep dependent views in step.

use std::collections::{HashMap, HashSet};

use rusqlite::Connection;
use strata_core::{
  Classify as _,
  Collection,
  Errors,
  Schema,
  ValidationContext,
  hooks::{ImportSyncEvent, Model},
  security::{DEFAULT_ID_LENGTH, random_id},
  store::ImportSummary,
  time,
};
use tracing::{debug, info};

use crate::{
  Error,
  Result,
  cache::{SchemaCache, mentions},
  encode::{COLLECTION_COLUMNS, RawCollection},
  schema::{COLLECTIONS_TABLE, EXTERNAL_AUTHS_TABLE},
  store::{Ctx, Phase},
  sync,
  view::{self, ViewPlan},
};

// ─── Validation context ──────────────────────────────────────────────────────

/// Validation lookups against a prospective set of collections.
struct Lookup<'a> {
  conn:        &'a Connection,
  collections: Vec<Collection>,
  /// Lowercase names whose tables belong to a collection, now or after the
  /// pending change.
  owned:       HashSet<String>,
}

impl<'a> Lookup<'a> {
  fn new(conn: &'a Connection, existing: &[Collection], collections: Vec<Collection>) -> Self {
    let owned = existing
      .iter()
      .chain(&collections)
      .map(|c| c.name.to_lowercase())
      .collect();
    Self { conn, collections, owned }
  }
}

impl ValidationContext for Lookup<'_> {
  fn collection_by_id(&self, id: &str) -> Option<Collection> {
    self.collections.iter().find(|c| c.id == id).cloned()
  }

  fn collection_by_name(&self, name: &str) -> Option<Collection> {
    self.collections.iter().find(|c| c.name.eq_ignore_ascii_case(name)).cloned()
  }

  fn table_exists(&self, name: &str) -> bool {
    if self.owned.contains(&name.to_lowercase()) {
      return false;
    }
    self
      .conn
      .prepare(
        "SELECT 1 FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?1 COLLATE NOCASE",
      )
      .and_then(|mut stmt| stmt.exists([name]))
      .unwrap_or(false)
  }

  fn check_rule(&self, collection: &Collection, rule: &str) -> std::result::Result<(), String> {
    let mut all = vec![collection.clone()];
    all.extend(self.collections.iter().filter(|c| c.id != collection.id).cloned());
    strata_rules::check(collection, &all, rule).map_err(|e| e.to_string())
  }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Assign ids and timestamps.
fn prepare(collection: &mut Collection, old: Option<&Collection>) {
  if collection.id.is_empty() {
    collection.id = random_id(DEFAULT_ID_LENGTH);
  }
  collection.schema.ensure_ids();
  let now = time::now();
  collection.created = old.map_or(now, |o| o.created);
  collection.updated = now;
}

/// Validate `collection`. Views have their schema derived from the query
/// first, so rules can reference the resulting columns.
fn check(
  conn: &Connection,
  cache: &SchemaCache,
  collection: &mut Collection,
  old: Option<&Collection>,
  lookup: &Lookup<'_>,
) -> Result<Option<ViewPlan>> {
  let mut plan = None;
  let mut query_errors = None;
  if collection.is_view() {
    let query = collection.view_query().unwrap_or_default().to_string();
    match view::infer(conn, cache, &query, old) {
      Ok(p) => {
        collection.schema = Schema::new(p.schema.clone());
        plan = Some(p);
      }
      Err(e) => match e.validation_errors() {
        Some(errors) => query_errors = Some(errors.clone()),
        None => return Err(e),
      },
    }
  }

  let mut errors = collection.validate(old, lookup).err().unwrap_or_default();
  if let Some(query_errors) = query_errors {
    if let Some(strata_core::validation::ErrorNode::Nested(options)) = query_errors.get("options") {
      errors.nest("options", options.clone());
    }
  }
  errors.into_result()?;
  Ok(plan)
}

fn upsert(conn: &Connection, collection: &Collection) -> Result<()> {
  let raw = RawCollection::encode(collection)?;
  conn.execute(
    &format!(
      "INSERT INTO `{COLLECTIONS_TABLE}` ({COLLECTION_COLUMNS})
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
       ON CONFLICT (`id`) DO UPDATE SET
         `system` = excluded.`system`,
         `type` = excluded.`type`,
         `name` = excluded.`name`,
         `schema` = excluded.`schema`,
         `indexes` = excluded.`indexes`,
         `listRule` = excluded.`listRule`,
         `viewRule` = excluded.`viewRule`,
         `createRule` = excluded.`createRule`,
         `updateRule` = excluded.`updateRule`,
         `deleteRule` = excluded.`deleteRule`,
         `options` = excluded.`options`,
         `updated` = excluded.`updated`"
    ),
    raw.params(),
  )?;
  Ok(())
}

fn into_collection(model: Model) -> Result<Collection> {
  match model {
    Model::Collection(c) => Ok(*c),
    Model::Record(_) => Err(Error::bad_request("A hook replaced the collection with a record.")),
  }
}

/// Write an already validated collection: hooks, DDL, row, dependents.
fn persist(
  ctx: &mut Ctx<'_>,
  collection: Collection,
  old: Option<&Collection>,
  plan: Option<ViewPlan>,
) -> Result<Collection> {
  let phase = if old.is_some() { Phase::Update } else { Phase::Create };
  let collection = into_collection(ctx.before(phase, Model::Collection(Box::new(collection)))?)?;

  match plan {
    Some(plan) => {
      if let Some(old) = old {
        ctx.conn.execute_batch(&view::drop_sql(&old.name))?;
      }
      ctx.conn.execute_batch(&view::create_sql(&collection.name, &plan.select))?;
    }
    None => sync::apply(ctx.conn, &sync::plan(old, Some(&collection)))?,
  }
  upsert(ctx.conn, &collection)?;

  if let Some(old) = old {
    refresh_dependents(ctx.conn, old, &collection)?;
  }
  info!(
    collection = %collection.name,
    action = if old.is_some() { "update" } else { "create" },
    "saved collection"
  );
  ctx.after.model(phase, Model::Collection(Box::new(collection.clone())));
  Ok(collection)
}

/// Re-derive the views that read from `new` (and, transitively, from those
/// views). Stored queries are never rewritten: a rename that breaks a
/// dependent view fails the whole save.
fn refresh_dependents(conn: &Connection, old: &Collection, new: &Collection) -> Result<()> {
  let mut seen = HashSet::from([new.id.clone()]);
  let mut pending = vec![(old.name.clone(), new.name.clone())];
  while let Some((old_name, name)) = pending.pop() {
    let cache = SchemaCache::load(conn)?;
    let dependents: Vec<Collection> = cache
      .all()
      .iter()
      .filter(|c| !seen.contains(&c.id))
      .filter(|c| c.view_query().is_some_and(|q| mentions(q, &old_name) || mentions(q, &name)))
      .cloned()
      .collect();

    for current in dependents {
      seen.insert(current.id.clone());
      let query = current.view_query().unwrap_or_default().to_string();
      let plan = view::infer(conn, &cache, &query, Some(&current)).map_err(|e| {
        Error::bad_request(format!("Failed to refresh dependent view {:?}: {e}", current.name))
      })?;

      let mut updated = current.clone();
      updated.schema = Schema::new(plan.schema);
      updated.updated = time::now();

      conn.execute_batch(&view::drop_sql(&current.name))?;
      conn.execute_batch(&view::create_sql(&updated.name, &plan.select))?;
      upsert(conn, &updated)?;
      debug!(view = %updated.name, source = %name, "refreshed dependent view");
      pending.push((updated.name.clone(), updated.name.clone()));
    }
  }
  Ok(())
}

// ─── Operations ──────────────────────────────────────────────────────────────

/// Create or update `collection`.
pub(crate) fn save(ctx: &mut Ctx<'_>, mut collection: Collection) -> Result<Collection> {
  let cache = ctx.cache;
  let old = (!collection.is_new()).then(|| cache.by_id(&collection.id)).flatten();
  if collection.is_view() {
    // Derived from the query; the submitted schema is ignored.
    collection.schema = old.map(|o| o.schema.clone()).unwrap_or_default();
  }
  prepare(&mut collection, old);

  let mut merged: Vec<Collection> =
    cache.all().iter().filter(|c| c.id != collection.id).cloned().collect();
  merged.push(collection.clone());
  let lookup = Lookup::new(ctx.conn, cache.all(), merged);

  let plan = check(ctx.conn, cache, &mut collection, old, &lookup)?;
  persist(ctx, collection, old, plan)
}

/// Delete a collection with its table or view.
pub(crate) fn delete(ctx: &mut Ctx<'_>, name_or_id: &str) -> Result<()> {
  let cache = ctx.cache;
  let collection = cache
    .get(name_or_id)
    .cloned()
    .ok_or_else(|| strata_core::Error::CollectionNotFound(name_or_id.to_string()))?;

  if collection.system {
    return Err(Error::bad_request(format!(
      "System collection {:?} cannot be deleted.",
      collection.name
    )));
  }
  let referencing: Vec<&str> = cache
    .references_to(&collection.id)
    .into_iter()
    .filter(|(c, _)| c.id != collection.id)
    .map(|(c, _)| c.name.as_str())
    .collect();
  if !referencing.is_empty() {
    return Err(Error::bad_request(format!(
      "The collection {:?} is referenced by: {}.",
      collection.name,
      referencing.join(", ")
    )));
  }
  let views: Vec<&str> = cache
    .dependent_views(&collection.name)
    .into_iter()
    .filter(|v| v.id != collection.id)
    .map(|v| v.name.as_str())
    .collect();
  if !views.is_empty() {
    return Err(Error::bad_request(format!(
      "The collection {:?} is used by the views: {}.",
      collection.name,
      views.join(", ")
    )));
  }

  remove(ctx, collection)
}

fn remove(ctx: &mut Ctx<'_>, collection: Collection) -> Result<()> {
  let collection =
    into_collection(ctx.before(Phase::Delete, Model::Collection(Box::new(collection)))?)?;

  if collection.is_view() {
    ctx.conn.execute_batch(&view::drop_sql(&collection.name))?;
  } else {
    sync::apply(ctx.conn, &sync::plan(Some(&collection), None))?;
  }
  ctx.conn.execute(
    &format!("DELETE FROM `{COLLECTIONS_TABLE}` WHERE `id` = ?1"),
    [&collection.id],
  )?;
  if collection.is_auth() {
    ctx.conn.execute(
      &format!("DELETE FROM `{EXTERNAL_AUTHS_TABLE}` WHERE `collectionId` = ?1"),
      [&collection.id],
    )?;
  }
  info!(collection = %collection.name, "deleted collection");

  ctx.after.delete_prefix(collection.id.clone());
  ctx.after.model(Phase::Delete, Model::Collection(Box::new(collection)));
  Ok(())
}

fn import_error(code: &str, message: String) -> Error {
  Error::validation("collections", code, message)
}

/// Replace the schema with `imported`.
pub(crate) fn import(
  ctx: &mut Ctx<'_>,
  imported: Vec<Collection>,
  delete_missing: bool,
) -> Result<ImportSummary> {
  if imported.is_empty() {
    return Err(Error::validation("collections", "validation_required", "Cannot be blank."));
  }
  let cache = ctx.cache;
  let existing = cache.all();

  let mut imported = imported;
  for c in &mut imported {
    if c.id.is_empty()
      && let Some(found) = cache.by_name(&c.name)
    {
      c.id = found.id.clone();
    }
    let old = cache.by_id(&c.id);
    if c.is_view() {
      c.schema = old.map(|o| o.schema.clone()).unwrap_or_default();
    }
    prepare(c, old);
  }
  let imported_ids: HashSet<&str> = imported.iter().map(|c| c.id.as_str()).collect();

  let deleted: Vec<Collection> = if delete_missing {
    existing.iter().filter(|c| !imported_ids.contains(c.id.as_str())).cloned().collect()
  } else {
    Vec::new()
  };
  if let Some(system) = deleted.iter().find(|c| c.system) {
    return Err(import_error(
      "collections_import_failure",
      format!("System collection {:?} cannot be deleted.", system.name),
    ));
  }

  let deleted_ids: HashSet<&str> = deleted.iter().map(|c| c.id.as_str()).collect();
  let mut merged: Vec<Collection> = existing
    .iter()
    .filter(|c| !deleted_ids.contains(c.id.as_str()) && !imported_ids.contains(c.id.as_str()))
    .cloned()
    .collect();
  merged.extend(imported.iter().cloned());

  let validate_failure = |name: &str, errors: &Errors| {
    import_error(
      "collections_import_validate_failure",
      format!("Data validations failed for collection {name:?}: {errors}"),
    )
  };

  // Views are validated once their sources exist; everything else up front.
  let lookup = Lookup::new(ctx.conn, existing, merged.clone());
  for c in imported.iter().filter(|c| !c.is_view()) {
    if let Err(errors) = c.validate(cache.by_id(&c.id), &lookup) {
      return Err(validate_failure(&c.name, &errors));
    }
  }

  let mut summary = ImportSummary::default();

  let mut removals = deleted;
  removals.sort_by_key(|c| !c.is_view());
  for c in removals {
    summary.deleted.push(c.id.clone());
    remove(ctx, c).map_err(|e| import_error("collections_import_failure", e.to_string()))?;
  }

  let (views, tables): (Vec<Collection>, Vec<Collection>) =
    imported.into_iter().partition(Collection::is_view);
  let by_id: HashMap<String, Collection> =
    existing.iter().map(|c| (c.id.clone(), c.clone())).collect();

  for c in tables {
    let old = by_id.get(&c.id);
    let name = c.name.clone();
    let id = c.id.clone();
    persist(ctx, c, old, None).map_err(|e| match e.validation_errors() {
      Some(errors) => validate_failure(&name, errors),
      None => import_error("collections_import_failure", e.to_string()),
    })?;
    if old.is_some() { summary.updated.push(id) } else { summary.created.push(id) }
  }

  for mut c in views {
    let old = by_id.get(&c.id);
    let name = c.name.clone();
    let id = c.id.clone();
    let current = SchemaCache::load(ctx.conn)?;
    let lookup = Lookup::new(ctx.conn, existing, merged.clone());
    let plan = check(ctx.conn, &current, &mut c, old, &lookup).map_err(|e| {
      match e.validation_errors() {
        Some(errors) => validate_failure(&name, errors),
        None => import_error("collections_import_failure", e.to_string()),
      }
    })?;
    persist(ctx, c, old, plan)
      .map_err(|e| import_error("collections_import_failure", e.to_string()))?;
    if old.is_some() { summary.updated.push(id) } else { summary.created.push(id) }
  }

  let mut event = ImportSyncEvent {
    old: existing.to_vec(),
    new: SchemaCache::load(ctx.conn)?.all().to_vec(),
  };
  ctx
    .hooks
    .collections_before_import_sync
    .trigger(&mut event)
    .map_err(|e| import_error("collections_import_failure", e.to_string()))?;

  info!(
    created = summary.created.len(),
    updated = summary.updated.len(),
    deleted = summary.deleted.len(),
    "imported collections"
  );
  Ok(summary)
}
