//! Record reads and writes: access rules, value validation, expansion and
//! the relation-aware delete cascade.

use std::{
  collections::{BTreeMap, HashMap, HashSet},
  sync::LazyLock,
};

use regex::Regex;
use rusqlite::{Connection, ToSql, types::Value as SqlValue};
use serde_json::{Map, Value, json};
use strata_core::{
  Collection,
  Errors,
  Field,
  FieldError,
  FieldOptions,
  FieldType,
  Record,
  RequestInfo,
  external::{ChangeAction, file_key, record_dir, thumb_keys},
  hooks::Model,
  record::AUTH_COLUMNS,
  security::{self, DEFAULT_ID_LENGTH, TOKEN_KEY_LENGTH},
  store::{RecordList, RecordQuery},
  time,
};
use strata_rules::{Compiler, MAX_PATH_DEPTH};
use tracing::debug;

use crate::{
  Error,
  Result,
  cache::SchemaCache,
  encode::{decode_record, named_params, to_sql},
  schema::EXTERNAL_AUTHS_TABLE,
  store::{Ctx, Phase},
  sync::quote,
  values::{self, Modifier},
};

static ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\w+$").expect("static regex"));
static USERNAME_RE: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"^\w[\w.\-]*$").expect("static regex"));

const MAX_PASSWORD_LENGTH: usize = 72;
const DEFAULT_MIN_PASSWORD_LENGTH: usize = 8;

// ─── Lookup ──────────────────────────────────────────────────────────────────

pub(crate) fn collection<'c>(cache: &'c SchemaCache, name_or_id: &str) -> Result<&'c Collection> {
  cache
    .get(name_or_id)
    .ok_or_else(|| strata_core::Error::CollectionNotFound(name_or_id.to_string()).into())
}

fn writable<'c>(cache: &'c SchemaCache, name_or_id: &str) -> Result<&'c Collection> {
  let collection = collection(cache, name_or_id)?;
  if collection.is_view() {
    return Err(Error::bad_request("View collections are read only."));
  }
  Ok(collection)
}

/// Resolve which filter a rule imposes on `request`. `Ok(None)` means no
/// restriction; a missing rule is reserved for admins.
fn access<'r>(rule: Option<&'r str>, request: &RequestInfo) -> Result<Option<&'r str>> {
  if request.is_admin() {
    return Ok(None);
  }
  match rule {
    None => Err(strata_core::Error::Forbidden.into()),
    Some(r) if r.trim().is_empty() => Ok(None),
    Some(r) => Ok(Some(r)),
  }
}

fn not_found(id: &str) -> Error { strata_core::Error::RecordNotFound(id.to_string()).into() }

// ─── Select builder ──────────────────────────────────────────────────────────

/// A `SELECT` over one collection's table, filtered by compiled rules.
struct Select<'a> {
  collection: &'a Collection,
  compiler:   Compiler<'a>,
  wheres:     Vec<String>,
}

impl<'a> Select<'a> {
  fn new(collection: &'a Collection, cache: &'a SchemaCache, request: &'a RequestInfo) -> Self {
    Self { collection, compiler: Compiler::new(collection, cache, Some(request)), wheres: Vec::new() }
  }

  fn table(&self) -> String { quote(&self.collection.name) }

  fn rule(&mut self, rule: &str) -> Result<()> {
    let sql = self.compiler.rule(rule)?;
    self.wheres.push(sql);
    Ok(())
  }

  fn filter(&mut self, filter: &str) -> Result<()> {
    let sql = self.compiler.user_filter(filter)?;
    self.wheres.push(sql);
    Ok(())
  }

  fn id_in(&mut self, ids: &[String]) {
    let params: Vec<String> = ids.iter().map(|id| self.compiler.param(json!(id))).collect();
    let table = self.table();
    self.wheres.push(format!("{table}.`id` IN ({})", params.join(", ")));
  }

  fn from_where(&self) -> String {
    let mut sql = format!("FROM {}", self.table());
    if self.compiler.has_joins() {
      sql.push(' ');
      sql.push_str(&self.compiler.joins_sql());
    }
    if !self.wheres.is_empty() {
      sql.push_str(" WHERE ");
      sql.push_str(&self.wheres.join(" AND "));
    }
    sql
  }

  fn rows(
    &self,
    conn: &Connection,
    order: &[String],
    limit: Option<(usize, usize)>,
  ) -> Result<Vec<Record>> {
    let table = self.table();
    let mut sql = format!("SELECT {table}.* {}", self.from_where());
    if self.compiler.has_joins() {
      sql.push_str(&format!(" GROUP BY {table}.`id`"));
    }
    if !order.is_empty() {
      sql.push_str(&format!(" ORDER BY {}", order.join(", ")));
    } else if !self.collection.is_view() {
      sql.push_str(&format!(" ORDER BY {table}.rowid"));
    }
    if let Some((limit, offset)) = limit {
      sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}"));
    }

    let params = named_params(self.compiler.params());
    let bound = bind(&sql, &params);
    debug!(sql = %sql, "select records");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(bound.as_slice())?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
      out.push(decode_record(self.collection, row)?);
    }
    Ok(out)
  }

  fn count(&self, conn: &Connection) -> Result<i64> {
    let sql =
      format!("SELECT COUNT(DISTINCT {}.`id`) {}", self.table(), self.from_where());
    let params = named_params(self.compiler.params());
    let bound = bind(&sql, &params);
    Ok(conn.query_row(&sql, bound.as_slice(), |r| r.get(0))?)
  }
}

/// Named parameters that `sql` actually references.
fn bind<'p>(sql: &str, params: &'p [(String, SqlValue)]) -> Vec<(&'p str, &'p dyn ToSql)> {
  params
    .iter()
    .filter(|(name, _)| {
      sql.match_indices(name.as_str()).any(|(i, _)| {
        !sql[i + name.len()..].starts_with(|c: char| c.is_ascii_digit())
      })
    })
    .map(|(name, value)| (name.as_str(), value as &dyn ToSql))
    .collect()
}

// ─── Reads ───────────────────────────────────────────────────────────────────

/// Load one record, optionally restricted by `rule`.
pub(crate) fn fetch(
  conn: &Connection,
  cache: &SchemaCache,
  collection: &Collection,
  id: &str,
  rule: Option<&str>,
  request: &RequestInfo,
) -> Result<Option<Record>> {
  let mut select = Select::new(collection, cache, request);
  select.id_in(&[id.to_string()]);
  if let Some(rule) = rule {
    select.rule(rule)?;
  }
  Ok(select.rows(conn, &[], Some((1, 0)))?.pop())
}

pub(crate) fn list(
  conn: &Connection,
  cache: &SchemaCache,
  name: &str,
  query: &RecordQuery,
  request: &RequestInfo,
) -> Result<RecordList> {
  let collection = collection(cache, name)?;
  let rule = access(collection.list_rule.as_deref(), request)?;

  let mut select = Select::new(collection, cache, request);
  if let Some(rule) = rule {
    select.rule(rule)?;
  }
  if let Some(filter) = query.filter.as_deref().filter(|f| !f.trim().is_empty()) {
    select.filter(filter)?;
  }
  let order = match query.sort.as_deref().filter(|s| !s.trim().is_empty()) {
    Some(sort) => select.compiler.sort(sort)?,
    None => Vec::new(),
  };

  let (page, per_page) = (query.page(), query.per_page());
  let total = if query.skip_total { -1 } else { select.count(conn)? };
  let mut items = select.rows(conn, &order, Some((per_page, query.offset())))?;

  expand(conn, cache, request, collection, &mut items, &query.expand_paths())?;
  for item in &mut items {
    redact(collection, item, request);
  }

  let total_pages = if total < 0 { -1 } else { (total + per_page as i64 - 1) / per_page as i64 };
  Ok(RecordList { page, per_page, total_items: total, total_pages, items })
}

pub(crate) fn view(
  conn: &Connection,
  cache: &SchemaCache,
  name: &str,
  id: &str,
  expand_paths: Option<String>,
  request: &RequestInfo,
) -> Result<Record> {
  let collection = collection(cache, name)?;
  let rule = access(collection.view_rule.as_deref(), request)?;
  let mut record =
    fetch(conn, cache, collection, id, rule, request)?.ok_or_else(|| not_found(id))?;

  let paths = RecordQuery { expand: expand_paths, ..Default::default() }.expand_paths();
  expand(conn, cache, request, collection, std::slice::from_mut(&mut record), &paths)?;
  redact(collection, &mut record, request);
  Ok(record)
}

/// Hide `email` of auth records from everyone but admins and the owner,
/// unless the owner made it visible.
pub(crate) fn redact(collection: &Collection, record: &mut Record, request: &RequestInfo) {
  if !collection.is_auth() || request.is_admin() {
    return;
  }
  let visible = record.data.get("emailVisibility").and_then(Value::as_bool).unwrap_or(false);
  let owner = request
    .auth_record()
    .is_some_and(|a| a.id == record.id && a.collection_id == record.collection_id);
  if !visible && !owner {
    record.data.remove("email");
  }
}

/// Fill `expand` of `records` along dotted relation `paths`. Related records
/// are subject to their collection's view rule; paths that do not resolve
/// are skipped.
pub(crate) fn expand(
  conn: &Connection,
  cache: &SchemaCache,
  request: &RequestInfo,
  collection: &Collection,
  records: &mut [Record],
  paths: &[String],
) -> Result<()> {
  expand_level(conn, cache, request, collection, records, paths, 0)
}

fn expand_level(
  conn: &Connection,
  cache: &SchemaCache,
  request: &RequestInfo,
  collection: &Collection,
  records: &mut [Record],
  paths: &[String],
  depth: usize,
) -> Result<()> {
  if records.is_empty() || paths.is_empty() || depth >= MAX_PATH_DEPTH {
    return Ok(());
  }

  let mut groups: BTreeMap<&str, Vec<String>> = BTreeMap::new();
  for path in paths {
    match path.split_once('.') {
      Some((head, rest)) => groups.entry(head).or_default().push(rest.to_string()),
      None => {
        groups.entry(path.as_str()).or_default();
      }
    }
  }

  for (name, nested) in groups {
    let Some(field) = collection.schema.get_by_name(name) else { continue };
    let Some(target) = field.relation().and_then(|r| cache.by_id(&r.collection_id)) else {
      continue;
    };
    let rule = match access(target.view_rule.as_deref(), request) {
      Ok(rule) => rule,
      Err(_) => continue,
    };

    let mut ids: Vec<String> = Vec::new();
    for record in records.iter() {
      for id in record.get_string_list(name) {
        if !ids.contains(&id) {
          ids.push(id);
        }
      }
    }
    if ids.is_empty() {
      continue;
    }

    let mut select = Select::new(target, cache, request);
    select.id_in(&ids);
    if let Some(rule) = rule {
      select.rule(rule)?;
    }
    let mut related = select.rows(conn, &[], None)?;
    expand_level(conn, cache, request, target, &mut related, &nested, depth + 1)?;
    for r in &mut related {
      redact(target, r, request);
    }

    let by_id: HashMap<&str, &Record> = related.iter().map(|r| (r.id.as_str(), r)).collect();
    for record in records.iter_mut() {
      let found = record
        .get_string_list(name)
        .iter()
        .filter_map(|id| by_id.get(id.as_str()))
        .map(serde_json::to_value)
        .collect::<std::result::Result<Vec<_>, _>>()?;
      if found.is_empty() {
        continue;
      }
      let value = if field.is_multiple() {
        Value::Array(found)
      } else {
        found.into_iter().next().unwrap_or(Value::Null)
      };
      record.expand.insert(name.to_string(), value);
    }
  }
  Ok(())
}

// ─── Input ───────────────────────────────────────────────────────────────────

/// `field`'s value after applying the submitted value and its `+`/`-`
/// modifiers to `current`.
fn input(field: &Field, data: &Map<String, Value>, current: Value) -> Value {
  let mut value = current;
  if let Some(raw) = data.get(&field.name) {
    value = values::normalize(field, raw.clone());
  }
  if let Some(delta) = data.get(&format!("{}+", field.name)) {
    value = values::modify(field, value, Modifier::Append, delta.clone());
  }
  if let Some(delta) = data.get(&format!("{}-", field.name)) {
    value = values::modify(field, value, Modifier::Remove, delta.clone());
  }
  value
}

/// `request` as access rules see it: every submitted field, whether sent
/// plainly or through a `+`/`-` key, carries the value it resolved to.
fn resolved_request(
  collection: &Collection,
  request: &RequestInfo,
  record: &Record,
) -> RequestInfo {
  let mut data = request.data.clone();
  for field in collection.schema.fields() {
    let plain = data.contains_key(&field.name);
    let appended = data.remove(&format!("{}+", field.name)).is_some();
    let removed = data.remove(&format!("{}-", field.name)).is_some();
    if plain || appended || removed {
      let value = record.data.get(&field.name).cloned().unwrap_or(Value::Null);
      data.insert(field.name.clone(), value);
    }
  }
  RequestInfo { data, ..request.clone() }
}

fn text(value: &Value) -> String {
  match value {
    Value::String(s) => s.trim().to_string(),
    Value::Null => String::new(),
    other => other.to_string(),
  }
}

/// Whether another row of `collection` already holds `value` in `column`.
fn taken(
  conn: &Connection,
  collection: &Collection,
  column: &str,
  value: &Value,
  except_id: &str,
  nocase: bool,
) -> Result<bool> {
  let collate = if nocase { " COLLATE NOCASE" } else { "" };
  let sql = format!(
    "SELECT 1 FROM {} WHERE {} = ?1{collate} AND `id` != ?2 LIMIT 1",
    quote(&collection.name),
    quote(column)
  );
  let value = match collection.schema.get_by_name(column) {
    Some(field) => cell_value(field, value),
    None => to_sql(value),
  };
  Ok(conn.prepare(&sql)?.exists(rusqlite::params![value, except_id])?)
}

fn check_id(
  conn: &Connection,
  cache: &SchemaCache,
  collection: &Collection,
  id: &str,
) -> Result<Option<FieldError>> {
  if id.chars().count() != DEFAULT_ID_LENGTH {
    return Ok(Some(FieldError::new(
      "validation_length_invalid",
      format!("The length must be exactly {DEFAULT_ID_LENGTH}."),
    )));
  }
  if !ID_RE.is_match(id) {
    return Ok(Some(FieldError::new("validation_match_invalid", "Must be in a valid format.")));
  }
  // Auth ids are unique across every auth collection.
  let scope: Vec<&Collection> = if collection.is_auth() {
    cache.all().iter().filter(|c| c.is_auth()).collect()
  } else {
    vec![collection]
  };
  for c in scope {
    let sql = format!("SELECT 1 FROM {} WHERE `id` = ?1", quote(&c.name));
    if conn.prepare(&sql)?.exists([id])? {
      return Ok(Some(FieldError::new(
        "validation_invalid_id",
        "The model id is invalid or already exists.",
      )));
    }
  }
  Ok(None)
}

/// Apply the auth-specific inputs (identity, password) to `record`.
fn auth_input(
  conn: &Connection,
  collection: &Collection,
  record: &mut Record,
  old: Option<&Record>,
  request: &RequestInfo,
  errors: &mut Errors,
) -> Result<()> {
  let options = collection.auth_options().cloned().unwrap_or_default();
  let data = &request.data;

  if old.is_none() {
    for column in AUTH_COLUMNS {
      record.set(*column, json!(""));
    }
    record.set("emailVisibility", json!(false));
    record.set("verified", json!(false));
    record.set("tokenKey", json!(security::random_id(TOKEN_KEY_LENGTH)));
  }
  let changed = |record: &Record, key: &str| old.is_none_or(|o| o.get_str(key) != record.get_str(key));

  // Username.
  if let Some(v) = data.get("username") {
    record.set("username", json!(text(v)));
  }
  let username = record.get_str("username").unwrap_or_default().to_string();
  if username.is_empty() {
    if old.is_none() {
      record.set("username", json!(format!("user{}", security::random_id(6))));
    } else {
      errors.add_error("username", FieldError::required());
    }
  } else if changed(&*record, "username") {
    let len = username.chars().count();
    if !(3..=150).contains(&len) || !USERNAME_RE.is_match(&username) {
      errors.add("username", "validation_invalid_username", "Invalid username format.");
    } else if taken(conn, collection, "username", &json!(username), &record.id, true)? {
      errors.add(
        "username",
        "validation_invalid_username",
        "The username is invalid or already in use.",
      );
    }
  }

  // Email.
  if let Some(v) = data.get("email") {
    record.set("email", json!(text(v)));
  }
  let email = record.get_str("email").unwrap_or_default().to_string();
  if email.is_empty() {
    if options.require_email {
      errors.add_error("email", FieldError::required());
    }
  } else if changed(&*record, "email") {
    if let Some(e) = values::check_email(
      &email,
      options.only_email_domains.as_ref(),
      options.except_email_domains.as_ref(),
    ) {
      errors.add_error("email", e);
    } else if taken(conn, collection, "email", &json!(email), &record.id, true)? {
      errors.add("email", "validation_invalid_email", "The email is invalid or already in use.");
    }
  }

  let flag = Field::new("flag", FieldType::Bool);
  if let Some(v) = data.get("emailVisibility") {
    record.set("emailVisibility", values::normalize(&flag, v.clone()));
  }
  // Only admins may mark records verified.
  if request.is_admin()
    && let Some(v) = data.get("verified")
  {
    record.set("verified", values::normalize(&flag, v.clone()));
  }

  // Password.
  let password = data.get("password").map(text).filter(|p| !p.is_empty());
  let Some(password) = password else {
    if old.is_none() {
      errors.add_error("password", FieldError::required());
    }
    return Ok(());
  };
  let min = match options.min_password_length as usize {
    0 => DEFAULT_MIN_PASSWORD_LENGTH,
    n => n,
  };
  let len = password.chars().count();
  if len < min || len > MAX_PASSWORD_LENGTH {
    errors.add(
      "password",
      "validation_length_out_of_range",
      format!("The length must be between {min} and {MAX_PASSWORD_LENGTH}."),
    );
  }
  if data.get("passwordConfirm").map(text).as_deref() != Some(password.as_str()) {
    errors.add("passwordConfirm", "validation_values_mismatch", "Values don't match.");
  }
  if let Some(old) = old
    && !request.is_admin()
  {
    let given = data.get("oldPassword").map(text).unwrap_or_default();
    if !security::verify_password(&given, old.get_str("passwordHash").unwrap_or_default()) {
      errors.add("oldPassword", "validation_invalid_old_password", "Missing or invalid old password.");
    }
  }
  if errors.is_empty() {
    record.set("passwordHash", json!(security::hash_password(&password)?));
    record.set("tokenKey", json!(security::random_id(TOKEN_KEY_LENGTH)));
  }
  Ok(())
}

/// Validate every schema value of `record`, including the checks that need
/// the database.
fn check_values(
  conn: &Connection,
  cache: &SchemaCache,
  collection: &Collection,
  record: &Record,
  errors: &mut Errors,
) -> Result<()> {
  for field in collection.schema.fields() {
    let value = record.data.get(&field.name).cloned().unwrap_or(Value::Null);
    if let Some(e) = values::validate(field, &value) {
      errors.add_error(field.name.clone(), e);
      continue;
    }
    if values::is_empty(&value) {
      continue;
    }

    if let Some(relation) = field.relation() {
      let ids = record.get_string_list(&field.name);
      let Some(target) = cache.by_id(&relation.collection_id) else {
        errors.add(
          field.name.clone(),
          "validation_missing_rel_collection",
          "The related collection no longer exists.",
        );
        continue;
      };
      let placeholders = vec!["?"; ids.len()].join(", ");
      let sql = format!("SELECT COUNT(*) FROM {} WHERE `id` IN ({placeholders})", quote(&target.name));
      let found: i64 = conn.query_row(&sql, rusqlite::params_from_iter(&ids), |r| r.get(0))?;
      if found as usize != ids.len() {
        errors.add(
          field.name.clone(),
          "validation_missing_rel_records",
          "Failed to find all relation records with the provided ids.",
        );
        continue;
      }
    }

    if field.unique && taken(conn, collection, &field.name, &value, &record.id, false)? {
      errors.add(field.name.clone(), "validation_not_unique", "Value must be unique.");
    }
  }
  Ok(())
}

// ─── Writes ──────────────────────────────────────────────────────────────────

/// Bindable form of a schema value.
fn cell_value(field: &Field, value: &Value) -> SqlValue {
  if field.is_multiple() || field.field_type() == FieldType::Json {
    return match value {
      Value::Null if !field.is_multiple() => SqlValue::Null,
      Value::Null => SqlValue::Text("[]".into()),
      other => SqlValue::Text(other.to_string()),
    };
  }
  to_sql(value)
}

fn columns(collection: &Collection) -> Vec<String> {
  let mut columns: Vec<String> = ["id", "created", "updated"].map(String::from).to_vec();
  if collection.is_auth() {
    columns.extend(AUTH_COLUMNS.iter().map(|c| c.to_string()));
  }
  columns.extend(collection.schema.fields().iter().map(|f| f.name.clone()));
  columns
}

fn cells(collection: &Collection, record: &Record) -> Vec<SqlValue> {
  columns(collection)
    .iter()
    .map(|column| match column.as_str() {
      "id" => SqlValue::Text(record.id.clone()),
      "created" => SqlValue::Text(time::format(&record.created)),
      "updated" => SqlValue::Text(time::format(&record.updated)),
      name => {
        let value = record.data.get(name).cloned().unwrap_or(Value::Null);
        match collection.schema.get_by_name(name) {
          Some(field) => cell_value(field, &value),
          None => to_sql(&value),
        }
      }
    })
    .collect()
}

fn insert(conn: &Connection, collection: &Collection, record: &Record) -> Result<()> {
  let columns = columns(collection);
  let names = columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", ");
  let placeholders = vec!["?"; columns.len()].join(", ");
  conn.execute(
    &format!("INSERT INTO {} ({names}) VALUES ({placeholders})", quote(&collection.name)),
    rusqlite::params_from_iter(cells(collection, record)),
  )?;
  Ok(())
}

fn update_row(conn: &Connection, collection: &Collection, record: &Record) -> Result<()> {
  let columns = columns(collection);
  let assignments = columns
    .iter()
    .skip(1)
    .enumerate()
    .map(|(i, c)| format!("{} = ?{}", quote(c), i + 2))
    .collect::<Vec<_>>()
    .join(", ");
  conn.execute(
    &format!("UPDATE {} SET {assignments} WHERE `id` = ?1", quote(&collection.name)),
    rusqlite::params_from_iter(cells(collection, record)),
  )?;
  Ok(())
}

fn into_record(model: Model) -> Result<Record> {
  match model {
    Model::Record(r) => Ok(*r),
    Model::Collection(_) => Err(Error::bad_request("A hook replaced the record with a collection.")),
  }
}

/// Create a record from `request.data`; returns its id.
pub(crate) fn create(ctx: &mut Ctx<'_>, name: &str, request: &RequestInfo) -> Result<String> {
  let cache = ctx.cache;
  let collection = writable(cache, name)?;
  let rule = access(collection.create_rule.as_deref(), request)?;
  let data = &request.data;

  let mut errors = Errors::new();
  let mut record = Record::new(collection);
  match data.get("id").and_then(Value::as_str).filter(|id| !id.is_empty()) {
    Some(id) => {
      if let Some(e) = check_id(ctx.conn, cache, collection, id)? {
        errors.add_error("id", e);
      }
      record.id = id.to_string();
    }
    None => record.id = security::random_id(DEFAULT_ID_LENGTH),
  }
  for field in collection.schema.fields() {
    record.set(field.name.clone(), input(field, data, values::empty(field)));
  }
  if collection.is_auth() {
    auth_input(ctx.conn, collection, &mut record, None, request, &mut errors)?;
  }
  check_values(ctx.conn, cache, collection, &record, &mut errors)?;
  errors.into_result()?;

  let record = into_record(ctx.before(Phase::Create, Model::Record(Box::new(record)))?)?;
  insert(ctx.conn, collection, &record)?;

  // The create rule sees the stored row, so it can reference its values.
  if let Some(rule) = rule {
    let resolved = resolved_request(collection, request, &record);
    if fetch(ctx.conn, cache, collection, &record.id, Some(rule), &resolved)?.is_none() {
      return Err(Error::bad_request("Failed to create record."));
    }
  }

  debug!(collection = %collection.name, id = %record.id, "created record");
  ctx.after.change(ChangeAction::Create, &record);
  let id = record.id.clone();
  ctx.after.model(Phase::Create, Model::Record(Box::new(record)));
  Ok(id)
}

/// Update record `id` from `request.data`.
pub(crate) fn update(
  ctx: &mut Ctx<'_>,
  name: &str,
  id: &str,
  request: &RequestInfo,
) -> Result<()> {
  let cache = ctx.cache;
  let collection = writable(cache, name)?;
  let rule = access(collection.update_rule.as_deref(), request)?;
  let existing =
    fetch(ctx.conn, cache, collection, id, None, request)?.ok_or_else(|| not_found(id))?;

  let data = &request.data;
  let mut errors = Errors::new();
  let mut record = existing.clone();
  record.updated = time::now();
  for field in collection.schema.fields() {
    let current = existing.data.get(&field.name).cloned().unwrap_or_else(|| values::empty(field));
    record.set(field.name.clone(), input(field, data, current));
  }
  if collection.is_auth() {
    auth_input(ctx.conn, collection, &mut record, Some(&existing), request, &mut errors)?;
  }
  check_values(ctx.conn, cache, collection, &record, &mut errors)?;

  // The update rule runs against the stored row with the resolved values.
  if let Some(rule) = rule {
    let resolved = resolved_request(collection, request, &record);
    if fetch(ctx.conn, cache, collection, id, Some(rule), &resolved)?.is_none() {
      return Err(not_found(id));
    }
  }
  errors.into_result()?;

  let record = into_record(ctx.before(Phase::Update, Model::Record(Box::new(record)))?)?;
  update_row(ctx.conn, collection, &record)?;

  // Files dropped from the record are deleted once committed.
  for field in collection.schema.fields() {
    let FieldOptions::File(options) = &field.options else { continue };
    let kept = record.get_string_list(&field.name);
    for file in existing.get_string_list(&field.name) {
      if kept.contains(&file) {
        continue;
      }
      ctx.after.delete_file(file_key(&collection.id, &record.id, &file));
      for key in thumb_keys(&collection.id, &record.id, &file, &options.thumbs) {
        ctx.after.delete_file(key);
      }
    }
  }

  debug!(collection = %collection.name, id = %record.id, "updated record");
  ctx.after.change(ChangeAction::Update, &record);
  ctx.after.model(Phase::Update, Model::Record(Box::new(record)));
  Ok(())
}

/// Delete record `id` and cascade through the relations that point at it.
pub(crate) fn delete(
  ctx: &mut Ctx<'_>,
  name: &str,
  id: &str,
  request: &RequestInfo,
) -> Result<()> {
  let cache = ctx.cache;
  let collection = writable(cache, name)?;
  let rule = access(collection.delete_rule.as_deref(), request)?;
  let record =
    fetch(ctx.conn, cache, collection, id, rule, request)?.ok_or_else(|| not_found(id))?;

  let mut visited = HashSet::new();
  cascade_delete(ctx, collection, record, &mut visited)
}

/// Rows of `collection` whose relation `field` contains `id`.
fn referencing(
  conn: &Connection,
  collection: &Collection,
  field: &Field,
  id: &str,
) -> Result<Vec<Record>> {
  let (t, c) = (quote(&collection.name), quote(&field.name));
  let sql = if field.is_multiple() {
    format!(
      "SELECT {t}.* FROM {t} WHERE EXISTS (SELECT 1 FROM json_each(CASE WHEN json_valid({c}) \
       THEN {c} ELSE json_array({c}) END) je WHERE je.value = ?1)"
    )
  } else {
    format!("SELECT {t}.* FROM {t} WHERE {c} = ?1")
  };
  let mut stmt = conn.prepare(&sql)?;
  let mut rows = stmt.query([id])?;
  let mut out = Vec::new();
  while let Some(row) = rows.next()? {
    out.push(decode_record(collection, row)?);
  }
  Ok(out)
}

fn cascade_delete(
  ctx: &mut Ctx<'_>,
  collection: &Collection,
  record: Record,
  visited: &mut HashSet<(String, String)>,
) -> Result<()> {
  if !visited.insert((collection.id.clone(), record.id.clone())) {
    return Ok(());
  }
  let record = into_record(ctx.before(Phase::Delete, Model::Record(Box::new(record)))?)?;

  let cache = ctx.cache;
  for (source, field) in cache.references_to(&collection.id) {
    let Some(relation) = field.relation() else { continue };
    for mut row in referencing(ctx.conn, source, field, &record.id)? {
      if visited.contains(&(source.id.clone(), row.id.clone())) {
        continue;
      }
      if relation.cascade_delete {
        cascade_delete(ctx, source, row, visited)?;
        continue;
      }

      let mut ids = row.get_string_list(&field.name);
      ids.retain(|i| i != &record.id);
      if field.required && ids.is_empty() {
        return Err(Error::bad_request(format!(
          "The record cannot be deleted because it is part of a required reference in record \
           {:?} of collection {:?}.",
          row.id, source.name
        )));
      }
      let value = if field.is_multiple() {
        json!(ids)
      } else {
        json!(ids.into_iter().next().unwrap_or_default())
      };
      row.set(field.name.clone(), value);
      row.updated = time::now();
      let row = into_record(ctx.before(Phase::Update, Model::Record(Box::new(row)))?)?;
      update_row(ctx.conn, source, &row)?;
      ctx.after.change(ChangeAction::Update, &row);
      ctx.after.model(Phase::Update, Model::Record(Box::new(row)));
    }
  }

  ctx
    .conn
    .execute(&format!("DELETE FROM {} WHERE `id` = ?1", quote(&collection.name)), [&record.id])?;
  if collection.is_auth() {
    ctx.conn.execute(
      &format!("DELETE FROM `{EXTERNAL_AUTHS_TABLE}` WHERE `collectionId` = ?1 AND `recordId` = ?2"),
      [&collection.id, &record.id],
    )?;
  }

  debug!(collection = %collection.name, id = %record.id, "deleted record");
  ctx.after.delete_prefix(record_dir(&collection.id, &record.id));
  ctx.after.change(ChangeAction::Delete, &record);
  ctx.after.model(Phase::Delete, Model::Record(Box::new(record)));
  Ok(())
}
