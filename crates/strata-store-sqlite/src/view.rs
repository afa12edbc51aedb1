//! View collections: validate a `SELECT`, derive its schema, build the DDL.
//!
//! SQLite checks the query itself (a dry-run `prepare` yields the output
//! column names). Column types come from a light reading of the select list:
//! plain column references copy the source field, `cast(... as T)` and
//! numeric literals map to a field type, anything else is `json`.
//!
//! The view's `id` must compare as text. When the inferred type of the `id`
//! column is not text-like, the query is wrapped in a projection that casts
//! only `id` and keeps the column order.

use std::{collections::HashMap, sync::LazyLock};

use regex::Regex;
use rusqlite::Connection;
use strata_core::{
  Collection,
  Errors,
  Field,
  FieldOptions,
  FieldType,
  field::RelationOptions,
  security::{self, FIELD_ID_LENGTH},
};

use crate::{Error, Result, cache::SchemaCache, sync::quote};

/// Output of [`infer`].
#[derive(Debug, Clone, PartialEq)]
pub struct ViewPlan {
  /// Derived fields, without `id`, `created` and `updated`.
  pub schema: Vec<Field>,
  /// The `SELECT` the view is created from.
  pub select: String,
  pub wrapped: bool,
}

pub fn create_sql(name: &str, select: &str) -> String {
  format!("CREATE VIEW {} AS {select}", quote(name))
}

pub fn drop_sql(name: &str) -> String { format!("DROP VIEW IF EXISTS {}", quote(name)) }

fn invalid(reason: impl std::fmt::Display) -> Error {
  let mut query = Errors::new();
  query.add("query", "validation_invalid_view_query", format!("Invalid query - {reason}"));
  let mut errors = Errors::new();
  errors.nest("options", query);
  errors.into()
}

/// Check `query` against the live schema and derive the view's fields.
/// Field ids of `previous` are kept for columns that keep their name.
pub fn infer(
  conn: &Connection,
  cache: &SchemaCache,
  query: &str,
  previous: Option<&Collection>,
) -> Result<ViewPlan> {
  let query = normalize(query).ok_or_else(|| invalid("empty or multiple statements"))?;

  let columns: Vec<String> = {
    let stmt = conn.prepare(&format!("SELECT * FROM ({query})")).map_err(invalid)?;
    stmt.column_names().into_iter().map(str::to_string).collect()
  };
  if columns.is_empty() {
    return Err(invalid("the query must return at least one column"));
  }
  if !columns.iter().any(|c| c == "id") {
    return Err(invalid("missing required id column"));
  }
  let mut seen = std::collections::HashSet::new();
  if let Some(dup) = columns.iter().find(|c| !seen.insert(c.to_lowercase())) {
    return Err(invalid(format!("duplicated column {dup:?}")));
  }

  let inferred = Inference::new(cache, &query);
  let id_kind = inferred.column("id");
  let wrapped = !id_kind.is_text_like();

  let select = if wrapped {
    let projection = columns
      .iter()
      .map(|c| if c == "id" { "cast(`id` as text) `id`".to_string() } else { quote(c) })
      .collect::<Vec<_>>()
      .join(",");
    format!("SELECT * FROM (SELECT {projection} FROM ({query}))")
  } else {
    format!("SELECT * FROM ({query})")
  };

  let schema = columns
    .iter()
    .filter(|c| !matches!(c.as_str(), "id" | "created" | "updated"))
    .map(|c| {
      let mut field = inferred.column(c).into_field(c);
      field.id = previous
        .and_then(|p| p.schema.get_by_name(c))
        .map(|f| f.id.clone())
        .unwrap_or_else(|| security::random_id(FIELD_ID_LENGTH));
      field
    })
    .collect();

  Ok(ViewPlan { schema, select, wrapped })
}

/// Trim and drop trailing semicolons; `None` for empty input or more than
/// one statement.
fn normalize(query: &str) -> Option<String> {
  let trimmed = query.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace());
  if trimmed.is_empty() {
    return None;
  }
  let masked = mask(trimmed);
  if masked.contains(';') {
    return None;
  }
  Some(trimmed.to_string())
}

// ─── Inference ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Inferred {
  Copy(Field),
  Kind(FieldType),
  /// A foreign `id` column.
  Relation(String),
}

impl Inferred {
  fn is_text_like(&self) -> bool {
    let kind = match self {
      Self::Copy(f) => f.field_type(),
      Self::Kind(k) => *k,
      Self::Relation(_) => return true,
    };
    matches!(
      kind,
      FieldType::Text
        | FieldType::Editor
        | FieldType::Email
        | FieldType::Url
        | FieldType::Date
        | FieldType::Select
        | FieldType::File
        | FieldType::Relation
    )
  }

  fn into_field(self, name: &str) -> Field {
    match self {
      Self::Copy(src) => Field::new(name, src.field_type()).with_options(src.options),
      Self::Kind(kind) => Field::new(name, kind),
      Self::Relation(collection_id) => Field::new(name, FieldType::Relation).with_options(
        FieldOptions::Relation(RelationOptions {
          collection_id,
          max_select: Some(1),
          ..Default::default()
        }),
      ),
    }
  }
}

struct Inference<'c> {
  cache:   &'c SchemaCache,
  /// Lowercase alias or table name → table name.
  sources: HashMap<String, String>,
  main:    Option<String>,
  /// Output name (lowercase) → inferred type.
  columns: HashMap<String, Inferred>,
}

impl<'c> Inference<'c> {
  fn new(cache: &'c SchemaCache, query: &str) -> Self {
    let mut this = Self { cache, sources: HashMap::new(), main: None, columns: HashMap::new() };
    let Some((items, from)) = split_select(query) else { return this };
    this.read_sources(&from);

    for item in items {
      let (expr, alias) = split_alias(&item);
      if expr == "*" || expr.ends_with(".*") {
        this.expand_star(expr.strip_suffix(".*"));
        continue;
      }
      let name = alias.clone().or_else(|| identifier(&expr).map(|(_, c)| c));
      let Some(name) = name else { continue };
      let inferred = this.expr(&expr, &name);
      this.columns.entry(name.to_lowercase()).or_insert(inferred);
    }
    this
  }

  fn column(&self, name: &str) -> Inferred {
    self.columns.get(&name.to_lowercase()).cloned().unwrap_or(Inferred::Kind(FieldType::Json))
  }

  fn read_sources(&mut self, from: &str) {
    let masked = mask(from);
    for caps in SOURCE_RE.captures_iter(&format!("from {masked}")) {
      let table = unquote(&caps[1]);
      if self.main.is_none() {
        self.main = Some(table.clone());
      }
      if let Some(alias) = caps.get(2).map(|m| unquote(m.as_str()))
        && !is_keyword(&alias)
      {
        self.sources.insert(alias.to_lowercase(), table.clone());
      }
      self.sources.insert(table.to_lowercase(), table);
    }
  }

  fn source(&self, qualifier: Option<&str>) -> Option<&'c Collection> {
    let table = match qualifier {
      Some(q) => self.sources.get(&q.to_lowercase())?,
      None => self.main.as_ref()?,
    };
    self.cache.by_name(table)
  }

  fn expand_star(&mut self, qualifier: Option<&str>) {
    let Some(collection) = self.source(qualifier) else { return };
    self.columns.entry("id".into()).or_insert(Inferred::Kind(FieldType::Text));
    for base in ["created", "updated"] {
      self.columns.entry(base.into()).or_insert(Inferred::Kind(FieldType::Date));
    }
    for field in collection.schema.fields() {
      self
        .columns
        .entry(field.name.to_lowercase())
        .or_insert_with(|| Inferred::Copy(field.clone()));
    }
  }

  fn expr(&self, expr: &str, output: &str) -> Inferred {
    if let Some(caps) = CAST_RE.captures(expr) {
      return Inferred::Kind(cast_kind(&caps[1]));
    }
    if NUMBER_RE.is_match(expr) || AGGREGATE_RE.is_match(expr) {
      return Inferred::Kind(FieldType::Number);
    }
    let Some((qualifier, column)) = identifier(expr) else {
      return Inferred::Kind(FieldType::Json);
    };
    let Some(collection) = self.source(qualifier.as_deref()) else {
      return Inferred::Kind(FieldType::Json);
    };
    match column.as_str() {
      "id" if output == "id" => Inferred::Kind(FieldType::Text),
      "id" => Inferred::Relation(collection.id.clone()),
      "created" | "updated" => Inferred::Kind(FieldType::Date),
      _ => {
        if let Some(field) = collection.schema.get_by_name(&column) {
          return Inferred::Copy(field.clone());
        }
        if collection.is_auth() {
          return Inferred::Kind(match column.as_str() {
            "email" => FieldType::Email,
            "emailVisibility" | "verified" => FieldType::Bool,
            "lastResetSentAt" | "lastVerificationSentAt" => FieldType::Date,
            _ => FieldType::Text,
          });
        }
        Inferred::Kind(FieldType::Json)
      }
    }
  }
}

fn cast_kind(target: &str) -> FieldType {
  match target.to_lowercase().as_str() {
    "text" | "varchar" | "char" | "string" => FieldType::Text,
    "int" | "integer" | "real" | "numeric" | "decimal" | "float" | "double" => FieldType::Number,
    "bool" | "boolean" => FieldType::Bool,
    _ => FieldType::Json,
  }
}

// ─── Lexical helpers ─────────────────────────────────────────────────────────

static SOURCE_RE: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r#"(?i)\b(?:from|join)\s+([`"\[]?\w+[`"\]]?)(?:\s+(?:as\s+)?([`"\[]?\w+[`"\]]?))?"#)
    .expect("static regex")
});
static ALIAS_RE: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r#"(?is)^(.*?\S)\s+(?:as\s+)?([`"\[]?\w+[`"\]]?)$"#).expect("static regex")
});
static IDENT_RE: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r#"^(?:([`"\[]?\w+[`"\]]?)\.)?([`"\[]?\w+[`"\]]?)$"#).expect("static regex")
});
static CAST_RE: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"(?is)^cast\s*\(.*\s+as\s+(\w+)\s*\)$").expect("static regex"));
static NUMBER_RE: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"^-?\d+(\.\d+)?$").expect("static regex"));
static AGGREGATE_RE: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"(?i)^(count|sum|total|avg)\s*\(.*\)$").expect("static regex"));

const KEYWORDS: &[&str] = &[
  "on", "using", "left", "right", "inner", "outer", "cross", "full", "natural", "join", "where",
  "group", "order", "limit", "having", "window", "union", "end", "null", "and", "or", "not",
  "asc", "desc",
];

fn is_keyword(word: &str) -> bool { KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(word)) }

fn unquote(ident: &str) -> String {
  ident.trim_matches(|c| matches!(c, '`' | '"' | '[' | ']')).to_string()
}

/// `(qualifier, column)` when `expr` is a plain column reference.
fn identifier(expr: &str) -> Option<(Option<String>, String)> {
  let caps = IDENT_RE.captures(expr.trim())?;
  let column = unquote(&caps[2]);
  if NUMBER_RE.is_match(&column) || is_keyword(&column) {
    return None;
  }
  Some((caps.get(1).map(|m| unquote(m.as_str())), column))
}

/// `(expression, alias)` of one select item.
fn split_alias(item: &str) -> (String, Option<String>) {
  let item = item.trim();
  if let Some(caps) = ALIAS_RE.captures(item) {
    let expr = caps[1].trim();
    let alias = unquote(&caps[2]);
    let dangling = expr.ends_with(|c: char| "+-*/%|=<>!,(.".contains(c));
    if !dangling && !is_keyword(&alias) {
      return (expr.to_string(), Some(alias));
    }
  }
  (item.to_string(), None)
}

/// Replace everything inside quotes and parentheses with spaces, keeping
/// byte offsets, so keyword searches only see the top level.
fn mask(sql: &str) -> String {
  let mut out = String::with_capacity(sql.len());
  let mut depth = 0usize;
  let mut quote: Option<char> = None;
  for c in sql.chars() {
    let hidden = match (quote, c) {
      (Some(q), c) => {
        if c == q || (q == '[' && c == ']') {
          quote = None;
        }
        true
      }
      (None, '\'' | '"' | '`' | '[') => {
        quote = Some(c);
        true
      }
      (None, '(') => {
        depth += 1;
        true
      }
      (None, ')') => {
        depth = depth.saturating_sub(1);
        true
      }
      (None, _) => depth > 0,
    };
    if hidden {
      out.extend(std::iter::repeat_n(' ', c.len_utf8()));
    } else {
      out.push(c);
    }
  }
  out
}

/// Byte offset of the first top-level occurrence of `keyword`.
fn find_keyword(masked: &str, keyword: &str, from: usize) -> Option<usize> {
  let re = Regex::new(&format!(r"(?i)\b{keyword}\b")).ok()?;
  re.find_at(masked, from).map(|m| m.start())
}

/// Select items and FROM clause of a plain `SELECT`.
fn split_select(query: &str) -> Option<(Vec<String>, String)> {
  let masked = mask(query);
  let start = SELECT_RE.find(&masked)?.end();
  let from = find_keyword(&masked, "from", start).unwrap_or(query.len());

  let mut items = Vec::new();
  let mut last = start;
  for (i, c) in masked[start..from].char_indices() {
    if c == ',' {
      items.push(query[last..start + i].trim().to_string());
      last = start + i + 1;
    }
  }
  items.push(query[last..from].trim().to_string());

  let tail = if from < query.len() { from + 4 } else { from };
  let end = ["where", "group", "order", "limit", "having", "window", "union", "except", "intersect"]
    .iter()
    .filter_map(|k| find_keyword(&masked, k, tail))
    .min()
    .unwrap_or(query.len());
  Some((items, query[tail..end].to_string()))
}

static SELECT_RE: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"(?is)^\s*select\s+(?:(?:distinct|all)\s+)?").expect("static regex")
});

#[cfg(test)]
mod tests {
  use strata_core::{
    CollectionType,
    field::{SelectOptions, TextOptions},
  };

  use super::*;
  use crate::sync;

  fn demo1() -> Collection {
    let mut c = Collection::new("demo1", CollectionType::Base);
    c.id = "demo1_id_000001".into();
    let fields = [
      ("text", FieldType::Text),
      ("bool", FieldType::Bool),
      ("url", FieldType::Url),
      ("json", FieldType::Json),
      ("email", FieldType::Email),
      ("datetime", FieldType::Date),
      ("number", FieldType::Number),
    ];
    for (name, kind) in fields {
      c.schema.add_field(Field::new(name, kind));
    }
    c.schema.add_field(Field::new("rel_one", FieldType::Relation).with_options(
      FieldOptions::Relation(RelationOptions {
        collection_id: c.id.clone(),
        max_select: Some(1),
        ..Default::default()
      }),
    ));
    c.schema.add_field(Field::new("select_many", FieldType::Select).with_options(
      FieldOptions::Select(SelectOptions { max_select: 3, values: vec!["a".into(), "b".into()] }),
    ));
    c
  }

  fn setup() -> (Connection, SchemaCache) {
    let conn = Connection::open_in_memory().unwrap();
    let c = demo1();
    sync::apply(&conn, &sync::plan(None, Some(&c))).unwrap();
    (conn, SchemaCache::new(vec![c]))
  }

  fn select_of(query: &str) -> String {
    let (conn, cache) = setup();
    infer(&conn, &cache, query, None).unwrap().select
  }

  #[test]
  fn text_like_ids_are_not_wrapped() {
    for id in ["id", "text", "rel_one", "select_many", "email", "datetime", "url", "cast('test' as text)"] {
      let query = format!("select {id} as id, text as txt, url from demo1");
      assert_eq!(select_of(&query), format!("SELECT * FROM ({query})"), "id = {id}");
    }
  }

  #[test]
  fn non_text_ids_are_cast_in_place() {
    for id in ["bool", "json", "1", "('test')"] {
      let query = format!("select {id} as id, text as txt, url from demo1");
      assert_eq!(
        select_of(&query),
        format!("SELECT * FROM (SELECT cast(`id` as text) `id`,`txt`,`url` FROM ({query}))"),
        "id = {id}"
      );
    }
  }

  #[test]
  fn wrapping_keeps_column_order() {
    let query = "select text as txt, url, bool as id from demo1";
    assert_eq!(
      select_of(query),
      format!("SELECT * FROM (SELECT `txt`,`url`,cast(`id` as text) `id` FROM ({query}))")
    );
  }

  #[test]
  fn same_query_same_select() {
    let query = "select bool as id, text from demo1";
    assert_eq!(select_of(query), select_of(query));
  }

  #[test]
  fn schema_is_derived_from_sources() {
    let (conn, cache) = setup();
    let plan = infer(
      &conn,
      &cache,
      "select p.id, p.text as t, p.id as ref, p.created, cast(p.number as integer) as n, \
       count(p.id) as total, p.select_many from demo1 as p group by p.id",
      None,
    )
    .unwrap();
    assert!(!plan.wrapped);

    let summary: Vec<(&str, FieldType)> =
      plan.schema.iter().map(|f| (f.name.as_str(), f.field_type())).collect();
    assert_eq!(
      summary,
      vec![
        ("t", FieldType::Text),
        ("ref", FieldType::Relation),
        ("n", FieldType::Number),
        ("total", FieldType::Number),
        ("select_many", FieldType::Select),
      ]
    );
    assert_eq!(plan.schema[1].relation().unwrap().collection_id, "demo1_id_000001");
    assert!(plan.schema[4].is_multiple());
  }

  #[test]
  fn star_selects_copy_every_field() {
    let (conn, cache) = setup();
    let plan = infer(&conn, &cache, "select * from demo1", None).unwrap();
    assert!(!plan.wrapped);
    assert_eq!(plan.schema.len(), demo1().schema.len());
    assert_eq!(
      plan.schema.iter().find(|f| f.name == "bool").map(Field::field_type),
      Some(FieldType::Bool)
    );
  }

  #[test]
  fn previous_field_ids_are_kept() {
    let (conn, cache) = setup();
    let mut previous = Collection::new("v", CollectionType::View);
    previous.schema.add_field(
      Field::new("txt", FieldType::Text)
        .with_id("keep_me1")
        .with_options(FieldOptions::Text(TextOptions::default())),
    );
    let plan = infer(&conn, &cache, "select id, text as txt from demo1", Some(&previous)).unwrap();
    assert_eq!(plan.schema[0].id, "keep_me1");
  }

  #[test]
  fn invalid_queries_are_reported_on_options_query() {
    let (conn, cache) = setup();
    for query in [
      "",
      "select text from demo1",
      "select id from missing",
      "select id from demo1; drop table demo1",
      "delete from demo1",
    ] {
      let err = infer(&conn, &cache, query, None).unwrap_err();
      let errors = strata_core::Classify::validation_errors(&err).unwrap();
      assert_eq!(
        errors.code_at("options.query"),
        Some("validation_invalid_view_query"),
        "query = {query:?}"
      );
    }
  }
}
