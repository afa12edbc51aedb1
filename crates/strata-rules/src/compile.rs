//! Expression tree → parameterized SQL.
//!
//! A [`Compiler`] is bound to one base collection and accumulates the joins
//! and named parameters of every expression compiled through it, so a rule,
//! a user filter and a sort can be merged into a single `SELECT`.
//!
//! Field paths resolve as follows:
//!
//! - every segment but the last names a `relation` field; single relations
//!   become one `LEFT JOIN` each, to-many relations go through `json_each`
//!   and make the whole path multi-valued;
//! - the last segment names a schema field, a base column (`id`, `created`,
//!   `updated`, `collectionId`, `collectionName`) or an auth column, with an
//!   optional `:lower`, `:length` or `:each` modifier.
//!
//! A plain operator over a multi-valued operand means "every value matches"
//! and adds a correlated `NOT EXISTS` counterexample check; the `?` operators
//! mean "at least one value matches".

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use strata_core::{
  Collection,
  Record,
  RequestInfo,
  record::{AUTH_COLUMNS, HIDDEN_AUTH_COLUMNS},
  time,
};

use crate::{
  Error,
  Result,
  ast::{CmpOp, Expr, Operand, Operator},
  parse::parse,
};

/// Relation hops allowed in one field path.
pub const MAX_PATH_DEPTH: usize = 6;

/// Collection lookups needed while resolving relation paths.
pub trait CollectionResolver {
  /// Find a collection by id or (case-insensitive) name.
  fn find(&self, name_or_id: &str) -> Option<Collection>;
}

impl CollectionResolver for [Collection] {
  fn find(&self, name_or_id: &str) -> Option<Collection> {
    self
      .iter()
      .find(|c| c.id == name_or_id || c.name.eq_ignore_ascii_case(name_or_id))
      .cloned()
  }
}

impl CollectionResolver for Vec<Collection> {
  fn find(&self, name_or_id: &str) -> Option<Collection> { self.as_slice().find(name_or_id) }
}

pub(crate) fn quote(ident: &str) -> String { format!("`{}`", ident.replace('`', "``")) }

// ─── Joins ───────────────────────────────────────────────────────────────────

/// One `LEFT JOIN` of the final query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Join {
  /// Table or table-valued function expression.
  pub table: String,
  pub alias: String,
  pub on:    Option<String>,
}

impl Join {
  pub fn to_sql(&self) -> String {
    match &self.on {
      Some(on) => format!("LEFT JOIN {} {} ON {}", self.table, self.alias, on),
      None => format!("LEFT JOIN {} {}", self.table, self.alias),
    }
  }
}

/// Deduplicating join list with deterministic, first-appearance aliases.
#[derive(Debug, Default)]
struct JoinScope {
  prefix:  String,
  joins:   Vec<Join>,
  aliases: HashMap<String, String>,
}

impl JoinScope {
  fn new(prefix: impl Into<String>) -> Self {
    Self { prefix: prefix.into(), ..Default::default() }
  }

  /// Return the alias joined for `key`, adding the join on first use.
  fn join(
    &mut self,
    key: &str,
    build: impl FnOnce(&str) -> (String, Option<String>),
  ) -> String {
    if let Some(alias) = self.aliases.get(key) {
      return alias.clone();
    }
    let alias = format!("{}{}", self.prefix, self.joins.len());
    let (table, on) = build(&alias);
    self.joins.push(Join { table, alias: alias.clone(), on });
    self.aliases.insert(key.to_string(), alias.clone());
    alias
  }

  fn to_sql(&self) -> String {
    self.joins.iter().map(Join::to_sql).collect::<Vec<_>>().join(" ")
  }
}

fn json_each_source(column: &str) -> String {
  format!("json_each(CASE WHEN json_valid({column}) THEN {column} ELSE json_array({column}) END)")
}

fn json_length(column: &str) -> String {
  format!(
    "json_array_length(CASE WHEN json_valid({column}) THEN {column} ELSE (CASE WHEN {column} = '' OR {column} IS NULL THEN json_array() ELSE json_array({column}) END) END)"
  )
}

// ─── Operands ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Multi {
  None,
  /// Values reachable through joins; `sub` selects them as `v` for the
  /// current row.
  Joined { sub: String },
  /// A JSON array parameter (`json_each(:rN)`).
  Array { source: String },
}

#[derive(Debug, Clone)]
struct Side {
  sql:   String,
  /// `null` or `''` literal.
  empty: bool,
  multi: Multi,
}

impl Side {
  fn scalar(sql: impl Into<String>) -> Self {
    Self { sql: sql.into(), empty: false, multi: Multi::None }
  }
}

struct Walked {
  expr:  String,
  multi: bool,
}

/// Where a field path starts.
struct PathStart<'c> {
  collection: &'c Collection,
  alias:      String,
  key:        String,
}

// ─── Compiler ────────────────────────────────────────────────────────────────

/// Output of a one-shot compilation.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFilter {
  pub sql:    String,
  pub params: BTreeMap<String, Value>,
  pub joins:  Vec<Join>,
}

pub struct Compiler<'a> {
  base:       &'a Collection,
  resolver:   &'a dyn CollectionResolver,
  request:    Option<&'a RequestInfo>,
  params:     BTreeMap<String, Value>,
  joins:      JoinScope,
  sub_count:  usize,
  /// Set while compiling user-supplied input.
  user_input: bool,
}

impl<'a> Compiler<'a> {
  /// `request` is `None` when only checking that an expression compiles;
  /// every `@request.*` value then resolves to `NULL`.
  pub fn new(
    base: &'a Collection,
    resolver: &'a dyn CollectionResolver,
    request: Option<&'a RequestInfo>,
  ) -> Self {
    Self {
      base,
      resolver,
      request,
      params: BTreeMap::new(),
      joins: JoinScope::new("__j"),
      sub_count: 0,
      user_input: false,
    }
  }

  /// Compile a collection access rule.
  pub fn rule(&mut self, rule: &str) -> Result<String> {
    self.user_input = false;
    let expr = parse(rule)?;
    self.expr(&expr)
  }

  /// Compile a request-supplied `filter`. Non-admins may not use `@request`
  /// or `@collection`; nobody may reference hidden auth columns.
  pub fn user_filter(&mut self, filter: &str) -> Result<String> {
    self.user_input = true;
    let expr = parse(filter);
    let result = expr.and_then(|e| self.expr(&e));
    self.user_input = false;
    result
  }

  /// Compile a `sort` expression (`-created,title,@random`) into `ORDER BY`
  /// terms.
  pub fn sort(&mut self, sort: &str) -> Result<Vec<String>> {
    self.user_input = true;
    let result = self.sort_terms(sort);
    self.user_input = false;
    result
  }

  pub fn joins(&self) -> &[Join] { &self.joins.joins }

  /// Rendered `LEFT JOIN ...` clauses, space separated.
  pub fn joins_sql(&self) -> String { self.joins.to_sql() }

  pub fn params(&self) -> &BTreeMap<String, Value> { &self.params }

  pub fn has_joins(&self) -> bool { !self.joins.joins.is_empty() }

  /// Register an extra named parameter in the shared namespace.
  pub fn param(&mut self, value: Value) -> String {
    let name = format!(":r{}", self.params.len());
    self.params.insert(name.clone(), value);
    name
  }

  fn restricted(&self) -> bool {
    self.user_input && !self.request.is_some_and(RequestInfo::is_admin)
  }

  fn expr(&mut self, expr: &Expr) -> Result<String> {
    match expr {
      Expr::And(l, r) => Ok(format!("({} AND {})", self.expr(l)?, self.expr(r)?)),
      Expr::Or(l, r) => Ok(format!("({} OR {})", self.expr(l)?, self.expr(r)?)),
      Expr::Compare { left, op, right } => self.compare(left, *op, right),
    }
  }

  fn compare(&mut self, left: &Operand, op: Operator, right: &Operand) -> Result<String> {
    let like = matches!(op.op, CmpOp::Like | CmpOp::NotLike);
    let l = self.side(left, false)?;
    let r = self.side(right, like)?;

    if let Multi::Array { source } = &l.multi {
      return Ok(self.array_match(source, op, &r, true));
    }
    if let Multi::Array { source } = &r.multi {
      return Ok(self.array_match(source, op, &l, false));
    }

    let main = plain_compare(&l, op.op, &r);
    if op.any {
      return Ok(main);
    }

    let mut parts = vec![main];
    if let Multi::Joined { sub } = &l.multi {
      let alias = self.next_sub_alias("__sm");
      let value = Side { sql: format!("{alias}.v"), ..l.clone() };
      parts.push(format!(
        "NOT EXISTS (SELECT 1 FROM ({sub}) {alias} WHERE NOT ({}))",
        plain_compare(&value, op.op, &r)
      ));
    }
    if let Multi::Joined { sub } = &r.multi {
      let alias = self.next_sub_alias("__sm");
      let sql = if like { format!("('%' || {alias}.v || '%')") } else { format!("{alias}.v") };
      let value = Side { sql, ..r.clone() };
      parts.push(format!(
        "NOT EXISTS (SELECT 1 FROM ({sub}) {alias} WHERE NOT ({}))",
        plain_compare(&l, op.op, &value)
      ));
    }

    if parts.len() == 1 {
      Ok(parts.remove(0))
    } else {
      Ok(format!("({})", parts.join(" AND ")))
    }
  }

  /// Match against every element of a JSON array parameter.
  fn array_match(&mut self, source: &str, op: Operator, other: &Side, array_left: bool) -> String {
    let alias = self.next_sub_alias("__pa");
    let item = Side::scalar(format!("{alias}.value"));
    let cond = if array_left {
      plain_compare(&item, op.op, other)
    } else {
      plain_compare(other, op.op, &item)
    };
    if op.any {
      format!("EXISTS (SELECT 1 FROM {source} {alias} WHERE {cond})")
    } else {
      format!(
        "(EXISTS (SELECT 1 FROM {source}) AND NOT EXISTS (SELECT 1 FROM {source} {alias} WHERE NOT ({cond})))"
      )
    }
  }

  fn next_sub_alias(&mut self, prefix: &str) -> String {
    let alias = format!("{prefix}{}", self.sub_count);
    self.sub_count += 1;
    alias
  }

  fn side(&mut self, operand: &Operand, like_right: bool) -> Result<Side> {
    match operand {
      Operand::Null => Ok(Side { sql: "NULL".into(), empty: true, multi: Multi::None }),
      Operand::Str(s) => {
        if like_right {
          Ok(Side::scalar(self.param(Value::String(like_pattern(s)))))
        } else {
          let empty = s.is_empty();
          Ok(Side { empty, ..Side::scalar(self.param(Value::String(s.clone()))) })
        }
      }
      Operand::Number(n) => {
        if like_right {
          return Ok(Side::scalar(self.param(Value::String(like_pattern(n)))));
        }
        let value = n
          .parse::<i64>()
          .map(Value::from)
          .or_else(|_| n.parse::<f64>().map(Value::from))
          .map_err(|_| Error::syntax(0, format!("invalid number {n:?}")))?;
        Ok(Side::scalar(self.param(value)))
      }
      Operand::Bool(b) => Ok(Side::scalar(self.param(Value::Bool(*b)))),
      Operand::Ident(raw) => {
        let mut side = self.ident(raw)?;
        if like_right && !matches!(side.multi, Multi::Array { .. }) {
          side.sql = format!("('%' || {} || '%')", side.sql);
        }
        Ok(side)
      }
    }
  }

  // ── Identifier resolution ─────────────────────────────────────────────

  fn ident(&mut self, raw: &str) -> Result<Side> {
    let (path, modifier) = match raw.rsplit_once(':') {
      Some((p, m)) => (p, Some(m)),
      None => (raw, None),
    };
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
      return Err(Error::UnknownField(raw.to_string()));
    }

    match segments[0] {
      "@now" if segments.len() == 1 && modifier.is_none() => {
        Ok(Side::scalar(self.param(Value::String(time::format(&time::now())))))
      }
      "@request" => {
        if self.restricted() {
          return Err(Error::Restricted(raw.to_string()));
        }
        self.request_macro(raw, &segments[1..], modifier)
      }
      "@collection" => {
        if self.restricted() {
          return Err(Error::Restricted(raw.to_string()));
        }
        self.collection_macro(raw, &segments[1..], modifier)
      }
      s if s.starts_with('@') => Err(Error::UnknownField(raw.to_string())),
      _ => self.field_path(raw, &segments, modifier),
    }
  }

  fn field_path(&mut self, raw: &str, segments: &[&str], modifier: Option<&str>) -> Result<Side> {
    let base = self.base;
    let start = PathStart { collection: base, alias: quote(&base.name), key: String::new() };
    let walked = self.walk_main(&start, segments, modifier, raw)?;
    if !walked.multi {
      return Ok(Side::scalar(walked.expr));
    }

    let sub_alias = self.next_sub_alias("__mm");
    let mut scope = JoinScope::new(format!("{sub_alias}_"));
    let sub_start = PathStart { collection: base, alias: sub_alias.clone(), key: String::new() };
    let inner = self.walk(&mut scope, &sub_start, segments, modifier, raw)?;
    let sub = format!(
      "SELECT {} AS v FROM {} {sub_alias} {} WHERE {sub_alias}.`id` = {}.`id`",
      inner.expr,
      quote(&base.name),
      scope.to_sql(),
      quote(&base.name),
    );
    Ok(Side { sql: walked.expr, empty: false, multi: Multi::Joined { sub } })
  }

  fn collection_macro(
    &mut self,
    raw: &str,
    segments: &[&str],
    modifier: Option<&str>,
  ) -> Result<Side> {
    let [name, rest @ ..] = segments else {
      return Err(Error::UnknownField(raw.to_string()));
    };
    if rest.is_empty() {
      return Err(Error::UnknownField(raw.to_string()));
    }
    let target = self
      .resolver
      .find(name)
      .ok_or_else(|| Error::UnknownCollection(name.to_string()))?;

    let key = format!("@collection.{}", target.name);
    let table = quote(&target.name);
    let alias = self.joins.join(&key, |_| (table.clone(), None));
    let start = PathStart { collection: &target, alias, key };
    let walked = self.walk_main(&start, rest, modifier, raw)?;

    let sub_alias = self.next_sub_alias("__mm");
    let mut scope = JoinScope::new(format!("{sub_alias}_"));
    let sub_start = PathStart {
      collection: &target,
      alias: sub_alias.clone(),
      key: String::new(),
    };
    let inner = self.walk(&mut scope, &sub_start, rest, modifier, raw)?;
    let sub = format!(
      "SELECT {} AS v FROM {} {sub_alias} {}",
      inner.expr,
      quote(&target.name),
      scope.to_sql(),
    );
    Ok(Side { sql: walked.expr, empty: false, multi: Multi::Joined { sub } })
  }

  fn request_macro(
    &mut self,
    raw: &str,
    segments: &[&str],
    modifier: Option<&str>,
  ) -> Result<Side> {
    let request = self.request;
    match segments {
      ["method"] => {
        let method = request.map(|r| r.method.clone()).unwrap_or_default();
        self.value_side(raw, Some(Value::String(method)), modifier)
      }
      ["query", key] => {
        let value = request.and_then(|r| r.query.get(*key).cloned());
        self.value_side(raw, value, modifier)
      }
      ["headers", key] => {
        let key = RequestInfo::header_key(key);
        let value = request.and_then(|r| r.headers.get(&key).cloned());
        self.value_side(raw, value, modifier)
      }
      ["data", key] => {
        let value = request.and_then(|r| r.data.get(*key).cloned());
        self.value_side(raw, value, modifier)
      }
      ["auth", rest @ ..] if !rest.is_empty() => self.auth_macro(raw, rest, modifier),
      _ => Err(Error::UnknownField(raw.to_string())),
    }
  }

  fn auth_macro(&mut self, raw: &str, path: &[&str], modifier: Option<&str>) -> Result<Side> {
    let record: Option<&Record> = self.request.and_then(RequestInfo::auth_record);
    let Some(record) = record else {
      // Guests and admins have no auth record: every field is NULL.
      return match modifier {
        Some("isset") => Err(Error::InvalidModifier {
          path: raw.to_string(),
          modifier: "isset".into(),
        }),
        _ => Ok(Side::scalar("NULL")),
      };
    };

    if path.len() == 1 {
      if modifier == Some("isset") {
        return Err(Error::InvalidModifier { path: raw.to_string(), modifier: "isset".into() });
      }
      return self.value_side(raw, record.get(path[0]), modifier);
    }

    let auth_collection = self
      .resolver
      .find(&record.collection_id)
      .ok_or_else(|| Error::UnknownCollection(record.collection_id.clone()))?;
    let id_param = self.param(Value::String(record.id.clone()));

    let key = format!("@request.auth.{}", auth_collection.name);
    let table = quote(&auth_collection.name);
    let on_param = id_param.clone();
    let alias = self.joins.join(&key, |a| (table.clone(), Some(format!("{a}.`id` = {on_param}"))));
    let start = PathStart { collection: &auth_collection, alias, key };
    let walked = self.walk_main(&start, path, modifier, raw)?;
    if !walked.multi {
      return Ok(Side::scalar(walked.expr));
    }

    let sub_alias = self.next_sub_alias("__mm");
    let mut scope = JoinScope::new(format!("{sub_alias}_"));
    let sub_start = PathStart {
      collection: &auth_collection,
      alias: sub_alias.clone(),
      key: String::new(),
    };
    let inner = self.walk(&mut scope, &sub_start, path, modifier, raw)?;
    let sub = format!(
      "SELECT {} AS v FROM {} {sub_alias} {} WHERE {sub_alias}.`id` = {id_param}",
      inner.expr,
      quote(&auth_collection.name),
      scope.to_sql(),
    );
    Ok(Side { sql: walked.expr, empty: false, multi: Multi::Joined { sub } })
  }

  /// A request-provided value as an operand.
  fn value_side(&mut self, raw: &str, value: Option<Value>, modifier: Option<&str>) -> Result<Side> {
    match modifier {
      Some("isset") => Ok(Side::scalar(self.param(Value::Bool(value.is_some())))),
      Some("length") => {
        let len = match &value {
          Some(Value::Array(items)) => items.len(),
          None | Some(Value::Null) => 0,
          Some(Value::String(s)) if s.is_empty() => 0,
          Some(_) => 1,
        };
        Ok(Side::scalar(self.param(Value::from(len))))
      }
      Some("each") => {
        let items = match value {
          Some(Value::Array(items)) => items,
          None | Some(Value::Null) => Vec::new(),
          Some(other) => vec![other],
        };
        let p = self.param(Value::String(Value::Array(items).to_string()));
        Ok(Side {
          sql:   p.clone(),
          empty: false,
          multi: Multi::Array { source: format!("json_each({p})") },
        })
      }
      Some("lower") => {
        let p = self.scalar_param(value);
        Ok(Side::scalar(format!("LOWER({p})")))
      }
      Some(other) => Err(Error::InvalidModifier {
        path: raw.to_string(),
        modifier: other.to_string(),
      }),
      None => match value {
        Some(Value::Array(items)) => {
          let p = self.param(Value::String(Value::Array(items).to_string()));
          Ok(Side {
            sql:   p.clone(),
            empty: false,
            multi: Multi::Array { source: format!("json_each({p})") },
          })
        }
        other => Ok(Side::scalar(self.scalar_param(other))),
      },
    }
  }

  fn scalar_param(&mut self, value: Option<Value>) -> String {
    match value {
      None | Some(Value::Null) => "NULL".into(),
      Some(Value::Object(map)) => self.param(Value::String(Value::Object(map).to_string())),
      Some(v) => self.param(v),
    }
  }

  fn walk_main(
    &mut self,
    start: &PathStart<'_>,
    segments: &[&str],
    modifier: Option<&str>,
    raw: &str,
  ) -> Result<Walked> {
    let mut scope = std::mem::take(&mut self.joins);
    let result = self.walk(&mut scope, start, segments, modifier, raw);
    self.joins = scope;
    result
  }

  /// Resolve `segments` starting at `start`, adding joins to `scope`.
  fn walk(
    &self,
    scope: &mut JoinScope,
    start: &PathStart<'_>,
    segments: &[&str],
    modifier: Option<&str>,
    raw: &str,
  ) -> Result<Walked> {
    let unknown = || Error::UnknownField(raw.to_string());
    let Some((last, hops)) = segments.split_last() else {
      return Err(unknown());
    };
    if hops.len() > MAX_PATH_DEPTH {
      return Err(Error::TooDeep(raw.to_string()));
    }

    let mut collection = start.collection.clone();
    let mut alias = start.alias.clone();
    let mut key = start.key.clone();
    let mut multi = false;

    for hop in hops {
      let field = collection.schema.get_by_name(hop).ok_or_else(unknown)?;
      let relation = field.relation().ok_or_else(unknown)?;
      let target = self.find_collection(&relation.collection_id).ok_or_else(unknown)?;

      key = format!("{key}.{hop}");
      let column = format!("{alias}.{}", quote(hop));
      let table = quote(&target.name);
      if field.is_multiple() {
        let each = scope.join(&format!("{key}:each"), |_| (json_each_source(&column), None));
        alias = scope.join(&key, |a| (table, Some(format!("{a}.`id` = {each}.value"))));
        multi = true;
      } else {
        alias = scope.join(&key, |a| (table, Some(format!("{a}.`id` = {column}"))));
      }
      collection = target;
    }

    let column = format!("{alias}.{}", quote(last));
    match *last {
      "id" | "created" | "updated" => {
        return simple_modifier(column, modifier, raw).map(|expr| Walked { expr, multi });
      }
      "collectionId" | "collectionName" => {
        let value = if *last == "collectionId" { &collection.id } else { &collection.name };
        let literal = format!("'{}'", value.replace('\'', "''"));
        return simple_modifier(literal, modifier, raw).map(|expr| Walked { expr, multi });
      }
      _ => {}
    }

    if collection.is_auth() && AUTH_COLUMNS.contains(last) {
      if self.user_input && HIDDEN_AUTH_COLUMNS.contains(last) {
        return Err(unknown());
      }
      return simple_modifier(column, modifier, raw).map(|expr| Walked { expr, multi });
    }

    let field = collection.schema.get_by_name(last).ok_or_else(unknown)?;
    if !field.is_multiple() {
      return simple_modifier(column, modifier, raw).map(|expr| Walked { expr, multi });
    }

    match modifier {
      Some("length") => Ok(Walked { expr: json_length(&column), multi }),
      None | Some("each") | Some("lower") => {
        let each_key = format!("{key}.{last}:each");
        let each = scope.join(&each_key, |_| (json_each_source(&column), None));
        let value = format!("{each}.value");
        let expr = if modifier == Some("lower") { format!("LOWER({value})") } else { value };
        Ok(Walked { expr, multi: true })
      }
      Some(other) => Err(Error::InvalidModifier {
        path: raw.to_string(),
        modifier: other.to_string(),
      }),
    }
  }

  fn find_collection(&self, id: &str) -> Option<Collection> {
    if !self.base.id.is_empty() && self.base.id == id {
      return Some(self.base.clone());
    }
    self.resolver.find(id)
  }

  fn sort_terms(&mut self, sort: &str) -> Result<Vec<String>> {
    let mut terms = Vec::new();
    for part in sort.split(',').map(str::trim).filter(|p| !p.is_empty()) {
      let (dir, field) = match part.as_bytes()[0] {
        b'-' => ("DESC", &part[1..]),
        b'+' => ("ASC", &part[1..]),
        _ => ("ASC", part),
      };
      if field == "@random" {
        terms.push("RANDOM()".to_string());
        continue;
      }
      if field == "@rowid" {
        terms.push(format!("{}._rowid_ {dir}", quote(&self.base.name)));
        continue;
      }
      let side = self.ident(field)?;
      terms.push(format!("{} {dir}", side.sql));
    }
    Ok(terms)
  }
}

/// Apply a single-value modifier to a column expression.
fn simple_modifier(expr: String, modifier: Option<&str>, raw: &str) -> Result<String> {
  match modifier {
    None => Ok(expr),
    Some("lower") => Ok(format!("LOWER({expr})")),
    Some(other) => Err(Error::InvalidModifier {
      path: raw.to_string(),
      modifier: other.to_string(),
    }),
  }
}

fn plain_compare(l: &Side, op: CmpOp, r: &Side) -> String {
  match op {
    CmpOp::Eq | CmpOp::Neq => {
      let eq = op == CmpOp::Eq;
      match (l.empty, r.empty) {
        (true, true) => if eq { "1 = 1" } else { "1 = 0" }.to_string(),
        (true, false) | (false, true) => {
          let other = if l.empty { &r.sql } else { &l.sql };
          if eq {
            format!("({other} = '' OR {other} IS NULL)")
          } else {
            format!("({other} != '' AND {other} IS NOT NULL)")
          }
        }
        (false, false) => {
          let sign = if eq { "=" } else { "!=" };
          format!("COALESCE({}, '') {sign} COALESCE({}, '')", l.sql, r.sql)
        }
      }
    }
    CmpOp::Gt => format!("{} > {}", l.sql, r.sql),
    CmpOp::Gte => format!("{} >= {}", l.sql, r.sql),
    CmpOp::Lt => format!("{} < {}", l.sql, r.sql),
    CmpOp::Lte => format!("{} <= {}", l.sql, r.sql),
    CmpOp::Like => format!("{} LIKE {} ESCAPE '\\'", l.sql, r.sql),
    CmpOp::NotLike => format!("{} NOT LIKE {} ESCAPE '\\'", l.sql, r.sql),
  }
}

/// `abc` → `%abc%` with LIKE wildcards escaped; explicit `%` is kept as is.
fn like_pattern(value: &str) -> String {
  if value.contains('%') {
    return value.to_string();
  }
  let escaped = value.replace('\\', "\\\\").replace('_', "\\_");
  format!("%{escaped}%")
}

// ─── One-shot helpers ────────────────────────────────────────────────────────

/// Compile a single rule against `base`.
pub fn compile(
  base: &Collection,
  resolver: &dyn CollectionResolver,
  request: Option<&RequestInfo>,
  rule: &str,
) -> Result<CompiledFilter> {
  let mut compiler = Compiler::new(base, resolver, request);
  let sql = compiler.rule(rule)?;
  tracing::trace!(collection = %base.name, rule, sql = %sql, "compiled rule");
  Ok(CompiledFilter {
    sql,
    params: compiler.params.clone(),
    joins: compiler.joins.joins.clone(),
  })
}

/// Check that `rule` parses and every path in it resolves against `base`.
pub fn check(base: &Collection, resolver: &dyn CollectionResolver, rule: &str) -> Result<()> {
  compile(base, resolver, None, rule).map(|_| ())
}
