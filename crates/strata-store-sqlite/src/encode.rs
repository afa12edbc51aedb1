//! Conversions between domain types and SQLite rows/values.
//!
//! Collections are persisted one row per collection in `_collections`, with
//! `schema`, `indexes` and `options` as compact JSON. Record rows map column
//! by column; the owning collection's schema decides how each cell decodes.

use rusqlite::{Row, types::ValueRef};
use serde_json::{Map, Value, json};
use strata_core::{Collection, FieldType, Record, time};

use crate::{Error, Result};

// ─── Collection rows ─────────────────────────────────────────────────────────

pub const COLLECTION_COLUMNS: &str = "`id`, `system`, `type`, `name`, `schema`, `indexes`, \
   `listRule`, `viewRule`, `createRule`, `updateRule`, `deleteRule`, `options`, `created`, `updated`";

/// A `_collections` row as stored.
pub struct RawCollection {
  pub id:          String,
  pub system:      bool,
  pub kind:        String,
  pub name:        String,
  pub schema:      String,
  pub indexes:     String,
  pub list_rule:   Option<String>,
  pub view_rule:   Option<String>,
  pub create_rule: Option<String>,
  pub update_rule: Option<String>,
  pub delete_rule: Option<String>,
  pub options:     String,
  pub created:     String,
  pub updated:     String,
}

impl RawCollection {
  /// Read a row selected with [`COLLECTION_COLUMNS`].
  pub fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id:          r.get(0)?,
      system:      r.get(1)?,
      kind:        r.get(2)?,
      name:        r.get(3)?,
      schema:      r.get(4)?,
      indexes:     r.get(5)?,
      list_rule:   r.get(6)?,
      view_rule:   r.get(7)?,
      create_rule: r.get(8)?,
      update_rule: r.get(9)?,
      delete_rule: r.get(10)?,
      options:     r.get(11)?,
      created:     r.get(12)?,
      updated:     r.get(13)?,
    })
  }

  pub fn encode(c: &Collection) -> Result<Self> {
    let options = match serde_json::to_value(c)? {
      Value::Object(mut map) => map.remove("options").unwrap_or(Value::Null),
      _ => Value::Null,
    };
    Ok(Self {
      id:          c.id.clone(),
      system:      c.system,
      kind:        c.kind().as_ref().to_string(),
      name:        c.name.clone(),
      schema:      serde_json::to_string(&c.schema)?,
      indexes:     serde_json::to_string(&c.indexes)?,
      list_rule:   c.list_rule.clone(),
      view_rule:   c.view_rule.clone(),
      create_rule: c.create_rule.clone(),
      update_rule: c.update_rule.clone(),
      delete_rule: c.delete_rule.clone(),
      options:     options.to_string(),
      created:     time::format(&c.created),
      updated:     time::format(&c.updated),
    })
  }

  pub fn decode(self) -> Result<Collection> {
    let value = json!({
      "id":         self.id,
      "system":     self.system,
      "type":       self.kind,
      "name":       self.name,
      "schema":     serde_json::from_str::<Value>(&self.schema)?,
      "indexes":    serde_json::from_str::<Value>(&self.indexes)?,
      "listRule":   self.list_rule,
      "viewRule":   self.view_rule,
      "createRule": self.create_rule,
      "updateRule": self.update_rule,
      "deleteRule": self.delete_rule,
      "options":    serde_json::from_str::<Value>(&self.options)?,
      "created":    self.created,
      "updated":    self.updated,
    });
    Ok(serde_json::from_value(value)?)
  }

  pub fn params(&self) -> [&dyn rusqlite::ToSql; 14] {
    [
      &self.id,
      &self.system,
      &self.kind,
      &self.name,
      &self.schema,
      &self.indexes,
      &self.list_rule,
      &self.view_rule,
      &self.create_rule,
      &self.update_rule,
      &self.delete_rule,
      &self.options,
      &self.created,
      &self.updated,
    ]
  }
}

// ─── Values ──────────────────────────────────────────────────────────────────

/// Bindable form of a JSON value. Booleans bind as integers and containers
/// as their JSON text.
pub fn to_sql(value: &Value) -> rusqlite::types::Value {
  use rusqlite::types::Value as Sql;
  match value {
    Value::Null => Sql::Null,
    Value::Bool(b) => Sql::Integer(i64::from(*b)),
    Value::Number(n) => match n.as_i64() {
      Some(i) => Sql::Integer(i),
      None => Sql::Real(n.as_f64().unwrap_or_default()),
    },
    Value::String(s) => Sql::Text(s.clone()),
    other => Sql::Text(other.to_string()),
  }
}

/// Named parameters in the shape `rusqlite` accepts.
pub fn named_params(
  params: &std::collections::BTreeMap<String, Value>,
) -> Vec<(String, rusqlite::types::Value)> {
  params.iter().map(|(k, v)| (k.clone(), to_sql(v))).collect()
}

pub fn number(f: f64) -> Value {
  if f.fract() == 0.0 && f.abs() < 9.0e15 {
    Value::from(f as i64)
  } else {
    serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
  }
}

fn raw_value(cell: ValueRef<'_>) -> Value {
  match cell {
    ValueRef::Null => Value::Null,
    ValueRef::Integer(i) => Value::from(i),
    ValueRef::Real(f) => number(f),
    ValueRef::Text(t) | ValueRef::Blob(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
  }
}

fn as_text(v: &Value) -> String {
  match v {
    Value::Null => String::new(),
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

fn as_bool(v: &Value) -> bool {
  match v {
    Value::Bool(b) => *b,
    Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
    Value::String(s) => matches!(s.as_str(), "1" | "true" | "TRUE"),
    _ => false,
  }
}

fn as_json(v: Value) -> Value {
  match v {
    Value::String(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
    other => other,
  }
}

fn as_list(v: Value) -> Value {
  match as_json(v) {
    Value::Array(items) => Value::Array(items),
    Value::Null => Value::Array(Vec::new()),
    Value::String(s) if s.is_empty() => Value::Array(Vec::new()),
    other => Value::Array(vec![other]),
  }
}

/// Decode one stored cell of `column` in `collection`.
fn decode_cell(collection: &Collection, column: &str, raw: Value) -> Value {
  if let Some(field) = collection.schema.get_by_name(column) {
    if field.is_multiple() {
      return as_list(raw);
    }
    return match field.field_type() {
      FieldType::Number => match raw {
        Value::Number(n) => number(n.as_f64().unwrap_or_default()),
        Value::String(s) => s.parse::<f64>().map(number).unwrap_or(Value::from(0)),
        _ => Value::from(0),
      },
      FieldType::Bool => Value::Bool(as_bool(&raw)),
      FieldType::Json => as_json(raw),
      _ => Value::String(as_text(&raw)),
    };
  }
  match column {
    "emailVisibility" | "verified" if collection.is_auth() => Value::Bool(as_bool(&raw)),
    _ => raw,
  }
}

/// Decode a full record row. Unknown columns are kept as stored.
pub fn decode_record(collection: &Collection, row: &Row<'_>) -> Result<Record> {
  let mut record = Record::new(collection);
  let stmt = row.as_ref();
  let mut data = Map::new();
  for (i, name) in stmt.column_names().into_iter().enumerate() {
    let raw = raw_value(row.get_ref(i)?);
    match name {
      "id" => record.id = as_text(&raw),
      "created" | "updated" => {
        let text = as_text(&raw);
        let parsed = time::parse(&text)
          .ok_or_else(|| Error::DateParse(format!("{name} = {text:?}")));
        // Views may project these from arbitrary expressions.
        if collection.is_view() && parsed.is_err() {
          continue;
        }
        let parsed = parsed?;
        if name == "created" {
          record.created = parsed;
        } else {
          record.updated = parsed;
        }
      }
      _ => {
        data.insert(name.to_string(), decode_cell(collection, name, raw));
      }
    }
  }
  record.data = data;
  Ok(record)
}
