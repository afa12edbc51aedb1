//! Records: rows of a collection's table.

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer, ser::SerializeMap};
use serde_json::{Map, Value};

use crate::{collection::Collection, time};

/// Auth columns that never leave the server.
pub const HIDDEN_AUTH_COLUMNS: &[&str] = &["tokenKey", "passwordHash"];

/// Every auth collection carries these columns in addition to its schema.
pub const AUTH_COLUMNS: &[&str] = &[
  "username",
  "email",
  "emailVisibility",
  "verified",
  "tokenKey",
  "passwordHash",
  "lastResetSentAt",
  "lastVerificationSentAt",
];

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
  pub id:              String,
  pub collection_id:   String,
  pub collection_name: String,
  pub created:         DateTime<Utc>,
  pub updated:         DateTime<Utc>,
  /// Schema field values (and auth columns) keyed by column name.
  pub data:            Map<String, Value>,
  /// Expanded relations keyed by field name.
  pub expand:          Map<String, Value>,
}

impl Record {
  /// A fresh, unsaved record of `collection`.
  pub fn new(collection: &Collection) -> Self {
    let now = time::now();
    Self {
      id:              String::new(),
      collection_id:   collection.id.clone(),
      collection_name: collection.name.clone(),
      created:         now,
      updated:         now,
      data:            Map::new(),
      expand:          Map::new(),
    }
  }

  pub fn get(&self, key: &str) -> Option<Value> {
    match key {
      "id" => Some(Value::String(self.id.clone())),
      "collectionId" => Some(Value::String(self.collection_id.clone())),
      "collectionName" => Some(Value::String(self.collection_name.clone())),
      "created" => Some(Value::String(time::format(&self.created))),
      "updated" => Some(Value::String(time::format(&self.updated))),
      _ => self.data.get(key).cloned(),
    }
  }

  pub fn set(&mut self, key: impl Into<String>, value: Value) {
    self.data.insert(key.into(), value);
  }

  pub fn get_str(&self, key: &str) -> Option<&str> {
    self.data.get(key).and_then(Value::as_str)
  }

  /// Values of a (possibly multi-valued) relation/select/file column.
  pub fn get_string_list(&self, key: &str) -> Vec<String> {
    match self.data.get(key) {
      Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
      Some(Value::Array(items)) => items
        .iter()
        .filter_map(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect(),
      _ => Vec::new(),
    }
  }
}

impl Serialize for Record {
  fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
    let mut map = s.serialize_map(None)?;
    map.serialize_entry("collectionId", &self.collection_id)?;
    map.serialize_entry("collectionName", &self.collection_name)?;
    map.serialize_entry("created", &time::format(&self.created))?;
    map.serialize_entry("id", &self.id)?;
    map.serialize_entry("updated", &time::format(&self.updated))?;
    for (key, value) in &self.data {
      if HIDDEN_AUTH_COLUMNS.contains(&key.as_str()) {
        continue;
      }
      map.serialize_entry(key, value)?;
    }
    if !self.expand.is_empty() {
      map.serialize_entry("expand", &self.expand)?;
    }
    map.end()
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;
  use crate::collection::CollectionType;

  #[test]
  fn hidden_columns_are_not_serialized() {
    let mut c = Collection::new("users", CollectionType::Auth);
    c.id = "_pb_users_auth_".into();
    let mut r = Record::new(&c);
    r.id = "4q1xlclmfloku33".into();
    r.set("email", json!("test@example.com"));
    r.set("tokenKey", json!("secret"));
    r.set("passwordHash", json!("$argon2id$..."));

    let value = serde_json::to_value(&r).unwrap();
    assert_eq!(value["collectionName"], "users");
    assert_eq!(value["email"], "test@example.com");
    assert!(value.get("tokenKey").is_none());
    assert!(value.get("passwordHash").is_none());
    assert!(value.get("expand").is_none());
  }

  #[test]
  fn string_lists_accept_scalars_and_arrays() {
    let c = Collection::new("demo", CollectionType::Base);
    let mut r = Record::new(&c);
    r.set("single", json!("a"));
    r.set("multi", json!(["a", "", "b"]));
    r.set("empty", json!(""));
    assert_eq!(r.get_string_list("single"), vec!["a"]);
    assert_eq!(r.get_string_list("multi"), vec!["a", "b"]);
    assert!(r.get_string_list("empty").is_empty());
    assert!(r.get_string_list("missing").is_empty());
  }
}
