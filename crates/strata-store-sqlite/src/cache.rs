//! In-memory copy of `_collections`.
//!
//! Rebuilt from the table after every committed schema change; never edited
//! in place, so it cannot drift from what is persisted.

use std::{collections::HashMap, sync::LazyLock};

use regex::Regex;
use rusqlite::Connection;
use strata_core::{Collection, Field};
use strata_rules::CollectionResolver;

use crate::{
  Result,
  encode::{COLLECTION_COLUMNS, RawCollection},
  schema::COLLECTIONS_TABLE,
};

#[derive(Debug, Clone, Default)]
pub struct SchemaCache {
  collections: Vec<Collection>,
  by_id:       HashMap<String, usize>,
  /// Keyed by lowercase name.
  by_name:     HashMap<String, usize>,
}

impl SchemaCache {
  pub fn new(collections: Vec<Collection>) -> Self {
    let by_id = collections.iter().enumerate().map(|(i, c)| (c.id.clone(), i)).collect();
    let by_name = collections
      .iter()
      .enumerate()
      .map(|(i, c)| (c.name.to_lowercase(), i))
      .collect();
    Self { collections, by_id, by_name }
  }

  /// Read every collection, oldest first.
  pub fn load(conn: &Connection) -> Result<Self> {
    let mut stmt = conn.prepare(&format!(
      "SELECT {COLLECTION_COLUMNS} FROM `{COLLECTIONS_TABLE}` ORDER BY `created`, rowid"
    ))?;
    let raws = stmt
      .query_map([], RawCollection::from_row)?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    let collections = raws.into_iter().map(RawCollection::decode).collect::<Result<Vec<_>>>()?;
    Ok(Self::new(collections))
  }

  pub fn all(&self) -> &[Collection] { &self.collections }

  pub fn by_id(&self, id: &str) -> Option<&Collection> {
    self.by_id.get(id).map(|&i| &self.collections[i])
  }

  pub fn by_name(&self, name: &str) -> Option<&Collection> {
    self.by_name.get(&name.to_lowercase()).map(|&i| &self.collections[i])
  }

  pub fn get(&self, name_or_id: &str) -> Option<&Collection> {
    self.by_id(name_or_id).or_else(|| self.by_name(name_or_id))
  }

  /// Relation fields of table-backed collections that point at `target_id`.
  pub fn references_to(&self, target_id: &str) -> Vec<(&Collection, &Field)> {
    self
      .collections
      .iter()
      .filter(|c| !c.is_view())
      .flat_map(|c| c.schema.fields().iter().map(move |f| (c, f)))
      .filter(|(_, f)| f.relation().is_some_and(|r| r.collection_id == target_id))
      .collect()
  }

  /// Views whose query mentions the table `name`.
  pub fn dependent_views(&self, name: &str) -> Vec<&Collection> {
    self
      .collections
      .iter()
      .filter(|c| c.view_query().is_some_and(|q| mentions(q, name)))
      .collect()
  }
}

impl CollectionResolver for SchemaCache {
  fn find(&self, name_or_id: &str) -> Option<Collection> { self.get(name_or_id).cloned() }
}

static WORD_CHARS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\w+").expect("static regex"));

/// Whether `query` references `table` as a whole identifier.
pub fn mentions(query: &str, table: &str) -> bool {
  WORD_CHARS.find_iter(query).any(|m| m.as_str().eq_ignore_ascii_case(table))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn mentions_matches_whole_identifiers_only() {
    assert!(mentions("select id from `Posts` p", "posts"));
    assert!(!mentions("select id from posts_archive", "posts"));
  }
}
