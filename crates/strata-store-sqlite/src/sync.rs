//! Table synchronizer: reconcile a collection's table with its schema.
//!
//! [`plan`] diffs two versions of a table-backed collection by field id and
//! returns an ordered list of [`Change`]s; [`apply`] executes them on the
//! caller's transaction. Planning the same collection against itself yields
//! nothing, so re-running a sync is a no-op.

use rusqlite::Connection;
use strata_core::{
  Collection,
  Errors,
  Field,
  FieldType,
  index::IndexDef,
};
use tracing::debug;

use crate::Result;

pub(crate) fn quote(ident: &str) -> String { format!("`{}`", ident.replace('`', "``")) }

// ─── Column storage ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
  Text,
  Number,
  Bool,
  Json,
  /// JSON array of values.
  Multi,
}

impl Storage {
  pub fn of(field: &Field) -> Self {
    if field.is_multiple() {
      return Self::Multi;
    }
    match field.field_type() {
      FieldType::Number => Self::Number,
      FieldType::Bool => Self::Bool,
      FieldType::Json => Self::Json,
      _ => Self::Text,
    }
  }

  pub fn column_def(self) -> &'static str {
    match self {
      Self::Text => "TEXT DEFAULT '' NOT NULL",
      Self::Number => "NUMERIC DEFAULT 0 NOT NULL",
      Self::Bool => "BOOLEAN DEFAULT FALSE NOT NULL",
      Self::Json => "JSON DEFAULT NULL",
      Self::Multi => "JSON DEFAULT '[]' NOT NULL",
    }
  }

  /// The stored form of an empty value. JSON columns have none, so their
  /// uniqueness is only checked on write.
  fn empty_literal(self) -> Option<&'static str> {
    match self {
      Self::Text => Some("''"),
      Self::Number => Some("0"),
      Self::Bool => Some("FALSE"),
      Self::Json => None,
      Self::Multi => Some("'[]'"),
    }
  }
}

const BASE_COLUMNS: &[(&str, &str)] = &[
  ("id", "TEXT PRIMARY KEY NOT NULL"),
  ("created", "TEXT DEFAULT '' NOT NULL"),
  ("updated", "TEXT DEFAULT '' NOT NULL"),
];

const AUTH_COLUMN_DEFS: &[(&str, &str)] = &[
  ("username", "TEXT NOT NULL"),
  ("email", "TEXT DEFAULT '' NOT NULL"),
  ("emailVisibility", "BOOLEAN DEFAULT FALSE NOT NULL"),
  ("verified", "BOOLEAN DEFAULT FALSE NOT NULL"),
  ("tokenKey", "TEXT NOT NULL"),
  ("passwordHash", "TEXT NOT NULL"),
  ("lastResetSentAt", "TEXT DEFAULT '' NOT NULL"),
  ("lastVerificationSentAt", "TEXT DEFAULT '' NOT NULL"),
];

// ─── Plan ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Convert {
  /// Wrap the stored scalar into a one-element array.
  ToMulti,
  /// Keep the first element of the stored array.
  ToSingle,
  /// Incompatible storage: the column is recreated empty.
  Recreate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
  CreateTable { name: String, columns: Vec<(String, String)> },
  DropTable { name: String },
  RenameTable { from: String, to: String },
  DropIndex { name: String },
  AddColumn { table: String, column: String, def: &'static str },
  DropColumn { table: String, column: String },
  RenameColumn { table: String, from: String, to: String },
  ConvertColumn { table: String, column: String, temp: String, def: &'static str, how: Convert },
  /// `position` is the index's position in the collection's `indexes`.
  CreateIndex { position: Option<usize>, sql: String },
  /// `field` is the field's position in the schema.
  CreateUniqueIndex { field: usize, sql: String },
}

impl Change {
  pub fn statements(&self) -> Vec<String> {
    match self {
      Self::CreateTable { name, columns } => {
        let cols = columns
          .iter()
          .map(|(c, def)| format!("{} {def}", quote(c)))
          .collect::<Vec<_>>()
          .join(", ");
        vec![format!("CREATE TABLE {} ({cols})", quote(name))]
      }
      Self::DropTable { name } => vec![format!("DROP TABLE IF EXISTS {}", quote(name))],
      Self::RenameTable { from, to } => {
        vec![format!("ALTER TABLE {} RENAME TO {}", quote(from), quote(to))]
      }
      Self::DropIndex { name } => vec![format!("DROP INDEX IF EXISTS {}", quote(name))],
      Self::AddColumn { table, column, def } => {
        vec![format!("ALTER TABLE {} ADD COLUMN {} {def}", quote(table), quote(column))]
      }
      Self::DropColumn { table, column } => {
        vec![format!("ALTER TABLE {} DROP COLUMN {}", quote(table), quote(column))]
      }
      Self::RenameColumn { table, from, to } => vec![format!(
        "ALTER TABLE {} RENAME COLUMN {} TO {}",
        quote(table),
        quote(from),
        quote(to)
      )],
      Self::ConvertColumn { table, column, temp, def, how } => {
        let (t, c, tmp) = (quote(table), quote(column), quote(temp));
        let mut stmts = vec![format!("ALTER TABLE {t} ADD COLUMN {tmp} {def}")];
        match how {
          Convert::ToMulti => stmts.push(format!(
            "UPDATE {t} SET {tmp} = CASE WHEN {c} IS NULL OR {c} = '' THEN '[]' \
             WHEN json_valid({c}) AND json_type({c}) = 'array' THEN {c} \
             ELSE json_array({c}) END"
          )),
          Convert::ToSingle => stmts.push(format!(
            "UPDATE {t} SET {tmp} = COALESCE(CASE WHEN json_valid({c}) AND json_type({c}) = 'array' \
             THEN json_extract({c}, '$[0]') ELSE {c} END, '')"
          )),
          Convert::Recreate => {}
        }
        stmts.push(format!("ALTER TABLE {t} DROP COLUMN {c}"));
        stmts.push(format!("ALTER TABLE {t} RENAME COLUMN {tmp} TO {c}"));
        stmts
      }
      Self::CreateIndex { sql, .. } | Self::CreateUniqueIndex { sql, .. } => vec![sql.clone()],
    }
  }
}

/// Column definitions of a fresh table for `collection`.
pub fn table_columns(collection: &Collection) -> Vec<(String, String)> {
  let mut columns: Vec<(String, String)> =
    BASE_COLUMNS.iter().map(|(c, d)| (c.to_string(), d.to_string())).collect();
  if collection.is_auth() {
    columns.extend(AUTH_COLUMN_DEFS.iter().map(|(c, d)| (c.to_string(), d.to_string())));
  }
  for field in collection.schema.fields() {
    columns.push((field.name.clone(), Storage::of(field).column_def().to_string()));
  }
  columns
}

/// Unique indexes every auth table carries; named after the collection id
/// so they survive renames.
pub fn auth_indexes(collection: &Collection) -> Vec<String> {
  let (id, table) = (&collection.id, quote(&collection.name));
  vec![
    format!("CREATE UNIQUE INDEX {} ON {table} (`username`)", quote(&format!("_{id}_username_idx"))),
    format!(
      "CREATE UNIQUE INDEX {} ON {table} (`email`) WHERE `email` != ''",
      quote(&format!("_{id}_email_idx"))
    ),
    format!("CREATE UNIQUE INDEX {} ON {table} (`tokenKey`)", quote(&format!("_{id}_tokenKey_idx"))),
  ]
}

fn unique_index_name(collection: &Collection, field: &Field) -> String {
  format!("_{}_{}_unique", collection.id, field.id)
}

/// Unique index backing a `unique` field. Empty values may repeat.
fn unique_index(collection: &Collection, position: usize, field: &Field) -> Option<Change> {
  if !field.unique {
    return None;
  }
  let empty = Storage::of(field).empty_literal()?;
  let column = quote(&field.name);
  Some(Change::CreateUniqueIndex {
    field: position,
    sql:   format!(
      "CREATE UNIQUE INDEX {} ON {} ({column}) WHERE {column} != {empty}",
      quote(&unique_index_name(collection, field)),
      quote(&collection.name)
    ),
  })
}

fn user_indexes(collection: &Collection) -> Vec<Change> {
  collection
    .indexes
    .iter()
    .enumerate()
    .filter_map(|(i, raw)| {
      IndexDef::parse(raw)
        .ok()
        .map(|def| Change::CreateIndex { position: Some(i), sql: def.build_for(&collection.name) })
    })
    .collect()
}

/// Changes turning the table of `old` into the table of `new`. Views are
/// handled by [`crate::view`].
pub fn plan(old: Option<&Collection>, new: Option<&Collection>) -> Vec<Change> {
  match (old, new) {
    (None, None) => Vec::new(),
    (Some(old), None) => vec![Change::DropTable { name: old.name.clone() }],
    (None, Some(new)) => {
      let mut changes =
        vec![Change::CreateTable { name: new.name.clone(), columns: table_columns(new) }];
      if new.is_auth() {
        changes.extend(
          auth_indexes(new).into_iter().map(|sql| Change::CreateIndex { position: None, sql }),
        );
      }
      for (i, field) in new.schema.fields().iter().enumerate() {
        changes.extend(unique_index(new, i, field));
      }
      changes.extend(user_indexes(new));
      changes
    }
    (Some(old), Some(new)) => plan_update(old, new),
  }
}

/// Whether the unique index of `field` must be rebuilt between versions.
fn unique_changed(before: Option<&Field>, after: Option<&Field>) -> bool {
  match (before, after) {
    (Some(b), Some(a)) => {
      b.unique != a.unique || b.name != a.name || Storage::of(b) != Storage::of(a)
    }
    (Some(b), None) => b.unique,
    (None, Some(a)) => a.unique,
    (None, None) => false,
  }
}

fn plan_update(old: &Collection, new: &Collection) -> Vec<Change> {
  let table = new.name.clone();
  let mut columns = Vec::new();

  // Unique indexes block column drops, so stale ones go first.
  let mut uniques = Vec::new();
  for field in old.schema.fields() {
    if field.unique && unique_changed(Some(field), new.schema.get_by_id(&field.id)) {
      uniques.push(Change::DropIndex { name: unique_index_name(old, field) });
    }
  }

  // Drops.
  for field in old.schema.fields() {
    if new.schema.get_by_id(&field.id).is_none() {
      columns.push(Change::DropColumn { table: table.clone(), column: field.name.clone() });
    }
  }

  // Renames, in two phases so that swapped names never collide.
  let renamed: Vec<(&Field, &Field)> = new
    .schema
    .fields()
    .iter()
    .filter_map(|f| old.schema.get_by_id(&f.id).map(|o| (o, f)))
    .filter(|(o, f)| o.name != f.name)
    .collect();
  for (o, _) in &renamed {
    columns.push(Change::RenameColumn {
      table: table.clone(),
      from:  o.name.clone(),
      to:    temp_name(o),
    });
  }
  for (o, f) in &renamed {
    columns.push(Change::RenameColumn {
      table: table.clone(),
      from:  temp_name(o),
      to:    f.name.clone(),
    });
  }

  // Additions and storage conversions.
  for field in new.schema.fields() {
    let storage = Storage::of(field);
    match old.schema.get_by_id(&field.id) {
      None => columns.push(Change::AddColumn {
        table:  table.clone(),
        column: field.name.clone(),
        def:    storage.column_def(),
      }),
      Some(previous) => {
        let before = Storage::of(previous);
        if before == storage {
          continue;
        }
        let how = match (before, storage) {
          (_, Storage::Multi) if before != Storage::Json => Convert::ToMulti,
          (Storage::Multi, Storage::Text) => Convert::ToSingle,
          _ => Convert::Recreate,
        };
        columns.push(Change::ConvertColumn {
          table: table.clone(),
          column: field.name.clone(),
          temp: temp_name(field),
          def: storage.column_def(),
          how,
        });
      }
    }
  }

  let recreate_indexes =
    !columns.is_empty() || old.indexes != new.indexes || old.name != new.name;
  let mut changes = uniques;
  if recreate_indexes {
    for def in old.index_defs() {
      changes.push(Change::DropIndex { name: def.name });
    }
  }
  if old.name != new.name {
    changes.push(Change::RenameTable { from: old.name.clone(), to: new.name.clone() });
  }
  changes.extend(columns);
  for (i, field) in new.schema.fields().iter().enumerate() {
    if unique_changed(old.schema.get_by_id(&field.id), Some(field)) {
      changes.extend(unique_index(new, i, field));
    }
  }
  if recreate_indexes {
    changes.extend(user_indexes(new));
  }
  changes
}

fn temp_name(field: &Field) -> String { format!("_tmp_{}", field.id) }

// ─── Apply ───────────────────────────────────────────────────────────────────

/// Execute `changes` in order. Index statements that fail are collected as
/// `indexes.{position}` (or `schema.{field}.unique`) validation errors after
/// every other change ran; the caller's transaction must then be rolled back.
pub fn apply(conn: &Connection, changes: &[Change]) -> Result<()> {
  let mut index_errors = Errors::new();
  let mut schema_errors = Errors::new();
  for change in changes {
    for sql in change.statements() {
      debug!(sql = %sql, "sync");
      match (change, conn.execute_batch(&sql)) {
        (_, Ok(())) => {}
        (Change::CreateIndex { position: Some(i), .. }, Err(e)) => index_errors.add(
          i.to_string(),
          "validation_invalid_index_expression",
          format!("Failed to create index: {e}"),
        ),
        (Change::CreateUniqueIndex { field, .. }, Err(e)) => {
          let mut unique = Errors::new();
          unique.add(
            "unique",
            "validation_not_unique",
            format!("Existing values are not unique: {e}"),
          );
          schema_errors.nest(field.to_string(), unique);
        }
        (_, Err(e)) => return Err(e.into()),
      }
    }
  }
  if index_errors.is_empty() && schema_errors.is_empty() {
    return Ok(());
  }
  let mut errors = Errors::new();
  errors.nest("indexes", index_errors);
  errors.nest("schema", schema_errors);
  Err(errors.into())
}

#[cfg(test)]
mod tests {
  use strata_core::{
    CollectionType,
    FieldOptions,
    field::{RelationOptions, SelectOptions},
  };

  use super::*;

  fn demo() -> Collection {
    let mut c = Collection::new("demo", CollectionType::Base);
    c.id = "demo00000000001".into();
    c.schema.add_field(Field::new("title", FieldType::Text).with_id("f_title"));
    c.schema.add_field(Field::new("count", FieldType::Number).with_id("f_count"));
    c.indexes.push("CREATE INDEX idx_title ON demo (title)".into());
    c
  }

  fn select(max: usize) -> FieldOptions {
    FieldOptions::Select(SelectOptions { max_select: max, values: vec!["a".into(), "b".into()] })
  }

  #[test]
  fn create_table_columns_follow_storage() {
    let changes = plan(None, Some(&demo()));
    assert_eq!(
      changes[0].statements(),
      vec![
        "CREATE TABLE `demo` (`id` TEXT PRIMARY KEY NOT NULL, `created` TEXT DEFAULT '' NOT NULL, \
         `updated` TEXT DEFAULT '' NOT NULL, `title` TEXT DEFAULT '' NOT NULL, \
         `count` NUMERIC DEFAULT 0 NOT NULL)"
      ]
    );
    assert_eq!(
      changes[1],
      Change::CreateIndex {
        position: Some(0),
        sql:      "CREATE INDEX `idx_title` ON `demo` (`title`)".into(),
      }
    );
  }

  #[test]
  fn planning_a_collection_against_itself_is_empty() {
    let c = demo();
    assert!(plan(Some(&c), Some(&c)).is_empty());
  }

  #[test]
  fn renames_go_through_temporary_names() {
    let old = demo();
    let mut new = old.clone();
    new.schema.fields_mut()[0].name = "count".into();
    new.schema.fields_mut()[1].name = "title".into();
    new.indexes.clear();

    let sql: Vec<String> = plan(Some(&old), Some(&new)).iter().flat_map(Change::statements).collect();
    assert_eq!(
      sql,
      vec![
        "DROP INDEX IF EXISTS `idx_title`",
        "ALTER TABLE `demo` RENAME COLUMN `title` TO `_tmp_f_title`",
        "ALTER TABLE `demo` RENAME COLUMN `count` TO `_tmp_f_count`",
        "ALTER TABLE `demo` RENAME COLUMN `_tmp_f_title` TO `count`",
        "ALTER TABLE `demo` RENAME COLUMN `_tmp_f_count` TO `title`",
      ]
    );
  }

  #[test]
  fn single_to_multi_converts_data() {
    let mut old = demo();
    old.schema.add_field(Field::new("tags", FieldType::Select).with_id("f_tags").with_options(select(1)));
    old.indexes.clear();
    let mut new = old.clone();
    new.schema.fields_mut()[2].options = select(2);

    let changes = plan(Some(&old), Some(&new));
    assert_eq!(changes.len(), 1);
    assert!(matches!(
      &changes[0],
      Change::ConvertColumn { how: Convert::ToMulti, column, .. } if column == "tags"
    ));
  }

  #[test]
  fn relation_max_select_change_converts_back() {
    let rel = |max| {
      FieldOptions::Relation(RelationOptions {
        collection_id: "other".into(),
        max_select: max,
        ..Default::default()
      })
    };
    let mut old = demo();
    old.indexes.clear();
    old.schema.add_field(Field::new("owner", FieldType::Relation).with_id("f_owner").with_options(rel(None)));
    let mut new = old.clone();
    new.schema.fields_mut()[2].options = rel(Some(1));

    let changes = plan(Some(&old), Some(&new));
    assert!(matches!(&changes[0], Change::ConvertColumn { how: Convert::ToSingle, .. }));
  }

  #[test]
  fn table_rename_recreates_indexes_on_the_new_name() {
    let old = demo();
    let mut new = old.clone();
    new.name = "renamed".into();

    let sql: Vec<String> = plan(Some(&old), Some(&new)).iter().flat_map(Change::statements).collect();
    assert_eq!(
      sql,
      vec![
        "DROP INDEX IF EXISTS `idx_title`",
        "ALTER TABLE `demo` RENAME TO `renamed`",
        "CREATE INDEX `idx_title` ON `renamed` (`title`)",
      ]
    );
  }

  #[test]
  fn unique_fields_get_partial_unique_indexes() {
    let mut c = demo();
    c.indexes.clear();
    c.schema.fields_mut()[0].unique = true;
    let sql: Vec<String> = plan(None, Some(&c)).iter().flat_map(Change::statements).collect();
    assert_eq!(
      sql[1],
      "CREATE UNIQUE INDEX `_demo00000000001_f_title_unique` ON `demo` (`title`) WHERE `title` != ''"
    );

    let mut renamed = c.clone();
    renamed.schema.fields_mut()[0].name = "heading".into();
    let sql: Vec<String> =
      plan(Some(&c), Some(&renamed)).iter().flat_map(Change::statements).collect();
    assert_eq!(sql.first().map(String::as_str), Some("DROP INDEX IF EXISTS `_demo00000000001_f_title_unique`"));
    assert_eq!(
      sql.last().map(String::as_str),
      Some(
        "CREATE UNIQUE INDEX `_demo00000000001_f_title_unique` ON `demo` (`heading`) WHERE `heading` != ''"
      )
    );

    let mut plain = c.clone();
    plain.schema.fields_mut()[0].unique = false;
    let sql: Vec<String> = plan(Some(&c), Some(&plain)).iter().flat_map(Change::statements).collect();
    assert_eq!(sql, vec!["DROP INDEX IF EXISTS `_demo00000000001_f_title_unique`"]);
  }

  #[test]
  fn unique_index_on_duplicate_data_is_a_field_error() {
    let conn = Connection::open_in_memory().unwrap();
    let mut c = demo();
    c.indexes.clear();
    apply(&conn, &plan(None, Some(&c))).unwrap();
    conn
      .execute_batch("INSERT INTO demo (id, title) VALUES ('a', 'x'), ('b', 'x'), ('c', ''), ('d', '')")
      .unwrap();

    let mut unique = c.clone();
    unique.schema.fields_mut()[0].unique = true;
    let err = apply(&conn, &plan(Some(&c), Some(&unique))).unwrap_err();
    let errors = strata_core::Classify::validation_errors(&err).unwrap();
    assert_eq!(errors.code_at("schema.0.unique"), Some("validation_not_unique"));

    conn.execute_batch("UPDATE demo SET title = 'y' WHERE id = 'b'").unwrap();
    apply(&conn, &plan(Some(&c), Some(&unique))).unwrap();
  }

  #[test]
  fn failing_indexes_are_reported_by_position() {
    let conn = Connection::open_in_memory().unwrap();
    let mut c = demo();
    c.indexes = vec![
      "CREATE INDEX idx_ok ON demo (title)".into(),
      "CREATE INDEX idx_bad ON demo (missing)".into(),
    ];
    let err = apply(&conn, &plan(None, Some(&c))).unwrap_err();
    let errors = strata_core::Classify::validation_errors(&err).unwrap();
    assert_eq!(errors.code_at("indexes.1"), Some("validation_invalid_index_expression"));
    assert!(errors.code_at("indexes.0").is_none());
  }
}
