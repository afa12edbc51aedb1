//! `CREATE INDEX` statements attached to a collection.
//!
//! Collections store their indexes as raw SQL strings. The table name inside
//! a stored statement is irrelevant: it is always rewritten to the owning
//! collection's current name before execution.

use std::sync::LazyLock;

use regex::Regex;

static INDEX_RE: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(
    r"(?is)^\s*create\s+(unique\s+)?index\s+(if\s+not\s+exists\s+)?([`'\x22\[]?[\w.]+[`'\x22\]]?)\s+on\s+([`'\x22\[]?[\w.]+[`'\x22\]]?)\s*\((.+?)\)\s*(?:where\s+(.+?))?\s*;?\s*$",
  )
  .expect("static regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidIndex(pub String);

impl std::fmt::Display for InvalidIndex {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "invalid index expression: {}", self.0)
  }
}

impl std::error::Error for InvalidIndex {}

/// One indexed column (or expression) with its optional collation/order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexColumn {
  pub name:    String,
  pub collate: Option<String>,
  pub sort:    Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
  pub unique:        bool,
  pub if_not_exists: bool,
  pub name:          String,
  pub table:         String,
  pub columns:       Vec<IndexColumn>,
  pub where_clause:  Option<String>,
}

impl IndexDef {
  pub fn parse(raw: &str) -> Result<Self, InvalidIndex> {
    let caps = INDEX_RE
      .captures(raw)
      .ok_or_else(|| InvalidIndex(raw.to_string()))?;

    let columns = split_top_level(&caps[5])
      .into_iter()
      .map(|c| parse_column(&c))
      .collect::<Vec<_>>();
    if columns.is_empty() || columns.iter().any(|c| c.name.is_empty()) {
      return Err(InvalidIndex(raw.to_string()));
    }

    let name = unquote(&caps[3]);
    if name.is_empty() {
      return Err(InvalidIndex(raw.to_string()));
    }

    Ok(IndexDef {
      unique: caps.get(1).is_some(),
      if_not_exists: caps.get(2).is_some(),
      name,
      table: unquote(&caps[4]),
      columns,
      where_clause: caps
        .get(6)
        .map(|m| m.as_str().trim().to_string())
        .filter(|w| !w.is_empty()),
    })
  }

  /// Render the statement against `table`.
  pub fn build_for(&self, table: &str) -> String {
    let mut sql = String::from("CREATE ");
    if self.unique {
      sql.push_str("UNIQUE ");
    }
    sql.push_str("INDEX ");
    if self.if_not_exists {
      sql.push_str("IF NOT EXISTS ");
    }
    sql.push_str(&format!("`{}` ON `{}` (", self.name, table));
    let cols = self
      .columns
      .iter()
      .map(|c| {
        let mut out = if is_identifier(&c.name) {
          format!("`{}`", c.name)
        } else {
          c.name.clone()
        };
        if let Some(collate) = &c.collate {
          out.push_str(&format!(" COLLATE {collate}"));
        }
        if let Some(sort) = &c.sort {
          out.push(' ');
          out.push_str(sort);
        }
        out
      })
      .collect::<Vec<_>>()
      .join(", ");
    sql.push_str(&cols);
    sql.push(')');
    if let Some(w) = &self.where_clause {
      sql.push_str(" WHERE ");
      sql.push_str(w);
    }
    sql
  }

  pub fn build(&self) -> String { self.build_for(&self.table) }

  /// Whether `column` is one of the plain indexed columns.
  pub fn has_column(&self, column: &str) -> bool {
    self.columns.iter().any(|c| c.name.eq_ignore_ascii_case(column))
  }
}

fn is_identifier(s: &str) -> bool {
  !s.is_empty() && s.chars().all(|c| c.is_alphanumeric() || c == '_')
}

fn unquote(s: &str) -> String {
  s.trim()
    .trim_matches(|c| matches!(c, '`' | '"' | '\'' | '[' | ']'))
    .to_string()
}

/// Split on commas that are not inside parentheses.
fn split_top_level(s: &str) -> Vec<String> {
  let mut parts = Vec::new();
  let mut depth = 0i32;
  let mut current = String::new();
  for ch in s.chars() {
    match ch {
      '(' => {
        depth += 1;
        current.push(ch);
      }
      ')' => {
        depth -= 1;
        current.push(ch);
      }
      ',' if depth == 0 => parts.push(std::mem::take(&mut current)),
      _ => current.push(ch),
    }
  }
  parts.push(current);
  parts
    .into_iter()
    .map(|p| p.trim().to_string())
    .filter(|p| !p.is_empty())
    .collect()
}

fn parse_column(raw: &str) -> IndexColumn {
  let mut rest = raw.trim().to_string();
  let mut sort = None;
  let upper = rest.to_ascii_uppercase();
  for dir in ["ASC", "DESC"] {
    if upper.ends_with(&format!(" {dir}")) {
      sort = Some(dir.to_string());
      rest.truncate(rest.len() - dir.len() - 1);
      break;
    }
  }

  let mut collate = None;
  let upper = rest.to_ascii_uppercase();
  if let Some(pos) = upper.rfind(" COLLATE ") {
    collate = Some(rest[pos + 9..].trim().to_string());
    rest.truncate(pos);
  }

  IndexColumn { name: unquote(&rest), collate, sort }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_and_rewrites_table() {
    let def = IndexDef::parse("create unique index idx_test on anything (id, test)").unwrap();
    assert!(def.unique);
    assert_eq!(def.name, "idx_test");
    assert_eq!(def.table, "anything");
    assert_eq!(
      def.build_for("demo"),
      "CREATE UNIQUE INDEX `idx_test` ON `demo` (`id`, `test`)"
    );
  }

  #[test]
  fn keeps_expressions_collation_order_and_where() {
    let def = IndexDef::parse(
      "CREATE INDEX IF NOT EXISTS `idx_x` ON `t` (lower(name) COLLATE NOCASE DESC, `b`) WHERE b != ''",
    )
    .unwrap();
    assert!(def.if_not_exists);
    assert_eq!(def.columns[0].name, "lower(name)");
    assert_eq!(def.columns[0].collate.as_deref(), Some("NOCASE"));
    assert_eq!(def.columns[0].sort.as_deref(), Some("DESC"));
    assert_eq!(def.where_clause.as_deref(), Some("b != ''"));
    assert_eq!(
      def.build(),
      "CREATE INDEX IF NOT EXISTS `idx_x` ON `t` (lower(name) COLLATE NOCASE DESC, `b`) WHERE b != ''"
    );
  }

  #[test]
  fn rejects_garbage() {
    assert!(IndexDef::parse("create index on t (a)").is_err());
    assert!(IndexDef::parse("create index idx on t ()").is_err());
    assert!(IndexDef::parse("drop table t").is_err());
  }
}
