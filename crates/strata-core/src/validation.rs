//! Field-path keyed validation errors.
//!
//! Validation never stops at the first problem: every failing field is
//! collected into an [`Errors`] tree whose JSON form mirrors the shape of the
//! validated input, e.g.
//!
//! ```json
//! {"schema":{"0":{"name":{"code":"validation_required","message":"Cannot be blank."}}}}
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single leaf error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
  pub code:    String,
  pub message: String,
}

impl FieldError {
  pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
    Self { code: code.into(), message: message.into() }
  }

  pub fn required() -> Self {
    Self::new("validation_required", "Cannot be blank.")
  }
}

/// Either a leaf error or a nested error map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorNode {
  Leaf(FieldError),
  Nested(Errors),
}

/// An ordered, nested map of validation errors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Errors(BTreeMap<String, ErrorNode>);

impl Errors {
  pub fn new() -> Self { Self::default() }

  pub fn is_empty(&self) -> bool { self.0.is_empty() }

  pub fn len(&self) -> usize { self.0.len() }

  /// Record a leaf error under `key`. The first error for a key wins.
  pub fn add(
    &mut self,
    key: impl Into<String>,
    code: impl Into<String>,
    message: impl Into<String>,
  ) {
    self
      .0
      .entry(key.into())
      .or_insert_with(|| ErrorNode::Leaf(FieldError::new(code, message)));
  }

  pub fn add_error(&mut self, key: impl Into<String>, error: FieldError) {
    self.0.entry(key.into()).or_insert(ErrorNode::Leaf(error));
  }

  /// Attach a nested error map under `key`; empty maps are ignored.
  pub fn nest(&mut self, key: impl Into<String>, nested: Errors) {
    if nested.is_empty() {
      return;
    }
    let key = key.into();
    match self.0.get_mut(&key) {
      Some(ErrorNode::Nested(existing)) => {
        for (k, v) in nested.0 {
          existing.0.entry(k).or_insert(v);
        }
      }
      Some(ErrorNode::Leaf(_)) => {}
      None => {
        self.0.insert(key, ErrorNode::Nested(nested));
      }
    }
  }

  pub fn get(&self, key: &str) -> Option<&ErrorNode> { self.0.get(key) }

  /// Follow a dotted path (`"schema.0.name"`) down to a leaf error.
  pub fn leaf(&self, path: &str) -> Option<&FieldError> {
    let mut node: Option<&ErrorNode> = None;
    let mut current = self;
    for segment in path.split('.') {
      node = current.0.get(segment);
      match node {
        Some(ErrorNode::Nested(inner)) => current = inner,
        Some(ErrorNode::Leaf(_)) => {}
        None => return None,
      }
    }
    match node {
      Some(ErrorNode::Leaf(err)) => Some(err),
      _ => None,
    }
  }

  /// Convenience accessor for the code at a dotted path.
  pub fn code_at(&self, path: &str) -> Option<&str> {
    self.leaf(path).map(|e| e.code.as_str())
  }

  /// `Ok(())` when empty, otherwise the errors themselves.
  pub fn into_result(self) -> Result<(), Errors> {
    if self.is_empty() { Ok(()) } else { Err(self) }
  }
}

impl std::fmt::Display for Errors {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    fn walk(
      prefix: &str,
      errors: &Errors,
      out: &mut Vec<String>,
    ) {
      for (key, node) in &errors.0 {
        let path = if prefix.is_empty() {
          key.clone()
        } else {
          format!("{prefix}.{key}")
        };
        match node {
          ErrorNode::Leaf(e) => out.push(format!("{path}: {}", e.message)),
          ErrorNode::Nested(inner) => walk(&path, inner, out),
        }
      }
    }

    let mut parts = Vec::new();
    walk("", self, &mut parts);
    f.write_str(&parts.join("; "))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn nested_errors_serialize_by_path() {
    let mut field = Errors::new();
    field.add_error("name", FieldError::required());

    let mut schema = Errors::new();
    schema.nest("0", field);

    let mut root = Errors::new();
    root.nest("schema", schema);

    let json = serde_json::to_string(&root).unwrap();
    assert_eq!(
      json,
      r#"{"schema":{"0":{"name":{"code":"validation_required","message":"Cannot be blank."}}}}"#
    );
    assert_eq!(root.code_at("schema.0.name"), Some("validation_required"));
  }

  #[test]
  fn first_error_per_key_wins() {
    let mut errors = Errors::new();
    errors.add("name", "first", "a");
    errors.add("name", "second", "b");
    assert_eq!(errors.code_at("name"), Some("first"));
  }

  #[test]
  fn empty_nested_maps_are_dropped() {
    let mut errors = Errors::new();
    errors.nest("schema", Errors::new());
    assert!(errors.is_empty());
    assert!(errors.into_result().is_ok());
  }
}
