//! Fields: one typed entry of a collection schema.
//!
//! A field's `type` and `options` travel as two sibling JSON keys, but in Rust
//! they are a single tagged union ([`FieldOptions`]) so that the options of a
//! `relation` field can never be confused with those of a `text` field.
//! Missing `options` on input are filled with the per-type defaults.

use std::{
  collections::HashSet,
  sync::LazyLock,
};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display, EnumIter};

use crate::{
  collection::{Collection, CollectionType, ValidationContext},
  time,
  validation::{Errors, FieldError},
};

/// Base record columns that can never be used as field names.
pub const RESERVED_BASE_NAMES: &[&str] =
  &["id", "created", "updated", "collectionId", "collectionName", "expand"];

/// Columns implicitly carried by every auth collection (plus the write-only
/// password inputs).
pub const RESERVED_AUTH_NAMES: &[&str] = &[
  "email",
  "username",
  "verified",
  "emailVisibility",
  "lastResetSentAt",
  "lastVerificationSentAt",
  "tokenKey",
  "passwordHash",
  "password",
  "passwordConfirm",
  "oldPassword",
];

pub const MAX_NAME_LENGTH: usize = 255;

static NAME_RE: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"^\w+$").expect("static regex"));

static THUMB_RE: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"^(\d+)x(\d+)(t|b|f)?$").expect("static regex"));

// ─── Field type ──────────────────────────────────────────────────────────────

/// The closed set of supported field types.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  AsRefStr,
  Display,
  EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FieldType {
  Text,
  Editor,
  Number,
  Bool,
  Email,
  Url,
  #[serde(alias = "datetime")]
  Date,
  Select,
  Json,
  File,
  Relation,
}

// ─── Options ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TextOptions {
  pub min:     Option<i64>,
  pub max:     Option<i64>,
  pub pattern: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EditorOptions {
  pub convert_urls: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NumberOptions {
  pub min:        Option<f64>,
  pub max:        Option<f64>,
  pub no_decimal: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoolOptions {}

/// Shared by `email` and `url` fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DomainOptions {
  pub except_domains: Option<Vec<String>>,
  pub only_domains:   Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DateOptions {
  pub min: String,
  pub max: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SelectOptions {
  pub max_select: usize,
  pub values:     Vec<String>,
}

impl Default for SelectOptions {
  fn default() -> Self { Self { max_select: 1, values: Vec::new() } }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JsonOptions {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FileOptions {
  pub max_select: usize,
  pub max_size:   u64,
  pub mime_types: Vec<String>,
  pub thumbs:     Vec<String>,
  pub protected:  bool,
}

impl Default for FileOptions {
  fn default() -> Self {
    Self {
      max_select: 1,
      max_size:   5 * 1024 * 1024,
      mime_types: Vec::new(),
      thumbs:     Vec::new(),
      protected:  false,
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RelationOptions {
  pub collection_id:  String,
  pub cascade_delete: bool,
  pub min_select:     Option<usize>,
  /// `None` or anything above 1 means a to-many relation.
  pub max_select:     Option<usize>,
  pub display_fields: Vec<String>,
}

/// Type-specific options; the variant *is* the field type.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldOptions {
  Text(TextOptions),
  Editor(EditorOptions),
  Number(NumberOptions),
  Bool(BoolOptions),
  Email(DomainOptions),
  Url(DomainOptions),
  Date(DateOptions),
  Select(SelectOptions),
  Json(JsonOptions),
  File(FileOptions),
  Relation(RelationOptions),
}

impl FieldOptions {
  pub fn field_type(&self) -> FieldType {
    match self {
      Self::Text(_) => FieldType::Text,
      Self::Editor(_) => FieldType::Editor,
      Self::Number(_) => FieldType::Number,
      Self::Bool(_) => FieldType::Bool,
      Self::Email(_) => FieldType::Email,
      Self::Url(_) => FieldType::Url,
      Self::Date(_) => FieldType::Date,
      Self::Select(_) => FieldType::Select,
      Self::Json(_) => FieldType::Json,
      Self::File(_) => FieldType::File,
      Self::Relation(_) => FieldType::Relation,
    }
  }

  pub fn default_for(kind: FieldType) -> Self {
    match kind {
      FieldType::Text => Self::Text(Default::default()),
      FieldType::Editor => Self::Editor(Default::default()),
      FieldType::Number => Self::Number(Default::default()),
      FieldType::Bool => Self::Bool(Default::default()),
      FieldType::Email => Self::Email(Default::default()),
      FieldType::Url => Self::Url(Default::default()),
      FieldType::Date => Self::Date(Default::default()),
      FieldType::Select => Self::Select(Default::default()),
      FieldType::Json => Self::Json(Default::default()),
      FieldType::File => Self::File(Default::default()),
      FieldType::Relation => Self::Relation(Default::default()),
    }
  }

  /// Decode the options payload for `kind`; `null`/missing yields defaults.
  pub fn from_json(
    kind: FieldType,
    raw: Option<Value>,
  ) -> Result<Self, serde_json::Error> {
    let raw = match raw {
      None | Some(Value::Null) => return Ok(Self::default_for(kind)),
      Some(v) => v,
    };
    Ok(match kind {
      FieldType::Text => Self::Text(serde_json::from_value(raw)?),
      FieldType::Editor => Self::Editor(serde_json::from_value(raw)?),
      FieldType::Number => Self::Number(serde_json::from_value(raw)?),
      FieldType::Bool => Self::Bool(serde_json::from_value(raw)?),
      FieldType::Email => Self::Email(serde_json::from_value(raw)?),
      FieldType::Url => Self::Url(serde_json::from_value(raw)?),
      FieldType::Date => Self::Date(serde_json::from_value(raw)?),
      FieldType::Select => Self::Select(serde_json::from_value(raw)?),
      FieldType::Json => Self::Json(serde_json::from_value(raw)?),
      FieldType::File => Self::File(serde_json::from_value(raw)?),
      FieldType::Relation => Self::Relation(serde_json::from_value(raw)?),
    })
  }

  pub fn to_json(&self) -> Value {
    let result = match self {
      Self::Text(o) => serde_json::to_value(o),
      Self::Editor(o) => serde_json::to_value(o),
      Self::Number(o) => serde_json::to_value(o),
      Self::Bool(o) => serde_json::to_value(o),
      Self::Email(o) | Self::Url(o) => serde_json::to_value(o),
      Self::Date(o) => serde_json::to_value(o),
      Self::Select(o) => serde_json::to_value(o),
      Self::Json(o) => serde_json::to_value(o),
      Self::File(o) => serde_json::to_value(o),
      Self::Relation(o) => serde_json::to_value(o),
    };
    // Plain structs of strings/numbers/bools always serialize.
    result.unwrap_or(Value::Null)
  }

  /// Per-type validator lookup.
  fn validator(&self) -> &dyn OptionsValidator {
    match self {
      Self::Text(o) => o,
      Self::Editor(o) => o,
      Self::Number(o) => o,
      Self::Bool(o) => o,
      Self::Email(o) | Self::Url(o) => o,
      Self::Date(o) => o,
      Self::Select(o) => o,
      Self::Json(o) => o,
      Self::File(o) => o,
      Self::Relation(o) => o,
    }
  }
}

// ─── Options validation ──────────────────────────────────────────────────────

/// Type-specific options validation.
trait OptionsValidator {
  fn validate(&self, owner: &Collection, ctx: &dyn ValidationContext) -> Errors;
}

impl OptionsValidator for TextOptions {
  fn validate(&self, _: &Collection, _: &dyn ValidationContext) -> Errors {
    let mut errors = Errors::new();
    if let Some(min) = self.min
      && min < 0
    {
      errors.add(
        "min",
        "validation_min_greater_equal_than_required",
        "Must be no less than 0.",
      );
    }
    if let (Some(min), Some(max)) = (self.min, self.max)
      && max < min
    {
      errors.add(
        "max",
        "validation_max_greater_equal_than_min",
        format!("Must be no less than {min}."),
      );
    }
    if !self.pattern.is_empty() && Regex::new(&self.pattern).is_err() {
      errors.add("pattern", "validation_invalid_regex", "Invalid regular expression.");
    }
    errors
  }
}

impl OptionsValidator for EditorOptions {
  fn validate(&self, _: &Collection, _: &dyn ValidationContext) -> Errors { Errors::new() }
}

impl OptionsValidator for NumberOptions {
  fn validate(&self, _: &Collection, _: &dyn ValidationContext) -> Errors {
    let mut errors = Errors::new();
    if let (Some(min), Some(max)) = (self.min, self.max)
      && max < min
    {
      errors.add(
        "max",
        "validation_max_greater_equal_than_min",
        format!("Must be no less than {min}."),
      );
    }
    errors
  }
}

impl OptionsValidator for BoolOptions {
  fn validate(&self, _: &Collection, _: &dyn ValidationContext) -> Errors { Errors::new() }
}

impl OptionsValidator for JsonOptions {
  fn validate(&self, _: &Collection, _: &dyn ValidationContext) -> Errors { Errors::new() }
}

impl OptionsValidator for DomainOptions {
  fn validate(&self, _: &Collection, _: &dyn ValidationContext) -> Errors {
    let mut errors = Errors::new();
    let has_only = self.only_domains.as_ref().is_some_and(|d| !d.is_empty());
    let has_except = self.except_domains.as_ref().is_some_and(|d| !d.is_empty());
    if has_only && has_except {
      errors.add(
        "exceptDomains",
        "validation_empty",
        "Must be blank when onlyDomains is set.",
      );
    }
    errors
  }
}

impl OptionsValidator for DateOptions {
  fn validate(&self, _: &Collection, _: &dyn ValidationContext) -> Errors {
    let mut errors = Errors::new();
    let min = parse_optional_date(&self.min, "min", &mut errors);
    let max = parse_optional_date(&self.max, "max", &mut errors);
    if let (Some(min), Some(max)) = (min, max)
      && max < min
    {
      errors.add(
        "max",
        "validation_max_greater_equal_than_min",
        "Must be no earlier than min.",
      );
    }
    errors
  }
}

fn parse_optional_date(
  raw: &str,
  key: &str,
  errors: &mut Errors,
) -> Option<chrono::DateTime<chrono::Utc>> {
  if raw.is_empty() {
    return None;
  }
  let parsed = time::parse(raw);
  if parsed.is_none() {
    errors.add(key, "validation_invalid_date", "Must be a valid date.");
  }
  parsed
}

impl OptionsValidator for SelectOptions {
  fn validate(&self, _: &Collection, _: &dyn ValidationContext) -> Errors {
    let mut errors = Errors::new();
    if self.max_select == 0 {
      errors.add_error("maxSelect", FieldError::required());
    }
    if self.values.is_empty() {
      errors.add_error("values", FieldError::required());
    } else {
      let mut seen = HashSet::new();
      let mut nested = Errors::new();
      for (i, v) in self.values.iter().enumerate() {
        if !seen.insert(v.as_str()) {
          nested.add(i.to_string(), "validation_duplicated_value", "Duplicated value.");
        }
      }
      errors.nest("values", nested);
    }
    errors
  }
}

impl OptionsValidator for FileOptions {
  fn validate(&self, _: &Collection, _: &dyn ValidationContext) -> Errors {
    let mut errors = Errors::new();
    if self.max_select == 0 {
      errors.add_error("maxSelect", FieldError::required());
    }
    if self.max_size == 0 {
      errors.add_error("maxSize", FieldError::required());
    }
    let mut thumbs = Errors::new();
    for (i, thumb) in self.thumbs.iter().enumerate() {
      let valid = THUMB_RE
        .captures(thumb)
        .is_some_and(|c| !(&c[1] == "0" && &c[2] == "0"));
      if !valid {
        thumbs.add(
          i.to_string(),
          "validation_invalid_thumb_format",
          format!("Invalid thumb format {thumb:?}."),
        );
      }
    }
    errors.nest("thumbs", thumbs);
    errors
  }
}

impl OptionsValidator for RelationOptions {
  fn validate(&self, owner: &Collection, ctx: &dyn ValidationContext) -> Errors {
    let mut errors = Errors::new();

    if self.collection_id.is_empty() {
      errors.add_error("collectionId", FieldError::required());
    } else if owner.id == self.collection_id && !owner.id.is_empty() {
      // Self-references are always resolvable.
    } else {
      match ctx.collection_by_id(&self.collection_id) {
        None => errors.add(
          "collectionId",
          "validation_missing_rel_collection",
          "The related collection doesn't exist.",
        ),
        Some(target) => {
          if target.kind() == CollectionType::View && owner.kind() != CollectionType::View {
            errors.add(
              "collectionId",
              "validation_invalid_view_relation",
              "Non view collections are not allowed to have a view relation.",
            );
          }
        }
      }
    }

    if let Some(max) = self.max_select {
      if max == 0 {
        errors.add(
          "maxSelect",
          "validation_min_greater_equal_than_required",
          "Must be no less than 1.",
        );
      } else if let Some(min) = self.min_select
        && max < min
      {
        errors.add(
          "maxSelect",
          "validation_max_greater_equal_than_min",
          format!("Must be no less than {min}."),
        );
      }
    }

    errors
  }
}

// ─── Field ───────────────────────────────────────────────────────────────────

/// One schema entry. `id` is stable across renames; `name` is the column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawField", into = "RawField")]
pub struct Field {
  pub system:      bool,
  pub id:          String,
  pub name:        String,
  pub required:    bool,
  pub presentable: bool,
  pub unique:      bool,
  pub options:     FieldOptions,
}

impl Field {
  /// A new, non-system field with default options for `kind`.
  pub fn new(name: impl Into<String>, kind: FieldType) -> Self {
    Self {
      system:      false,
      id:          String::new(),
      name:        name.into(),
      required:    false,
      presentable: false,
      unique:      false,
      options:     FieldOptions::default_for(kind),
    }
  }

  pub fn with_id(mut self, id: impl Into<String>) -> Self {
    self.id = id.into();
    self
  }

  pub fn with_options(mut self, options: FieldOptions) -> Self {
    self.options = options;
    self
  }

  pub fn required(mut self) -> Self {
    self.required = true;
    self
  }

  pub fn unique(mut self) -> Self {
    self.unique = true;
    self
  }

  pub fn field_type(&self) -> FieldType { self.options.field_type() }

  /// Whether the stored value is a JSON array of values.
  pub fn is_multiple(&self) -> bool {
    match &self.options {
      FieldOptions::Select(o) => o.max_select > 1,
      FieldOptions::File(o) => o.max_select > 1,
      FieldOptions::Relation(o) => o.max_select.is_none_or(|m| m > 1),
      _ => false,
    }
  }

  pub fn relation(&self) -> Option<&RelationOptions> {
    match &self.options {
      FieldOptions::Relation(o) => Some(o),
      _ => None,
    }
  }

  /// Validate this field as entry of `owner`'s schema.
  pub fn validate(&self, owner: &Collection, ctx: &dyn ValidationContext) -> Errors {
    let mut errors = Errors::new();

    if self.id.is_empty() {
      errors.add_error("id", FieldError::required());
    } else if self.id.len() < 3 || self.id.len() > 100 {
      errors.add(
        "id",
        "validation_length_out_of_range",
        "The length must be between 3 and 100.",
      );
    }

    if self.name.is_empty() {
      errors.add_error("name", FieldError::required());
    } else if self.name.len() > MAX_NAME_LENGTH {
      errors.add(
        "name",
        "validation_length_out_of_range",
        format!("The length must be between 1 and {MAX_NAME_LENGTH}."),
      );
    } else if !NAME_RE.is_match(&self.name) {
      errors.add("name", "validation_match_invalid", "Must be in a valid format.");
    } else if RESERVED_BASE_NAMES
      .iter()
      .any(|r| r.eq_ignore_ascii_case(&self.name))
    {
      errors.add("name", "validation_not_in_invalid", "Must be a valid value.");
    } else if owner.kind() == CollectionType::Auth
      && RESERVED_AUTH_NAMES
        .iter()
        .any(|r| r.eq_ignore_ascii_case(&self.name))
    {
      errors.add(
        "name",
        "validation_reserved_auth_field_name",
        "The field name is reserved and cannot be used.",
      );
    }

    errors.nest("options", self.options.validator().validate(owner, ctx));
    errors
  }
}

/// Wire shape of a [`Field`].
#[derive(Serialize, Deserialize)]
struct RawField {
  #[serde(default)]
  system:      bool,
  #[serde(default)]
  id:          String,
  #[serde(default)]
  name:        String,
  #[serde(rename = "type")]
  kind:        FieldType,
  #[serde(default)]
  required:    bool,
  #[serde(default)]
  presentable: bool,
  #[serde(default)]
  unique:      bool,
  #[serde(default)]
  options:     Option<Value>,
}

impl TryFrom<RawField> for Field {
  type Error = serde_json::Error;

  fn try_from(raw: RawField) -> Result<Self, Self::Error> {
    Ok(Field {
      system:      raw.system,
      id:          raw.id,
      name:        raw.name,
      required:    raw.required,
      presentable: raw.presentable,
      unique:      raw.unique,
      options:     FieldOptions::from_json(raw.kind, raw.options)?,
    })
  }
}

impl From<Field> for RawField {
  fn from(f: Field) -> Self {
    RawField {
      system:      f.system,
      id:          f.id,
      name:        f.name,
      kind:        f.options.field_type(),
      required:    f.required,
      presentable: f.presentable,
      unique:      f.unique,
      options:     Some(f.options.to_json()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn text_field_serializes_with_default_options() {
    let field = Field::new("test", FieldType::Text).with_id("12345789");
    let json = serde_json::to_string(&field).unwrap();
    assert_eq!(
      json,
      r#"{"system":false,"id":"12345789","name":"test","type":"text","required":false,"presentable":false,"unique":false,"options":{"min":null,"max":null,"pattern":""}}"#
    );
  }

  #[test]
  fn missing_options_fall_back_to_defaults() {
    let field: Field =
      serde_json::from_str(r#"{"type":"relation","name":"author"}"#).unwrap();
    assert_eq!(field.field_type(), FieldType::Relation);
    assert!(field.is_multiple());
    assert_eq!(field.relation().unwrap().collection_id, "");
  }

  #[test]
  fn datetime_is_an_alias_of_date() {
    let field: Field =
      serde_json::from_str(r#"{"type":"datetime","name":"due"}"#).unwrap();
    assert_eq!(field.field_type(), FieldType::Date);
  }

  #[test]
  fn single_relation_is_not_multiple() {
    let field = Field::new("owner", FieldType::Relation).with_options(
      FieldOptions::Relation(RelationOptions {
        max_select: Some(1),
        ..Default::default()
      }),
    );
    assert!(!field.is_multiple());
  }
}
