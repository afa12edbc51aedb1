//! Collections: named record sets with a schema, access rules and indexes.

use std::{collections::HashSet, sync::LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display, EnumIter};

use crate::{
  field::{Field, MAX_NAME_LENGTH},
  index::IndexDef,
  security::{self, FIELD_ID_LENGTH},
  time,
  validation::{Errors, FieldError},
};

static COLLECTION_NAME_RE: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"^\w+$").expect("static regex"));

// ─── Type & options ──────────────────────────────────────────────────────────

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
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
pub enum CollectionType {
  #[default]
  Base,
  Auth,
  View,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaseOptions {}

/// Settings of an `auth` collection. Keys serialize alphabetically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthOptions {
  pub allow_email_auth:     bool,
  #[serde(rename = "allowOAuth2Auth")]
  pub allow_oauth2_auth:    bool,
  pub allow_username_auth:  bool,
  pub except_email_domains: Option<Vec<String>>,
  pub manage_rule:          Option<String>,
  pub min_password_length:  u32,
  pub only_email_domains:   Option<Vec<String>>,
  pub only_verified:        bool,
  pub require_email:        bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewOptions {
  pub query: String,
}

/// Type-specific options; the variant *is* the collection type.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionOptions {
  Base(BaseOptions),
  Auth(AuthOptions),
  View(ViewOptions),
}

impl Default for CollectionOptions {
  fn default() -> Self { Self::Base(BaseOptions {}) }
}

impl CollectionOptions {
  pub fn kind(&self) -> CollectionType {
    match self {
      Self::Base(_) => CollectionType::Base,
      Self::Auth(_) => CollectionType::Auth,
      Self::View(_) => CollectionType::View,
    }
  }

  fn from_json(kind: CollectionType, raw: Option<Value>) -> Result<Self, serde_json::Error> {
    let raw = match raw {
      None | Some(Value::Null) => Value::Object(Default::default()),
      Some(v) => v,
    };
    Ok(match kind {
      CollectionType::Base => Self::Base(serde_json::from_value(raw)?),
      CollectionType::Auth => Self::Auth(serde_json::from_value(raw)?),
      CollectionType::View => Self::View(serde_json::from_value(raw)?),
    })
  }

  fn to_json(&self) -> Value {
    let result = match self {
      Self::Base(o) => serde_json::to_value(o),
      Self::Auth(o) => serde_json::to_value(o),
      Self::View(o) => serde_json::to_value(o),
    };
    result.unwrap_or(Value::Null)
  }
}

// ─── Schema ──────────────────────────────────────────────────────────────────

/// Ordered list of user-defined fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema(Vec<Field>);

impl Schema {
  pub fn new(fields: Vec<Field>) -> Self { Self(fields) }

  pub fn fields(&self) -> &[Field] { &self.0 }

  pub fn fields_mut(&mut self) -> &mut Vec<Field> { &mut self.0 }

  pub fn is_empty(&self) -> bool { self.0.is_empty() }

  pub fn len(&self) -> usize { self.0.len() }

  pub fn get_by_id(&self, id: &str) -> Option<&Field> {
    self.0.iter().find(|f| f.id == id)
  }

  pub fn get_by_name(&self, name: &str) -> Option<&Field> {
    self.0.iter().find(|f| f.name == name)
  }

  /// Append or replace (by id) a field, assigning an id if it has none.
  pub fn add_field(&mut self, mut field: Field) {
    if field.id.is_empty() {
      field.id = security::random_id(FIELD_ID_LENGTH);
    }
    match self.0.iter_mut().find(|f| f.id == field.id) {
      Some(existing) => *existing = field,
      None => self.0.push(field),
    }
  }

  pub fn remove_field(&mut self, id: &str) { self.0.retain(|f| f.id != id); }

  /// Give every id-less field a fresh random id.
  pub fn ensure_ids(&mut self) {
    for field in &mut self.0 {
      if field.id.is_empty() {
        field.id = security::random_id(FIELD_ID_LENGTH);
      }
    }
  }
}

// ─── Collection ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCollection", into = "RawCollection")]
pub struct Collection {
  pub id:          String,
  pub created:     DateTime<Utc>,
  pub updated:     DateTime<Utc>,
  pub name:        String,
  pub system:      bool,
  pub schema:      Schema,
  pub indexes:     Vec<String>,
  /// `None` means admin only; `Some("")` means public.
  pub list_rule:   Option<String>,
  pub view_rule:   Option<String>,
  pub create_rule: Option<String>,
  pub update_rule: Option<String>,
  pub delete_rule: Option<String>,
  pub options:     CollectionOptions,
}

impl Collection {
  pub fn new(name: impl Into<String>, kind: CollectionType) -> Self {
    let now = time::now();
    let options = match kind {
      CollectionType::Base => CollectionOptions::Base(BaseOptions {}),
      CollectionType::Auth => CollectionOptions::Auth(AuthOptions::default()),
      CollectionType::View => CollectionOptions::View(ViewOptions::default()),
    };
    Self {
      id: String::new(),
      created: now,
      updated: now,
      name: name.into(),
      system: false,
      schema: Schema::default(),
      indexes: Vec::new(),
      list_rule: None,
      view_rule: None,
      create_rule: None,
      update_rule: None,
      delete_rule: None,
      options,
    }
  }

  pub fn kind(&self) -> CollectionType { self.options.kind() }

  pub fn is_auth(&self) -> bool { self.kind() == CollectionType::Auth }

  pub fn is_view(&self) -> bool { self.kind() == CollectionType::View }

  pub fn is_new(&self) -> bool { self.id.is_empty() }

  pub fn auth_options(&self) -> Option<&AuthOptions> {
    match &self.options {
      CollectionOptions::Auth(o) => Some(o),
      _ => None,
    }
  }

  pub fn view_query(&self) -> Option<&str> {
    match &self.options {
      CollectionOptions::View(o) => Some(&o.query),
      _ => None,
    }
  }

  /// Parsed index definitions, skipping unparsable entries.
  pub fn index_defs(&self) -> Vec<IndexDef> {
    self.indexes.iter().filter_map(|raw| IndexDef::parse(raw).ok()).collect()
  }

  /// The rule strings paired with their JSON key.
  pub fn rules(&self) -> [(&'static str, Option<&str>); 5] {
    [
      ("listRule", self.list_rule.as_deref()),
      ("viewRule", self.view_rule.as_deref()),
      ("createRule", self.create_rule.as_deref()),
      ("updateRule", self.update_rule.as_deref()),
      ("deleteRule", self.delete_rule.as_deref()),
    ]
  }

  /// Validate this collection against its previous persisted state (`old`)
  /// and the rest of the schema (`ctx`).
  pub fn validate(
    &self,
    old: Option<&Collection>,
    ctx: &dyn ValidationContext,
  ) -> Result<(), Errors> {
    let mut errors = Errors::new();

    self.validate_id(&mut errors);
    self.validate_name(old, ctx, &mut errors);

    if let Some(old) = old
      && old.kind() != self.kind()
    {
      errors.add(
        "type",
        "validation_collection_type_change",
        "Collection type cannot be changed.",
      );
    }

    if let Some(old) = old
      && old.system
      && !self.system
    {
      errors.add(
        "system",
        "validation_collection_system_flag_change",
        "System collection state cannot be changed.",
      );
    }

    errors.nest("schema", self.validate_schema(old, ctx));
    if self.kind() == CollectionType::Base && self.schema.is_empty() {
      errors.add_error("schema", FieldError::required());
    }

    self.validate_rules(ctx, &mut errors);
    self.validate_indexes(&mut errors);
    errors.nest("options", self.validate_options(ctx));

    errors.into_result()
  }

  fn validate_id(&self, errors: &mut Errors) {
    if self.id.is_empty() {
      return;
    }
    if self.id.len() > 100 || !COLLECTION_NAME_RE.is_match(&self.id) {
      errors.add("id", "validation_match_invalid", "Must be in a valid format.");
    }
  }

  fn validate_name(
    &self,
    old: Option<&Collection>,
    ctx: &dyn ValidationContext,
    errors: &mut Errors,
  ) {
    if self.name.is_empty() {
      errors.add_error("name", FieldError::required());
      return;
    }
    if self.name.len() > MAX_NAME_LENGTH {
      errors.add(
        "name",
        "validation_length_out_of_range",
        format!("The length must be between 1 and {MAX_NAME_LENGTH}."),
      );
      return;
    }
    if !COLLECTION_NAME_RE.is_match(&self.name) {
      errors.add("name", "validation_match_invalid", "Must be in a valid format.");
      return;
    }

    if let Some(old) = old
      && old.system
      && old.name != self.name
    {
      errors.add(
        "name",
        "validation_collection_system_name_change",
        "System collections cannot be renamed.",
      );
      return;
    }

    if let Some(existing) = ctx.collection_by_name(&self.name)
      && existing.id != self.id
    {
      errors.add(
        "name",
        "validation_collection_name_exists",
        "Collection name must be unique (case insensitive).",
      );
      return;
    }

    let renamed = old.is_none_or(|o| !o.name.eq_ignore_ascii_case(&self.name));
    if renamed && ctx.table_exists(&self.name) {
      errors.add(
        "name",
        "validation_collection_name_invalid",
        "The name shouldn't match with an existing internal table.",
      );
    }
  }

  fn validate_schema(&self, old: Option<&Collection>, ctx: &dyn ValidationContext) -> Errors {
    let mut errors = Errors::new();

    // Views derive their schema from the query.
    if self.is_view() {
      return errors;
    }

    let mut ids = HashSet::new();
    let mut names = HashSet::new();
    for (i, field) in self.schema.fields().iter().enumerate() {
      let mut field_errors = field.validate(self, ctx);

      if !field.id.is_empty() && !ids.insert(field.id.as_str()) {
        field_errors.add(
          "id",
          "validation_duplicated_field_id",
          "Duplicated or invalid schema field id.",
        );
      }
      // SQLite column names are case insensitive.
      if !field.name.is_empty() && !names.insert(field.name.to_lowercase()) {
        field_errors.add(
          "name",
          "validation_duplicated_field_name",
          "Duplicated or invalid schema field name.",
        );
      }

      if let Some(previous) = old.and_then(|o| o.schema.get_by_id(&field.id))
        && previous.system
        && (previous.name != field.name || previous.field_type() != field.field_type())
      {
        field_errors.add(
          "system",
          "validation_system_field_change",
          "System fields cannot be renamed or retyped.",
        );
      }

      errors.nest(i.to_string(), field_errors);
    }

    if let Some(old) = old {
      let removed_system = old
        .schema
        .fields()
        .iter()
        .any(|f| f.system && self.schema.get_by_id(&f.id).is_none());
      if removed_system {
        errors.add(
          "system",
          "validation_system_field_change",
          "System fields cannot be deleted.",
        );
      }
    }

    errors
  }

  fn validate_rules(&self, ctx: &dyn ValidationContext, errors: &mut Errors) {
    for (key, rule) in self.rules() {
      let Some(rule) = rule else { continue };

      if self.is_view() && matches!(key, "createRule" | "updateRule" | "deleteRule") {
        errors.add(key, "validation_nil", "Must be null for view collections.");
        continue;
      }
      if rule.trim().is_empty() {
        continue;
      }
      if let Err(reason) = ctx.check_rule(self, rule) {
        errors.add(
          key,
          "validation_invalid_rule",
          format!("Invalid filter rule. Raw error: {reason}"),
        );
      }
    }
  }

  fn validate_indexes(&self, errors: &mut Errors) {
    if self.is_view() {
      if !self.indexes.is_empty() {
        errors.add(
          "indexes",
          "validation_indexes_not_supported",
          "View collections don't support indexes.",
        );
      }
      return;
    }

    let mut nested = Errors::new();
    let mut names = HashSet::new();
    for (i, raw) in self.indexes.iter().enumerate() {
      match IndexDef::parse(raw) {
        Err(_) => nested.add(
          i.to_string(),
          "validation_invalid_index_expression",
          "Invalid CREATE INDEX expression.",
        ),
        Ok(def) => {
          if !names.insert(def.name.to_ascii_lowercase()) {
            nested.add(
              i.to_string(),
              "validation_duplicated_index_name",
              "The index name must be unique.",
            );
          }
        }
      }
    }
    errors.nest("indexes", nested);
  }

  fn validate_options(&self, ctx: &dyn ValidationContext) -> Errors {
    let mut errors = Errors::new();
    match &self.options {
      CollectionOptions::Base(_) => {}
      CollectionOptions::View(o) => {
        if o.query.trim().is_empty() {
          errors.add_error("query", FieldError::required());
        }
      }
      CollectionOptions::Auth(o) => {
        if o.allow_email_auth || o.allow_username_auth {
          if o.min_password_length == 0 {
            errors.add_error("minPasswordLength", FieldError::required());
          } else if o.min_password_length < 5 {
            errors.add(
              "minPasswordLength",
              "validation_min_greater_equal_than_required",
              "Must be no less than 5.",
            );
          }
        }
        if o.min_password_length > 72 {
          errors.add(
            "minPasswordLength",
            "validation_max_less_equal_than_required",
            "Must be no greater than 72.",
          );
        }
        let only = o.only_email_domains.as_ref().is_some_and(|d| !d.is_empty());
        let except = o.except_email_domains.as_ref().is_some_and(|d| !d.is_empty());
        if only && except {
          errors.add(
            "exceptEmailDomains",
            "validation_empty",
            "Must be blank when onlyEmailDomains is set.",
          );
        }
        if let Some(rule) = o.manage_rule.as_deref()
          && !rule.trim().is_empty()
          && let Err(reason) = ctx.check_rule(self, rule)
        {
          errors.add(
            "manageRule",
            "validation_invalid_rule",
            format!("Invalid filter rule. Raw error: {reason}"),
          );
        }
      }
    }
    errors
  }
}

// ─── Validation context ──────────────────────────────────────────────────────

/// Lookups collection validation needs from the rest of the system.
pub trait ValidationContext {
  /// Look up a persisted collection by id.
  fn collection_by_id(&self, id: &str) -> Option<Collection>;

  /// Look up a persisted collection by name (case insensitive).
  fn collection_by_name(&self, name: &str) -> Option<Collection>;

  /// Whether a table that does not belong to a collection uses `name`.
  fn table_exists(&self, name: &str) -> bool;

  /// Check that `rule` compiles against `collection`.
  fn check_rule(&self, collection: &Collection, rule: &str) -> Result<(), String>;
}

// ─── Wire shape ──────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCollection {
  #[serde(default)]
  id:          String,
  #[serde(default)]
  created:     String,
  #[serde(default)]
  updated:     String,
  #[serde(default)]
  name:        String,
  #[serde(rename = "type", default)]
  kind:        CollectionType,
  #[serde(default)]
  system:      bool,
  #[serde(default)]
  schema:      Schema,
  #[serde(default)]
  indexes:     Vec<String>,
  #[serde(default)]
  list_rule:   Option<String>,
  #[serde(default)]
  view_rule:   Option<String>,
  #[serde(default)]
  create_rule: Option<String>,
  #[serde(default)]
  update_rule: Option<String>,
  #[serde(default)]
  delete_rule: Option<String>,
  #[serde(default)]
  options:     Option<Value>,
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
  if raw.is_empty() {
    return Ok(time::now());
  }
  time::parse(raw).ok_or_else(|| format!("invalid datetime {raw:?}"))
}

impl TryFrom<RawCollection> for Collection {
  type Error = String;

  fn try_from(raw: RawCollection) -> Result<Self, Self::Error> {
    Ok(Collection {
      id:          raw.id,
      created:     parse_timestamp(&raw.created)?,
      updated:     parse_timestamp(&raw.updated)?,
      name:        raw.name,
      system:      raw.system,
      schema:      raw.schema,
      indexes:     raw.indexes,
      list_rule:   raw.list_rule,
      view_rule:   raw.view_rule,
      create_rule: raw.create_rule,
      update_rule: raw.update_rule,
      delete_rule: raw.delete_rule,
      options:     CollectionOptions::from_json(raw.kind, raw.options)
        .map_err(|e| format!("invalid options: {e}"))?,
    })
  }
}

impl From<Collection> for RawCollection {
  fn from(c: Collection) -> Self {
    RawCollection {
      id:          c.id,
      created:     time::format(&c.created),
      updated:     time::format(&c.updated),
      name:        c.name,
      kind:        c.options.kind(),
      system:      c.system,
      schema:      c.schema,
      indexes:     c.indexes,
      list_rule:   c.list_rule,
      view_rule:   c.view_rule,
      create_rule: c.create_rule,
      update_rule: c.update_rule,
      delete_rule: c.delete_rule,
      options:     Some(c.options.to_json()),
    }
  }
}
