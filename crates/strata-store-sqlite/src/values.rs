//! Normalization and per-field validation of submitted record values.
//!
//! Checks that need the database (relation existence, uniqueness) live in
//! [`crate::records`].

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use strata_core::{Field, FieldError, FieldOptions, time};

use crate::encode::number;

static EMAIL_RE: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("static regex"));
static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"^(?i)https?://([^\s/?#:@]+)(:\d+)?([/?#]\S*)?$").expect("static regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modifier {
  /// `field+`
  Append,
  /// `field-`
  Remove,
}

fn text(value: &Value) -> String {
  match value {
    Value::Null => String::new(),
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

fn list(value: Value) -> Vec<String> {
  let items = match value {
    Value::Array(items) => items,
    Value::Null => Vec::new(),
    Value::String(s) if s.trim_start().starts_with('[') => {
      match serde_json::from_str::<Vec<Value>>(&s) {
        Ok(items) => items,
        Err(_) => vec![Value::String(s)],
      }
    }
    other => vec![other],
  };
  let mut out: Vec<String> = Vec::new();
  for item in items {
    let s = text(&item);
    if !s.is_empty() && !out.contains(&s) {
      out.push(s);
    }
  }
  out
}

fn to_f64(value: &Value) -> f64 {
  match value {
    Value::Number(n) => n.as_f64().unwrap_or_default(),
    Value::Bool(b) => f64::from(u8::from(*b)),
    Value::String(s) => s.trim().parse().unwrap_or_default(),
    _ => 0.0,
  }
}

fn to_bool(value: &Value) -> bool {
  match value {
    Value::Bool(b) => *b,
    Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
    Value::String(s) => matches!(s.trim(), "1" | "true" | "TRUE" | "True"),
    _ => false,
  }
}

/// Coerce `raw` into the shape `field` stores.
pub fn normalize(field: &Field, raw: Value) -> Value {
  if field.is_multiple() {
    return Value::from(list(raw));
  }
  match &field.options {
    FieldOptions::Select(_) | FieldOptions::File(_) | FieldOptions::Relation(_) => {
      Value::String(list(raw).pop().unwrap_or_default())
    }
    FieldOptions::Number(_) => number(to_f64(&raw)),
    FieldOptions::Bool(_) => Value::Bool(to_bool(&raw)),
    FieldOptions::Json(_) => raw,
    FieldOptions::Date(_) => {
      let s = text(&raw);
      match time::parse(&s) {
        Some(dt) => Value::String(time::format(&dt)),
        None => Value::String(s.trim().to_string()),
      }
    }
    _ => Value::String(text(&raw)),
  }
}

/// The zero value of `field`.
pub fn empty(field: &Field) -> Value { normalize(field, Value::Null) }

/// Apply a `+`/`-` modifier to the current value. Types without modifier
/// support keep their current value.
pub fn modify(field: &Field, current: Value, modifier: Modifier, delta: Value) -> Value {
  match &field.options {
    FieldOptions::Number(_) => {
      let (a, b) = (to_f64(&current), to_f64(&delta));
      number(if modifier == Modifier::Append { a + b } else { a - b })
    }
    FieldOptions::Select(_) | FieldOptions::File(_) | FieldOptions::Relation(_) => {
      let mut values = list(current);
      let delta = list(delta);
      match modifier {
        Modifier::Append => {
          for v in delta {
            if !values.contains(&v) {
              values.push(v);
            }
          }
        }
        Modifier::Remove => values.retain(|v| !delta.contains(v)),
      }
      normalize(field, Value::from(values))
    }
    _ => current,
  }
}

pub fn is_empty(value: &Value) -> bool {
  match value {
    Value::Null => true,
    Value::String(s) => s.is_empty(),
    Value::Array(items) => items.is_empty(),
    Value::Number(n) => n.as_f64() == Some(0.0),
    Value::Bool(b) => !b,
    Value::Object(_) => false,
  }
}

fn domain_allowed(domain: &str, only: Option<&Vec<String>>, except: Option<&Vec<String>>) -> bool {
  let domain = domain.to_lowercase();
  if let Some(only) = only.filter(|d| !d.is_empty()) {
    return only.iter().any(|d| d.eq_ignore_ascii_case(&domain));
  }
  except.is_none_or(|except| !except.iter().any(|d| d.eq_ignore_ascii_case(&domain)))
}

/// Check an email address against format and domain lists.
pub fn check_email(
  email: &str,
  only: Option<&Vec<String>>,
  except: Option<&Vec<String>>,
) -> Option<FieldError> {
  if !EMAIL_RE.is_match(email) {
    return Some(FieldError::new("validation_is_email", "Must be a valid email address."));
  }
  let domain = email.rsplit('@').next().unwrap_or_default();
  if !domain_allowed(domain, only, except) {
    return Some(FieldError::new(
      "validation_email_domain_not_allowed",
      "Email domain is not allowed.",
    ));
  }
  None
}

/// Validate a normalized value. `None` means valid.
pub fn validate(field: &Field, value: &Value) -> Option<FieldError> {
  // Zero values (0, false, "", []) count as blank.
  if is_empty(value) {
    return field.required.then(FieldError::required);
  }

  match &field.options {
    FieldOptions::Text(o) => {
      let s = text(value);
      let len = s.chars().count() as i64;
      if let Some(min) = o.min
        && len < min
      {
        return Some(FieldError::new(
          "validation_min_text_constraint",
          format!("Must be at least {min} character(s)."),
        ));
      }
      if let Some(max) = o.max
        && len > max
      {
        return Some(FieldError::new(
          "validation_max_text_constraint",
          format!("Must be less than {max} character(s)."),
        ));
      }
      if !o.pattern.is_empty()
        && Regex::new(&o.pattern).is_ok_and(|re| !re.is_match(&s))
      {
        return Some(FieldError::new("validation_invalid_format", "Invalid value format."));
      }
      None
    }
    FieldOptions::Number(o) => {
      let n = to_f64(value);
      if o.no_decimal && n.fract() != 0.0 {
        return Some(FieldError::new(
          "validation_no_decimal_constraint",
          "Decimal numbers are not allowed.",
        ));
      }
      if let Some(min) = o.min
        && n < min
      {
        return Some(FieldError::new(
          "validation_min_number_constraint",
          format!("Must be larger than {min}."),
        ));
      }
      if let Some(max) = o.max
        && n > max
      {
        return Some(FieldError::new(
          "validation_max_number_constraint",
          format!("Must be less than {max}."),
        ));
      }
      None
    }
    FieldOptions::Email(o) => {
      check_email(&text(value), o.only_domains.as_ref(), o.except_domains.as_ref())
    }
    FieldOptions::Url(o) => {
      let s = text(value);
      let Some(caps) = URL_RE.captures(&s) else {
        return Some(FieldError::new("validation_is_url", "Must be a valid url."));
      };
      if !domain_allowed(&caps[1], o.only_domains.as_ref(), o.except_domains.as_ref()) {
        return Some(FieldError::new(
          "validation_url_domain_not_allowed",
          "Url domain is not allowed.",
        ));
      }
      None
    }
    FieldOptions::Date(o) => {
      let Some(dt) = time::parse(&text(value)) else {
        return Some(FieldError::new("validation_invalid_date", "Must be a valid date."));
      };
      if let Some(min) = time::parse(&o.min)
        && dt < min
      {
        return Some(FieldError::new(
          "validation_min_date_constraint",
          format!("Must be no earlier than {}.", o.min),
        ));
      }
      if let Some(max) = time::parse(&o.max)
        && dt > max
      {
        return Some(FieldError::new(
          "validation_max_date_constraint",
          format!("Must be no later than {}.", o.max),
        ));
      }
      None
    }
    FieldOptions::Select(o) => {
      let values = list(value.clone());
      if let Some(bad) = values.iter().find(|v| !o.values.contains(v)) {
        return Some(FieldError::new("validation_invalid_value", format!("Invalid value {bad}.")));
      }
      too_many(values.len(), o.max_select.max(1))
    }
    FieldOptions::File(o) => too_many(list(value.clone()).len(), o.max_select.max(1)),
    FieldOptions::Relation(o) => {
      let count = list(value.clone()).len();
      if let Some(max) = o.max_select
        && let Some(err) = too_many(count, max.max(1))
      {
        return Some(err);
      }
      if let Some(min) = o.min_select
        && count < min
      {
        return Some(FieldError::new(
          "validation_not_enough_values",
          format!("Select at least {min}."),
        ));
      }
      None
    }
    FieldOptions::Editor(_) | FieldOptions::Bool(_) | FieldOptions::Json(_) => None,
  }
}

fn too_many(count: usize, max: usize) -> Option<FieldError> {
  (count > max).then(|| {
    FieldError::new("validation_too_many_values", format!("Select no more than {max}."))
  })
}
