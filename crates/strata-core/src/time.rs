//! Timestamp formatting shared by every persisted model.
//!
//! Timestamps are stored and serialized as `YYYY-MM-DD HH:MM:SS.mmmZ`, which
//! sorts lexically in the same order as chronologically.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

pub const FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3fZ";

pub fn now() -> DateTime<Utc> { Utc::now() }

pub fn format(dt: &DateTime<Utc>) -> String { dt.format(FORMAT).to_string() }

/// Lenient parser: accepts the storage format, RFC 3339, and a bare date.
pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
  let raw = raw.trim();
  if raw.is_empty() {
    return None;
  }
  if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
    return Some(dt.with_timezone(&Utc));
  }
  for fmt in ["%Y-%m-%d %H:%M:%S%.fZ", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
      return Some(naive.and_utc());
    }
  }
  NaiveDate::parse_from_str(raw, "%Y-%m-%d")
    .ok()
    .and_then(|d| d.and_hms_opt(0, 0, 0))
    .map(|n| n.and_utc())
}

/// `#[serde(with = "strata_core::time::serde_format")]`
pub mod serde_format {
  use chrono::{DateTime, Utc};
  use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

  pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&super::format(dt))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
    let raw = String::deserialize(d)?;
    super::parse(&raw).ok_or_else(|| D::Error::custom(format!("invalid datetime {raw:?}")))
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;

  #[test]
  fn formats_with_millisecond_precision() {
    let dt = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
    assert_eq!(format(&dt), "2024-03-09 07:05:01.000Z");
  }

  #[test]
  fn parses_storage_rfc3339_and_bare_dates() {
    let expected = Utc.with_ymd_and_hms(2024, 3, 9, 0, 0, 0).unwrap();
    assert_eq!(parse("2024-03-09 00:00:00.000Z"), Some(expected));
    assert_eq!(parse("2024-03-09T00:00:00Z"), Some(expected));
    assert_eq!(parse("2024-03-09"), Some(expected));
    assert_eq!(parse("yesterday"), None);
  }
}
