//! Per-request context visible to access rules as `@request.*`.

use serde_json::{Map, Value};

use crate::record::Record;

/// Who is making the request.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Auth {
  #[default]
  Guest,
  Admin {
    id: String,
  },
  Record(Box<Record>),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestInfo {
  pub method:  String,
  /// Query string parameters.
  pub query:   Map<String, Value>,
  /// Submitted body. `name+`/`name-` modifier keys are applied by the store.
  pub data:    Map<String, Value>,
  /// Header names are lowercased with `-` replaced by `_`.
  pub headers: Map<String, Value>,
  pub auth:    Auth,
}

impl RequestInfo {
  pub fn admin() -> Self {
    Self { auth: Auth::Admin { id: String::from("admin") }, ..Default::default() }
  }

  pub fn guest() -> Self { Self::default() }

  pub fn with_auth_record(record: Record) -> Self {
    Self { auth: Auth::Record(Box::new(record)), ..Default::default() }
  }

  pub fn with_data(mut self, data: Map<String, Value>) -> Self {
    self.data = data;
    self
  }

  pub fn with_query(mut self, query: Map<String, Value>) -> Self {
    self.query = query;
    self
  }

  pub fn with_method(mut self, method: impl Into<String>) -> Self {
    self.method = method.into();
    self
  }

  pub fn is_admin(&self) -> bool { matches!(self.auth, Auth::Admin { .. }) }

  pub fn auth_record(&self) -> Option<&Record> {
    match &self.auth {
      Auth::Record(r) => Some(r),
      _ => None,
    }
  }

  /// Normalise a header name to its `@request.headers.*` key.
  pub fn header_key(name: &str) -> String {
    name.to_ascii_lowercase().replace('-', "_")
  }
}
