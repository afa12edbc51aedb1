//! Collaborators outside the database: file storage and change notification.
//!
//! Both are invoked only after the owning transaction commits.

use serde::Serialize;

/// Blob storage keyed by `collectionId/recordId/filename`.
pub trait FileStore: Send + Sync {
  /// Delete every object under `prefix`.
  fn delete_prefix(&self, prefix: &str) -> std::io::Result<()>;

  fn delete(&self, key: &str) -> std::io::Result<()>;

  fn exists(&self, key: &str) -> bool;
}

/// Storage prefix of a record's files.
pub fn record_dir(collection_id: &str, record_id: &str) -> String {
  format!("{collection_id}/{record_id}")
}

/// Storage key of one uploaded file.
pub fn file_key(collection_id: &str, record_id: &str, filename: &str) -> String {
  format!("{}/{filename}", record_dir(collection_id, record_id))
}

/// Keys of every generated thumbnail of `filename` for the given sizes.
pub fn thumb_keys(
  collection_id: &str,
  record_id: &str,
  filename: &str,
  thumbs: &[String],
) -> Vec<String> {
  let dir = record_dir(collection_id, record_id);
  thumbs
    .iter()
    .map(|size| format!("{dir}/thumbs_{filename}/{size}_{filename}"))
    .collect()
}

/// File store that keeps nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopFileStore;

impl FileStore for NoopFileStore {
  fn delete_prefix(&self, _: &str) -> std::io::Result<()> { Ok(()) }

  fn delete(&self, _: &str) -> std::io::Result<()> { Ok(()) }

  fn exists(&self, _: &str) -> bool { false }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
  Create,
  Update,
  Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
  pub action:        ChangeAction,
  pub collection_id: String,
  pub record_id:     String,
}

/// Receives committed record changes (e.g. for realtime subscriptions).
pub trait ChangeNotifier: Send + Sync {
  fn notify(&self, event: ChangeEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl ChangeNotifier for NoopNotifier {
  fn notify(&self, _: ChangeEvent) {}
}
