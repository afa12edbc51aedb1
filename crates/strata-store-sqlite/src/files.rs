//! Local filesystem [`FileStore`] rooted at the configured storage directory.

use std::{
  io,
  path::{Path, PathBuf},
};

use strata_core::external::FileStore;

#[derive(Debug, Clone)]
pub struct LocalFileStore {
  root: PathBuf,
}

impl LocalFileStore {
  pub fn new(root: impl Into<PathBuf>) -> Self { Self { root: root.into() } }

  pub fn root(&self) -> &Path { &self.root }

  fn path(&self, key: &str) -> PathBuf {
    // Keys are `/` separated and never absolute.
    key
      .split('/')
      .filter(|s| !s.is_empty() && *s != "..")
      .fold(self.root.clone(), |p, s| p.join(s))
  }
}

fn ignore_missing(result: io::Result<()>) -> io::Result<()> {
  match result {
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
    other => other,
  }
}

impl FileStore for LocalFileStore {
  fn delete_prefix(&self, prefix: &str) -> io::Result<()> {
    ignore_missing(std::fs::remove_dir_all(self.path(prefix)))
  }

  fn delete(&self, key: &str) -> io::Result<()> {
    ignore_missing(std::fs::remove_file(self.path(key)))
  }

  fn exists(&self, key: &str) -> bool { self.path(key).exists() }
}

#[cfg(test)]
mod tests {
  use strata_core::external::{file_key, record_dir};

  use super::*;

  #[test]
  fn deletes_files_and_prefixes() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalFileStore::new(dir.path());

    let key = file_key("col", "rec", "a.txt");
    std::fs::create_dir_all(dir.path().join("col/rec")).unwrap();
    std::fs::write(dir.path().join("col/rec/a.txt"), b"x").unwrap();
    std::fs::write(dir.path().join("col/rec/b.txt"), b"y").unwrap();
    assert!(store.exists(&key));

    store.delete(&key).unwrap();
    assert!(!store.exists(&key));
    assert!(store.exists("col/rec/b.txt"));

    store.delete_prefix(&record_dir("col", "rec")).unwrap();
    assert!(!dir.path().join("col/rec").exists());
  }

  #[test]
  fn missing_paths_are_not_errors() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalFileStore::new(dir.path());
    store.delete("nope/file").unwrap();
    store.delete_prefix("nope").unwrap();
  }

  #[test]
  fn keys_cannot_escape_the_root() {
    let store = LocalFileStore::new("/srv/storage");
    assert_eq!(store.path("../etc/passwd"), PathBuf::from("/srv/storage/etc/passwd"));
  }
}
