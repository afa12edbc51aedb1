//! Ordered, named migrations tracked in the `_migrations` ledger.
//!
//! The registered list is kept sorted by file name, and that order (not the
//! order in which migrations happened to be applied) decides what [`Runner::up`]
//! runs next. Every migration commits in its own transaction, so a failure
//! leaves the earlier ones applied and names the one that broke.

use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension as _};
use tracing::info;

use crate::{Error, Result, schema::MIGRATIONS_TABLE};

pub type MigrationFn = Arc<dyn Fn(&Connection) -> Result<()> + Send + Sync>;

#[derive(Clone)]
pub struct Migration {
  pub file: String,
  up:       MigrationFn,
  down:     Option<MigrationFn>,
}

impl std::fmt::Debug for Migration {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Migration")
      .field("file", &self.file)
      .field("reversible", &self.down.is_some())
      .finish()
  }
}

#[derive(Debug, Clone, Default)]
pub struct MigrationsList {
  items: Vec<Migration>,
}

impl MigrationsList {
  pub fn new() -> Self { Self::default() }

  /// Register a migration without a down step.
  pub fn register<U>(&mut self, file: impl Into<String>, up: U)
  where
    U: Fn(&Connection) -> Result<()> + Send + Sync + 'static,
  {
    self.insert(Migration { file: file.into(), up: Arc::new(up), down: None });
  }

  pub fn register_reversible<U, D>(&mut self, file: impl Into<String>, up: U, down: D)
  where
    U: Fn(&Connection) -> Result<()> + Send + Sync + 'static,
    D: Fn(&Connection) -> Result<()> + Send + Sync + 'static,
  {
    self.insert(Migration {
      file: file.into(),
      up:   Arc::new(up),
      down: Some(Arc::new(down)),
    });
  }

  /// Append every migration of `other`.
  pub fn merge(&mut self, other: &MigrationsList) {
    for m in &other.items {
      self.insert(m.clone());
    }
  }

  pub fn items(&self) -> &[Migration] { &self.items }

  pub fn len(&self) -> usize { self.items.len() }

  pub fn is_empty(&self) -> bool { self.items.is_empty() }

  fn get(&self, file: &str) -> Option<&Migration> { self.items.iter().find(|m| m.file == file) }

  fn insert(&mut self, migration: Migration) {
    match self.items.binary_search_by(|m| m.file.as_str().cmp(&migration.file)) {
      Ok(i) => self.items[i] = migration,
      Err(i) => self.items.insert(i, migration),
    }
  }
}

// ─── Runner ──────────────────────────────────────────────────────────────────

pub struct Runner<'c> {
  conn: &'c mut Connection,
  list: MigrationsList,
}

impl<'c> Runner<'c> {
  /// Bind `list` to `conn`, creating the ledger table if needed.
  pub fn new(conn: &'c mut Connection, list: MigrationsList) -> Result<Self> {
    conn.execute_batch(&format!(
      "CREATE TABLE IF NOT EXISTS `{MIGRATIONS_TABLE}` (file VARCHAR(255) PRIMARY KEY NOT NULL, applied INTEGER NOT NULL)"
    ))?;
    Ok(Self { conn, list })
  }

  pub fn list(&self) -> &MigrationsList { &self.list }

  /// Apply every registered migration not yet in the ledger.
  pub fn up(&mut self) -> Result<Vec<String>> {
    let mut applied = Vec::new();
    for migration in self.list.items.clone() {
      if self.is_applied(&migration.file)? {
        continue;
      }
      let tx = self.conn.transaction()?;
      (migration.up)(&*tx).map_err(|e| Error::Migration {
        file:   migration.file.clone(),
        source: Box::new(e),
      })?;
      record_applied(&tx, &migration.file)?;
      tx.commit()?;
      info!(file = %migration.file, "applied migration");
      applied.push(migration.file);
    }
    Ok(applied)
  }

  /// Revert the last `n` applied migrations, newest first.
  pub fn down(&mut self, n: usize) -> Result<Vec<String>> {
    let mut reverted = Vec::new();
    for file in self.applied()?.into_iter().take(n) {
      let down = self
        .list
        .get(&file)
        .and_then(|m| m.down.clone())
        .ok_or_else(|| Error::MissingDown(file.clone()))?;

      let tx = self.conn.transaction()?;
      down(&*tx).map_err(|e| Error::Migration { file: file.clone(), source: Box::new(e) })?;
      tx.execute(
        &format!("DELETE FROM `{MIGRATIONS_TABLE}` WHERE file = ?1"),
        rusqlite::params![file],
      )?;
      tx.commit()?;
      info!(file = %file, "reverted migration");
      reverted.push(file);
    }
    Ok(reverted)
  }

  /// Forget ledger entries whose migration is no longer registered. Their
  /// down step is not run.
  pub fn remove_missing_applied(&mut self) -> Result<Vec<String>> {
    let missing: Vec<String> = self
      .applied()?
      .into_iter()
      .filter(|file| self.list.get(file).is_none())
      .collect();
    for file in &missing {
      self.conn.execute(
        &format!("DELETE FROM `{MIGRATIONS_TABLE}` WHERE file = ?1"),
        rusqlite::params![file],
      )?;
      info!(file = %file, "removed missing migration from ledger");
    }
    Ok(missing)
  }

  /// Applied migration files, most recently applied first.
  pub fn applied(&self) -> Result<Vec<String>> {
    let mut stmt = self.conn.prepare(&format!(
      "SELECT file FROM `{MIGRATIONS_TABLE}` ORDER BY applied DESC, rowid DESC"
    ))?;
    let files = stmt
      .query_map([], |r| r.get::<_, String>(0))?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(files)
  }

  pub fn is_applied(&self, file: &str) -> Result<bool> {
    let found = self
      .conn
      .query_row(
        &format!("SELECT 1 FROM `{MIGRATIONS_TABLE}` WHERE file = ?1"),
        rusqlite::params![file],
        |_| Ok(()),
      )
      .optional()?;
    Ok(found.is_some())
  }

  /// Mark `file` as applied without running it.
  pub fn mark_applied(&self, file: &str) -> Result<()> { record_applied(&*self.conn, file) }
}

fn record_applied(conn: &Connection, file: &str) -> Result<()> {
  conn.execute(
    &format!("INSERT INTO `{MIGRATIONS_TABLE}` (file, applied) VALUES (?1, ?2)"),
    rusqlite::params![file, chrono::Utc::now().timestamp_micros()],
  )?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use std::sync::Mutex;

  use super::*;

  type Calls = Arc<Mutex<Vec<String>>>;

  fn tracked(list: &mut MigrationsList, calls: &Calls, file: &str, name: &str) {
    let up_calls = Arc::clone(calls);
    let down_calls = Arc::clone(calls);
    let up_name = format!("up{name}");
    let down_name = format!("down{name}");
    list.register_reversible(
      file,
      move |_| {
        up_calls.lock().unwrap().push(up_name.clone());
        Ok(())
      },
      move |_| {
        down_calls.lock().unwrap().push(down_name.clone());
        Ok(())
      },
    );
  }

  #[test]
  fn runner_creates_the_ledger() {
    let mut conn = Connection::open_in_memory().unwrap();
    let runner = Runner::new(&mut conn, MigrationsList::new()).unwrap();
    assert!(runner.applied().unwrap().is_empty());
    drop(runner);

    let exists: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = '_migrations'",
        [],
        |r| r.get(0),
      )
      .unwrap();
    assert_eq!(exists, 1);
  }

  #[test]
  fn up_runs_in_registered_order_and_down_in_applied_order() {
    let calls: Calls = Arc::default();
    let mut list = MigrationsList::new();
    tracked(&mut list, &calls, "2_test", "2");
    tracked(&mut list, &calls, "3_test", "3");
    tracked(&mut list, &calls, "1_test", "1");

    let mut conn = Connection::open_in_memory().unwrap();
    let mut runner = Runner::new(&mut conn, list).unwrap();

    // Out of order: 2 was applied before 1 existed.
    runner.mark_applied("2_test").unwrap();

    let applied = runner.up().unwrap();
    assert_eq!(applied, vec!["1_test", "3_test"]);
    assert_eq!(*calls.lock().unwrap(), vec!["up1", "up3"]);

    calls.lock().unwrap().clear();
    let reverted = runner.down(2).unwrap();
    assert_eq!(reverted, vec!["3_test", "1_test"]);
    assert_eq!(*calls.lock().unwrap(), vec!["down3", "down1"]);
    assert_eq!(runner.applied().unwrap(), vec!["2_test"]);
  }

  #[test]
  fn down_without_a_down_step_fails() {
    let mut list = MigrationsList::new();
    list.register("1_once", |_| Ok(()));

    let mut conn = Connection::open_in_memory().unwrap();
    let mut runner = Runner::new(&mut conn, list).unwrap();
    runner.up().unwrap();

    let err = runner.down(1).unwrap_err();
    assert!(matches!(err, Error::MissingDown(ref f) if f == "1_once"));
    assert!(runner.is_applied("1_once").unwrap());
  }

  #[test]
  fn failed_migration_keeps_earlier_ones() {
    let mut list = MigrationsList::new();
    list.register("1_ok", |conn| {
      conn.execute_batch("CREATE TABLE ok (id INTEGER)")?;
      Ok(())
    });
    list.register("2_broken", |conn| {
      conn.execute_batch("CREATE TABLE broken (id INTEGER); SELECT * FROM nope;")?;
      Ok(())
    });

    let mut conn = Connection::open_in_memory().unwrap();
    let mut runner = Runner::new(&mut conn, list).unwrap();
    let err = runner.up().unwrap_err();
    assert!(matches!(err, Error::Migration { ref file, .. } if file == "2_broken"));
    assert_eq!(runner.applied().unwrap(), vec!["1_ok"]);
    drop(runner);

    let broken: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE name = 'broken'",
        [],
        |r| r.get(0),
      )
      .unwrap();
    assert_eq!(broken, 0);
  }

  #[test]
  fn missing_applied_migrations_are_forgotten() {
    let calls: Calls = Arc::default();
    let mut list = MigrationsList::new();
    tracked(&mut list, &calls, "1_test", "1");
    tracked(&mut list, &calls, "2_test", "2");
    tracked(&mut list, &calls, "3_test", "3");

    let mut conn = Connection::open_in_memory().unwrap();
    {
      let mut runner = Runner::new(&mut conn, list).unwrap();
      runner.up().unwrap();
      assert!(runner.is_applied("2_test").unwrap());
    }

    let mut trimmed = MigrationsList::new();
    tracked(&mut trimmed, &calls, "1_test", "1");
    tracked(&mut trimmed, &calls, "3_test", "3");
    calls.lock().unwrap().clear();

    let mut runner = Runner::new(&mut conn, trimmed).unwrap();
    assert_eq!(runner.remove_missing_applied().unwrap(), vec!["2_test"]);
    assert!(!runner.is_applied("2_test").unwrap());
    assert!(calls.lock().unwrap().is_empty());
  }
}
