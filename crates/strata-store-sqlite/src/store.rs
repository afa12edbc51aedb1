//! [`SqliteStore`]: the SQLite implementation of [`Store`].

use std::{
  path::{Path, PathBuf},
  sync::{Arc, PoisonError, RwLock},
  time::{Duration, Instant},
};

use rusqlite::{Connection, ErrorCode, TransactionBehavior};
use strata_core::{
  Collection,
  Record,
  RequestInfo,
  external::{ChangeAction, ChangeEvent, ChangeNotifier, FileStore, NoopFileStore, NoopNotifier},
  hooks::{Hooks, Model, ModelEvent},
  store::{ImportSummary, RecordList, RecordQuery, Store},
};
use tracing::{debug, warn};

use crate::{
  Error,
  Result,
  cache::SchemaCache,
  collections,
  files::LocalFileStore,
  migrate::{MigrationsList, Runner},
  records,
  schema::{PRAGMAS, system_migrations},
};

/// VM instructions between deadline checks during reads.
const PROGRESS_STEPS: i32 = 1000;

fn interrupted(err: &Error) -> bool {
  matches!(err, Error::Sqlite(e) if e.sqlite_error_code() == Some(ErrorCode::OperationInterrupted))
}

// ─── Config ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StoreConfig {
  /// Upper bound for read queries; slower ones are interrupted.
  pub query_timeout: Duration,
  /// Root of the local file storage. `None` keeps no files.
  pub storage_dir:   Option<PathBuf>,
}

impl Default for StoreConfig {
  fn default() -> Self { Self { query_timeout: Duration::from_secs(30), storage_dir: None } }
}

// ─── Deferred effects ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
  Create,
  Update,
  Delete,
}

/// Effects collected inside a transaction and run only once it committed.
#[derive(Debug, Default)]
pub(crate) struct AfterCommit {
  models:   Vec<(Phase, Model)>,
  changes:  Vec<ChangeEvent>,
  prefixes: Vec<String>,
  files:    Vec<String>,
}

impl AfterCommit {
  pub fn model(&mut self, phase: Phase, model: Model) { self.models.push((phase, model)); }

  pub fn change(&mut self, action: ChangeAction, record: &Record) {
    self.changes.push(ChangeEvent {
      action,
      collection_id: record.collection_id.clone(),
      record_id: record.id.clone(),
    });
  }

  pub fn delete_prefix(&mut self, prefix: String) { self.prefixes.push(prefix); }

  pub fn delete_file(&mut self, key: String) { self.files.push(key); }

  /// File cleanup, then notifications, then after hooks. File failures are
  /// logged; the first hook failure is returned.
  fn run(self, hooks: &Hooks, files: &dyn FileStore, notifier: &dyn ChangeNotifier) -> Result<()> {
    for prefix in &self.prefixes {
      if let Err(e) = files.delete_prefix(prefix) {
        warn!(prefix = %prefix, error = %e, "failed to delete files");
      }
    }
    for key in &self.files {
      if let Err(e) = files.delete(key) {
        warn!(key = %key, error = %e, "failed to delete file");
      }
    }
    for event in self.changes {
      notifier.notify(event);
    }

    let mut first_error = None;
    for (phase, model) in self.models {
      let hook = match phase {
        Phase::Create => &hooks.model_after_create,
        Phase::Update => &hooks.model_after_update,
        Phase::Delete => &hooks.model_after_delete,
      };
      if let Err(e) = hook.trigger(&mut ModelEvent { model }) {
        first_error.get_or_insert(e);
      }
    }
    match first_error {
      Some(e) => Err(e.into()),
      None => Ok(()),
    }
  }
}

/// What a write closure sees: the open transaction, the schema as of its
/// start, and the deferred effects.
pub(crate) struct Ctx<'a> {
  pub conn:  &'a Connection,
  pub cache: &'a SchemaCache,
  pub hooks: &'a Hooks,
  pub after: &'a mut AfterCommit,
}

impl Ctx<'_> {
  /// Run the before hook of `phase` and hand back the (possibly replaced)
  /// model.
  pub fn before(&self, phase: Phase, model: Model) -> Result<Model> {
    let hook = match phase {
      Phase::Create => &self.hooks.model_before_create,
      Phase::Update => &self.hooks.model_before_update,
      Phase::Delete => &self.hooks.model_before_delete,
    };
    let mut event = ModelEvent { model };
    hook.trigger(&mut event)?;
    Ok(event.model)
  }
}

// ─── Store ───────────────────────────────────────────────────────────────────

/// A strata store backed by a single SQLite file.
///
/// Cloning is cheap; the connection, schema cache and collaborators are
/// reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
  conn:      tokio_rusqlite::Connection,
  cache:     Arc<RwLock<SchemaCache>>,
  hooks:     Arc<Hooks>,
  files:     Arc<dyn FileStore>,
  notifier:  Arc<dyn ChangeNotifier>,
  config:    StoreConfig,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and apply pending system migrations.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    Self::open_with_config(path, StoreConfig::default()).await
  }

  pub async fn open_with_config(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    Self::init(conn, config).await
  }

  /// Open an in-memory store, mostly for tests.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    Self::init(conn, StoreConfig::default()).await
  }

  async fn init(conn: tokio_rusqlite::Connection, config: StoreConfig) -> Result<Self> {
    conn
      .call(|conn| {
        conn.execute_batch(PRAGMAS)?;
        Ok(())
      })
      .await?;

    let files: Arc<dyn FileStore> = match &config.storage_dir {
      Some(dir) => Arc::new(LocalFileStore::new(dir)),
      None => Arc::new(NoopFileStore),
    };
    let store = Self {
      conn,
      cache: Arc::default(),
      hooks: Arc::default(),
      files,
      notifier: Arc::new(NoopNotifier),
      config,
    };
    store.migrate(MigrationsList::new()).await?;
    Ok(store)
  }

  pub fn with_hooks(mut self, hooks: Arc<Hooks>) -> Self {
    self.hooks = hooks;
    self
  }

  pub fn with_file_store(mut self, files: Arc<dyn FileStore>) -> Self {
    self.files = files;
    self
  }

  pub fn with_notifier(mut self, notifier: Arc<dyn ChangeNotifier>) -> Self {
    self.notifier = notifier;
    self
  }

  pub fn config(&self) -> &StoreConfig { &self.config }

  /// Apply the system migrations followed by `list`. Returns the files
  /// applied by this call.
  pub async fn migrate(&self, list: MigrationsList) -> Result<Vec<String>> {
    let applied = self
      .run(move |conn| {
        let mut all = system_migrations();
        all.merge(&list);
        Runner::new(conn, all)?.up()
      })
      .await?;
    self.reload_cache().await?;
    Ok(applied)
  }

  /// Revert the last `n` applied migrations of the system list plus `list`.
  pub async fn migrate_down(&self, list: MigrationsList, n: usize) -> Result<Vec<String>> {
    let reverted = self
      .run(move |conn| {
        let mut all = system_migrations();
        all.merge(&list);
        Runner::new(conn, all)?.down(n)
      })
      .await?;
    self.reload_cache().await?;
    Ok(reverted)
  }

  /// A copy of the current schema.
  pub fn schema(&self) -> SchemaCache {
    self.cache.read().unwrap_or_else(PoisonError::into_inner).clone()
  }

  async fn reload_cache(&self) -> Result<()> {
    let cache = Arc::clone(&self.cache);
    self
      .run(move |conn| {
        // Before the init migration there is nothing to load.
        let has_table = conn
          .prepare("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = '_collections'")?
          .exists([])?;
        let fresh = if has_table { SchemaCache::load(conn)? } else { SchemaCache::default() };
        *cache.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        Ok(())
      })
      .await
  }

  /// Run `f` on the database thread.
  pub(crate) async fn run<T, F>(&self, f: F) -> Result<T>
  where
    F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    T: Send + 'static,
  {
    self.conn.call(move |conn| Ok(f(conn))).await?
  }

  /// Run a read under the configured timeout. The clock starts once the job
  /// reaches the database thread, and a statement still running at the
  /// deadline is interrupted with [`Error::Timeout`].
  pub(crate) async fn read<T, F>(&self, f: F) -> Result<T>
  where
    F: FnOnce(&Connection, &SchemaCache) -> Result<T> + Send + 'static,
    T: Send + 'static,
  {
    let cache = Arc::clone(&self.cache);
    let timeout = self.config.query_timeout;
    self
      .run(move |conn| {
        let schema = cache.read().unwrap_or_else(PoisonError::into_inner).clone();
        let deadline = Instant::now() + timeout;
        conn.progress_handler(PROGRESS_STEPS, Some(move || Instant::now() >= deadline));
        let result = f(conn, &schema);
        conn.progress_handler(0, None::<fn() -> bool>);
        match result {
          Err(e) if interrupted(&e) => {
            warn!(?timeout, "read query timed out");
            Err(Error::Timeout(timeout))
          }
          other => other,
        }
      })
      .await
  }

  /// Run `f` in an immediate transaction, then the deferred effects. The
  /// schema cache is reloaded after commit when `schema_changed`.
  async fn write<T, F>(&self, schema_changed: bool, f: F) -> Result<T>
  where
    F: for<'c> FnOnce(&mut Ctx<'c>) -> Result<T> + Send + 'static,
    T: Send + 'static,
  {
    let cache = Arc::clone(&self.cache);
    let hooks = Arc::clone(&self.hooks);
    let (value, after) = self
      .run(move |conn| {
        let schema = cache.read().unwrap_or_else(PoisonError::into_inner).clone();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut after = AfterCommit::default();
        let value = {
          let mut ctx = Ctx { conn: &tx, cache: &schema, hooks: &hooks, after: &mut after };
          f(&mut ctx)?
        };
        tx.commit()?;
        if schema_changed {
          let fresh = SchemaCache::load(conn)?;
          debug!(collections = fresh.all().len(), "reloaded schema cache");
          *cache.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        }
        Ok((value, after))
      })
      .await?;
    after.run(&self.hooks, &*self.files, &*self.notifier)?;
    Ok(value)
  }

  /// Load a record for a response, with expansions applied for `request`.
  async fn load_record(
    &self,
    collection: String,
    id: String,
    expand: Option<String>,
    request: RequestInfo,
  ) -> Result<Record> {
    self
      .read(move |conn, cache| {
        let collection = records::collection(cache, &collection)?;
        let mut record = records::fetch(conn, cache, collection, &id, None, &request)?
          .ok_or_else(|| strata_core::Error::RecordNotFound(id.clone()))?;
        let query = RecordQuery { expand, ..Default::default() };
        records::expand(
          conn,
          cache,
          &request,
          collection,
          std::slice::from_mut(&mut record),
          &query.expand_paths(),
        )?;
        records::redact(collection, &mut record, &request);
        Ok(record)
      })
      .await
  }
}

impl Store for SqliteStore {
  type Error = Error;

  fn hooks(&self) -> &Hooks { &self.hooks }

  // ── Collections ───────────────────────────────────────────────────────

  async fn find_collection<'a>(&'a self, name_or_id: &'a str) -> Result<Collection> {
    self
      .cache
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .get(name_or_id)
      .cloned()
      .ok_or_else(|| strata_core::Error::CollectionNotFound(name_or_id.to_string()).into())
  }

  async fn list_collections(&self) -> Result<Vec<Collection>> {
    Ok(self.cache.read().unwrap_or_else(PoisonError::into_inner).all().to_vec())
  }

  async fn save_collection(&self, collection: Collection) -> Result<Collection> {
    self.write(true, move |ctx| collections::save(ctx, collection)).await
  }

  async fn delete_collection<'a>(&'a self, name_or_id: &'a str) -> Result<()> {
    let name_or_id = name_or_id.to_string();
    self.write(true, move |ctx| collections::delete(ctx, &name_or_id)).await
  }

  async fn import_collections(
    &self,
    collections: Vec<Collection>,
    delete_missing: bool,
  ) -> Result<ImportSummary> {
    self
      .write(true, move |ctx| collections::import(ctx, collections, delete_missing))
      .await
  }

  // ── Records ───────────────────────────────────────────────────────────

  async fn list_records<'a>(
    &'a self,
    collection: &'a str,
    query: RecordQuery,
    request: RequestInfo,
  ) -> Result<RecordList> {
    let collection = collection.to_string();
    self
      .read(move |conn, cache| records::list(conn, cache, &collection, &query, &request))
      .await
  }

  async fn view_record<'a>(
    &'a self,
    collection: &'a str,
    id: &'a str,
    expand: Option<String>,
    request: RequestInfo,
  ) -> Result<Record> {
    let (collection, id) = (collection.to_string(), id.to_string());
    self
      .read(move |conn, cache| records::view(conn, cache, &collection, &id, expand, &request))
      .await
  }

  async fn create_record<'a>(
    &'a self,
    collection: &'a str,
    request: RequestInfo,
    expand: Option<String>,
  ) -> Result<Record> {
    let name = collection.to_string();
    let req = request.clone();
    let id = self.write(false, move |ctx| records::create(ctx, &name, &req)).await?;
    self.load_record(collection.to_string(), id, expand, request).await
  }

  async fn update_record<'a>(
    &'a self,
    collection: &'a str,
    id: &'a str,
    request: RequestInfo,
    expand: Option<String>,
  ) -> Result<Record> {
    let (name, record_id) = (collection.to_string(), id.to_string());
    let req = request.clone();
    self.write(false, move |ctx| records::update(ctx, &name, &record_id, &req)).await?;
    self.load_record(collection.to_string(), id.to_string(), expand, request).await
  }

  async fn delete_record<'a>(
    &'a self,
    collection: &'a str,
    id: &'a str,
    request: RequestInfo,
  ) -> Result<()> {
    let (name, id) = (collection.to_string(), id.to_string());
    self.write(false, move |ctx| records::delete(ctx, &name, &id, &request)).await
  }
}
