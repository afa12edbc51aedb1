//! Ordered, named hook chains.
//!
//! Each hook point is a [`Hook<E>`]: handlers run in registration order and
//! may mutate the event. A handler returning [`HookError::Stop`] ends the
//! chain without failing the operation; [`HookError::Failed`] aborts it.

use std::sync::{
  Arc,
  RwLock,
  atomic::{AtomicUsize, Ordering},
};

use crate::{
  Error,
  Result,
  collection::Collection,
  record::Record,
  request::RequestInfo,
};

#[derive(Debug)]
pub enum HookError {
  /// Skip the remaining handlers; the operation proceeds.
  Stop,
  Failed(Box<dyn std::error::Error + Send + Sync>),
}

impl HookError {
  pub fn failed(message: impl Into<String>) -> Self {
    Self::Failed(message.into().into())
  }
}

pub type Handler<E> = Arc<dyn Fn(&mut E) -> Result<(), HookError> + Send + Sync>;

/// Returned by [`Hook::add`]; pass to [`Hook::remove`] to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(usize);

pub struct Hook<E> {
  handlers: RwLock<Vec<(HandlerId, Handler<E>)>>,
  next_id:  AtomicUsize,
}

impl<E> Default for Hook<E> {
  fn default() -> Self {
    Self { handlers: RwLock::new(Vec::new()), next_id: AtomicUsize::new(0) }
  }
}

impl<E> std::fmt::Debug for Hook<E> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Hook").field("handlers", &self.len()).finish()
  }
}

impl<E> Hook<E> {
  pub fn add<F>(&self, handler: F) -> HandlerId
  where
    F: Fn(&mut E) -> Result<(), HookError> + Send + Sync + 'static,
  {
    let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
    self
      .handlers
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .push((id, Arc::new(handler)));
    id
  }

  pub fn remove(&self, id: HandlerId) {
    self
      .handlers
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .retain(|(h, _)| *h != id);
  }

  pub fn len(&self) -> usize {
    self.handlers.read().unwrap_or_else(|e| e.into_inner()).len()
  }

  pub fn is_empty(&self) -> bool { self.len() == 0 }

  /// Run every handler against `event` in order.
  pub fn trigger(&self, event: &mut E) -> Result<()> {
    // Snapshot so handlers may register further handlers.
    let handlers: Vec<Handler<E>> = self
      .handlers
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .iter()
      .map(|(_, h)| Arc::clone(h))
      .collect();

    for handler in handlers {
      match handler(event) {
        Ok(()) => {}
        Err(HookError::Stop) => break,
        Err(HookError::Failed(e)) => return Err(Error::Hook(e)),
      }
    }
    Ok(())
  }
}

// ─── Events ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Model {
  Collection(Box<Collection>),
  Record(Box<Record>),
}

impl Model {
  pub fn table_name(&self) -> &str {
    match self {
      Self::Collection(_) => "_collections",
      Self::Record(r) => &r.collection_name,
    }
  }

  pub fn id(&self) -> &str {
    match self {
      Self::Collection(c) => &c.id,
      Self::Record(r) => &r.id,
    }
  }
}

/// Fired around every persisted create/update/delete.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelEvent {
  pub model: Model,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectionRequestEvent {
  pub collection: Collection,
  pub request:    RequestInfo,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectionsImportEvent {
  pub collections:    Vec<Collection>,
  pub delete_missing: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordRequestEvent {
  pub collection: Collection,
  pub record:     Record,
  pub request:    RequestInfo,
}

/// Fired by the collection synchronizer inside the import transaction,
/// before any change is written.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportSyncEvent {
  pub old: Vec<Collection>,
  pub new: Vec<Collection>,
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// Every hook point of the system.
#[derive(Debug, Default)]
pub struct Hooks {
  pub model_before_create: Hook<ModelEvent>,
  pub model_after_create:  Hook<ModelEvent>,
  pub model_before_update: Hook<ModelEvent>,
  pub model_after_update:  Hook<ModelEvent>,
  pub model_before_delete: Hook<ModelEvent>,
  pub model_after_delete:  Hook<ModelEvent>,

  pub collections_before_import_sync: Hook<ImportSyncEvent>,

  pub collection_before_create_request: Hook<CollectionRequestEvent>,
  pub collection_after_create_request:  Hook<CollectionRequestEvent>,
  pub collection_before_update_request: Hook<CollectionRequestEvent>,
  pub collection_after_update_request:  Hook<CollectionRequestEvent>,
  pub collection_before_delete_request: Hook<CollectionRequestEvent>,
  pub collection_after_delete_request:  Hook<CollectionRequestEvent>,

  pub collections_before_import_request: Hook<CollectionsImportEvent>,
  pub collections_after_import_request:  Hook<CollectionsImportEvent>,

  pub record_before_create_request: Hook<RecordRequestEvent>,
  pub record_after_create_request:  Hook<RecordRequestEvent>,
  pub record_before_update_request: Hook<RecordRequestEvent>,
  pub record_after_update_request:  Hook<RecordRequestEvent>,
  pub record_before_delete_request: Hook<RecordRequestEvent>,
  pub record_after_delete_request:  Hook<RecordRequestEvent>,
}

impl Hooks {
  pub fn new() -> Self { Self::default() }
}
