//! Integration tests for `SqliteStore` against an in-memory database.

use std::{
  sync::{
    Arc,
    Mutex,
    atomic::{AtomicUsize, Ordering},
  },
  time::Duration,
};

use serde_json::{Map, Value, json};
use strata_core::{
  Classify,
  Collection,
  CollectionType,
  ErrorKind,
  Field,
  FieldOptions,
  FieldType,
  Record,
  RequestInfo,
  collection::{AuthOptions, CollectionOptions, ViewOptions},
  external::{ChangeAction, ChangeEvent, ChangeNotifier},
  field::{RelationOptions, SelectOptions},
  hooks::{HookError, Hooks, Model},
  store::{RecordQuery, Store},
};

use crate::{Error, MigrationsList, SqliteStore, StoreConfig};

async fn store() -> SqliteStore {
  SqliteStore::open_in_memory()
    .await
    .expect("in-memory store")
}

fn body(value: Value) -> Map<String, Value> { value.as_object().cloned().unwrap_or_default() }

fn base(name: &str, fields: Vec<Field>) -> Collection {
  let mut c = Collection::new(name, CollectionType::Base);
  for field in fields {
    c.schema.add_field(field);
  }
  c
}

fn public(mut c: Collection) -> Collection {
  c.list_rule = Some(String::new());
  c.view_rule = Some(String::new());
  c.create_rule = Some(String::new());
  c.update_rule = Some(String::new());
  c.delete_rule = Some(String::new());
  c
}

fn relation(name: &str, target: &str, max: Option<usize>, cascade: bool) -> Field {
  Field::new(name, FieldType::Relation).with_options(FieldOptions::Relation(RelationOptions {
    collection_id: target.to_string(),
    cascade_delete: cascade,
    max_select: max,
    ..Default::default()
  }))
}

fn tags_field() -> Field {
  Field::new("tags", FieldType::Select).with_options(FieldOptions::Select(SelectOptions {
    max_select: 3,
    values:     vec!["a".into(), "b".into(), "c".into()],
  }))
}

fn view(name: &str, query: &str) -> Collection {
  let mut c = Collection::new(name, CollectionType::View);
  c.options = CollectionOptions::View(ViewOptions { query: query.to_string() });
  c
}

async fn add(s: &SqliteStore, collection: &str, data: Value) -> Record {
  s.create_record(collection, RequestInfo::admin().with_data(body(data)), None)
    .await
    .unwrap()
}

async fn sql_text(s: &SqliteStore, sql: &'static str) -> Option<String> {
  s.run(move |conn| {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([])?;
    Ok(match rows.next()? {
      Some(row) => row.get::<_, Option<String>>(0)?,
      None => None,
    })
  })
  .await
  .unwrap()
}

async fn column_names(s: &SqliteStore, table: &'static str) -> Vec<String> {
  s.run(move |conn| {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info(`{table}`)"))?;
    let names = stmt
      .query_map([], |r| r.get::<_, String>(1))?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names)
  })
  .await
  .unwrap()
}

fn validation_code(err: &Error, path: &str) -> Option<String> {
  err.validation_errors().and_then(|e| e.code_at(path)).map(str::to_string)
}

// ─── Collections ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn create_collection_builds_table_and_row() {
  let s = store().await;
  let saved = s
    .save_collection(base("posts", vec![
      Field::new("title", FieldType::Text).required(),
      Field::new("views", FieldType::Number),
      tags_field(),
    ]))
    .await
    .unwrap();

  assert_eq!(saved.id.len(), 15);
  assert!(saved.schema.fields().iter().all(|f| !f.id.is_empty()));
  assert_eq!(column_names(&s, "posts").await, vec![
    "id", "created", "updated", "title", "views", "tags"
  ]);

  let schema = sql_text(&s, "SELECT schema FROM _collections WHERE name = 'posts'").await.unwrap();
  let schema: Value = serde_json::from_str(&schema).unwrap();
  assert_eq!(schema[0]["name"], "title");
  assert_eq!(schema[0]["type"], "text");
  assert_eq!(schema[2]["options"]["maxSelect"], 3);

  let found = s.find_collection("POSTS").await.unwrap();
  assert_eq!(found.id, saved.id);
  assert_eq!(s.find_collection(&saved.id).await.unwrap().name, "posts");
}

#[tokio::test]
async fn auth_collections_get_auth_columns_and_indexes() {
  let s = store().await;
  let users = s.save_collection(Collection::new("users", CollectionType::Auth)).await.unwrap();

  let columns = column_names(&s, "users").await;
  for column in ["username", "email", "emailVisibility", "verified", "tokenKey", "passwordHash"] {
    assert!(columns.iter().any(|c| c == column), "missing {column}");
  }
  let indexes = s
    .run(|conn| {
      let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND tbl_name = 'users'",
        [],
        |r| r.get(0),
      )?;
      Ok(n)
    })
    .await
    .unwrap();
  assert!(indexes >= 3, "auth indexes of {}", users.name);
}

#[tokio::test]
async fn auth_fields_cannot_reuse_reserved_names() {
  let s = store().await;
  let mut users = Collection::new("users", CollectionType::Auth);
  users.schema.add_field(Field::new("email", FieldType::Text));
  let err = s.save_collection(users).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Validation);
  assert_eq!(
    validation_code(&err, "schema.0.name").as_deref(),
    Some("validation_reserved_auth_field_name")
  );
  assert!(s.find_collection("users").await.is_err());
}

#[tokio::test]
async fn failing_index_is_reported_and_nothing_changes() {
  let s = store().await;
  let mut posts = base("posts", vec![Field::new("title", FieldType::Text)]);
  posts.indexes = vec![
    "CREATE INDEX idx_title ON posts (title)".into(),
    "CREATE INDEX idx_bad ON posts (missing)".into(),
  ];
  let err = s.save_collection(posts).await.unwrap_err();
  assert_eq!(
    validation_code(&err, "indexes.1").as_deref(),
    Some("validation_invalid_index_expression")
  );
  assert!(validation_code(&err, "indexes.0").is_none());

  assert!(s.find_collection("posts").await.is_err());
  assert!(sql_text(&s, "SELECT name FROM sqlite_master WHERE name = 'posts'").await.is_none());
}

#[tokio::test]
async fn rename_keeps_data_and_ids() {
  let s = store().await;
  let posts = s
    .save_collection(base("posts", vec![Field::new("title", FieldType::Text)]))
    .await
    .unwrap();
  let record = add(&s, "posts", json!({"title": "hello"})).await;

  let mut renamed = posts.clone();
  renamed.name = "articles".into();
  renamed.schema.fields_mut()[0].name = "headline".into();
  let saved = s.save_collection(renamed).await.unwrap();

  assert_eq!(saved.id, posts.id);
  assert_eq!(saved.schema.fields()[0].id, posts.schema.fields()[0].id);
  assert!(sql_text(&s, "SELECT name FROM sqlite_master WHERE name = 'posts'").await.is_none());

  let fetched = s
    .view_record("articles", &record.id, None, RequestInfo::admin())
    .await
    .unwrap();
  assert_eq!(fetched.data["headline"], "hello");
  assert!(!fetched.data.contains_key("title"));
}

#[tokio::test]
async fn type_change_is_rejected() {
  let s = store().await;
  let posts = s
    .save_collection(base("posts", vec![Field::new("title", FieldType::Text)]))
    .await
    .unwrap();
  let mut changed = posts.clone();
  changed.options = CollectionOptions::Auth(AuthOptions::default());
  let err = s.save_collection(changed).await.unwrap_err();
  assert_eq!(validation_code(&err, "type").as_deref(), Some("validation_collection_type_change"));
}

#[tokio::test]
async fn referenced_collection_cannot_be_deleted() {
  let hooks = Arc::new(Hooks::new());
  let calls = Arc::new(AtomicUsize::new(0));
  let seen = Arc::clone(&calls);
  hooks.model_before_delete.add(move |_| {
    seen.fetch_add(1, Ordering::SeqCst);
    Ok(())
  });
  let s = store().await.with_hooks(hooks);

  let people = s
    .save_collection(base("people", vec![Field::new("name", FieldType::Text)]))
    .await
    .unwrap();
  s.save_collection(base("posts", vec![relation("author", &people.id, Some(1), false)]))
    .await
    .unwrap();

  let err = s.delete_collection("people").await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::BadRequest);
  assert_eq!(calls.load(Ordering::SeqCst), 0);
  assert!(s.find_collection("people").await.is_ok());

  s.delete_collection("posts").await.unwrap();
  s.delete_collection("people").await.unwrap();
  assert_eq!(calls.load(Ordering::SeqCst), 2);
  assert!(sql_text(&s, "SELECT name FROM sqlite_master WHERE name = 'people'").await.is_none());
}

#[tokio::test]
async fn system_collections_cannot_be_deleted() {
  let s = store().await;
  let mut c = base("settings", vec![Field::new("key", FieldType::Text)]);
  c.system = true;
  s.save_collection(c).await.unwrap();
  let err = s.delete_collection("settings").await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::BadRequest);
}

// ─── Views ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn view_collections_derive_schema_and_ddl() {
  let s = store().await;
  s.save_collection(base("posts", vec![
    Field::new("title", FieldType::Text),
    Field::new("views", FieldType::Number),
  ]))
  .await
  .unwrap();
  add(&s, "posts", json!({"title": "a", "views": 3})).await;

  let mut titles = view("titles", "SELECT id, title FROM posts");
  titles.list_rule = Some(String::new());
  let saved = s.save_collection(titles).await.unwrap();
  assert_eq!(saved.schema.len(), 1);
  assert_eq!(saved.schema.fields()[0].field_type(), FieldType::Text);

  let ddl = sql_text(&s, "SELECT sql FROM sqlite_master WHERE name = 'titles'").await.unwrap();
  assert!(ddl.ends_with("AS SELECT * FROM (SELECT id, title FROM posts)"), "{ddl}");

  let counts = view("counts", "SELECT views AS id, title FROM posts");
  s.save_collection(counts).await.unwrap();
  let ddl = sql_text(&s, "SELECT sql FROM sqlite_master WHERE name = 'counts'").await.unwrap();
  assert!(
    ddl.contains("SELECT cast(`id` as text) `id`,`title` FROM (SELECT views AS id, title FROM posts)"),
    "{ddl}"
  );

  let list = s
    .list_records("titles", RecordQuery::default(), RequestInfo::guest())
    .await
    .unwrap();
  assert_eq!(list.items.len(), 1);
  assert_eq!(list.items[0].data["title"], "a");
}

#[tokio::test]
async fn views_are_read_only_and_reject_bad_queries() {
  let s = store().await;
  s.save_collection(base("posts", vec![Field::new("title", FieldType::Text)]))
    .await
    .unwrap();

  let err = s.save_collection(view("broken", "SELECT title FROM posts")).await.unwrap_err();
  assert_eq!(validation_code(&err, "options.query").as_deref(), Some("validation_invalid_view_query"));

  s.save_collection(view("titles", "SELECT id, title FROM posts")).await.unwrap();
  let err = s
    .create_record("titles", RequestInfo::admin().with_data(body(json!({"title": "x"}))), None)
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::BadRequest);
}

#[tokio::test]
async fn renames_leave_dependent_view_queries_untouched() {
  let s = store().await;
  let posts = s
    .save_collection(base("posts", vec![Field::new("title", FieldType::Text)]))
    .await
    .unwrap();
  add(&s, "posts", json!({"title": "kept"})).await;
  s.save_collection(view("labels", "SELECT id, 'title' AS label FROM posts")).await.unwrap();

  // The view does not read the column, so the rename goes through and the
  // literal inside the query survives.
  let mut renamed = posts.clone();
  renamed.schema.fields_mut()[0].name = "heading".into();
  let posts = s.save_collection(renamed).await.unwrap();

  let labels = s.find_collection("labels").await.unwrap();
  assert_eq!(labels.view_query(), Some("SELECT id, 'title' AS label FROM posts"));
  let list = s
    .list_records("labels", RecordQuery::default(), RequestInfo::admin())
    .await
    .unwrap();
  assert_eq!(list.items[0].data["label"], "title");

  // A view that reads the column blocks renaming it again.
  s.save_collection(view("headings", "SELECT p.id, p.heading AS h FROM posts p")).await.unwrap();
  let mut renamed = posts.clone();
  renamed.schema.fields_mut()[0].name = "subject".into();
  let err = s.save_collection(renamed).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::BadRequest);

  let headings = s.find_collection("headings").await.unwrap();
  assert_eq!(headings.view_query(), Some("SELECT p.id, p.heading AS h FROM posts p"));
  let stored = s.find_collection("posts").await.unwrap();
  assert_eq!(stored.schema.fields()[0].name, "heading");
  assert!(column_names(&s, "posts").await.contains(&"heading".to_string()));

  // So does renaming the table the views read from.
  let mut moved = posts.clone();
  moved.name = "articles".into();
  let err = s.save_collection(moved).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::BadRequest);
  assert!(s.find_collection("posts").await.is_ok());

  let err = s.delete_collection("posts").await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::BadRequest);
}

// ─── Import ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn import_creates_updates_and_deletes() {
  let s = store().await;
  let old = s
    .save_collection(base("old", vec![Field::new("a", FieldType::Text)]))
    .await
    .unwrap();
  let keep = s
    .save_collection(base("keep", vec![Field::new("a", FieldType::Text)]))
    .await
    .unwrap();

  let mut updated = keep.clone();
  updated.schema.add_field(Field::new("b", FieldType::Bool));
  let fresh = base("fresh", vec![Field::new("c", FieldType::Number)]);
  let summary = s
    .import_collections(vec![updated, fresh, view("keep_view", "SELECT id, a FROM keep")], true)
    .await
    .unwrap();

  assert_eq!(summary.deleted, vec![old.id]);
  assert_eq!(summary.updated, vec![keep.id]);
  assert_eq!(summary.created.len(), 2);
  assert!(s.find_collection("old").await.is_err());
  assert!(s.find_collection("keep_view").await.is_ok());
  assert_eq!(column_names(&s, "keep").await, vec!["id", "created", "updated", "a", "b"]);
}

#[tokio::test]
async fn import_reports_the_failing_collection() {
  let s = store().await;
  let err = s
    .import_collections(vec![base("ok", vec![Field::new("a", FieldType::Text)]), base("bad", vec![])], false)
    .await
    .unwrap_err();
  assert_eq!(
    validation_code(&err, "collections").as_deref(),
    Some("collections_import_validate_failure")
  );
  assert!(s.find_collection("ok").await.is_err());

  let err = s.import_collections(vec![], false).await.unwrap_err();
  assert_eq!(validation_code(&err, "collections").as_deref(), Some("validation_required"));
}

#[tokio::test]
async fn import_cannot_delete_system_collections() {
  let s = store().await;
  let mut system = base("settings", vec![Field::new("key", FieldType::Text)]);
  system.system = true;
  s.save_collection(system).await.unwrap();

  let err = s
    .import_collections(vec![base("other", vec![Field::new("a", FieldType::Text)])], true)
    .await
    .unwrap_err();
  assert_eq!(validation_code(&err, "collections").as_deref(), Some("collections_import_failure"));
  assert!(s.find_collection("settings").await.is_ok());
}

#[tokio::test]
async fn failing_sync_hook_rolls_back_the_import() {
  let hooks = Arc::new(Hooks::new());
  hooks.collections_before_import_sync.add(|_| Err(HookError::failed("sync refused")));
  let s = store().await.with_hooks(hooks);

  let err = s
    .import_collections(vec![base("posts", vec![Field::new("a", FieldType::Text)])], false)
    .await
    .unwrap_err();
  assert_eq!(validation_code(&err, "collections").as_deref(), Some("collections_import_failure"));
  assert!(s.find_collection("posts").await.is_err());
  assert!(sql_text(&s, "SELECT name FROM sqlite_master WHERE name = 'posts'").await.is_none());
}

// ─── Records ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn create_normalizes_and_validates_values() {
  let s = store().await;
  s.save_collection(public(base("posts", vec![
    Field::new("title", FieldType::Text).required(),
    Field::new("views", FieldType::Number),
    Field::new("draft", FieldType::Bool),
    tags_field(),
  ])))
  .await
  .unwrap();

  let record = add(&s, "posts", json!({"title": "t", "views": "4", "draft": "true", "tags": ["a", "a", "b"]}))
    .await;
  assert_eq!(record.id.len(), 15);
  assert_eq!(record.data["views"], 4);
  assert_eq!(record.data["draft"], true);
  assert_eq!(record.data["tags"], json!(["a", "b"]));

  let err = s
    .create_record("posts", RequestInfo::guest().with_data(body(json!({"tags": ["z"]}))), None)
    .await
    .unwrap_err();
  assert_eq!(validation_code(&err, "title").as_deref(), Some("validation_required"));
  assert_eq!(validation_code(&err, "tags").as_deref(), Some("validation_invalid_value"));
}

#[tokio::test]
async fn custom_ids_are_checked() {
  let s = store().await;
  s.save_collection(base("posts", vec![Field::new("title", FieldType::Text)]))
    .await
    .unwrap();
  let record = add(&s, "posts", json!({"id": "abcdefghijklmno", "title": "x"})).await;
  assert_eq!(record.id, "abcdefghijklmno");

  let err = s
    .create_record(
      "posts",
      RequestInfo::admin().with_data(body(json!({"id": "abcdefghijklmno"}))),
      None,
    )
    .await
    .unwrap_err();
  assert!(validation_code(&err, "id").is_some());
}

#[tokio::test]
async fn modifiers_apply_to_numbers_and_lists() {
  let s = store().await;
  s.save_collection(base("posts", vec![Field::new("views", FieldType::Number), tags_field()]))
    .await
    .unwrap();
  let record = add(&s, "posts", json!({"views": 1, "tags": ["a"]})).await;

  let updated = s
    .update_record(
      "posts",
      &record.id,
      RequestInfo::admin().with_data(body(json!({"views+": 2, "tags+": ["b", "c"], "tags-": "a"}))),
      None,
    )
    .await
    .unwrap();
  assert_eq!(updated.data["views"], 3);
  assert_eq!(updated.data["tags"], json!(["b", "c"]));
}

#[tokio::test]
async fn unique_fields_reject_duplicates() {
  let s = store().await;
  s.save_collection(base("posts", vec![Field::new("slug", FieldType::Text).unique()]))
    .await
    .unwrap();
  add(&s, "posts", json!({"slug": "one"})).await;
  let err = s
    .create_record("posts", RequestInfo::admin().with_data(body(json!({"slug": "one"}))), None)
    .await
    .unwrap_err();
  assert_eq!(validation_code(&err, "slug").as_deref(), Some("validation_not_unique"));

  let index = sql_text(&s, "SELECT sql FROM sqlite_master WHERE type = 'index' AND name LIKE '%_unique'")
    .await
    .unwrap();
  assert!(index.contains("WHERE `slug` != ''"), "{index}");
  let raw = s
    .run(|conn| {
      conn.execute_batch("INSERT INTO posts (id, slug) VALUES ('aaaaaaaaaaaaaaa', 'one')")?;
      Ok(())
    })
    .await;
  assert!(raw.is_err());
  add(&s, "posts", json!({})).await;
  add(&s, "posts", json!({})).await;
}

#[tokio::test]
async fn missing_relation_targets_are_rejected() {
  let s = store().await;
  let people = s
    .save_collection(base("people", vec![Field::new("name", FieldType::Text)]))
    .await
    .unwrap();
  s.save_collection(base("posts", vec![relation("author", &people.id, Some(1), false)]))
    .await
    .unwrap();
  let err = s
    .create_record("posts", RequestInfo::admin().with_data(body(json!({"author": "nope"}))), None)
    .await
    .unwrap_err();
  assert_eq!(validation_code(&err, "author").as_deref(), Some("validation_missing_rel_records"));
}

// ─── Rules ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn nil_rules_are_admin_only() {
  let s = store().await;
  s.save_collection(base("posts", vec![Field::new("title", FieldType::Text)]))
    .await
    .unwrap();
  let err = s
    .list_records("posts", RecordQuery::default(), RequestInfo::guest())
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Forbidden);

  let err = s
    .create_record("posts", RequestInfo::guest().with_data(body(json!({"title": "x"}))), None)
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Forbidden);

  assert!(s.list_records("posts", RecordQuery::default(), RequestInfo::admin()).await.is_ok());
}

#[tokio::test]
async fn list_combines_rule_filter_sort_and_pages() {
  let s = store().await;
  let mut posts = base("posts", vec![Field::new("views", FieldType::Number)]);
  posts.list_rule = Some("views > 1".into());
  s.save_collection(posts).await.unwrap();
  for views in 0..6 {
    add(&s, "posts", json!({"views": views})).await;
  }

  let all = s
    .list_records("posts", RecordQuery::default(), RequestInfo::guest())
    .await
    .unwrap();
  assert_eq!(all.total_items, 4);

  let query = RecordQuery {
    filter: Some("views < 5".into()),
    sort: Some("-views".into()),
    per_page: Some(2),
    page: Some(1),
    ..Default::default()
  };
  let page = s.list_records("posts", query, RequestInfo::guest()).await.unwrap();
  assert_eq!(page.total_items, 3);
  assert_eq!(page.total_pages, 2);
  let views: Vec<_> = page.items.iter().map(|r| r.data["views"].clone()).collect();
  assert_eq!(views, vec![json!(4), json!(3)]);

  let query = RecordQuery { skip_total: true, ..Default::default() };
  let skipped = s.list_records("posts", query, RequestInfo::guest()).await.unwrap();
  assert_eq!(skipped.total_items, -1);
  assert_eq!(skipped.total_pages, -1);
}

#[tokio::test]
async fn user_filters_cannot_reach_other_collections() {
  let s = store().await;
  s.save_collection(public(base("posts", vec![Field::new("title", FieldType::Text)])))
    .await
    .unwrap();
  let query = RecordQuery { filter: Some("@collection.posts.title = 'x'".into()), ..Default::default() };
  let err = s.list_records("posts", query, RequestInfo::guest()).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::InvalidFilter);
}

#[tokio::test]
async fn failed_create_rule_rolls_back() {
  let s = store().await;
  let mut posts = base("posts", vec![Field::new("title", FieldType::Text)]);
  posts.create_rule = Some("title = 'ok'".into());
  s.save_collection(posts).await.unwrap();

  let err = s
    .create_record("posts", RequestInfo::guest().with_data(body(json!({"title": "bad"}))), None)
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::BadRequest);

  s.create_record("posts", RequestInfo::guest().with_data(body(json!({"title": "ok"}))), None)
    .await
    .unwrap();
  let list = s
    .list_records("posts", RecordQuery::default(), RequestInfo::admin())
    .await
    .unwrap();
  assert_eq!(list.total_items, 1);
}

#[tokio::test]
async fn rule_mismatch_on_view_is_not_found() {
  let s = store().await;
  let mut posts = base("posts", vec![Field::new("title", FieldType::Text)]);
  posts.view_rule = Some("title = 'public'".into());
  s.save_collection(posts).await.unwrap();
  let hidden = add(&s, "posts", json!({"title": "secret"})).await;

  let err = s
    .view_record("posts", &hidden.id, None, RequestInfo::guest())
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn request_data_sees_modified_values() {
  let s = store().await;
  let mut counters = public(base("counters", vec![Field::new("count", FieldType::Number)]));
  counters.update_rule = Some("@request.data.count <= 10".into());
  s.save_collection(counters).await.unwrap();
  let counter = add(&s, "counters", json!({"count": 3})).await;

  let bumped = s
    .update_record(
      "counters",
      &counter.id,
      RequestInfo::guest().with_data(body(json!({"count+": 2}))),
      None,
    )
    .await
    .unwrap();
  assert_eq!(bumped.data["count"], 5);

  let err = s
    .update_record(
      "counters",
      &counter.id,
      RequestInfo::guest().with_data(body(json!({"count+": 20}))),
      None,
    )
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::NotFound);
  let stored = s.view_record("counters", &counter.id, None, RequestInfo::admin()).await.unwrap();
  assert_eq!(stored.data["count"], 5);
}

#[tokio::test]
async fn deeply_nested_filters_are_rejected() {
  let s = store().await;
  s.save_collection(public(base("posts", vec![Field::new("title", FieldType::Text)])))
    .await
    .unwrap();
  let filter = format!("{}title = 'x'{}", "(".repeat(5000), ")".repeat(5000));
  let query = RecordQuery { filter: Some(filter), ..Default::default() };
  let err = s.list_records("posts", query, RequestInfo::guest()).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::InvalidFilter);
}

#[tokio::test]
async fn huge_page_numbers_return_empty_pages() {
  let s = store().await;
  s.save_collection(public(base("posts", vec![Field::new("title", FieldType::Text)])))
    .await
    .unwrap();
  add(&s, "posts", json!({"title": "a"})).await;

  let query = RecordQuery { page: Some(usize::MAX / 2), per_page: Some(500), ..Default::default() };
  let page = s.list_records("posts", query, RequestInfo::guest()).await.unwrap();
  assert!(page.items.is_empty());
  assert_eq!(page.total_items, 1);

  let first = s
    .list_records("posts", RecordQuery::default(), RequestInfo::guest())
    .await
    .unwrap();
  assert_eq!(first.items.len(), 1);
}

// ─── Auth records ────────────────────────────────────────────────────────────

async fn users_store() -> SqliteStore {
  let s = store().await;
  let mut users = public(Collection::new("users", CollectionType::Auth));
  users.schema.add_field(Field::new("name", FieldType::Text));
  s.save_collection(users).await.unwrap();
  s
}

fn signup(email: &str) -> RequestInfo {
  RequestInfo::guest().with_data(body(json!({
    "email": email,
    "password": "12345678",
    "passwordConfirm": "12345678",
    "verified": true,
  })))
}

#[tokio::test]
async fn auth_records_hash_passwords_and_hide_secrets() {
  let s = users_store().await;
  let user = s.create_record("users", signup("ann@example.com"), None).await.unwrap();

  assert!(user.get_str("username").unwrap().starts_with("user"));
  assert_eq!(user.data["verified"], false);
  let hash = user.get_str("passwordHash").unwrap();
  assert!(strata_core::security::verify_password("12345678", hash));

  let json = serde_json::to_value(&user).unwrap();
  assert!(json.get("passwordHash").is_none());
  assert!(json.get("tokenKey").is_none());
}

#[tokio::test]
async fn auth_input_is_validated() {
  let s = users_store().await;
  s.create_record("users", signup("ann@example.com"), None).await.unwrap();

  let err = s.create_record("users", signup("ANN@example.com"), None).await.unwrap_err();
  assert_eq!(validation_code(&err, "email").as_deref(), Some("validation_invalid_email"));

  let request = RequestInfo::guest().with_data(body(json!({
    "password": "short",
    "passwordConfirm": "other",
  })));
  let err = s.create_record("users", request, None).await.unwrap_err();
  assert_eq!(validation_code(&err, "password").as_deref(), Some("validation_length_out_of_range"));
  assert_eq!(validation_code(&err, "passwordConfirm").as_deref(), Some("validation_values_mismatch"));
}

#[tokio::test]
async fn password_change_needs_the_old_password() {
  let s = users_store().await;
  let user = s.create_record("users", signup("ann@example.com"), None).await.unwrap();

  let change = |old: &str| {
    RequestInfo::with_auth_record(user.clone()).with_data(body(json!({
      "password": "abcdefgh",
      "passwordConfirm": "abcdefgh",
      "oldPassword": old,
    })))
  };
  let err = s.update_record("users", &user.id, change("wrong"), None).await.unwrap_err();
  assert_eq!(validation_code(&err, "oldPassword").as_deref(), Some("validation_invalid_old_password"));

  let updated = s.update_record("users", &user.id, change("12345678"), None).await.unwrap();
  assert!(strata_core::security::verify_password("abcdefgh", updated.get_str("passwordHash").unwrap()));
  assert_ne!(updated.get_str("tokenKey"), user.get_str("tokenKey"));
}

#[tokio::test]
async fn emails_are_visible_to_admins_and_owners() {
  let s = users_store().await;
  let user = s.create_record("users", signup("ann@example.com"), None).await.unwrap();

  let as_guest = s.view_record("users", &user.id, None, RequestInfo::guest()).await.unwrap();
  assert!(as_guest.data.get("email").is_none());

  let as_admin = s.view_record("users", &user.id, None, RequestInfo::admin()).await.unwrap();
  assert_eq!(as_admin.data["email"], "ann@example.com");

  let as_owner = s
    .view_record("users", &user.id, None, RequestInfo::with_auth_record(user.clone()))
    .await
    .unwrap();
  assert_eq!(as_owner.data["email"], "ann@example.com");

  s.update_record(
    "users",
    &user.id,
    RequestInfo::admin().with_data(body(json!({"emailVisibility": true}))),
    None,
  )
  .await
  .unwrap();
  let visible = s.view_record("users", &user.id, None, RequestInfo::guest()).await.unwrap();
  assert_eq!(visible.data["email"], "ann@example.com");
}

#[tokio::test]
async fn auth_rules_can_reference_the_caller() {
  let s = store().await;
  let users = s
    .save_collection(public(Collection::new("users", CollectionType::Auth)))
    .await
    .unwrap();
  let mut notes = base("notes", vec![relation("owner", &users.id, Some(1), false)]);
  notes.list_rule = Some("owner = @request.auth.id".into());
  s.save_collection(notes).await.unwrap();

  let ann = s.create_record("users", signup("ann@example.com"), None).await.unwrap();
  let bob = s.create_record("users", signup("bob@example.com"), None).await.unwrap();
  add(&s, "notes", json!({"owner": ann.id})).await;
  add(&s, "notes", json!({"owner": bob.id})).await;

  let list = s
    .list_records("notes", RecordQuery::default(), RequestInfo::with_auth_record(ann.clone()))
    .await
    .unwrap();
  assert_eq!(list.total_items, 1);
  assert_eq!(list.items[0].data["owner"], ann.id);
}

// ─── Expand ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn expand_follows_relations_and_view_rules() {
  let s = store().await;
  let people = s
    .save_collection(public(base("people", vec![Field::new("name", FieldType::Text)])))
    .await
    .unwrap();
  let mut secrets = base("secrets", vec![Field::new("code", FieldType::Text)]);
  secrets.view_rule = None;
  let secrets = s.save_collection(secrets).await.unwrap();
  s.save_collection(public(base("posts", vec![
    relation("author", &people.id, Some(1), false),
    relation("secret", &secrets.id, Some(1), false),
  ])))
  .await
  .unwrap();

  let ann = add(&s, "people", json!({"name": "ann"})).await;
  let code = add(&s, "secrets", json!({"code": "42"})).await;
  let post = add(&s, "posts", json!({"author": ann.id, "secret": code.id})).await;

  let viewed = s
    .view_record("posts", &post.id, Some("author, secret".into()), RequestInfo::guest())
    .await
    .unwrap();
  assert_eq!(viewed.expand["author"]["name"], "ann");
  assert!(viewed.expand.get("secret").is_none());

  let viewed = s
    .view_record("posts", &post.id, Some("secret".into()), RequestInfo::admin())
    .await
    .unwrap();
  assert_eq!(viewed.expand["secret"]["code"], "42");
}

// ─── Cascade delete ──────────────────────────────────────────────────────────

#[tokio::test]
async fn delete_cascades_through_relations() {
  let s = store().await;
  let people = s
    .save_collection(base("people", vec![Field::new("name", FieldType::Text)]))
    .await
    .unwrap();
  let posts = s
    .save_collection(base("posts", vec![
      relation("author", &people.id, Some(1), true),
      relation("editors", &people.id, None, false),
    ]))
    .await
    .unwrap();
  s.save_collection(base("comments", vec![relation("post", &posts.id, Some(1), true)]))
    .await
    .unwrap();

  let ann = add(&s, "people", json!({"name": "ann"})).await;
  let bob = add(&s, "people", json!({"name": "bob"})).await;
  let by_ann = add(&s, "posts", json!({"author": ann.id, "editors": [bob.id]})).await;
  let by_bob = add(&s, "posts", json!({"author": bob.id, "editors": [ann.id, bob.id]})).await;
  add(&s, "comments", json!({"post": by_ann.id})).await;

  s.delete_record("people", &ann.id, RequestInfo::admin()).await.unwrap();

  let admin = RequestInfo::admin;
  assert!(s.view_record("posts", &by_ann.id, None, admin()).await.is_err());
  let comments = s.list_records("comments", RecordQuery::default(), admin()).await.unwrap();
  assert_eq!(comments.total_items, 0);
  let kept = s.view_record("posts", &by_bob.id, None, admin()).await.unwrap();
  assert_eq!(kept.data["editors"], json!([bob.id]));
}

#[tokio::test]
async fn required_references_block_deletion() {
  let s = store().await;
  let tags = s
    .save_collection(base("tags", vec![Field::new("name", FieldType::Text)]))
    .await
    .unwrap();
  s.save_collection(base("posts", vec![relation("tag", &tags.id, Some(1), false).required()]))
    .await
    .unwrap();
  let tag = add(&s, "tags", json!({"name": "rust"})).await;
  add(&s, "posts", json!({"tag": tag.id})).await;

  let err = s.delete_record("tags", &tag.id, RequestInfo::admin()).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::BadRequest);
  assert!(s.view_record("tags", &tag.id, None, RequestInfo::admin()).await.is_ok());
}

#[tokio::test]
async fn cyclic_cascades_terminate() {
  let s = store().await;
  let nodes = s
    .save_collection(base("nodes", vec![Field::new("name", FieldType::Text)]))
    .await
    .unwrap();
  let mut with_next = nodes.clone();
  with_next.schema.add_field(relation("next", &nodes.id, Some(1), true));
  s.save_collection(with_next).await.unwrap();

  let a = add(&s, "nodes", json!({"name": "a"})).await;
  let b = add(&s, "nodes", json!({"name": "b", "next": a.id})).await;
  s.update_record("nodes", &a.id, RequestInfo::admin().with_data(body(json!({"next": b.id}))), None)
    .await
    .unwrap();

  s.delete_record("nodes", &a.id, RequestInfo::admin()).await.unwrap();
  let list = s
    .list_records("nodes", RecordQuery::default(), RequestInfo::admin())
    .await
    .unwrap();
  assert_eq!(list.total_items, 0);
}

#[tokio::test]
async fn dropped_references_run_update_hooks() {
  let hooks = Arc::new(Hooks::new());
  let updates = Arc::new(AtomicUsize::new(0));
  let counted = Arc::clone(&updates);
  hooks.model_before_update.add(move |e| {
    if matches!(e.model, Model::Record(_)) {
      counted.fetch_add(1, Ordering::SeqCst);
    }
    Ok(())
  });
  let s = store().await.with_hooks(Arc::clone(&hooks));
  let people = s
    .save_collection(base("people", vec![Field::new("name", FieldType::Text)]))
    .await
    .unwrap();
  s.save_collection(base("posts", vec![relation("editors", &people.id, None, false)]))
    .await
    .unwrap();
  let ann = add(&s, "people", json!({"name": "ann"})).await;
  let bob = add(&s, "people", json!({"name": "bob"})).await;
  let post = add(&s, "posts", json!({"editors": [ann.id, bob.id]})).await;

  s.delete_record("people", &ann.id, RequestInfo::admin()).await.unwrap();
  assert_eq!(updates.load(Ordering::SeqCst), 1);
  let kept = s.view_record("posts", &post.id, None, RequestInfo::admin()).await.unwrap();
  assert_eq!(kept.data["editors"], json!([bob.id]));

  hooks.model_before_update.add(|_| Err(HookError::failed("frozen")));
  let err = s.delete_record("people", &bob.id, RequestInfo::admin()).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::BadRequest);
  assert!(s.view_record("people", &bob.id, None, RequestInfo::admin()).await.is_ok());
}

// ─── Effects ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Recorder(Mutex<Vec<ChangeEvent>>);

impl ChangeNotifier for Recorder {
  fn notify(&self, event: ChangeEvent) { self.0.lock().unwrap().push(event); }
}

#[tokio::test]
async fn effects_run_after_commit_only() {
  let recorder = Arc::new(Recorder::default());
  let hooks = Arc::new(Hooks::new());
  let after = Arc::new(AtomicUsize::new(0));
  let counted = Arc::clone(&after);
  hooks.model_after_create.add(move |e| {
    if matches!(e.model, Model::Record(_)) {
      counted.fetch_add(1, Ordering::SeqCst);
    }
    Ok(())
  });
  hooks.model_before_update.add(|_| Err(HookError::failed("frozen")));

  let s = store()
    .await
    .with_hooks(hooks)
    .with_notifier(Arc::clone(&recorder) as Arc<dyn ChangeNotifier>);
  s.save_collection(base("posts", vec![Field::new("title", FieldType::Text)]))
    .await
    .unwrap();
  let post = add(&s, "posts", json!({"title": "a"})).await;

  let err = s
    .update_record("posts", &post.id, RequestInfo::admin().with_data(body(json!({"title": "b"}))), None)
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::BadRequest);

  let events = recorder.0.lock().unwrap().clone();
  assert_eq!(events.len(), 1);
  assert_eq!(events[0].action, ChangeAction::Create);
  assert_eq!(events[0].record_id, post.id);
  assert_eq!(after.load(Ordering::SeqCst), 1);

  let unchanged = s.view_record("posts", &post.id, None, RequestInfo::admin()).await.unwrap();
  assert_eq!(unchanged.data["title"], "a");
}

#[tokio::test]
async fn deleting_records_removes_their_files() {
  let dir = tempfile::tempdir().unwrap();
  let config = StoreConfig { storage_dir: Some(dir.path().join("storage")), ..Default::default() };
  let s = SqliteStore::open_with_config(dir.path().join("data.db"), config).await.unwrap();
  let posts = s
    .save_collection(base("posts", vec![Field::new("title", FieldType::Text)]))
    .await
    .unwrap();
  let post = add(&s, "posts", json!({"title": "a"})).await;

  let record_dir = dir.path().join("storage").join(&posts.id).join(&post.id);
  std::fs::create_dir_all(&record_dir).unwrap();
  std::fs::write(record_dir.join("a.txt"), b"x").unwrap();

  s.delete_record("posts", &post.id, RequestInfo::admin()).await.unwrap();
  assert!(!record_dir.exists());
}

// ─── Migrations ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn application_migrations_run_once_and_revert() {
  let s = store().await;
  let mut list = MigrationsList::new();
  list.register_reversible(
    "1700000000_notes.rs",
    |conn| {
      conn.execute_batch("CREATE TABLE notes (id TEXT PRIMARY KEY)")?;
      Ok(())
    },
    |conn| {
      conn.execute_batch("DROP TABLE notes")?;
      Ok(())
    },
  );

  assert_eq!(s.migrate(list.clone()).await.unwrap(), vec!["1700000000_notes.rs"]);
  assert!(s.migrate(list.clone()).await.unwrap().is_empty());
  assert!(sql_text(&s, "SELECT name FROM sqlite_master WHERE name = 'notes'").await.is_some());

  assert_eq!(s.migrate_down(list, 1).await.unwrap(), vec!["1700000000_notes.rs"]);
  assert!(sql_text(&s, "SELECT name FROM sqlite_master WHERE name = 'notes'").await.is_none());
}

// ─── Timeouts ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn slow_reads_time_out_as_transient() {
  let dir = tempfile::tempdir().unwrap();
  let config = StoreConfig { query_timeout: Duration::from_millis(20), ..Default::default() };
  let s = SqliteStore::open_with_config(dir.path().join("data.db"), config).await.unwrap();

  let err = s
    .read(|conn, _| {
      let n: i64 = conn.query_row(
        "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 1000000000) \
         SELECT count(*) FROM c",
        [],
        |r| r.get(0),
      )?;
      Ok(n)
    })
    .await
    .unwrap_err();
  assert!(matches!(err, Error::Timeout(_)));
  assert_eq!(err.kind(), ErrorKind::Transient);

  // The connection stays usable afterwards.
  assert!(s.list_collections().await.unwrap().is_empty());
}

#[tokio::test]
async fn queued_reads_get_their_full_timeout() {
  let dir = tempfile::tempdir().unwrap();
  let config = StoreConfig { query_timeout: Duration::from_millis(50), ..Default::default() };
  let s = SqliteStore::open_with_config(dir.path().join("data.db"), config).await.unwrap();

  let busy = s.run(|_| {
    std::thread::sleep(Duration::from_millis(200));
    Ok(())
  });
  let quick = s.read(|conn, _| Ok(conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))?));
  let (busy, quick) = tokio::join!(busy, quick);
  busy.unwrap();
  assert_eq!(quick.unwrap(), 1);
}
