//! DDL of the system tables and the built-in migrations that create them.

use crate::migrate::MigrationsList;

pub const COLLECTIONS_TABLE: &str = "_collections";
pub const EXTERNAL_AUTHS_TABLE: &str = "_externalAuths";
pub const MIGRATIONS_TABLE: &str = "_migrations";

/// Connection pragmas, applied on every open.
pub const PRAGMAS: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 10000;
";

/// System tables. `_collections.name` is authoritative for (case
/// insensitive) name uniqueness; validation only reports it early.
const INIT_UP: &str = "
CREATE TABLE `_collections` (
    `id`         TEXT PRIMARY KEY NOT NULL,
    `system`     BOOLEAN DEFAULT FALSE NOT NULL,
    `type`       TEXT DEFAULT 'base' NOT NULL,
    `name`       TEXT NOT NULL,
    `schema`     JSON DEFAULT '[]' NOT NULL,
    `indexes`    JSON DEFAULT '[]' NOT NULL,
    `listRule`   TEXT DEFAULT NULL,
    `viewRule`   TEXT DEFAULT NULL,
    `createRule` TEXT DEFAULT NULL,
    `updateRule` TEXT DEFAULT NULL,
    `deleteRule` TEXT DEFAULT NULL,
    `options`    JSON DEFAULT '{}' NOT NULL,
    `created`    TEXT NOT NULL,
    `updated`    TEXT NOT NULL
);

CREATE UNIQUE INDEX `_collections_name_idx` ON `_collections` (`name` COLLATE NOCASE);

-- Links between auth records and OAuth2 identities.
CREATE TABLE `_externalAuths` (
    `id`           TEXT PRIMARY KEY NOT NULL,
    `collectionId` TEXT NOT NULL,
    `recordId`     TEXT NOT NULL,
    `provider`     TEXT NOT NULL,
    `providerId`   TEXT NOT NULL,
    `created`      TEXT NOT NULL,
    `updated`      TEXT NOT NULL
);

CREATE UNIQUE INDEX `_externalAuths_record_provider_idx`
    ON `_externalAuths` (`collectionId`, `recordId`, `provider`);
CREATE UNIQUE INDEX `_externalAuths_collection_provider_idx`
    ON `_externalAuths` (`collectionId`, `provider`, `providerId`);
";

const INIT_DOWN: &str = "
DROP TABLE IF EXISTS `_externalAuths`;
DROP TABLE IF EXISTS `_collections`;
";

/// Migrations every store runs before any application migration.
pub fn system_migrations() -> MigrationsList {
  let mut list = MigrationsList::new();
  list.register_reversible(
    "1_init",
    |conn| {
      conn.execute_batch(INIT_UP)?;
      Ok(())
    },
    |conn| {
      conn.execute_batch(INIT_DOWN)?;
      Ok(())
    },
  );
  list
}
