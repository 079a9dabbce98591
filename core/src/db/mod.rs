//! SQLite-backed versioned entity store.
//!
//! Every syncable table carries `sync_version`, `updated_at` and `deleted_at`.
//! Mutations bump the version with `sync_version = sync_version + 1` and stamp
//! `updated_at = MAX(updated_at, now)` in the same statement, so a row's stamp
//! never moves backwards. Timestamps are fixed-width UTC text, which makes
//! text comparison equal time comparison.

mod completion;
mod delta;
mod meal_plans;
mod pantry;
mod push;
mod recipes;
mod shopping;

pub use push::PushTally;

use std::path::Path;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params};

use crate::error::{Error, Result};
use crate::models::{EntityType, SyncMeta, Versioned};

const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// Applied until a caller sets its own deadline.
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite VM instructions between deadline checks.
const PROGRESS_INTERVAL: i32 = 1_000;

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS recipes (
                    id TEXT PRIMARY KEY,
                    owner_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    description TEXT,
                    servings REAL,
                    tags TEXT NOT NULL DEFAULT '[]',
                    is_public INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    sync_version INTEGER NOT NULL DEFAULT 1,
                    updated_at TEXT NOT NULL,
                    deleted_at TEXT
                );

                CREATE TABLE IF NOT EXISTS recipe_ingredients (
                    recipe_id TEXT NOT NULL REFERENCES recipes(id) ON DELETE CASCADE,
                    position INTEGER NOT NULL,
                    name TEXT NOT NULL,
                    quantity REAL,
                    unit TEXT,
                    category TEXT,
                    note TEXT,
                    PRIMARY KEY (recipe_id, position)
                );

                CREATE TABLE IF NOT EXISTS recipe_steps (
                    recipe_id TEXT NOT NULL REFERENCES recipes(id) ON DELETE CASCADE,
                    position INTEGER NOT NULL,
                    instruction TEXT NOT NULL,
                    timer_minutes INTEGER,
                    PRIMARY KEY (recipe_id, position)
                );

                CREATE TABLE IF NOT EXISTS pantry_items (
                    id TEXT PRIMARY KEY,
                    owner_id TEXT NOT NULL,
                    name TEXT NOT NULL COLLATE NOCASE,
                    category TEXT NOT NULL,
                    quantity REAL,
                    unit TEXT,
                    created_at TEXT NOT NULL,
                    sync_version INTEGER NOT NULL DEFAULT 1,
                    updated_at TEXT NOT NULL,
                    deleted_at TEXT
                );

                CREATE TABLE IF NOT EXISTS shopping_lists (
                    id TEXT PRIMARY KEY,
                    owner_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    sync_version INTEGER NOT NULL DEFAULT 1,
                    updated_at TEXT NOT NULL,
                    deleted_at TEXT
                );

                CREATE TABLE IF NOT EXISTS shopping_items (
                    id TEXT PRIMARY KEY,
                    list_id TEXT NOT NULL REFERENCES shopping_lists(id) ON DELETE CASCADE,
                    owner_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    quantity REAL,
                    unit TEXT,
                    category TEXT,
                    checked INTEGER NOT NULL DEFAULT 0,
                    recipe_tag TEXT,
                    position INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    sync_version INTEGER NOT NULL DEFAULT 1,
                    updated_at TEXT NOT NULL,
                    deleted_at TEXT
                );

                CREATE TABLE IF NOT EXISTS meal_plans (
                    id TEXT PRIMARY KEY,
                    owner_id TEXT NOT NULL,
                    week_start TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    sync_version INTEGER NOT NULL DEFAULT 1,
                    updated_at TEXT NOT NULL,
                    deleted_at TEXT,
                    UNIQUE (owner_id, week_start)
                );

                CREATE TABLE IF NOT EXISTS meal_plan_entries (
                    id TEXT PRIMARY KEY,
                    plan_id TEXT NOT NULL REFERENCES meal_plans(id) ON DELETE CASCADE,
                    owner_id TEXT NOT NULL,
                    recipe_id TEXT NOT NULL,
                    day INTEGER NOT NULL CHECK (day BETWEEN 0 AND 6),
                    meal_type TEXT NOT NULL,
                    servings REAL,
                    position INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    sync_version INTEGER NOT NULL DEFAULT 1,
                    updated_at TEXT NOT NULL,
                    deleted_at TEXT
                );

                CREATE UNIQUE INDEX IF NOT EXISTS idx_pantry_merge_key
                    ON pantry_items(owner_id, name, category);
                CREATE INDEX IF NOT EXISTS idx_recipes_owner_updated ON recipes(owner_id, updated_at);
                CREATE INDEX IF NOT EXISTS idx_pantry_owner_updated ON pantry_items(owner_id, updated_at);
                CREATE INDEX IF NOT EXISTS idx_lists_owner_updated ON shopping_lists(owner_id, updated_at);
                CREATE INDEX IF NOT EXISTS idx_items_owner_updated ON shopping_items(owner_id, updated_at);
                CREATE INDEX IF NOT EXISTS idx_items_list ON shopping_items(list_id);
                CREATE INDEX IF NOT EXISTS idx_plans_owner_updated ON meal_plans(owner_id, updated_at);
                CREATE INDEX IF NOT EXISTS idx_entries_owner_updated ON meal_plan_entries(owner_id, updated_at);
                CREATE INDEX IF NOT EXISTS idx_entries_plan ON meal_plan_entries(plan_id);

                PRAGMA user_version = 1;",
            )?;
        }

        if version < 2 {
            // Pushed ids folded into the row that already held their natural
            // key (pantry merge key, meal plan week).
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS push_aliases (
                    owner_id TEXT NOT NULL,
                    entity TEXT NOT NULL,
                    client_id TEXT NOT NULL,
                    server_id TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    PRIMARY KEY (owner_id, entity, client_id)
                );

                PRAGMA user_version = 2;",
            )?;
        }

        Ok(())
    }

    /// Bound every statement on this connection by `budget`, including time
    /// spent waiting for another connection's write lock. Once exceeded the
    /// running statement is interrupted and surfaces as [`Error::Timeout`].
    pub fn set_deadline(&self, budget: Duration) -> Result<()> {
        self.conn.busy_timeout(budget)?;
        let deadline = Instant::now() + budget;
        self.conn
            .progress_handler(PROGRESS_INTERVAL, Some(move || Instant::now() > deadline));
        Ok(())
    }

    pub fn clear_deadline(&self) -> Result<()> {
        self.conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        self.conn.progress_handler(0, None::<fn() -> bool>);
        Ok(())
    }

    /// `BEGIN IMMEDIATE`: the write lock is taken before the first read.
    fn write_tx(&self) -> Result<Transaction<'_>> {
        Ok(Transaction::new_unchecked(
            &self.conn,
            TransactionBehavior::Immediate,
        )?)
    }

    /// Hard-delete everything `owner_id` has in every table. Produces no
    /// tombstones, so other devices never hear about it.
    pub fn erase_account(&self, owner_id: &str) -> Result<usize> {
        let tx = self.write_tx()?;
        let mut removed = 0;
        // Children first; recipe ingredients and steps cascade.
        for entity in [
            EntityType::MealPlanEntry,
            EntityType::MealPlan,
            EntityType::ShoppingItem,
            EntityType::ShoppingList,
            EntityType::PantryItem,
            EntityType::Recipe,
        ] {
            removed += tx.execute(
                &format!("DELETE FROM {} WHERE owner_id = ?1", entity.table()),
                params![owner_id],
            )?;
        }
        tx.execute(
            "DELETE FROM push_aliases WHERE owner_id = ?1",
            params![owner_id],
        )?;
        tx.commit()?;
        tracing::info!(owner_id, removed, "account erased");
        Ok(removed)
    }
}

// --- Timestamps ---

/// Server clock truncated to the stored precision.
pub(crate) fn stamp() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

pub(crate) fn to_db_ts(ts: &DateTime<Utc>) -> String {
    ts.format(TS_FORMAT).to_string()
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, TS_FORMAT)
        .map(|naive| naive.and_utc())
        .or_else(|_| DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc)))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(idx, &raw)
}

fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| parse_ts(idx, &r)).transpose()
}

fn decode_failure(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

/// Reads `created_at, sync_version, updated_at, deleted_at` starting at
/// column `start`. Every select list ends with these four.
fn sync_cols(row: &Row<'_>, start: usize) -> rusqlite::Result<(DateTime<Utc>, SyncMeta)> {
    Ok((
        ts_col(row, start)?,
        SyncMeta {
            sync_version: row.get(start + 1)?,
            updated_at: ts_col(row, start + 2)?,
            deleted_at: opt_ts_col(row, start + 3)?,
        },
    ))
}

// --- Generic row access ---

/// A syncable table and how to read one of its rows.
pub(crate) trait Table: Versioned + Sized {
    /// Select list, ending with the columns read by [`sync_cols`].
    const COLUMNS: &'static str;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;

    /// Load child collections after the row itself has been read.
    fn hydrate(&mut self, _conn: &Connection) -> Result<()> {
        Ok(())
    }
}

fn query_rows<T: Table>(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt
        .query_map(params, T::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    for row in &mut rows {
        row.hydrate(conn)?;
    }
    Ok(rows)
}

/// Any row with this id, whoever owns it and whether or not it is deleted.
fn find_any<T: Table>(conn: &Connection, id: &str) -> Result<Option<T>> {
    let sql = format!(
        "SELECT {} FROM {} WHERE id = ?1",
        T::COLUMNS,
        T::ENTITY.table()
    );
    let row = conn.query_row(&sql, params![id], T::from_row).optional()?;
    match row {
        Some(mut row) => {
            row.hydrate(conn)?;
            Ok(Some(row))
        }
        None => Ok(None),
    }
}

/// A live row owned by `owner_id`; anything else is `NotFound`.
fn find_live<T: Table>(conn: &Connection, owner_id: &str, id: &str) -> Result<T> {
    match find_any::<T>(conn, id)? {
        Some(row) if row.owner_id() == owner_id && !row.sync().is_tombstone() => Ok(row),
        _ => Err(Error::not_found(T::ENTITY, id)),
    }
}

fn list_live<T: Table>(conn: &Connection, owner_id: &str, order_by: &str) -> Result<Vec<T>> {
    let sql = format!(
        "SELECT {} FROM {} WHERE owner_id = ?1 AND deleted_at IS NULL ORDER BY {order_by}",
        T::COLUMNS,
        T::ENTITY.table()
    );
    query_rows(conn, &sql, params![owner_id])
}

/// Soft-delete one live owned row. Returns false when nothing matched.
fn tombstone_row(
    conn: &Connection,
    entity: EntityType,
    owner_id: &str,
    id: &str,
    now: &str,
) -> Result<bool> {
    let changed = conn.execute(
        &format!(
            "UPDATE {} SET deleted_at = ?1, updated_at = MAX(updated_at, ?1),
                 sync_version = sync_version + 1
             WHERE id = ?2 AND owner_id = ?3 AND deleted_at IS NULL",
            entity.table()
        ),
        params![now, id, owner_id],
    )?;
    Ok(changed > 0)
}

/// Version bump with no field changes.
fn bump_row(conn: &Connection, entity: EntityType, id: &str, now: &str) -> Result<()> {
    conn.execute(
        &format!(
            "UPDATE {} SET updated_at = MAX(updated_at, ?1), sync_version = sync_version + 1
             WHERE id = ?2",
            entity.table()
        ),
        params![now, id],
    )?;
    Ok(())
}

fn next_position(conn: &Connection, table: &str, parent_col: &str, parent: &str) -> Result<i64> {
    Ok(conn.query_row(
        &format!(
            "SELECT COALESCE(MAX(position) + 1, 0) FROM {table}
             WHERE {parent_col} = ?1 AND deleted_at IS NULL"
        ),
        params![parent],
        |row| row.get(0),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewPantryItem, NewRecipe, NewShoppingItem, NewShoppingList};

    #[test]
    fn test_timestamp_text_order_matches_time_order() {
        let earlier = Utc::now().trunc_subsecs(6);
        let later = earlier + chrono::Duration::microseconds(1);
        assert!(to_db_ts(&earlier) < to_db_ts(&later));
        assert_eq!(to_db_ts(&earlier).len(), to_db_ts(&later).len());
    }

    #[test]
    fn test_timestamp_round_trip() {
        let ts = stamp();
        assert_eq!(parse_ts(0, &to_db_ts(&ts)).unwrap(), ts);
    }

    #[test]
    fn test_malformed_timestamp_is_decode_error() {
        let db = Database::open_in_memory().unwrap();
        let list = db
            .create_list(
                "alice",
                &NewShoppingList {
                    id: None,
                    name: "Weekly".into(),
                },
            )
            .unwrap();
        db.conn
            .execute(
                "UPDATE shopping_lists SET updated_at = 'yesterday' WHERE id = ?1",
                params![list.id],
            )
            .unwrap();
        let err = db.get_list("alice", &list.id).unwrap_err();
        assert!(matches!(err, Error::Decode(_)), "got {err:?}");
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        let version: i64 = db
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, 2);
    }

    #[test]
    fn test_open_file_database_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("larder.db")).unwrap();
        let mode: String = db
            .conn
            .pragma_query_value(None, "journal_mode", |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn test_expired_deadline_interrupts_as_timeout() {
        let db = Database::open_in_memory().unwrap();
        db.set_deadline(Duration::ZERO).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        let err = db
            .conn
            .query_row(
                "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < 1000000)
                 SELECT COUNT(*) FROM n",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map_err(Error::from)
            .unwrap_err();
        assert!(matches!(err, Error::Timeout), "got {err:?}");

        db.clear_deadline().unwrap();
        assert!(db.list_lists("alice").is_ok());
    }

    #[test]
    fn test_erase_account_removes_only_that_owner() {
        let db = Database::open_in_memory().unwrap();
        for owner in ["alice", "bob"] {
            db.create_recipe(
                owner,
                &NewRecipe {
                    name: "Soup".into(),
                    ..NewRecipe::default()
                },
            )
            .unwrap();
            db.add_pantry_item(
                owner,
                &NewPantryItem {
                    name: "Rice".into(),
                    ..NewPantryItem::default()
                },
            )
            .unwrap();
            let list = db
                .create_list(
                    owner,
                    &NewShoppingList {
                        id: None,
                        name: "Weekly".into(),
                    },
                )
                .unwrap();
            db.add_item(
                owner,
                &list.id,
                &NewShoppingItem {
                    name: "Milk".into(),
                    ..NewShoppingItem::default()
                },
            )
            .unwrap();
        }

        let removed = db.erase_account("alice").unwrap();
        assert_eq!(removed, 4);

        // Hard delete: nothing left, not even tombstones.
        let delta = db.changes_since("alice", &Default::default()).unwrap();
        assert!(delta.recipes.is_empty());
        assert!(delta.pantry_items.is_empty());
        assert!(delta.shopping_lists.is_empty());
        assert!(delta.shopping_items.is_empty());
        let ingredients: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM recipe_ingredients", [], |r| r.get(0))
            .unwrap();
        assert_eq!(ingredients, 0);

        assert_eq!(db.list_recipes("bob").unwrap().len(), 1);
        assert_eq!(db.list_pantry("bob").unwrap().len(), 1);
    }
}
