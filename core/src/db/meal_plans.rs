use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use super::recipes::visible_recipe;
use super::{
    Database, Table, decode_failure, find_any, find_live, query_rows, stamp, sync_cols, to_db_ts,
    tombstone_row,
};
use crate::error::{Error, Result};
use crate::models::{EntityType, MealPlan, MealPlanEntry, NewMealPlanEntry, SyncMeta};

const DATE_FORMAT: &str = "%Y-%m-%d";

impl Table for MealPlan {
    const COLUMNS: &'static str =
        "id, owner_id, week_start, created_at, sync_version, updated_at, deleted_at";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let raw: String = row.get(2)?;
        let week_start =
            NaiveDate::parse_from_str(&raw, DATE_FORMAT).map_err(|e| decode_failure(2, e))?;
        let (created_at, sync) = sync_cols(row, 3)?;
        Ok(MealPlan {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            week_start,
            created_at,
            sync,
        })
    }
}

impl Table for MealPlanEntry {
    const COLUMNS: &'static str = "id, plan_id, owner_id, recipe_id, day, meal_type, servings, \
         position, created_at, sync_version, updated_at, deleted_at";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let (created_at, sync) = sync_cols(row, 8)?;
        Ok(MealPlanEntry {
            id: row.get(0)?,
            plan_id: row.get(1)?,
            owner_id: row.get(2)?,
            recipe_id: row.get(3)?,
            day: row.get(4)?,
            meal_type: row.get(5)?,
            servings: row.get(6)?,
            position: row.get(7)?,
            created_at,
            sync,
        })
    }
}

fn week_key(week_start: NaiveDate) -> String {
    week_start.format(DATE_FORMAT).to_string()
}

pub(super) fn find_plan_for_week(
    conn: &Connection,
    owner_id: &str,
    week_start: NaiveDate,
) -> Result<Option<MealPlan>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {} FROM meal_plans WHERE owner_id = ?1 AND week_start = ?2",
                MealPlan::COLUMNS
            ),
            params![owner_id, week_key(week_start)],
            MealPlan::from_row,
        )
        .optional()?)
}

fn live_plan_for_week(conn: &Connection, owner_id: &str, week_start: NaiveDate) -> Result<MealPlan> {
    match find_plan_for_week(conn, owner_id, week_start)? {
        Some(plan) if !plan.sync.is_tombstone() => Ok(plan),
        _ => Err(Error::not_found(EntityType::MealPlan, week_key(week_start))),
    }
}

/// One plan per owner per week: returns the live plan, resurrects a deleted
/// one, or creates it.
pub(super) fn ensure_plan(
    conn: &Connection,
    owner_id: &str,
    week_start: NaiveDate,
    now: &str,
) -> Result<MealPlan> {
    let id = match find_plan_for_week(conn, owner_id, week_start)? {
        Some(plan) if !plan.sync.is_tombstone() => return Ok(plan),
        Some(plan) => {
            conn.execute(
                "UPDATE meal_plans SET deleted_at = NULL, updated_at = MAX(updated_at, ?1),
                     sync_version = sync_version + 1
                 WHERE id = ?2",
                params![now, plan.id],
            )?;
            plan.id
        }
        None => {
            let id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO meal_plans (id, owner_id, week_start, created_at, sync_version, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 1, ?4)",
                params![id, owner_id, week_key(week_start), now],
            )?;
            id
        }
    };
    find_live(conn, owner_id, &id)
}

pub(super) fn insert_plan_row(
    conn: &Connection,
    owner_id: &str,
    plan: &MealPlan,
    now: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO meal_plans (id, owner_id, week_start, created_at, sync_version, updated_at, deleted_at)
         VALUES (?1, ?2, ?3, ?4, 1, ?4, CASE WHEN ?5 THEN ?4 END)",
        params![
            plan.id,
            owner_id,
            week_key(plan.week_start),
            now,
            plan.sync.is_tombstone()
        ],
    )?;
    Ok(())
}

pub(super) fn overwrite_plan(conn: &Connection, plan: &MealPlan, now: &str) -> Result<()> {
    conn.execute(
        "UPDATE meal_plans SET week_start = ?1,
             deleted_at = CASE WHEN ?2 THEN COALESCE(deleted_at, ?3) END,
             updated_at = MAX(updated_at, ?3), sync_version = sync_version + 1
         WHERE id = ?4",
        params![
            week_key(plan.week_start),
            plan.sync.is_tombstone(),
            now,
            plan.id
        ],
    )?;
    Ok(())
}

/// Move plan `plan_id` onto the week already held by another plan: its live
/// entries are re-parented to that plan and `plan_id` is tombstoned in place.
/// Returns the surviving plan.
pub(super) fn fold_plan(
    conn: &Connection,
    owner_id: &str,
    plan_id: &str,
    week_start: NaiveDate,
    now: &str,
) -> Result<MealPlan> {
    let survivor = ensure_plan(conn, owner_id, week_start, now)?;
    conn.execute(
        "UPDATE meal_plan_entries SET plan_id = ?1, updated_at = MAX(updated_at, ?2),
             sync_version = sync_version + 1
         WHERE plan_id = ?3 AND deleted_at IS NULL",
        params![survivor.id, now, plan_id],
    )?;
    tombstone_row(conn, EntityType::MealPlan, owner_id, plan_id, now)?;
    Ok(survivor)
}

pub(super) fn insert_entry_row(
    conn: &Connection,
    owner_id: &str,
    entry: &MealPlanEntry,
    now: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO meal_plan_entries (id, plan_id, owner_id, recipe_id, day, meal_type, servings,
                                        position, created_at, sync_version, updated_at, deleted_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1, ?9, CASE WHEN ?10 THEN ?9 END)",
        params![
            entry.id,
            entry.plan_id,
            owner_id,
            entry.recipe_id,
            entry.day,
            entry.meal_type,
            entry.servings,
            entry.position,
            now,
            entry.sync.is_tombstone(),
        ],
    )?;
    Ok(())
}

/// The owning plan is fixed at creation and never rewritten.
pub(super) fn overwrite_entry(conn: &Connection, entry: &MealPlanEntry, now: &str) -> Result<()> {
    conn.execute(
        "UPDATE meal_plan_entries SET recipe_id = ?1, day = ?2, meal_type = ?3, servings = ?4,
             position = ?5,
             deleted_at = CASE WHEN ?6 THEN COALESCE(deleted_at, ?7) END,
             updated_at = MAX(updated_at, ?7), sync_version = sync_version + 1
         WHERE id = ?8",
        params![
            entry.recipe_id,
            entry.day,
            entry.meal_type,
            entry.servings,
            entry.position,
            entry.sync.is_tombstone(),
            now,
            entry.id,
        ],
    )?;
    Ok(())
}

pub(super) fn require_plan_owner(conn: &Connection, owner_id: &str, plan_id: &str) -> Result<()> {
    match find_any::<MealPlan>(conn, plan_id)? {
        Some(plan) if plan.owner_id == owner_id => Ok(()),
        _ => Err(Error::not_found(EntityType::MealPlan, plan_id)),
    }
}

impl Database {
    pub fn get_or_create_meal_plan(&self, owner_id: &str, week_start: NaiveDate) -> Result<MealPlan> {
        let tx = self.write_tx()?;
        let now = to_db_ts(&stamp());
        let plan = ensure_plan(&tx, owner_id, week_start, &now)?;
        tx.commit()?;
        Ok(plan)
    }

    pub fn get_meal_plan(&self, owner_id: &str, week_start: NaiveDate) -> Result<MealPlan> {
        live_plan_for_week(&self.conn, owner_id, week_start)
    }

    /// Tombstones the plan and its live entries.
    pub fn delete_meal_plan(&self, owner_id: &str, week_start: NaiveDate) -> Result<()> {
        let tx = self.write_tx()?;
        let plan = live_plan_for_week(&tx, owner_id, week_start)?;
        let now = to_db_ts(&stamp());
        tombstone_row(&tx, EntityType::MealPlan, owner_id, &plan.id, &now)?;
        tx.execute(
            "UPDATE meal_plan_entries SET deleted_at = ?1, updated_at = MAX(updated_at, ?1),
                 sync_version = sync_version + 1
             WHERE plan_id = ?2 AND deleted_at IS NULL",
            params![now, plan.id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Creates the week's plan on demand. The recipe must be readable by the
    /// caller.
    pub fn add_meal_plan_entry(
        &self,
        owner_id: &str,
        week_start: NaiveDate,
        new: &NewMealPlanEntry,
    ) -> Result<MealPlanEntry> {
        let tx = self.write_tx()?;
        let now = to_db_ts(&stamp());
        visible_recipe(&tx, owner_id, &new.recipe_id)?;
        let plan = ensure_plan(&tx, owner_id, week_start, &now)?;

        let position: i64 = tx.query_row(
            "SELECT COALESCE(MAX(position) + 1, 0) FROM meal_plan_entries
             WHERE plan_id = ?1 AND day = ?2 AND deleted_at IS NULL",
            params![plan.id, new.day],
            |row| row.get(0),
        )?;
        let created_at = stamp();
        let entry = MealPlanEntry {
            id: new
                .id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            plan_id: plan.id,
            owner_id: owner_id.to_string(),
            recipe_id: new.recipe_id.clone(),
            day: new.day,
            meal_type: new.meal_type.clone(),
            servings: new.servings,
            position,
            created_at,
            sync: SyncMeta {
                sync_version: 1,
                updated_at: created_at,
                deleted_at: None,
            },
        };
        insert_entry_row(&tx, owner_id, &entry, &now)?;
        let created = find_live::<MealPlanEntry>(&tx, owner_id, &entry.id)?;
        tx.commit()?;
        Ok(created)
    }

    /// Entries of the week ordered by day then position; empty when the week
    /// has no plan.
    pub fn list_meal_plan_entries(
        &self,
        owner_id: &str,
        week_start: NaiveDate,
    ) -> Result<Vec<MealPlanEntry>> {
        let plan = match live_plan_for_week(&self.conn, owner_id, week_start) {
            Ok(plan) => plan,
            Err(Error::NotFound { .. }) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        query_rows(
            &self.conn,
            &format!(
                "SELECT {} FROM meal_plan_entries WHERE plan_id = ?1 AND deleted_at IS NULL
                 ORDER BY day, position, rowid",
                MealPlanEntry::COLUMNS
            ),
            params![plan.id],
        )
    }

    pub fn remove_meal_plan_entry(&self, owner_id: &str, id: &str) -> Result<()> {
        let tx = self.write_tx()?;
        let now = to_db_ts(&stamp());
        if !tombstone_row(&tx, EntityType::MealPlanEntry, owner_id, id, &now)? {
            return Err(Error::not_found(EntityType::MealPlanEntry, id));
        }
        tx.commit()?;
        Ok(())
    }
}
