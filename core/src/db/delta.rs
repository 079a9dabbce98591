use chrono::{DateTime, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior, params};
use tracing::debug;

use super::{Database, Table, query_rows, stamp, to_db_ts};
use crate::error::Result;
use crate::models::{
    DeltaBatch, EntityChanges, EntityType, MealPlan, MealPlanEntry, PantryItem, Recipe,
    ShoppingItem, ShoppingList, SyncPayload, Watermarks,
};

/// Rows of one type changed strictly after `since`, tombstones included,
/// ordered by `updated_at` with insertion order breaking ties.
fn batch_since<T: Table>(
    conn: &Connection,
    owner_id: &str,
    since: Option<DateTime<Utc>>,
) -> Result<DeltaBatch<T>> {
    let sql = format!(
        "SELECT {} FROM {} WHERE owner_id = ?1 AND (?2 IS NULL OR updated_at > ?2)
         ORDER BY updated_at, rowid",
        T::COLUMNS,
        T::ENTITY.table()
    );
    let rows = query_rows::<T>(conn, &sql, params![owner_id, since.as_ref().map(to_db_ts)])?;
    debug!(entity = %T::ENTITY, owner_id, rows = rows.len(), "delta extracted");
    Ok(DeltaBatch::from_rows(rows, since))
}

impl Database {
    /// Every entity type's changes after its watermark, read from a single
    /// snapshot.
    pub fn changes_since(&self, owner_id: &str, since: &Watermarks) -> Result<SyncPayload> {
        let server_timestamp = stamp();
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Deferred)?;
        let payload = SyncPayload {
            recipes: batch_since(&tx, owner_id, since.recipes)?,
            pantry_items: batch_since(&tx, owner_id, since.pantry_items)?,
            shopping_lists: batch_since(&tx, owner_id, since.shopping_lists)?,
            shopping_items: batch_since(&tx, owner_id, since.shopping_items)?,
            meal_plans: batch_since(&tx, owner_id, since.meal_plans)?,
            meal_plan_entries: batch_since(&tx, owner_id, since.meal_plan_entries)?,
            server_timestamp,
        };
        tx.finish()?;
        Ok(payload)
    }

    pub fn entity_changes_since(
        &self,
        owner_id: &str,
        entity: EntityType,
        since: Option<DateTime<Utc>>,
    ) -> Result<EntityChanges> {
        let conn = &self.conn;
        Ok(match entity {
            EntityType::Recipe => {
                EntityChanges::Recipes(batch_since::<Recipe>(conn, owner_id, since)?)
            }
            EntityType::PantryItem => {
                EntityChanges::PantryItems(batch_since::<PantryItem>(conn, owner_id, since)?)
            }
            EntityType::ShoppingList => {
                EntityChanges::ShoppingLists(batch_since::<ShoppingList>(conn, owner_id, since)?)
            }
            EntityType::ShoppingItem => {
                EntityChanges::ShoppingItems(batch_since::<ShoppingItem>(conn, owner_id, since)?)
            }
            EntityType::MealPlan => {
                EntityChanges::MealPlans(batch_since::<MealPlan>(conn, owner_id, since)?)
            }
            EntityType::MealPlanEntry => {
                EntityChanges::MealPlanEntries(batch_since::<MealPlanEntry>(conn, owner_id, since)?)
            }
        })
    }
}
