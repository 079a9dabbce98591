use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use super::{
    Database, Table, decode_failure, find_any, find_live, list_live, stamp, sync_cols, to_db_ts,
    tombstone_row,
};
use crate::category::{Category, normalize_category};
use crate::error::{Error, Result};
use crate::models::{
    EntityType, NewPantryItem, PantryItem, UpdatePantryItem, Versioned, add_quantities,
};

impl Table for PantryItem {
    const COLUMNS: &'static str = "id, owner_id, name, category, quantity, unit, \
         created_at, sync_version, updated_at, deleted_at";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let raw: String = row.get(3)?;
        let category = Category::parse(&raw)
            .ok_or_else(|| decode_failure(3, format!("unknown category '{raw}'")))?;
        let (created_at, sync) = sync_cols(row, 6)?;
        Ok(PantryItem {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            name: row.get(2)?,
            category,
            quantity: row.get(4)?,
            unit: row.get(5)?,
            created_at,
            sync,
        })
    }
}

/// Stock arriving at the pantry, already normalized to a merge key.
pub(super) struct Stock<'a> {
    pub name: &'a str,
    pub category: Category,
    pub quantity: Option<f64>,
    pub unit: Option<&'a str>,
}

/// Row for the merge key, live or tombstoned. Names compare case-insensitively
/// through the column collation.
pub(super) fn find_by_key(
    conn: &Connection,
    owner_id: &str,
    name: &str,
    category: Category,
) -> Result<Option<PantryItem>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {} FROM pantry_items WHERE owner_id = ?1 AND name = ?2 AND category = ?3",
                PantryItem::COLUMNS
            ),
            params![owner_id, name.trim(), category.as_str()],
            PantryItem::from_row,
        )
        .optional()?)
}

/// The single pantry upsert used by direct adds, list completion and pushed
/// copies landing on a stocked key.
///
/// * no row for the key: insert
/// * live row: add quantities, keep the existing unit unless it has none
/// * tombstoned row: resurrect with the incoming quantity
///
/// Every path leaves the row one version higher and re-stamped.
pub(super) fn merge_into_pantry(
    conn: &Connection,
    owner_id: &str,
    stock: &Stock<'_>,
    now: &str,
) -> Result<PantryItem> {
    let name = stock.name.trim();
    let id = match find_by_key(conn, owner_id, name, stock.category)? {
        None => {
            let id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO pantry_items (id, owner_id, name, category, quantity, unit,
                                           created_at, sync_version, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?7)",
                params![
                    id,
                    owner_id,
                    name,
                    stock.category.as_str(),
                    stock.quantity,
                    stock.unit,
                    now,
                ],
            )?;
            id
        }
        Some(existing) if !existing.sync.is_tombstone() => {
            conn.execute(
                "UPDATE pantry_items SET quantity = ?1, unit = COALESCE(unit, ?2),
                     updated_at = MAX(updated_at, ?3), sync_version = sync_version + 1
                 WHERE id = ?4",
                params![
                    add_quantities(existing.quantity, stock.quantity),
                    stock.unit,
                    now,
                    existing.id,
                ],
            )?;
            existing.id
        }
        Some(existing) => {
            conn.execute(
                "UPDATE pantry_items SET quantity = ?1, unit = COALESCE(?2, unit),
                     deleted_at = NULL,
                     updated_at = MAX(updated_at, ?3), sync_version = sync_version + 1
                 WHERE id = ?4",
                params![stock.quantity, stock.unit, now, existing.id],
            )?;
            existing.id
        }
    };
    find_any::<PantryItem>(conn, &id)?.ok_or_else(|| Error::not_found(EntityType::PantryItem, id))
}

/// Raw insert at version 1 under the row's own id, bypassing the merge. Only
/// valid when the key is free.
pub(super) fn insert_pantry_row(
    conn: &Connection,
    owner_id: &str,
    item: &PantryItem,
    now: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO pantry_items (id, owner_id, name, category, quantity, unit,
                                   created_at, sync_version, updated_at, deleted_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?7, CASE WHEN ?8 THEN ?7 END)",
        params![
            item.id,
            owner_id,
            item.name.trim(),
            item.category.as_str(),
            item.quantity,
            item.unit,
            now,
            item.sync.is_tombstone(),
        ],
    )?;
    Ok(())
}

/// A changed name or category that lands on another row's key fails with
/// `AlreadyExists` through the unique index; pushes go through
/// [`fold_pantry_row`] instead.
pub(super) fn overwrite_pantry(conn: &Connection, item: &PantryItem, now: &str) -> Result<()> {
    conn.execute(
        "UPDATE pantry_items SET name = ?1, category = ?2, quantity = ?3, unit = ?4,
             deleted_at = CASE WHEN ?5 THEN COALESCE(deleted_at, ?6) END,
             updated_at = MAX(updated_at, ?6), sync_version = sync_version + 1
         WHERE id = ?7",
        params![
            item.name.trim(),
            item.category.as_str(),
            item.quantity,
            item.unit,
            item.sync.is_tombstone(),
            now,
            item.id,
        ],
    )?;
    Ok(())
}

/// Retire row `item.id` into the row holding `item`'s key: the copy's stock
/// is merged there and `item.id` is tombstoned under its old key. Returns the
/// surviving row.
pub(super) fn fold_pantry_row(
    conn: &Connection,
    owner_id: &str,
    item: &PantryItem,
    now: &str,
) -> Result<PantryItem> {
    let stock = Stock {
        name: &item.name,
        category: item.category,
        quantity: item.quantity,
        unit: item.unit.as_deref(),
    };
    let survivor = merge_into_pantry(conn, owner_id, &stock, now)?;
    tombstone_row(conn, EntityType::PantryItem, owner_id, &item.id, now)?;
    Ok(survivor)
}

impl Database {
    /// Additive: adding stock for an existing key increases its quantity.
    pub fn add_pantry_item(&self, owner_id: &str, new: &NewPantryItem) -> Result<PantryItem> {
        let stock = Stock {
            name: &new.name,
            category: normalize_category(new.category.as_deref()),
            quantity: new.quantity,
            unit: new.unit.as_deref(),
        };
        let tx = self.write_tx()?;
        let now = to_db_ts(&stamp());
        let item = merge_into_pantry(&tx, owner_id, &stock, &now)?;
        tx.commit()?;
        Ok(item)
    }

    pub fn get_pantry_item(&self, owner_id: &str, id: &str) -> Result<PantryItem> {
        find_live(&self.conn, owner_id, id)
    }

    pub fn list_pantry(&self, owner_id: &str) -> Result<Vec<PantryItem>> {
        list_live(&self.conn, owner_id, "category, name COLLATE NOCASE")
    }

    pub fn update_pantry_item(
        &self,
        owner_id: &str,
        id: &str,
        update: &UpdatePantryItem,
    ) -> Result<PantryItem> {
        let tx = self.write_tx()?;
        let mut item = find_live::<PantryItem>(&tx, owner_id, id)?;
        if let Some(name) = &update.name {
            item.name.clone_from(name);
        }
        if let Some(category) = &update.category {
            item.category = normalize_category(Some(category));
        }
        if let Some(quantity) = update.quantity {
            item.quantity = quantity;
        }
        if let Some(unit) = &update.unit {
            item.unit.clone_from(unit);
        }

        let now = to_db_ts(&stamp());
        overwrite_pantry(&tx, &item, &now)?;
        let updated = find_live::<PantryItem>(&tx, owner_id, item.id())?;
        tx.commit()?;
        Ok(updated)
    }

    pub fn delete_pantry_item(&self, owner_id: &str, id: &str) -> Result<()> {
        let tx = self.write_tx()?;
        let now = to_db_ts(&stamp());
        if !tombstone_row(&tx, EntityType::PantryItem, owner_id, id, &now)? {
            return Err(Error::not_found(EntityType::PantryItem, id));
        }
        tx.commit()?;
        Ok(())
    }
}
