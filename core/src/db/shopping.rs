use rusqlite::{Connection, Row, params};
use uuid::Uuid;

use super::recipes::visible_recipe;
use super::{
    Database, Table, find_any, find_live, list_live, next_position, query_rows, stamp, sync_cols,
    to_db_ts, tombstone_row,
};
use crate::category::normalize_category;
use crate::error::{Error, Result};
use crate::models::{
    EntityType, NewShoppingItem, NewShoppingList, ShoppingItem, ShoppingList, SyncMeta,
    UpdateShoppingItem,
};

impl Table for ShoppingList {
    const COLUMNS: &'static str = "id, owner_id, name, created_at, sync_version, updated_at, deleted_at";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let (created_at, sync) = sync_cols(row, 3)?;
        Ok(ShoppingList {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            name: row.get(2)?,
            created_at,
            sync,
        })
    }
}

impl Table for ShoppingItem {
    const COLUMNS: &'static str = "id, list_id, owner_id, name, quantity, unit, category, checked, \
         recipe_tag, position, created_at, sync_version, updated_at, deleted_at";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let (created_at, sync) = sync_cols(row, 10)?;
        Ok(ShoppingItem {
            id: row.get(0)?,
            list_id: row.get(1)?,
            owner_id: row.get(2)?,
            name: row.get(3)?,
            quantity: row.get(4)?,
            unit: row.get(5)?,
            category: row.get(6)?,
            checked: row.get(7)?,
            recipe_tag: row.get(8)?,
            position: row.get(9)?,
            created_at,
            sync,
        })
    }
}

pub(super) fn insert_list_row(
    conn: &Connection,
    owner_id: &str,
    list: &ShoppingList,
    now: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO shopping_lists (id, owner_id, name, created_at, sync_version, updated_at, deleted_at)
         VALUES (?1, ?2, ?3, ?4, 1, ?4, CASE WHEN ?5 THEN ?4 END)",
        params![list.id, owner_id, list.name.trim(), now, list.sync.is_tombstone()],
    )?;
    Ok(())
}

pub(super) fn overwrite_list(conn: &Connection, list: &ShoppingList, now: &str) -> Result<()> {
    conn.execute(
        "UPDATE shopping_lists SET name = ?1,
             deleted_at = CASE WHEN ?2 THEN COALESCE(deleted_at, ?3) END,
             updated_at = MAX(updated_at, ?3), sync_version = sync_version + 1
         WHERE id = ?4",
        params![list.name.trim(), list.sync.is_tombstone(), now, list.id],
    )?;
    Ok(())
}

pub(super) fn insert_item_row(
    conn: &Connection,
    owner_id: &str,
    item: &ShoppingItem,
    now: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO shopping_items (id, list_id, owner_id, name, quantity, unit, category,
                                     checked, recipe_tag, position, created_at, sync_version,
                                     updated_at, deleted_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 1, ?11, CASE WHEN ?12 THEN ?11 END)",
        params![
            item.id,
            item.list_id,
            owner_id,
            item.name.trim(),
            item.quantity,
            item.unit,
            item.category,
            item.checked,
            item.recipe_tag,
            item.position,
            now,
            item.sync.is_tombstone(),
        ],
    )?;
    Ok(())
}

/// The parent list is fixed at creation and never rewritten.
pub(super) fn overwrite_item(conn: &Connection, item: &ShoppingItem, now: &str) -> Result<()> {
    conn.execute(
        "UPDATE shopping_items SET name = ?1, quantity = ?2, unit = ?3, category = ?4,
             checked = ?5, recipe_tag = ?6, position = ?7,
             deleted_at = CASE WHEN ?8 THEN COALESCE(deleted_at, ?9) END,
             updated_at = MAX(updated_at, ?9), sync_version = sync_version + 1
         WHERE id = ?10",
        params![
            item.name.trim(),
            item.quantity,
            item.unit,
            item.category,
            item.checked,
            item.recipe_tag,
            item.position,
            item.sync.is_tombstone(),
            now,
            item.id,
        ],
    )?;
    Ok(())
}

/// The list must exist and belong to `owner_id`; deleted lists still count.
pub(super) fn require_list_owner(conn: &Connection, owner_id: &str, list_id: &str) -> Result<()> {
    match find_any::<ShoppingList>(conn, list_id)? {
        Some(list) if list.owner_id == owner_id => Ok(()),
        _ => Err(Error::not_found(EntityType::ShoppingList, list_id)),
    }
}

fn live_items(conn: &Connection, list_id: &str) -> Result<Vec<ShoppingItem>> {
    query_rows(
        conn,
        &format!(
            "SELECT {} FROM shopping_items WHERE list_id = ?1 AND deleted_at IS NULL
             ORDER BY position, rowid",
            ShoppingItem::COLUMNS
        ),
        params![list_id],
    )
}

fn blank_item(list_id: &str, owner_id: &str, id: String) -> ShoppingItem {
    let now = stamp();
    ShoppingItem {
        id,
        list_id: list_id.to_string(),
        owner_id: owner_id.to_string(),
        name: String::new(),
        quantity: None,
        unit: None,
        category: None,
        checked: false,
        recipe_tag: None,
        position: 0,
        created_at: now,
        sync: SyncMeta {
            sync_version: 1,
            updated_at: now,
            deleted_at: None,
        },
    }
}

impl Database {
    pub fn create_list(&self, owner_id: &str, new: &NewShoppingList) -> Result<ShoppingList> {
        let now_ts = stamp();
        let list = ShoppingList {
            id: new
                .id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            owner_id: owner_id.to_string(),
            name: new.name.clone(),
            created_at: now_ts,
            sync: SyncMeta {
                sync_version: 1,
                updated_at: now_ts,
                deleted_at: None,
            },
        };
        let tx = self.write_tx()?;
        let now = to_db_ts(&stamp());
        insert_list_row(&tx, owner_id, &list, &now)?;
        let created = find_live::<ShoppingList>(&tx, owner_id, &list.id)?;
        tx.commit()?;
        Ok(created)
    }

    pub fn get_list(&self, owner_id: &str, id: &str) -> Result<ShoppingList> {
        find_live(&self.conn, owner_id, id)
    }

    pub fn list_lists(&self, owner_id: &str) -> Result<Vec<ShoppingList>> {
        list_live(&self.conn, owner_id, "created_at DESC, rowid DESC")
    }

    pub fn rename_list(&self, owner_id: &str, id: &str, name: &str) -> Result<ShoppingList> {
        let tx = self.write_tx()?;
        let mut list = find_live::<ShoppingList>(&tx, owner_id, id)?;
        name.clone_into(&mut list.name);
        let now = to_db_ts(&stamp());
        overwrite_list(&tx, &list, &now)?;
        let renamed = find_live::<ShoppingList>(&tx, owner_id, id)?;
        tx.commit()?;
        Ok(renamed)
    }

    /// Tombstones the list and every live item on it.
    pub fn delete_list(&self, owner_id: &str, id: &str) -> Result<()> {
        let tx = self.write_tx()?;
        let now = to_db_ts(&stamp());
        if !tombstone_row(&tx, EntityType::ShoppingList, owner_id, id, &now)? {
            return Err(Error::not_found(EntityType::ShoppingList, id));
        }
        tx.execute(
            "UPDATE shopping_items SET deleted_at = ?1, updated_at = MAX(updated_at, ?1),
                 sync_version = sync_version + 1
             WHERE list_id = ?2 AND deleted_at IS NULL",
            params![now, id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn list_items(&self, owner_id: &str, list_id: &str) -> Result<Vec<ShoppingItem>> {
        find_live::<ShoppingList>(&self.conn, owner_id, list_id)?;
        live_items(&self.conn, list_id)
    }

    pub fn get_item(&self, owner_id: &str, id: &str) -> Result<ShoppingItem> {
        find_live(&self.conn, owner_id, id)
    }

    pub fn add_item(
        &self,
        owner_id: &str,
        list_id: &str,
        new: &NewShoppingItem,
    ) -> Result<ShoppingItem> {
        let tx = self.write_tx()?;
        find_live::<ShoppingList>(&tx, owner_id, list_id)?;
        let id = new
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let item = ShoppingItem {
            name: new.name.clone(),
            quantity: new.quantity,
            unit: new.unit.clone(),
            category: new.category.clone(),
            checked: new.checked,
            position: next_position(&tx, "shopping_items", "list_id", list_id)?,
            ..blank_item(list_id, owner_id, id)
        };
        let now = to_db_ts(&stamp());
        insert_item_row(&tx, owner_id, &item, &now)?;
        let created = find_live::<ShoppingItem>(&tx, owner_id, &item.id)?;
        tx.commit()?;
        Ok(created)
    }

    pub fn update_item(
        &self,
        owner_id: &str,
        id: &str,
        update: &UpdateShoppingItem,
    ) -> Result<ShoppingItem> {
        let tx = self.write_tx()?;
        let mut item = find_live::<ShoppingItem>(&tx, owner_id, id)?;
        if let Some(name) = &update.name {
            item.name.clone_from(name);
        }
        if let Some(quantity) = update.quantity {
            item.quantity = quantity;
        }
        if let Some(unit) = &update.unit {
            item.unit.clone_from(unit);
        }
        if let Some(category) = &update.category {
            item.category.clone_from(category);
        }
        if let Some(checked) = update.checked {
            item.checked = checked;
        }
        if let Some(position) = update.position {
            item.position = position;
        }
        let now = to_db_ts(&stamp());
        overwrite_item(&tx, &item, &now)?;
        let updated = find_live::<ShoppingItem>(&tx, owner_id, id)?;
        tx.commit()?;
        Ok(updated)
    }

    pub fn delete_item(&self, owner_id: &str, id: &str) -> Result<()> {
        let tx = self.write_tx()?;
        let now = to_db_ts(&stamp());
        if !tombstone_row(&tx, EntityType::ShoppingItem, owner_id, id, &now)? {
            return Err(Error::not_found(EntityType::ShoppingItem, id));
        }
        tx.commit()?;
        Ok(())
    }

    /// Add one item per recipe ingredient, tagged with the recipe name.
    ///
    /// Refused with `AlreadyExists` when any live item on the list already
    /// carries that tag; existing rows are never touched.
    pub fn import_recipe(
        &self,
        owner_id: &str,
        list_id: &str,
        recipe_id: &str,
    ) -> Result<Vec<ShoppingItem>> {
        let tx = self.write_tx()?;
        find_live::<ShoppingList>(&tx, owner_id, list_id)?;
        let recipe = visible_recipe(&tx, owner_id, recipe_id)?;

        let already: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM shopping_items
                           WHERE list_id = ?1 AND recipe_tag = ?2 AND deleted_at IS NULL)",
            params![list_id, recipe.name],
            |row| row.get(0),
        )?;
        if already {
            tracing::debug!(list_id, recipe = %recipe.name, "duplicate recipe import refused");
            return Err(Error::AlreadyExists(format!(
                "recipe '{}' is already on shopping list {list_id}",
                recipe.name
            )));
        }

        let now = to_db_ts(&stamp());
        let mut position = next_position(&tx, "shopping_items", "list_id", list_id)?;
        let mut ids = Vec::with_capacity(recipe.ingredients.len());
        for ingredient in &recipe.ingredients {
            let item = ShoppingItem {
                name: ingredient.name.clone(),
                quantity: ingredient.quantity,
                unit: ingredient.unit.clone(),
                category: Some(
                    normalize_category(ingredient.category.as_deref())
                        .as_str()
                        .to_string(),
                ),
                recipe_tag: Some(recipe.name.clone()),
                position,
                ..blank_item(list_id, owner_id, Uuid::new_v4().to_string())
            };
            insert_item_row(&tx, owner_id, &item, &now)?;
            ids.push(item.id);
            position += 1;
        }

        let mut items = Vec::with_capacity(ids.len());
        for id in &ids {
            items.push(find_live::<ShoppingItem>(&tx, owner_id, id)?);
        }
        tx.commit()?;
        tracing::info!(list_id, recipe = %recipe.name, items = items.len(), "recipe imported");
        Ok(items)
    }
}
