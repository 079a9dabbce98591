use rusqlite::{Connection, Row, params};
use uuid::Uuid;

use super::{
    Database, Table, decode_failure, find_any, find_live, list_live, query_rows, stamp, sync_cols,
    to_db_ts, tombstone_row,
};
use crate::error::{Error, Result};
use crate::models::{
    EntityType, Ingredient, NewRecipe, Recipe, Step, SyncMeta, UpdateRecipe, Versioned,
};

impl Table for Recipe {
    const COLUMNS: &'static str = "id, owner_id, name, description, servings, tags, is_public, \
         created_at, sync_version, updated_at, deleted_at";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let tags_raw: String = row.get(5)?;
        let tags = serde_json::from_str(&tags_raw).map_err(|e| decode_failure(5, e))?;
        let (created_at, sync) = sync_cols(row, 7)?;
        Ok(Recipe {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            name: row.get(2)?,
            description: row.get(3)?,
            servings: row.get(4)?,
            tags,
            is_public: row.get(6)?,
            ingredients: Vec::new(),
            steps: Vec::new(),
            created_at,
            sync,
        })
    }

    fn hydrate(&mut self, conn: &Connection) -> Result<()> {
        let mut stmt = conn.prepare(
            "SELECT name, quantity, unit, category, note FROM recipe_ingredients
             WHERE recipe_id = ?1 ORDER BY position",
        )?;
        self.ingredients = stmt
            .query_map(params![self.id], |row| {
                Ok(Ingredient {
                    name: row.get(0)?,
                    quantity: row.get(1)?,
                    unit: row.get(2)?,
                    category: row.get(3)?,
                    note: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT instruction, timer_minutes FROM recipe_steps
             WHERE recipe_id = ?1 ORDER BY position",
        )?;
        self.steps = stmt
            .query_map(params![self.id], |row| {
                Ok(Step {
                    instruction: row.get(0)?,
                    timer_minutes: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(())
    }
}

fn encode_tags(tags: &[String]) -> Result<String> {
    serde_json::to_string(tags).map_err(|e| Error::Decode(e.to_string()))
}

/// Collections are replaced wholesale on every write.
fn write_children(conn: &Connection, recipe: &Recipe) -> Result<()> {
    conn.execute(
        "DELETE FROM recipe_ingredients WHERE recipe_id = ?1",
        params![recipe.id],
    )?;
    conn.execute(
        "DELETE FROM recipe_steps WHERE recipe_id = ?1",
        params![recipe.id],
    )?;

    let mut stmt = conn.prepare(
        "INSERT INTO recipe_ingredients (recipe_id, position, name, quantity, unit, category, note)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    for (position, ing) in (0_i64..).zip(&recipe.ingredients) {
        stmt.execute(params![
            recipe.id,
            position,
            ing.name.trim(),
            ing.quantity,
            ing.unit,
            ing.category,
            ing.note,
        ])?;
    }

    let mut stmt = conn.prepare(
        "INSERT INTO recipe_steps (recipe_id, position, instruction, timer_minutes)
         VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (position, step) in (0_i64..).zip(&recipe.steps) {
        stmt.execute(params![recipe.id, position, step.instruction, step.timer_minutes])?;
    }
    Ok(())
}

/// New row at version 1 stamped `now`. A tombstoned copy is stored deleted.
pub(super) fn insert_recipe(
    conn: &Connection,
    owner_id: &str,
    recipe: &Recipe,
    now: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO recipes (id, owner_id, name, description, servings, tags, is_public,
                              created_at, sync_version, updated_at, deleted_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?8, CASE WHEN ?9 THEN ?8 END)",
        params![
            recipe.id,
            owner_id,
            recipe.name.trim(),
            recipe.description,
            recipe.servings,
            encode_tags(&recipe.tags)?,
            recipe.is_public,
            now,
            recipe.sync.is_tombstone(),
        ],
    )?;
    write_children(conn, recipe)
}

/// Replace fields and tombstone status of an existing row, bumping its version.
pub(super) fn overwrite_recipe(conn: &Connection, recipe: &Recipe, now: &str) -> Result<()> {
    conn.execute(
        "UPDATE recipes SET name = ?1, description = ?2, servings = ?3, tags = ?4,
             is_public = ?5,
             deleted_at = CASE WHEN ?6 THEN COALESCE(deleted_at, ?7) END,
             updated_at = MAX(updated_at, ?7), sync_version = sync_version + 1
         WHERE id = ?8",
        params![
            recipe.name.trim(),
            recipe.description,
            recipe.servings,
            encode_tags(&recipe.tags)?,
            recipe.is_public,
            recipe.sync.is_tombstone(),
            now,
            recipe.id,
        ],
    )?;
    write_children(conn, recipe)
}

/// Live and either owned by the caller or published.
pub(super) fn visible_recipe(conn: &Connection, owner_id: &str, id: &str) -> Result<Recipe> {
    match find_any::<Recipe>(conn, id)? {
        Some(r) if !r.sync.is_tombstone() && (r.owner_id == owner_id || r.is_public) => Ok(r),
        _ => Err(Error::not_found(EntityType::Recipe, id)),
    }
}

fn draft(id: String, owner_id: &str) -> Recipe {
    let now = stamp();
    Recipe {
        id,
        owner_id: owner_id.to_string(),
        name: String::new(),
        description: None,
        servings: None,
        tags: Vec::new(),
        is_public: false,
        ingredients: Vec::new(),
        steps: Vec::new(),
        created_at: now,
        sync: SyncMeta {
            sync_version: 1,
            updated_at: now,
            deleted_at: None,
        },
    }
}

impl Database {
    pub fn create_recipe(&self, owner_id: &str, new: &NewRecipe) -> Result<Recipe> {
        let id = new
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let recipe = Recipe {
            name: new.name.clone(),
            description: new.description.clone(),
            servings: new.servings,
            tags: new.tags.clone(),
            is_public: new.is_public,
            ingredients: new.ingredients.clone(),
            steps: new.steps.clone(),
            ..draft(id, owner_id)
        };

        let tx = self.write_tx()?;
        let now = to_db_ts(&stamp());
        insert_recipe(&tx, owner_id, &recipe, &now)?;
        let created = find_live::<Recipe>(&tx, owner_id, &recipe.id)?;
        tx.commit()?;
        Ok(created)
    }

    /// Own recipes and published ones are readable.
    pub fn get_recipe(&self, owner_id: &str, id: &str) -> Result<Recipe> {
        visible_recipe(&self.conn, owner_id, id)
    }

    pub fn list_recipes(&self, owner_id: &str) -> Result<Vec<Recipe>> {
        list_live(&self.conn, owner_id, "name COLLATE NOCASE, rowid")
    }

    pub fn list_public_recipes(&self) -> Result<Vec<Recipe>> {
        query_rows(
            &self.conn,
            &format!(
                "SELECT {} FROM recipes WHERE is_public = 1 AND deleted_at IS NULL
                 ORDER BY name COLLATE NOCASE, rowid",
                Recipe::COLUMNS
            ),
            [],
        )
    }

    pub fn update_recipe(&self, owner_id: &str, id: &str, update: &UpdateRecipe) -> Result<Recipe> {
        let tx = self.write_tx()?;
        let mut recipe = find_live::<Recipe>(&tx, owner_id, id)?;
        if let Some(name) = &update.name {
            recipe.name.clone_from(name);
        }
        if let Some(description) = &update.description {
            recipe.description.clone_from(description);
        }
        if let Some(servings) = update.servings {
            recipe.servings = servings;
        }
        if let Some(tags) = &update.tags {
            recipe.tags.clone_from(tags);
        }
        if let Some(is_public) = update.is_public {
            recipe.is_public = is_public;
        }
        if let Some(ingredients) = &update.ingredients {
            recipe.ingredients.clone_from(ingredients);
        }
        if let Some(steps) = &update.steps {
            recipe.steps.clone_from(steps);
        }

        let now = to_db_ts(&stamp());
        overwrite_recipe(&tx, &recipe, &now)?;
        let updated = find_live::<Recipe>(&tx, owner_id, id)?;
        tx.commit()?;
        Ok(updated)
    }

    pub fn set_recipe_public(&self, owner_id: &str, id: &str, is_public: bool) -> Result<Recipe> {
        self.update_recipe(
            owner_id,
            id,
            &UpdateRecipe {
                is_public: Some(is_public),
                ..UpdateRecipe::default()
            },
        )
    }

    pub fn delete_recipe(&self, owner_id: &str, id: &str) -> Result<()> {
        let tx = self.write_tx()?;
        let now = to_db_ts(&stamp());
        if !tombstone_row(&tx, EntityType::Recipe, owner_id, id, &now)? {
            return Err(Error::not_found(EntityType::Recipe, id));
        }
        tx.commit()?;
        Ok(())
    }

    /// Copy a visible recipe into the caller's account as an independent,
    /// private row.
    pub fn clone_recipe(&self, owner_id: &str, id: &str) -> Result<Recipe> {
        let tx = self.write_tx()?;
        let source = visible_recipe(&tx, owner_id, id)?;
        let copy = Recipe {
            name: source.name,
            description: source.description,
            servings: source.servings,
            tags: source.tags,
            ingredients: source.ingredients,
            steps: source.steps,
            ..draft(Uuid::new_v4().to_string(), owner_id)
        };
        let now = to_db_ts(&stamp());
        insert_recipe(&tx, owner_id, &copy, &now)?;
        let cloned = find_live::<Recipe>(&tx, owner_id, copy.id())?;
        tx.commit()?;
        Ok(cloned)
    }
}
