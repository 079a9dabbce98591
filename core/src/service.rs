use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use tracing::warn;

use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::{
    CompletionSummary, EntityChanges, EntityType, MealPlan, MealPlanEntry, NewMealPlanEntry,
    NewPantryItem, NewRecipe, NewShoppingItem, NewShoppingList, PantryItem, PushOutcome, Recipe,
    ShoppingItem, ShoppingList, SyncPayload, SyncPush, UpdatePantryItem, UpdateRecipe,
    UpdateShoppingItem, Watermarks, resolve_id, validate_day, validate_ingredients,
    validate_meal_type, validate_name, validate_quantity, validate_servings, validate_steps,
    validate_week_start,
};

/// Server-side time budgets. Reads get the shorter one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadlines {
    pub read: Duration,
    pub write: Duration,
}

impl Default for Deadlines {
    fn default() -> Self {
        Self {
            read: Duration::from_secs(3),
            write: Duration::from_secs(10),
        }
    }
}

/// Validating facade over [`Database`]. Every call runs under the read or
/// write deadline; callers pass the authenticated owner explicitly.
pub struct LarderService {
    db: Database,
    deadlines: Deadlines,
}

impl LarderService {
    pub fn open(path: &Path, deadlines: Deadlines) -> Result<Self> {
        let db = Database::open(path)?;
        Ok(Self { db, deadlines })
    }

    pub fn new_in_memory() -> Result<Self> {
        let db = Database::open_in_memory()?;
        Ok(Self {
            db,
            deadlines: Deadlines::default(),
        })
    }

    fn read<T>(&self, operation: &str, f: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
        self.bounded(operation, self.deadlines.read, f)
    }

    fn write<T>(&self, operation: &str, f: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
        self.bounded(operation, self.deadlines.write, f)
    }

    fn bounded<T>(
        &self,
        operation: &str,
        budget: Duration,
        f: impl FnOnce(&Database) -> Result<T>,
    ) -> Result<T> {
        self.db.set_deadline(budget)?;
        let result = f(&self.db);
        if matches!(result, Err(Error::Timeout)) {
            warn!(operation, budget_ms = budget.as_millis(), "deadline exceeded");
        }
        self.db.clear_deadline()?;
        result
    }

    // --- Sync ---

    pub fn pull(&self, owner_id: &str, since: &Watermarks) -> Result<SyncPayload> {
        self.read("pull", |db| db.changes_since(owner_id, since))
    }

    pub fn changes_since(
        &self,
        owner_id: &str,
        entity: EntityType,
        since: Option<DateTime<Utc>>,
    ) -> Result<EntityChanges> {
        self.read("changes_since", |db| {
            db.entity_changes_since(owner_id, entity, since)
        })
    }

    /// Apply the client's copies, then answer with everything changed since
    /// the client's watermarks, the pushed rows' new versions included.
    pub fn push(&self, owner_id: &str, push: &SyncPush) -> Result<PushOutcome> {
        let tally = self.write("push", |db| db.apply_push(owner_id, push))?;
        let delta = self.read("pull", |db| db.changes_since(owner_id, &push.since))?;
        Ok(PushOutcome {
            applied: tally.applied,
            conflicts: tally.conflicts,
            merged: tally.merged,
            delta,
        })
    }

    pub fn complete_list(&self, owner_id: &str, list_id: &str) -> Result<CompletionSummary> {
        self.write("complete_list", |db| db.complete_list(owner_id, list_id))
    }

    pub fn import_recipe(
        &self,
        owner_id: &str,
        list_id: &str,
        recipe_id: &str,
    ) -> Result<Vec<ShoppingItem>> {
        self.write("import_recipe", |db| {
            db.import_recipe(owner_id, list_id, recipe_id)
        })
    }

    /// Irreversible; nothing about the account is left to sync.
    pub fn erase_account(&self, owner_id: &str) -> Result<usize> {
        self.write("erase_account", |db| db.erase_account(owner_id))
    }

    // --- Recipes ---

    pub fn create_recipe(&self, owner_id: &str, new: &NewRecipe) -> Result<Recipe> {
        validate_ingredients(&new.ingredients)?;
        validate_steps(&new.steps)?;
        let new = NewRecipe {
            id: Some(resolve_id(new.id.as_deref())?),
            name: validate_name("recipe name", &new.name)?,
            servings: validate_servings(new.servings)?,
            ..new.clone()
        };
        self.write("create_recipe", |db| db.create_recipe(owner_id, &new))
    }

    pub fn get_recipe(&self, owner_id: &str, id: &str) -> Result<Recipe> {
        self.read("get_recipe", |db| db.get_recipe(owner_id, id))
    }

    pub fn list_recipes(&self, owner_id: &str) -> Result<Vec<Recipe>> {
        self.read("list_recipes", |db| db.list_recipes(owner_id))
    }

    pub fn list_public_recipes(&self) -> Result<Vec<Recipe>> {
        self.read("list_public_recipes", Database::list_public_recipes)
    }

    pub fn update_recipe(&self, owner_id: &str, id: &str, update: &UpdateRecipe) -> Result<Recipe> {
        let mut update = update.clone();
        if let Some(name) = &update.name {
            update.name = Some(validate_name("recipe name", name)?);
        }
        if let Some(servings) = update.servings {
            validate_servings(servings)?;
        }
        if let Some(ingredients) = &update.ingredients {
            validate_ingredients(ingredients)?;
        }
        if let Some(steps) = &update.steps {
            validate_steps(steps)?;
        }
        self.write("update_recipe", |db| db.update_recipe(owner_id, id, &update))
    }

    pub fn set_recipe_public(&self, owner_id: &str, id: &str, is_public: bool) -> Result<Recipe> {
        self.write("set_recipe_public", |db| {
            db.set_recipe_public(owner_id, id, is_public)
        })
    }

    pub fn delete_recipe(&self, owner_id: &str, id: &str) -> Result<()> {
        self.write("delete_recipe", |db| db.delete_recipe(owner_id, id))
    }

    pub fn clone_recipe(&self, owner_id: &str, id: &str) -> Result<Recipe> {
        self.write("clone_recipe", |db| db.clone_recipe(owner_id, id))
    }

    // --- Pantry ---

    pub fn add_pantry_item(&self, owner_id: &str, new: &NewPantryItem) -> Result<PantryItem> {
        let new = NewPantryItem {
            name: validate_name("pantry item name", &new.name)?,
            quantity: validate_quantity("quantity", new.quantity)?,
            ..new.clone()
        };
        self.write("add_pantry_item", |db| db.add_pantry_item(owner_id, &new))
    }

    pub fn get_pantry_item(&self, owner_id: &str, id: &str) -> Result<PantryItem> {
        self.read("get_pantry_item", |db| db.get_pantry_item(owner_id, id))
    }

    pub fn list_pantry(&self, owner_id: &str) -> Result<Vec<PantryItem>> {
        self.read("list_pantry", |db| db.list_pantry(owner_id))
    }

    pub fn update_pantry_item(
        &self,
        owner_id: &str,
        id: &str,
        update: &UpdatePantryItem,
    ) -> Result<PantryItem> {
        let mut update = update.clone();
        if let Some(name) = &update.name {
            update.name = Some(validate_name("pantry item name", name)?);
        }
        if let Some(quantity) = update.quantity {
            validate_quantity("quantity", quantity)?;
        }
        self.write("update_pantry_item", |db| {
            db.update_pantry_item(owner_id, id, &update)
        })
    }

    pub fn delete_pantry_item(&self, owner_id: &str, id: &str) -> Result<()> {
        self.write("delete_pantry_item", |db| db.delete_pantry_item(owner_id, id))
    }

    // --- Shopping lists ---

    pub fn create_list(&self, owner_id: &str, new: &NewShoppingList) -> Result<ShoppingList> {
        let new = NewShoppingList {
            id: Some(resolve_id(new.id.as_deref())?),
            name: validate_name("list name", &new.name)?,
        };
        self.write("create_list", |db| db.create_list(owner_id, &new))
    }

    pub fn get_list(&self, owner_id: &str, id: &str) -> Result<ShoppingList> {
        self.read("get_list", |db| db.get_list(owner_id, id))
    }

    pub fn list_lists(&self, owner_id: &str) -> Result<Vec<ShoppingList>> {
        self.read("list_lists", |db| db.list_lists(owner_id))
    }

    pub fn rename_list(&self, owner_id: &str, id: &str, name: &str) -> Result<ShoppingList> {
        let name = validate_name("list name", name)?;
        self.write("rename_list", |db| db.rename_list(owner_id, id, &name))
    }

    pub fn delete_list(&self, owner_id: &str, id: &str) -> Result<()> {
        self.write("delete_list", |db| db.delete_list(owner_id, id))
    }

    pub fn list_items(&self, owner_id: &str, list_id: &str) -> Result<Vec<ShoppingItem>> {
        self.read("list_items", |db| db.list_items(owner_id, list_id))
    }

    pub fn get_item(&self, owner_id: &str, id: &str) -> Result<ShoppingItem> {
        self.read("get_item", |db| db.get_item(owner_id, id))
    }

    pub fn add_item(
        &self,
        owner_id: &str,
        list_id: &str,
        new: &NewShoppingItem,
    ) -> Result<ShoppingItem> {
        let new = NewShoppingItem {
            id: Some(resolve_id(new.id.as_deref())?),
            name: validate_name("item name", &new.name)?,
            quantity: validate_quantity("quantity", new.quantity)?,
            ..new.clone()
        };
        self.write("add_item", |db| db.add_item(owner_id, list_id, &new))
    }

    pub fn update_item(
        &self,
        owner_id: &str,
        id: &str,
        update: &UpdateShoppingItem,
    ) -> Result<ShoppingItem> {
        let mut update = update.clone();
        if let Some(name) = &update.name {
            update.name = Some(validate_name("item name", name)?);
        }
        if let Some(quantity) = update.quantity {
            validate_quantity("quantity", quantity)?;
        }
        self.write("update_item", |db| db.update_item(owner_id, id, &update))
    }

    pub fn delete_item(&self, owner_id: &str, id: &str) -> Result<()> {
        self.write("delete_item", |db| db.delete_item(owner_id, id))
    }

    // --- Meal plans ---

    pub fn meal_plan(&self, owner_id: &str, week_start: NaiveDate) -> Result<MealPlan> {
        let week_start = validate_week_start(week_start)?;
        self.write("meal_plan", |db| {
            db.get_or_create_meal_plan(owner_id, week_start)
        })
    }

    pub fn get_meal_plan(&self, owner_id: &str, week_start: NaiveDate) -> Result<MealPlan> {
        let week_start = validate_week_start(week_start)?;
        self.read("get_meal_plan", |db| db.get_meal_plan(owner_id, week_start))
    }

    pub fn delete_meal_plan(&self, owner_id: &str, week_start: NaiveDate) -> Result<()> {
        let week_start = validate_week_start(week_start)?;
        self.write("delete_meal_plan", |db| {
            db.delete_meal_plan(owner_id, week_start)
        })
    }

    pub fn add_meal_plan_entry(
        &self,
        owner_id: &str,
        week_start: NaiveDate,
        new: &NewMealPlanEntry,
    ) -> Result<MealPlanEntry> {
        let week_start = validate_week_start(week_start)?;
        let new = NewMealPlanEntry {
            id: Some(resolve_id(new.id.as_deref())?),
            recipe_id: new.recipe_id.trim().to_string(),
            day: validate_day(new.day)?,
            meal_type: validate_meal_type(&new.meal_type)?,
            servings: validate_servings(new.servings)?,
        };
        self.write("add_meal_plan_entry", |db| {
            db.add_meal_plan_entry(owner_id, week_start, &new)
        })
    }

    pub fn list_meal_plan_entries(
        &self,
        owner_id: &str,
        week_start: NaiveDate,
    ) -> Result<Vec<MealPlanEntry>> {
        let week_start = validate_week_start(week_start)?;
        self.read("list_meal_plan_entries", |db| {
            db.list_meal_plan_entries(owner_id, week_start)
        })
    }

    pub fn remove_meal_plan_entry(&self, owner_id: &str, id: &str) -> Result<()> {
        self.write("remove_meal_plan_entry", |db| {
            db.remove_meal_plan_entry(owner_id, id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::Resolution;
    use crate::models::Ingredient;

    fn svc() -> LarderService {
        LarderService::new_in_memory().unwrap()
    }

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    #[test]
    fn test_create_recipe_validates_and_trims() {
        let svc = svc();
        let err = svc
            .create_recipe(
                "alice",
                &NewRecipe {
                    name: "   ".into(),
                    ..NewRecipe::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));

        let err = svc
            .create_recipe(
                "alice",
                &NewRecipe {
                    name: "Soup".into(),
                    servings: Some(0.0),
                    ..NewRecipe::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));

        let recipe = svc
            .create_recipe(
                "alice",
                &NewRecipe {
                    name: "  Soup ".into(),
                    ingredients: vec![Ingredient {
                        name: "Leek".into(),
                        quantity: Some(2.0),
                        unit: None,
                        category: Some("veg".into()),
                        note: None,
                    }],
                    ..NewRecipe::default()
                },
            )
            .unwrap();
        assert_eq!(recipe.name, "Soup");
        assert_eq!(recipe.sync.sync_version, 1);
    }

    #[test]
    fn test_client_minted_id_must_be_uuid() {
        let err = svc()
            .create_list(
                "alice",
                &NewShoppingList {
                    id: Some("list-1".into()),
                    name: "Weekly".into(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[test]
    fn test_negative_quantity_is_rejected() {
        let err = svc()
            .add_pantry_item(
                "alice",
                &NewPantryItem {
                    name: "Rice".into(),
                    quantity: Some(-1.0),
                    ..NewPantryItem::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[test]
    fn test_meal_plan_requires_monday_and_valid_entry() {
        let svc = svc();
        let tuesday = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        assert!(matches!(
            svc.meal_plan("alice", tuesday).unwrap_err(),
            Error::Invalid(_)
        ));

        let recipe = svc
            .create_recipe(
                "alice",
                &NewRecipe {
                    name: "Chili".into(),
                    ..NewRecipe::default()
                },
            )
            .unwrap();
        let err = svc
            .add_meal_plan_entry(
                "alice",
                monday(),
                &NewMealPlanEntry {
                    recipe_id: recipe.id.clone(),
                    day: 7,
                    meal_type: "dinner".into(),
                    ..NewMealPlanEntry::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));

        let entry = svc
            .add_meal_plan_entry(
                "alice",
                monday(),
                &NewMealPlanEntry {
                    recipe_id: recipe.id,
                    day: 2,
                    meal_type: "Dinner".into(),
                    ..NewMealPlanEntry::default()
                },
            )
            .unwrap();
        assert_eq!(entry.meal_type, "dinner");
        assert_eq!(svc.list_meal_plan_entries("alice", monday()).unwrap().len(), 1);
    }

    #[test]
    fn test_push_returns_conflicts_and_post_apply_delta() {
        let svc = svc();
        let list = svc
            .create_list(
                "alice",
                &NewShoppingList {
                    id: None,
                    name: "Weekly".into(),
                },
            )
            .unwrap();
        let mark = svc.pull("alice", &Watermarks::default()).unwrap().watermarks();
        std::thread::sleep(Duration::from_millis(2));
        svc.rename_list("alice", &list.id, "Server edit").unwrap();

        // The client edited v1 offline, earlier than the server edit.
        let stale = ShoppingList {
            name: "Client edit".into(),
            ..list.clone()
        };
        let outcome = svc
            .push(
                "alice",
                &SyncPush {
                    since: mark,
                    shopping_lists: vec![stale],
                    ..SyncPush::default()
                },
            )
            .unwrap();

        assert_eq!(outcome.applied, 0);
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].resolution, Resolution::ServerWins);
        let rows = &outcome.delta.shopping_lists.rows;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].record.name, "Server edit");
        assert_eq!(rows[0].record.sync.sync_version, 2);
    }

    #[test]
    fn test_import_then_complete_round_trip() {
        let svc = svc();
        let recipe = svc
            .create_recipe(
                "alice",
                &NewRecipe {
                    name: "Pancakes".into(),
                    ingredients: vec![Ingredient {
                        name: "Milk".into(),
                        quantity: Some(0.5),
                        unit: Some("l".into()),
                        category: Some("dairy".into()),
                        note: None,
                    }],
                    ..NewRecipe::default()
                },
            )
            .unwrap();
        let list = svc
            .create_list(
                "alice",
                &NewShoppingList {
                    id: None,
                    name: "Brunch".into(),
                },
            )
            .unwrap();

        let items = svc.import_recipe("alice", &list.id, &recipe.id).unwrap();
        assert_eq!(items.len(), 1);
        assert!(matches!(
            svc.import_recipe("alice", &list.id, &recipe.id).unwrap_err(),
            Error::AlreadyExists(_)
        ));

        svc.update_item(
            "alice",
            &items[0].id,
            &UpdateShoppingItem {
                checked: Some(true),
                ..UpdateShoppingItem::default()
            },
        )
        .unwrap();
        let summary = svc.complete_list("alice", &list.id).unwrap();
        assert_eq!(summary.pantry.len(), 1);
        assert_eq!(summary.pantry[0].quantity, Some(0.5));
    }

    #[test]
    fn test_erase_account_leaves_nothing_to_pull() {
        let svc = svc();
        svc.add_pantry_item(
            "alice",
            &NewPantryItem {
                name: "Salt".into(),
                ..NewPantryItem::default()
            },
        )
        .unwrap();
        assert_eq!(svc.erase_account("alice").unwrap(), 1);
        let delta = svc.pull("alice", &Watermarks::default()).unwrap();
        assert!(delta.pantry_items.is_empty());
    }
}
