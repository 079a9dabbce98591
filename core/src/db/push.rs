//! Client → server reconciliation.
//!
//! Each pushed copy carries the version the client last saw. Unknown ids are
//! inserted, copies based on the current version fast-forward, and anything
//! else goes through the conflict policy. One push is one transaction.
//!
//! Pantry items and meal plans also have a natural key (merge key, week). A
//! copy landing on a key held by another row is folded into that row and its
//! id is remembered as an alias, so a retried push never applies twice.

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};

use super::meal_plans::{
    ensure_plan, find_plan_for_week, fold_plan, insert_entry_row, insert_plan_row, overwrite_entry,
    overwrite_plan, require_plan_owner,
};
use super::pantry::{
    Stock, find_by_key, fold_pantry_row, insert_pantry_row, merge_into_pantry, overwrite_pantry,
};
use super::recipes::{insert_recipe, overwrite_recipe, visible_recipe};
use super::shopping::{
    insert_item_row, insert_list_row, overwrite_item, overwrite_list, require_list_owner,
};
use super::{Database, Table, find_any, stamp, to_db_ts};
use crate::conflict::{ConflictRecord, Resolution, needs_resolution, resolve};
use crate::error::{Error, Result};
use crate::models::{
    EntityType, IdRemap, MealPlan, MealPlanEntry, PantryItem, Recipe, ShoppingItem, ShoppingList,
    SyncPush, validate_day, validate_id, validate_ingredients, validate_meal_type, validate_name,
    validate_quantity, validate_servings, validate_steps, validate_week_start,
};

/// Where a written copy ended up.
enum Landing {
    /// Stored under the pushed id.
    Own,
    /// Folded into row `into`; `credited` is false when the survivor was left
    /// untouched.
    Folded { into: String, credited: bool },
}

/// How a pushed copy of one entity type is checked and written.
trait PushTarget: Table {
    fn validate(&self) -> Result<()>;

    /// First sighting of this id: store it at version 1.
    fn insert(conn: &Connection, owner_id: &str, copy: &Self, now: &str) -> Result<Landing>;

    /// Persist the client copy over the server row, one version higher.
    fn overwrite(
        conn: &Connection,
        owner_id: &str,
        copy: &Self,
        server: &Self,
        now: &str,
    ) -> Result<Landing>;
}

impl PushTarget for Recipe {
    fn validate(&self) -> Result<()> {
        validate_name("recipe name", &self.name)?;
        validate_servings(self.servings)?;
        validate_ingredients(&self.ingredients)?;
        validate_steps(&self.steps)
    }

    fn insert(conn: &Connection, owner_id: &str, copy: &Self, now: &str) -> Result<Landing> {
        insert_recipe(conn, owner_id, copy, now)?;
        Ok(Landing::Own)
    }

    fn overwrite(
        conn: &Connection,
        _owner_id: &str,
        copy: &Self,
        _server: &Self,
        now: &str,
    ) -> Result<Landing> {
        overwrite_recipe(conn, copy, now)?;
        Ok(Landing::Own)
    }
}

impl PushTarget for PantryItem {
    fn validate(&self) -> Result<()> {
        validate_name("pantry item name", &self.name)?;
        validate_quantity("quantity", self.quantity).map(|_| ())
    }

    /// A live copy whose key is already stocked adds to that row. A deleted
    /// one has nothing to contribute and leaves it alone.
    fn insert(conn: &Connection, owner_id: &str, copy: &Self, now: &str) -> Result<Landing> {
        let Some(holder) = find_by_key(conn, owner_id, &copy.name, copy.category)? else {
            insert_pantry_row(conn, owner_id, copy, now)?;
            return Ok(Landing::Own);
        };
        if copy.sync.is_tombstone() {
            return Ok(Landing::Folded {
                into: holder.id,
                credited: false,
            });
        }
        let stock = Stock {
            name: &copy.name,
            category: copy.category,
            quantity: copy.quantity,
            unit: copy.unit.as_deref(),
        };
        let merged = merge_into_pantry(conn, owner_id, &stock, now)?;
        Ok(Landing::Folded {
            into: merged.id,
            credited: true,
        })
    }

    /// Renaming onto another row's key folds this row into that one; a deleted
    /// copy just keeps the row's current key.
    fn overwrite(
        conn: &Connection,
        owner_id: &str,
        copy: &Self,
        server: &Self,
        now: &str,
    ) -> Result<Landing> {
        let holder = find_by_key(conn, owner_id, &copy.name, copy.category)?;
        match holder {
            Some(holder) if holder.id != copy.id => {
                if copy.sync.is_tombstone() {
                    let keep_key = PantryItem {
                        name: server.name.clone(),
                        category: server.category,
                        ..copy.clone()
                    };
                    overwrite_pantry(conn, &keep_key, now)?;
                    return Ok(Landing::Own);
                }
                let survivor = fold_pantry_row(conn, owner_id, copy, now)?;
                Ok(Landing::Folded {
                    into: survivor.id,
                    credited: true,
                })
            }
            _ => {
                overwrite_pantry(conn, copy, now)?;
                Ok(Landing::Own)
            }
        }
    }
}

impl PushTarget for ShoppingList {
    fn validate(&self) -> Result<()> {
        validate_name("list name", &self.name).map(|_| ())
    }

    fn insert(conn: &Connection, owner_id: &str, copy: &Self, now: &str) -> Result<Landing> {
        insert_list_row(conn, owner_id, copy, now)?;
        Ok(Landing::Own)
    }

    fn overwrite(
        conn: &Connection,
        _owner_id: &str,
        copy: &Self,
        _server: &Self,
        now: &str,
    ) -> Result<Landing> {
        overwrite_list(conn, copy, now)?;
        Ok(Landing::Own)
    }
}

impl PushTarget for ShoppingItem {
    fn validate(&self) -> Result<()> {
        validate_name("item name", &self.name)?;
        validate_quantity("quantity", self.quantity).map(|_| ())
    }

    fn insert(conn: &Connection, owner_id: &str, copy: &Self, now: &str) -> Result<Landing> {
        require_list_owner(conn, owner_id, &copy.list_id)?;
        insert_item_row(conn, owner_id, copy, now)?;
        Ok(Landing::Own)
    }

    fn overwrite(
        conn: &Connection,
        _owner_id: &str,
        copy: &Self,
        _server: &Self,
        now: &str,
    ) -> Result<Landing> {
        overwrite_item(conn, copy, now)?;
        Ok(Landing::Own)
    }
}

impl PushTarget for MealPlan {
    fn validate(&self) -> Result<()> {
        validate_week_start(self.week_start).map(|_| ())
    }

    /// Two devices planning the same week offline: the later push joins the
    /// plan already on the server, resurrecting it if it was deleted.
    fn insert(conn: &Connection, owner_id: &str, copy: &Self, now: &str) -> Result<Landing> {
        let Some(holder) = find_plan_for_week(conn, owner_id, copy.week_start)? else {
            insert_plan_row(conn, owner_id, copy, now)?;
            return Ok(Landing::Own);
        };
        if copy.sync.is_tombstone() || !holder.sync.is_tombstone() {
            return Ok(Landing::Folded {
                into: holder.id,
                credited: false,
            });
        }
        let survivor = ensure_plan(conn, owner_id, copy.week_start, now)?;
        Ok(Landing::Folded {
            into: survivor.id,
            credited: true,
        })
    }

    fn overwrite(
        conn: &Connection,
        owner_id: &str,
        copy: &Self,
        server: &Self,
        now: &str,
    ) -> Result<Landing> {
        let holder = find_plan_for_week(conn, owner_id, copy.week_start)?;
        match holder {
            Some(holder) if holder.id != copy.id => {
                if copy.sync.is_tombstone() {
                    let keep_week = MealPlan {
                        week_start: server.week_start,
                        ..copy.clone()
                    };
                    overwrite_plan(conn, &keep_week, now)?;
                    return Ok(Landing::Own);
                }
                let survivor = fold_plan(conn, owner_id, &copy.id, copy.week_start, now)?;
                Ok(Landing::Folded {
                    into: survivor.id,
                    credited: true,
                })
            }
            _ => {
                overwrite_plan(conn, copy, now)?;
                Ok(Landing::Own)
            }
        }
    }
}

impl PushTarget for MealPlanEntry {
    fn validate(&self) -> Result<()> {
        validate_day(self.day)?;
        validate_meal_type(&self.meal_type)?;
        validate_servings(self.servings).map(|_| ())
    }

    /// The parent may be a plan this push (or an earlier one) folded away.
    fn insert(conn: &Connection, owner_id: &str, copy: &Self, now: &str) -> Result<Landing> {
        let plan_id = find_alias(conn, owner_id, EntityType::MealPlan, &copy.plan_id)?
            .unwrap_or_else(|| copy.plan_id.clone());
        require_plan_owner(conn, owner_id, &plan_id)?;
        if !copy.sync.is_tombstone() {
            visible_recipe(conn, owner_id, &copy.recipe_id)?;
        }
        let entry = MealPlanEntry {
            plan_id,
            ..copy.clone()
        };
        insert_entry_row(conn, owner_id, &entry, now)?;
        Ok(Landing::Own)
    }

    /// Only a recipe change is checked, so an entry whose recipe was deleted
    /// meanwhile can still be edited or removed.
    fn overwrite(
        conn: &Connection,
        owner_id: &str,
        copy: &Self,
        server: &Self,
        now: &str,
    ) -> Result<Landing> {
        if !copy.sync.is_tombstone() && copy.recipe_id != server.recipe_id {
            visible_recipe(conn, owner_id, &copy.recipe_id)?;
        }
        overwrite_entry(conn, copy, now)?;
        Ok(Landing::Own)
    }
}

fn find_alias(
    conn: &Connection,
    owner_id: &str,
    entity: EntityType,
    client_id: &str,
) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT server_id FROM push_aliases
             WHERE owner_id = ?1 AND entity = ?2 AND client_id = ?3",
            params![owner_id, entity.as_str(), client_id],
            |row| row.get(0),
        )
        .optional()?)
}

fn record_alias(
    conn: &Connection,
    owner_id: &str,
    remap: &IdRemap,
    now: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO push_aliases (owner_id, entity, client_id, server_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            owner_id,
            remap.resource_type.as_str(),
            remap.client_id,
            remap.server_id,
            now
        ],
    )?;
    Ok(())
}

#[derive(Debug, Default)]
pub struct PushTally {
    pub applied: usize,
    pub conflicts: Vec<ConflictRecord>,
    pub merged: Vec<IdRemap>,
}

impl PushTally {
    fn settle(
        &mut self,
        conn: &Connection,
        owner_id: &str,
        entity: EntityType,
        client_id: &str,
        landing: Landing,
        now: &str,
    ) -> Result<()> {
        match landing {
            Landing::Own => self.applied += 1,
            Landing::Folded { into, credited } => {
                let remap = IdRemap {
                    resource_type: entity,
                    client_id: client_id.to_string(),
                    server_id: into,
                };
                record_alias(conn, owner_id, &remap, now)?;
                debug!(
                    entity = %entity,
                    client_id,
                    server_id = %remap.server_id,
                    credited,
                    "pushed copy folded into existing row"
                );
                if credited {
                    self.applied += 1;
                }
                self.merged.push(remap);
            }
        }
        Ok(())
    }
}

fn reconcile<T: PushTarget>(
    conn: &Connection,
    owner_id: &str,
    copies: &[T],
    now: &str,
    tally: &mut PushTally,
) -> Result<()> {
    for copy in copies {
        validate_id(copy.id())?;
        copy.validate()?;

        if let Some(server_id) = find_alias(conn, owner_id, T::ENTITY, copy.id())? {
            tally.merged.push(IdRemap {
                resource_type: T::ENTITY,
                client_id: copy.id().to_string(),
                server_id,
            });
            continue;
        }

        let Some(server) = find_any::<T>(conn, copy.id())? else {
            let landing = T::insert(conn, owner_id, copy, now)?;
            tally.settle(conn, owner_id, T::ENTITY, copy.id(), landing, now)?;
            continue;
        };
        if server.owner_id() != owner_id {
            return Err(Error::not_found(T::ENTITY, copy.id()));
        }

        if !needs_resolution(copy.sync(), server.sync()) {
            let landing = T::overwrite(conn, owner_id, copy, &server, now)?;
            tally.settle(conn, owner_id, T::ENTITY, copy.id(), landing, now)?;
            continue;
        }

        let resolved = resolve(copy, &server);
        if resolved.resolution == Resolution::ClientWins {
            let landing = T::overwrite(conn, owner_id, copy, &server, now)?;
            tally.settle(conn, owner_id, T::ENTITY, copy.id(), landing, now)?;
        }
        if let Some(conflict) = resolved.conflict {
            debug!(
                entity = %conflict.resource_type,
                id = %conflict.resource_id,
                resolution = ?conflict.resolution,
                reason = %conflict.reason,
                "push conflict resolved"
            );
            tally.conflicts.push(conflict);
        }
    }
    Ok(())
}

impl Database {
    /// Apply every copy in `push` for `owner_id`, all or nothing.
    pub fn apply_push(&self, owner_id: &str, push: &SyncPush) -> Result<PushTally> {
        let tx = self.write_tx()?;
        let now = to_db_ts(&stamp());
        let mut tally = PushTally::default();

        let applied: Result<()> = (|| {
            // Parents before children so ownership checks see new parents.
            reconcile(&tx, owner_id, &push.recipes, &now, &mut tally)?;
            reconcile(&tx, owner_id, &push.shopping_lists, &now, &mut tally)?;
            reconcile(&tx, owner_id, &push.shopping_items, &now, &mut tally)?;
            reconcile(&tx, owner_id, &push.meal_plans, &now, &mut tally)?;
            reconcile(&tx, owner_id, &push.meal_plan_entries, &now, &mut tally)?;
            reconcile(&tx, owner_id, &push.pantry_items, &now, &mut tally)
        })();
        applied.map_err(|e| Error::aborted("push", e))?;
        tx.commit().map_err(|e| Error::aborted("push", e.into()))?;

        info!(
            owner_id,
            received = push.len(),
            applied = tally.applied,
            conflicts = tally.conflicts.len(),
            merged = tally.merged.len(),
            "push applied"
        );
        Ok(tally)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, NaiveDate};
    use uuid::Uuid;

    use super::*;
    use crate::category::Category;
    use crate::conflict::{ConflictKind, ConflictReason};
    use crate::models::{
        EntityType, NewPantryItem, NewRecipe, NewShoppingList, SyncMeta, Watermarks,
    };

    fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    fn pantry_copy(id: &str, name: &str, qty: f64, sync: SyncMeta) -> PantryItem {
        PantryItem {
            id: id.into(),
            owner_id: String::new(),
            name: name.into(),
            category: Category::Pantry,
            quantity: Some(qty),
            unit: None,
            created_at: stamp(),
            sync,
        }
    }

    fn plan_copy(id: &str, week_start: NaiveDate) -> MealPlan {
        MealPlan {
            id: id.into(),
            owner_id: String::new(),
            week_start,
            created_at: stamp(),
            sync: fresh(),
        }
    }

    fn entry_copy(id: &str, plan_id: &str, recipe_id: &str) -> MealPlanEntry {
        MealPlanEntry {
            id: id.into(),
            plan_id: plan_id.into(),
            owner_id: String::new(),
            recipe_id: recipe_id.into(),
            day: 0,
            meal_type: "dinner".into(),
            servings: None,
            position: 0,
            created_at: stamp(),
            sync: fresh(),
        }
    }

    fn fresh() -> SyncMeta {
        SyncMeta {
            sync_version: 1,
            updated_at: stamp(),
            deleted_at: None,
        }
    }

    #[test]
    fn test_unknown_ids_are_inserted_at_version_one() {
        let db = Database::open_in_memory().unwrap();
        let list_id = new_id();
        let push = SyncPush {
            shopping_lists: vec![ShoppingList {
                id: list_id.clone(),
                owner_id: String::new(),
                name: "Offline list".into(),
                created_at: stamp(),
                sync: SyncMeta {
                    sync_version: 7,
                    ..fresh()
                },
            }],
            shopping_items: vec![ShoppingItem {
                id: new_id(),
                list_id: list_id.clone(),
                owner_id: String::new(),
                name: "Milk".into(),
                quantity: Some(1.0),
                unit: None,
                category: None,
                checked: false,
                recipe_tag: None,
                position: 0,
                created_at: stamp(),
                sync: fresh(),
            }],
            ..SyncPush::default()
        };

        let tally = db.apply_push("alice", &push).unwrap();
        assert_eq!(tally.applied, 2);
        assert!(tally.conflicts.is_empty());

        let list = db.get_list("alice", &list_id).unwrap();
        assert_eq!(list.sync.sync_version, 1);
        assert_eq!(list.owner_id, "alice");
        assert_eq!(db.list_items("alice", &list_id).unwrap().len(), 1);
    }

    #[test]
    fn test_fast_forward_applies_client_fields() {
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

        let mut copy = list.clone();
        copy.name = "Weekend".into();
        // Local clock far behind: irrelevant when the base version matches.
        copy.sync.updated_at = list.sync.updated_at - Duration::days(1);

        let tally = db
            .apply_push(
                "alice",
                &SyncPush {
                    shopping_lists: vec![copy],
                    ..SyncPush::default()
                },
            )
            .unwrap();
        assert_eq!(tally.applied, 1);
        assert!(tally.conflicts.is_empty());

        let stored = db.get_list("alice", &list.id).unwrap();
        assert_eq!(stored.name, "Weekend");
        assert_eq!(stored.sync.sync_version, 2);
        assert!(stored.sync.updated_at >= list.sync.updated_at);
    }

    #[test]
    fn test_stale_recipe_push_keeps_server_copy() {
        let db = Database::open_in_memory().unwrap();
        let recipe = db
            .create_recipe(
                "alice",
                &NewRecipe {
                    name: "Server title".into(),
                    ..NewRecipe::default()
                },
            )
            .unwrap();
        for _ in 0..4 {
            db.set_recipe_public("alice", &recipe.id, false).unwrap();
        }
        let server = db.get_recipe("alice", &recipe.id).unwrap();
        assert_eq!(server.sync.sync_version, 5);

        let mut copy = server.clone();
        copy.name = "Client title".into();
        copy.sync.sync_version = 3;
        copy.sync.updated_at = server.sync.updated_at + Duration::hours(1);

        let tally = db
            .apply_push(
                "alice",
                &SyncPush {
                    recipes: vec![copy],
                    ..SyncPush::default()
                },
            )
            .unwrap();
        assert_eq!(tally.applied, 0);
        assert_eq!(tally.conflicts.len(), 1);
        let conflict = &tally.conflicts[0];
        assert_eq!(conflict.resolution, Resolution::ServerWins);
        assert_eq!(conflict.reason, ConflictReason::ServerAuthoritative);
        assert_eq!(conflict.client_version, 3);
        assert_eq!(conflict.server_version, 5);

        let stored = db.get_recipe("alice", &recipe.id).unwrap();
        assert_eq!(stored, server);
    }

    #[test]
    fn test_newer_pantry_edit_wins_lww() {
        let db = Database::open_in_memory().unwrap();
        let item = db
            .add_pantry_item(
                "alice",
                &NewPantryItem {
                    name: "Flour".into(),
                    category: Some("pantry".into()),
                    quantity: Some(1.0),
                    unit: Some("kg".into()),
                },
            )
            .unwrap();
        // Server moves on to v2 behind the client's back.
        db.add_pantry_item(
            "alice",
            &NewPantryItem {
                name: "Flour".into(),
                category: Some("pantry".into()),
                quantity: Some(1.0),
                unit: None,
            },
        )
        .unwrap();
        let server = db.get_pantry_item("alice", &item.id).unwrap();

        let mut copy = item.clone();
        copy.quantity = Some(4.0);
        copy.sync.updated_at = server.sync.updated_at + Duration::seconds(1);

        let tally = db
            .apply_push(
                "alice",
                &SyncPush {
                    pantry_items: vec![copy],
                    ..SyncPush::default()
                },
            )
            .unwrap();
        assert_eq!(tally.applied, 1);
        assert_eq!(tally.conflicts[0].resolution, Resolution::ClientWins);
        assert_eq!(tally.conflicts[0].reason, ConflictReason::ClientNewer);

        let stored = db.get_pantry_item("alice", &item.id).unwrap();
        assert_eq!(stored.quantity, Some(4.0));
        assert_eq!(stored.sync.sync_version, server.sync.sync_version + 1);
    }

    #[test]
    fn test_client_delete_of_current_version_is_tombstone_mismatch() {
        let db = Database::open_in_memory().unwrap();
        let list = db
            .create_list(
                "alice",
                &NewShoppingList {
                    id: None,
                    name: "Old".into(),
                },
            )
            .unwrap();
        let mut copy = list.clone();
        copy.sync.updated_at = list.sync.updated_at + Duration::seconds(5);
        copy.sync.deleted_at = Some(copy.sync.updated_at);

        let tally = db
            .apply_push(
                "alice",
                &SyncPush {
                    shopping_lists: vec![copy],
                    ..SyncPush::default()
                },
            )
            .unwrap();
        assert_eq!(tally.conflicts[0].kind, ConflictKind::TombstoneMismatch);
        assert_eq!(tally.conflicts[0].resolution, Resolution::ClientWins);
        assert!(db.get_list("alice", &list.id).is_err());
    }

    #[test]
    fn test_retried_pantry_push_credits_once() {
        let db = Database::open_in_memory().unwrap();
        let existing = db
            .add_pantry_item(
                "alice",
                &NewPantryItem {
                    name: "Rice".into(),
                    category: Some("pantry".into()),
                    quantity: Some(3.0),
                    unit: None,
                },
            )
            .unwrap();
        let client_id = new_id();
        let push = SyncPush {
            pantry_items: vec![pantry_copy(&client_id, "rice", 2.0, fresh())],
            ..SyncPush::default()
        };
        let remap = IdRemap {
            resource_type: EntityType::PantryItem,
            client_id: client_id.clone(),
            server_id: existing.id.clone(),
        };

        let first = db.apply_push("alice", &push).unwrap();
        assert_eq!(first.applied, 1);
        assert_eq!(first.merged, vec![remap.clone()]);

        // Lost response: the client sends the same push again.
        let retry = db.apply_push("alice", &push).unwrap();
        assert_eq!(retry.applied, 0);
        assert_eq!(retry.merged, vec![remap]);

        let pantry = db.list_pantry("alice").unwrap();
        assert_eq!(pantry.len(), 1);
        assert_eq!(pantry[0].id, existing.id);
        assert_eq!(pantry[0].quantity, Some(5.0));
        assert_eq!(pantry[0].sync.sync_version, 2);
    }

    #[test]
    fn test_deleted_copy_on_stocked_key_is_not_applied() {
        let db = Database::open_in_memory().unwrap();
        let existing = db
            .add_pantry_item(
                "alice",
                &NewPantryItem {
                    name: "Rice".into(),
                    category: Some("pantry".into()),
                    quantity: Some(3.0),
                    unit: None,
                },
            )
            .unwrap();
        let mut sync = fresh();
        sync.deleted_at = Some(sync.updated_at);
        let client_id = new_id();

        let tally = db
            .apply_push(
                "alice",
                &SyncPush {
                    pantry_items: vec![pantry_copy(&client_id, "Rice", 1.0, sync)],
                    ..SyncPush::default()
                },
            )
            .unwrap();
        assert_eq!(tally.applied, 0);
        assert_eq!(tally.merged[0].client_id, client_id);
        assert_eq!(tally.merged[0].server_id, existing.id);
        assert_eq!(db.get_pantry_item("alice", &existing.id).unwrap(), existing);
    }

    #[test]
    fn test_pantry_rename_onto_stocked_key_folds() {
        let db = Database::open_in_memory().unwrap();
        let stock = |name: &str, qty: f64| NewPantryItem {
            name: name.into(),
            category: Some("dairy".into()),
            quantity: Some(qty),
            unit: None,
        };
        let milk = db.add_pantry_item("alice", &stock("Milk", 1.0)).unwrap();
        let cream = db.add_pantry_item("alice", &stock("Cream", 2.0)).unwrap();

        let mut copy = milk.clone();
        copy.name = "cream".into();
        let push = SyncPush {
            pantry_items: vec![copy],
            ..SyncPush::default()
        };

        let tally = db.apply_push("alice", &push).unwrap();
        assert_eq!(tally.applied, 1);
        assert_eq!(tally.merged[0].server_id, cream.id);
        let retry = db.apply_push("alice", &push).unwrap();
        assert_eq!(retry.applied, 0);

        let pantry = db.list_pantry("alice").unwrap();
        assert_eq!(pantry.len(), 1);
        assert_eq!(pantry[0].id, cream.id);
        assert_eq!(pantry[0].quantity, Some(3.0));
        assert!(db.get_pantry_item("alice", &milk.id).is_err());
    }

    #[test]
    fn test_second_device_plan_for_same_week_joins_existing() {
        let db = Database::open_in_memory().unwrap();
        let recipe = db
            .create_recipe(
                "alice",
                &NewRecipe {
                    name: "Soup".into(),
                    ..NewRecipe::default()
                },
            )
            .unwrap();
        let week = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();

        let phone_plan = plan_copy(&new_id(), week);
        db.apply_push(
            "alice",
            &SyncPush {
                meal_plans: vec![phone_plan.clone()],
                ..SyncPush::default()
            },
        )
        .unwrap();

        let tablet_plan = plan_copy(&new_id(), week);
        let entry = entry_copy(&new_id(), &tablet_plan.id, &recipe.id);
        let list_id = new_id();
        let push = SyncPush {
            meal_plans: vec![tablet_plan.clone()],
            meal_plan_entries: vec![entry.clone()],
            shopping_lists: vec![ShoppingList {
                id: list_id.clone(),
                owner_id: String::new(),
                name: "Tablet list".into(),
                created_at: stamp(),
                sync: fresh(),
            }],
            ..SyncPush::default()
        };

        let tally = db.apply_push("alice", &push).unwrap();
        assert_eq!(tally.applied, 2);
        assert_eq!(
            tally.merged,
            vec![IdRemap {
                resource_type: EntityType::MealPlan,
                client_id: tablet_plan.id.clone(),
                server_id: phone_plan.id.clone(),
            }]
        );
        assert!(db.get_list("alice", &list_id).is_ok());
        let entries = db.list_meal_plan_entries("alice", week).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].plan_id, phone_plan.id);

        // Retrying does not fail or duplicate anything.
        db.apply_push("alice", &push).unwrap();
        assert_eq!(db.list_meal_plan_entries("alice", week).unwrap().len(), 1);
        assert_eq!(db.get_meal_plan("alice", week).unwrap().id, phone_plan.id);
    }

    #[test]
    fn test_plan_moved_onto_taken_week_folds_entries() {
        let db = Database::open_in_memory().unwrap();
        let recipe = db
            .create_recipe(
                "alice",
                &NewRecipe {
                    name: "Stew".into(),
                    ..NewRecipe::default()
                },
            )
            .unwrap();
        let first = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let second = NaiveDate::from_ymd_opt(2024, 1, 8).unwrap();
        let moving = db.get_or_create_meal_plan("alice", first).unwrap();
        let taken = db.get_or_create_meal_plan("alice", second).unwrap();
        db.apply_push(
            "alice",
            &SyncPush {
                meal_plan_entries: vec![entry_copy(&new_id(), &moving.id, &recipe.id)],
                ..SyncPush::default()
            },
        )
        .unwrap();

        let mut copy = moving.clone();
        copy.week_start = second;
        let tally = db
            .apply_push(
                "alice",
                &SyncPush {
                    meal_plans: vec![copy],
                    ..SyncPush::default()
                },
            )
            .unwrap();
        assert_eq!(tally.merged[0].client_id, moving.id);
        assert_eq!(tally.merged[0].server_id, taken.id);

        assert!(db.get_meal_plan("alice", first).is_err());
        let entries = db.list_meal_plan_entries("alice", second).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].plan_id, taken.id);
        assert_eq!(entries[0].sync.sync_version, 2);
    }

    #[test]
    fn test_entry_needs_a_readable_recipe() {
        let db = Database::open_in_memory().unwrap();
        let theirs = db
            .create_recipe(
                "bob",
                &NewRecipe {
                    name: "Secret".into(),
                    ..NewRecipe::default()
                },
            )
            .unwrap();
        let plan = plan_copy(&new_id(), NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        let push = SyncPush {
            meal_plans: vec![plan.clone()],
            meal_plan_entries: vec![entry_copy(&new_id(), &plan.id, &theirs.id)],
            ..SyncPush::default()
        };

        let err = db.apply_push("alice", &push).unwrap_err();
        assert!(matches!(
            err,
            Error::NotFound {
                entity: EntityType::Recipe,
                ..
            }
        ));

        db.set_recipe_public("bob", &theirs.id, true).unwrap();
        let tally = db.apply_push("alice", &push).unwrap();
        assert_eq!(tally.applied, 2);
    }

    #[test]
    fn test_foreign_id_is_not_found_and_rolls_back() {
        let db = Database::open_in_memory().unwrap();
        let theirs = db
            .create_list(
                "bob",
                &NewShoppingList {
                    id: None,
                    name: "Bob's".into(),
                },
            )
            .unwrap();
        let mine = ShoppingList {
            id: new_id(),
            owner_id: String::new(),
            name: "Mine".into(),
            created_at: stamp(),
            sync: fresh(),
        };

        let err = db
            .apply_push(
                "alice",
                &SyncPush {
                    shopping_lists: vec![mine.clone(), theirs.clone()],
                    ..SyncPush::default()
                },
            )
            .unwrap_err();
        assert!(matches!(
            err,
            Error::NotFound {
                entity: EntityType::ShoppingList,
                ..
            }
        ));
        // The list applied before the failure was rolled back.
        assert!(db.list_lists("alice").unwrap().is_empty());
        assert!(db.get_list("alice", &mine.id).is_err());
        assert_eq!(db.get_list("bob", &theirs.id).unwrap(), theirs);
    }

    #[test]
    fn test_item_for_foreign_list_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        let theirs = db
            .create_list(
                "bob",
                &NewShoppingList {
                    id: None,
                    name: "Bob's".into(),
                },
            )
            .unwrap();
        let err = db
            .apply_push(
                "alice",
                &SyncPush {
                    shopping_items: vec![ShoppingItem {
                        id: new_id(),
                        list_id: theirs.id.clone(),
                        owner_id: String::new(),
                        name: "Sneaky".into(),
                        quantity: None,
                        unit: None,
                        category: None,
                        checked: false,
                        recipe_tag: None,
                        position: 0,
                        created_at: stamp(),
                        sync: fresh(),
                    }],
                    ..SyncPush::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn test_invalid_copy_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        let err = db
            .apply_push(
                "alice",
                &SyncPush {
                    meal_plans: vec![MealPlan {
                        id: new_id(),
                        owner_id: String::new(),
                        // A Tuesday.
                        week_start: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
                        created_at: stamp(),
                        sync: fresh(),
                    }],
                    ..SyncPush::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));

        let err = db
            .apply_push(
                "alice",
                &SyncPush {
                    pantry_items: vec![pantry_copy("not-a-uuid", "Rice", 1.0, fresh())],
                    ..SyncPush::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[test]
    fn test_push_then_pull_reports_new_versions() {
        let db = Database::open_in_memory().unwrap();
        let id = new_id();
        db.apply_push(
            "alice",
            &SyncPush {
                pantry_items: vec![pantry_copy(&id, "Beans", 2.0, fresh())],
                ..SyncPush::default()
            },
        )
        .unwrap();

        let delta = db.changes_since("alice", &Watermarks::default()).unwrap();
        assert_eq!(delta.pantry_items.rows.len(), 1);
        assert_eq!(delta.pantry_items.rows[0].record.id, id);
        assert_eq!(delta.pantry_items.rows[0].record.sync.sync_version, 1);
    }
}
