//! Shopping list → pantry transfer.
//!
//! The whole workflow runs inside one `BEGIN IMMEDIATE` transaction. SQLite's
//! write lock is held from the first statement until commit or rollback, which
//! gives the list-scoped mutual exclusion: a second completion of the same
//! list waits for the first to finish and then finds no checked items left.

use rusqlite::{Connection, params};
use tracing::{info, warn};

use super::pantry::{Stock, merge_into_pantry};
use super::{Database, Table, bump_row, find_live, query_rows, stamp, to_db_ts, tombstone_row};
use crate::category::normalize_category;
use crate::error::{Error, Result};
use crate::models::{CompletionSummary, EntityType, PantryItem, ShoppingItem, ShoppingList};

const OPERATION: &str = "complete_shopping_list";

impl Database {
    /// Credit every checked item of `list_id` to the pantry and retire it.
    ///
    /// Completing a list with nothing checked is a successful no-op, so a
    /// retried completion never double-credits.
    pub fn complete_list(&self, owner_id: &str, list_id: &str) -> Result<CompletionSummary> {
        let tx = self.write_tx().map_err(|e| match e {
            Error::Timeout => {
                warn!(list_id, "completion lock contended");
                Error::LockContended {
                    list_id: list_id.to_string(),
                }
            }
            other => other,
        })?;

        let summary =
            complete_in(&tx, owner_id, list_id).map_err(|e| Error::aborted(OPERATION, e))?;
        tx.commit()
            .map_err(|e| Error::aborted(OPERATION, e.into()))?;

        info!(
            list_id,
            pantry_rows = summary.pantry.len(),
            retired = summary.retired_item_ids.len(),
            "shopping list completed"
        );
        Ok(summary)
    }
}

fn complete_in(conn: &Connection, owner_id: &str, list_id: &str) -> Result<CompletionSummary> {
    let list = find_live::<ShoppingList>(conn, owner_id, list_id)?;
    let checked: Vec<ShoppingItem> = query_rows(
        conn,
        &format!(
            "SELECT {} FROM shopping_items
             WHERE list_id = ?1 AND checked = 1 AND deleted_at IS NULL
             ORDER BY position, rowid",
            ShoppingItem::COLUMNS
        ),
        params![list_id],
    )?;

    if checked.is_empty() {
        return Ok(CompletionSummary {
            list,
            pantry: Vec::new(),
            retired_item_ids: Vec::new(),
        });
    }

    let now = to_db_ts(&stamp());
    let mut pantry: Vec<PantryItem> = Vec::new();
    let mut retired = Vec::with_capacity(checked.len());
    for item in &checked {
        let stock = Stock {
            name: &item.name,
            category: normalize_category(item.category.as_deref()),
            quantity: item.quantity,
            unit: item.unit.as_deref(),
        };
        let merged = merge_into_pantry(conn, owner_id, &stock, &now)?;
        match pantry.iter_mut().find(|p| p.id == merged.id) {
            Some(slot) => *slot = merged,
            None => pantry.push(merged),
        }

        tombstone_row(conn, EntityType::ShoppingItem, owner_id, &item.id, &now)?;
        retired.push(item.id.clone());
    }

    bump_row(conn, EntityType::ShoppingList, list_id, &now)?;
    let list = find_live::<ShoppingList>(conn, owner_id, list_id)?;

    Ok(CompletionSummary {
        list,
        pantry,
        retired_item_ids: retired,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::category::Category;
    use crate::models::{NewPantryItem, NewShoppingItem, NewShoppingList, UpdateShoppingItem};

    fn list_with(db: &Database, owner: &str, items: &[(&str, Option<f64>, &str, bool)]) -> String {
        let list = db
            .create_list(
                owner,
                &NewShoppingList {
                    id: None,
                    name: "Groceries".into(),
                },
            )
            .unwrap();
        for (name, qty, category, checked) in items {
            db.add_item(
                owner,
                &list.id,
                &NewShoppingItem {
                    name: (*name).into(),
                    quantity: *qty,
                    unit: None,
                    category: Some((*category).into()),
                    checked: *checked,
                    id: None,
                },
            )
            .unwrap();
        }
        list.id
    }

    #[test]
    fn test_completion_merges_into_existing_pantry() {
        let db = Database::open_in_memory().unwrap();
        db.add_pantry_item(
            "alice",
            &NewPantryItem {
                name: "Milk".into(),
                category: Some("dairy".into()),
                quantity: Some(3.0),
                unit: Some("l".into()),
            },
        )
        .unwrap();
        let list_id = list_with(
            &db,
            "alice",
            &[
                ("milk", Some(2.0), "Milk & Cheese", true),
                ("Bread", Some(1.0), "bakery", false),
            ],
        );
        let list_before = db.get_list("alice", &list_id).unwrap();

        let summary = db.complete_list("alice", &list_id).unwrap();

        assert_eq!(summary.pantry.len(), 1);
        assert_eq!(summary.pantry[0].quantity, Some(5.0));
        assert_eq!(summary.pantry[0].category, Category::Dairy);
        assert_eq!(summary.retired_item_ids.len(), 1);
        assert_eq!(
            summary.list.sync.sync_version,
            list_before.sync.sync_version + 1
        );

        // Only the unchecked item survives on the list.
        let remaining = db.list_items("alice", &list_id).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].name, "Bread");
    }

    #[test]
    fn test_duplicate_checked_items_collapse_to_one_pantry_row() {
        let db = Database::open_in_memory().unwrap();
        let list_id = list_with(
            &db,
            "alice",
            &[
                ("Apples", Some(3.0), "fruit", true),
                ("apples", Some(2.0), "produce", true),
            ],
        );
        let summary = db.complete_list("alice", &list_id).unwrap();
        assert_eq!(summary.pantry.len(), 1);
        assert_eq!(summary.pantry[0].quantity, Some(5.0));
        assert_eq!(summary.retired_item_ids.len(), 2);
    }

    #[test]
    fn test_second_completion_is_noop() {
        let db = Database::open_in_memory().unwrap();
        let list_id = list_with(&db, "alice", &[("Rice", Some(1.0), "pantry", true)]);
        let first = db.complete_list("alice", &list_id).unwrap();
        let again = db.complete_list("alice", &list_id).unwrap();

        assert!(again.pantry.is_empty());
        assert!(again.retired_item_ids.is_empty());
        assert_eq!(again.list.sync.sync_version, first.list.sync.sync_version);
        assert_eq!(db.list_pantry("alice").unwrap()[0].quantity, Some(1.0));
    }

    #[test]
    fn test_completion_resurrects_deleted_pantry_row() {
        let db = Database::open_in_memory().unwrap();
        let old = db
            .add_pantry_item(
                "alice",
                &NewPantryItem {
                    name: "Butter".into(),
                    category: Some("dairy".into()),
                    quantity: Some(9.0),
                    unit: None,
                },
            )
            .unwrap();
        db.delete_pantry_item("alice", &old.id).unwrap();

        let list_id = list_with(&db, "alice", &[("Butter", Some(1.0), "dairy", true)]);
        let summary = db.complete_list("alice", &list_id).unwrap();
        assert_eq!(summary.pantry[0].id, old.id);
        assert_eq!(summary.pantry[0].quantity, Some(1.0));
        assert!(!summary.pantry[0].sync.is_tombstone());
    }

    #[test]
    fn test_foreign_list_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        let list_id = list_with(&db, "alice", &[("Rice", Some(1.0), "pantry", true)]);
        let err = db.complete_list("bob", &list_id).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert!(db.list_pantry("alice").unwrap().is_empty());
    }

    #[test]
    fn test_failure_rolls_back_every_step() {
        let db = Database::open_in_memory().unwrap();
        let list_id = list_with(
            &db,
            "alice",
            &[
                ("Milk", Some(1.0), "dairy", true),
                ("Eggs", Some(12.0), "dairy", true),
            ],
        );
        // Make the second merge fail partway through.
        db.conn
            .execute_batch(
                "CREATE TRIGGER fail_on_eggs BEFORE INSERT ON pantry_items
                 WHEN NEW.name = 'Eggs'
                 BEGIN SELECT RAISE(ABORT, 'disk on fire'); END;",
            )
            .unwrap();

        let err = db.complete_list("alice", &list_id).unwrap_err();
        assert!(
            matches!(err, Error::TransactionAborted { operation, .. } if operation == OPERATION),
            "got {err:?}"
        );
        assert!(err.is_retryable());

        assert!(db.list_pantry("alice").unwrap().is_empty());
        let items = db.list_items("alice", &list_id).unwrap();
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|i| i.checked && i.sync.sync_version == 1));
    }

    #[test]
    fn test_concurrent_completion_credits_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("larder.db");
        let list_id = {
            let db = Database::open(&path).unwrap();
            let list_id = list_with(&db, "alice", &[("Oats", Some(3.0), "pantry", false)]);
            let item = db.list_items("alice", &list_id).unwrap().remove(0);
            db.update_item(
                "alice",
                &item.id,
                &UpdateShoppingItem {
                    checked: Some(true),
                    ..UpdateShoppingItem::default()
                },
            )
            .unwrap();
            list_id
        };

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                let path = path.clone();
                let list_id = list_id.clone();
                thread::spawn(move || {
                    let db = Database::open(&path).unwrap();
                    db.set_deadline(Duration::from_secs(5)).unwrap();
                    barrier.wait();
                    db.complete_list("alice", &list_id)
                })
            })
            .collect();

        let mut credited = 0;
        for handle in handles {
            match handle.join().unwrap() {
                Ok(summary) => credited += summary.retired_item_ids.len(),
                Err(e) => assert!(e.is_conflict(), "unexpected error: {e:?}"),
            }
        }
        assert_eq!(credited, 1);

        let db = Database::open(&path).unwrap();
        let pantry = db.list_pantry("alice").unwrap();
        assert_eq!(pantry.len(), 1);
        assert_eq!(pantry[0].quantity, Some(3.0));
    }
}
