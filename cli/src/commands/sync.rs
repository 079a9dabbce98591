use anyhow::{Context, Result, bail};
use tabled::{Table, Tabled, settings::Style};

use larder_core::models::{EntityType, SyncPush, Watermarks};
use larder_core::service::LarderService;

use super::helpers::{format_timestamp, parse_since};

/// Per-type change counts since a timestamp, or one type's rows.
pub(crate) fn cmd_changes(
    svc: &LarderService,
    owner: &str,
    entity: Option<&str>,
    since: Option<&str>,
    json: bool,
) -> Result<()> {
    let since = parse_since(since)?;

    if let Some(raw) = entity {
        let Some(entity) = EntityType::parse(raw) else {
            bail!(
                "Unknown entity type '{raw}'. Use one of: {}",
                EntityType::ALL.map(EntityType::table).join(", ")
            );
        };
        let changes = svc.changes_since(owner, entity, since)?;
        if json {
            println!("{}", serde_json::to_string_pretty(&changes)?);
        } else {
            println!("{}: {} changed row(s)", entity.table(), changes.len());
        }
        return Ok(());
    }

    let watermarks = Watermarks {
        recipes: since,
        pantry_items: since,
        shopping_lists: since,
        shopping_items: since,
        meal_plans: since,
        meal_plan_entries: since,
    };
    let payload = svc.pull(owner, &watermarks)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    #[derive(Tabled)]
    struct ChangeRow {
        #[tabled(rename = "Type")]
        entity: &'static str,
        #[tabled(rename = "Changed")]
        changed: usize,
        #[tabled(rename = "Deleted")]
        deleted: usize,
        #[tabled(rename = "Watermark")]
        watermark: String,
    }

    macro_rules! row {
        ($entity:expr, $batch:expr) => {
            ChangeRow {
                entity: $entity.table(),
                changed: $batch.rows.len(),
                deleted: $batch.rows.iter().filter(|c| c.deleted).count(),
                watermark: $batch
                    .watermark
                    .map(format_timestamp)
                    .unwrap_or_else(|| "-".into()),
            }
        };
    }

    let rows = vec![
        row!(EntityType::Recipe, payload.recipes),
        row!(EntityType::PantryItem, payload.pantry_items),
        row!(EntityType::ShoppingList, payload.shopping_lists),
        row!(EntityType::ShoppingItem, payload.shopping_items),
        row!(EntityType::MealPlan, payload.meal_plans),
        row!(EntityType::MealPlanEntry, payload.meal_plan_entries),
    ];
    println!("{}", Table::new(&rows).with(Style::rounded()));
    println!("Server time: {}", format_timestamp(payload.server_timestamp));
    Ok(())
}

/// Apply a `SyncPush` document from disk, as a client would over HTTP.
pub(crate) fn cmd_push(
    svc: &LarderService,
    owner: &str,
    file: &std::path::Path,
    json: bool,
) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read file: {}", file.display()))?;
    let push: SyncPush = serde_json::from_str(&raw)
        .with_context(|| format!("Malformed push document: {}", file.display()))?;

    let outcome = svc.push(owner, &push)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    println!(
        "Pushed {} record(s): {} applied, {} conflict(s)",
        push.len(),
        outcome.applied,
        outcome.conflicts.len()
    );
    for conflict in &outcome.conflicts {
        println!(
            "  {} {}: {:?} (client v{}, server v{}), {}",
            conflict.resource_type,
            conflict.resource_id,
            conflict.resolution,
            conflict.client_version,
            conflict.server_version,
            conflict.reason
        );
    }
    for remap in &outcome.merged {
        println!(
            "  {} {} merged into {}",
            remap.resource_type, remap.client_id, remap.server_id
        );
    }
    Ok(())
}

pub(crate) fn cmd_erase(svc: &LarderService, owner: &str, confirmed: bool, json: bool) -> Result<()> {
    if !confirmed {
        bail!("Erasing '{owner}' permanently deletes all of their data. Re-run with --yes to confirm");
    }
    let removed = svc.erase_account(owner)?;
    if json {
        println!("{}", serde_json::json!({ "owner_id": owner, "removed": removed }));
    } else {
        println!("Erased {removed} row(s) belonging to '{owner}'");
    }
    Ok(())
}
