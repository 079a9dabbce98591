use anyhow::Result;
use std::process;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use larder_core::models::{NewShoppingItem, NewShoppingList, ShoppingItem, UpdateShoppingItem};
use larder_core::service::LarderService;

use super::helpers::{format_quantity, format_timestamp, truncate};

fn print_items_table(items: &[ShoppingItem]) {
    #[derive(Tabled)]
    struct ItemRow {
        #[tabled(rename = "")]
        checked: &'static str,
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Quantity")]
        quantity: String,
        #[tabled(rename = "Category")]
        category: String,
        #[tabled(rename = "From recipe")]
        recipe: String,
    }

    let rows: Vec<ItemRow> = items
        .iter()
        .map(|item| ItemRow {
            checked: if item.checked { "[x]" } else { "[ ]" },
            id: item.id.chars().take(8).collect(),
            name: truncate(&item.name, 30),
            quantity: format_quantity(item.quantity, item.unit.as_deref()),
            category: item.category.clone().unwrap_or_default(),
            recipe: item
                .recipe_tag
                .as_deref()
                .map(|t| truncate(t, 20))
                .unwrap_or_default(),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(3..4)).with(Alignment::right()))
        .to_string();
    println!("{table}");
}

pub(crate) fn cmd_list_create(
    svc: &LarderService,
    owner: &str,
    name: &str,
    json: bool,
) -> Result<()> {
    let list = svc.create_list(
        owner,
        &NewShoppingList {
            id: None,
            name: name.to_string(),
        },
    )?;
    if json {
        println!("{}", serde_json::to_string_pretty(&list)?);
    } else {
        println!("Created shopping list: {} (id: {})", list.name, list.id);
    }
    Ok(())
}

pub(crate) fn cmd_list_all(svc: &LarderService, owner: &str, json: bool) -> Result<()> {
    #[derive(Tabled)]
    struct ListRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Updated")]
        updated: String,
    }

    let lists = svc.list_lists(owner)?;
    if lists.is_empty() {
        if json {
            println!("[]");
        } else {
            eprintln!("No shopping lists found");
        }
        process::exit(2);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&lists)?);
        return Ok(());
    }

    let rows: Vec<ListRow> = lists
        .iter()
        .map(|l| ListRow {
            id: l.id.clone(),
            name: truncate(&l.name, 30),
            updated: format_timestamp(l.sync.updated_at),
        })
        .collect();
    println!("{}", Table::new(&rows).with(Style::rounded()));
    Ok(())
}

pub(crate) fn cmd_list_show(
    svc: &LarderService,
    owner: &str,
    list_id: &str,
    json: bool,
) -> Result<()> {
    let list = svc.get_list(owner, list_id)?;
    let items = svc.list_items(owner, list_id)?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({ "list": list, "items": items }))?
        );
        return Ok(());
    }

    let checked = items.iter().filter(|i| i.checked).count();
    println!("=== {} ===", list.name);
    println!("  {} items, {checked} checked\n", items.len());
    if !items.is_empty() {
        print_items_table(&items);
    }
    Ok(())
}

pub(crate) fn cmd_item_add(
    svc: &LarderService,
    owner: &str,
    list_id: &str,
    new: &NewShoppingItem,
    json: bool,
) -> Result<()> {
    let item = svc.add_item(owner, list_id, new)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&item)?);
    } else {
        let qty = format_quantity(item.quantity, item.unit.as_deref());
        println!("Added {} ({qty}) (id: {})", item.name, item.id);
    }
    Ok(())
}

pub(crate) fn cmd_item_check(
    svc: &LarderService,
    owner: &str,
    item_id: &str,
    checked: bool,
    json: bool,
) -> Result<()> {
    let item = svc.update_item(
        owner,
        item_id,
        &UpdateShoppingItem {
            checked: Some(checked),
            ..UpdateShoppingItem::default()
        },
    )?;
    if json {
        println!("{}", serde_json::to_string_pretty(&item)?);
    } else {
        let state = if item.checked { "Checked" } else { "Unchecked" };
        println!("{state} {} (v{})", item.name, item.sync.sync_version);
    }
    Ok(())
}

pub(crate) fn cmd_import_recipe(
    svc: &LarderService,
    owner: &str,
    list_id: &str,
    recipe_id: &str,
    json: bool,
) -> Result<()> {
    let items = svc.import_recipe(owner, list_id, recipe_id)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    let tag = items
        .first()
        .and_then(|i| i.recipe_tag.as_deref())
        .unwrap_or("recipe");
    println!("Imported {} ingredient(s) from {tag}", items.len());
    if !items.is_empty() {
        print_items_table(&items);
    }
    Ok(())
}

/// Move every checked item into the pantry and retire it from the list.
pub(crate) fn cmd_list_complete(
    svc: &LarderService,
    owner: &str,
    list_id: &str,
    json: bool,
) -> Result<()> {
    let summary = svc.complete_list(owner, list_id)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    if summary.retired_item_ids.is_empty() {
        println!("Nothing checked on {}; pantry unchanged", summary.list.name);
        return Ok(());
    }

    println!(
        "Completed {}: {} item(s) moved into the pantry",
        summary.list.name,
        summary.retired_item_ids.len()
    );
    for item in &summary.pantry {
        let qty = format_quantity(item.quantity, item.unit.as_deref());
        println!("  {} ({qty}, {})", item.name, item.category);
    }
    Ok(())
}
