use anyhow::Result;
use std::process;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use larder_core::Error;
use larder_core::models::{NewPantryItem, PantryItem};
use larder_core::service::LarderService;

use super::helpers::{format_quantity, format_timestamp, json_error, truncate};

fn print_pantry_table(items: &[PantryItem]) {
    #[derive(Tabled)]
    struct PantryRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Category")]
        category: String,
        #[tabled(rename = "Quantity")]
        quantity: String,
        #[tabled(rename = "Updated")]
        updated: String,
        #[tabled(rename = "Ver")]
        version: i64,
    }

    let rows: Vec<PantryRow> = items
        .iter()
        .map(|item| PantryRow {
            id: item.id.chars().take(8).collect(),
            name: truncate(&item.name, 30),
            category: item.category.to_string(),
            quantity: format_quantity(item.quantity, item.unit.as_deref()),
            updated: format_timestamp(item.sync.updated_at),
            version: item.sync.sync_version,
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(3..4)).with(Alignment::right()))
        .to_string();
    println!("{table}");
}

pub(crate) fn cmd_pantry_list(svc: &LarderService, owner: &str, json: bool) -> Result<()> {
    let items = svc.list_pantry(owner)?;
    if items.is_empty() {
        if json {
            println!("[]");
        } else {
            eprintln!("Pantry is empty");
        }
        process::exit(2);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else {
        print_pantry_table(&items);
    }
    Ok(())
}

/// Adds stock; an existing row with the same name and category grows.
pub(crate) fn cmd_pantry_add(
    svc: &LarderService,
    owner: &str,
    new: &NewPantryItem,
    json: bool,
) -> Result<()> {
    let item = svc.add_pantry_item(owner, new)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&item)?);
    } else {
        let qty = format_quantity(item.quantity, item.unit.as_deref());
        println!(
            "Pantry: {} ({qty}, {}) v{}",
            item.name, item.category, item.sync.sync_version
        );
    }
    Ok(())
}

pub(crate) fn cmd_pantry_remove(
    svc: &LarderService,
    owner: &str,
    id: &str,
    json: bool,
) -> Result<()> {
    let item = match svc.get_pantry_item(owner, id) {
        Ok(item) => item,
        Err(Error::NotFound { .. }) => {
            if json {
                println!("{}", json_error(&format!("Pantry item {id} not found")));
            } else {
                eprintln!("Pantry item {id} not found");
            }
            process::exit(2);
        }
        Err(e) => return Err(e.into()),
    };
    svc.delete_pantry_item(owner, id)?;
    if json {
        println!("{}", serde_json::json!({ "deleted": item.id }));
    } else {
        println!("Removed {} from the pantry", item.name);
    }
    Ok(())
}
