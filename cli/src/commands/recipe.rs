use anyhow::{Context, Result, bail};
use std::process;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use larder_core::models::{Ingredient, NewRecipe, Step};
use larder_core::service::LarderService;

use super::helpers::{format_quantity, truncate};

pub(crate) struct ImportOptions {
    pub name: Option<String>,
    pub servings: Option<f64>,
    pub public: bool,
}

pub(crate) fn cmd_recipe_import(
    svc: &LarderService,
    owner: &str,
    file: &std::path::Path,
    opts: ImportOptions,
    json: bool,
) -> Result<()> {
    let input = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read file: {}", file.display()))?;

    let (recipe_data, _report) = cooklang::parse(&input)
        .into_result()
        .map_err(|e| anyhow::anyhow!("Failed to parse Cooklang file: {e}"))?;

    let name = opts
        .name
        .or_else(|| recipe_data.metadata.title().map(String::from))
        .or_else(|| file.file_stem().and_then(|s| s.to_str()).map(String::from))
        .context("Could not determine recipe name. Use --name to specify one")?;

    let servings = opts.servings.or_else(|| {
        recipe_data
            .metadata
            .servings()
            .and_then(|s| s.as_number().map(f64::from))
    });

    let converter = cooklang::Converter::default();
    let ingredients: Vec<Ingredient> = recipe_data
        .group_ingredients(&converter)
        .iter()
        .map(cooklang_ingredient)
        .collect();

    if ingredients.is_empty() {
        bail!("No ingredients found in recipe");
    }

    let recipe = svc.create_recipe(
        owner,
        &NewRecipe {
            name,
            servings,
            is_public: opts.public,
            ingredients,
            steps: steps_from_source(&input),
            ..NewRecipe::default()
        },
    )?;

    if json {
        println!("{}", serde_json::to_string_pretty(&recipe)?);
    } else {
        println!(
            "Imported recipe: {} ({} ingredients, {} steps, id: {})",
            recipe.name,
            recipe.ingredients.len(),
            recipe.steps.len(),
            recipe.id
        );
    }
    Ok(())
}

fn cooklang_ingredient(gi: &cooklang::ingredient_list::GroupedIngredient<'_>) -> Ingredient {
    // Only the first grouped quantity is kept.
    let (quantity, unit) =
        gi.quantity
            .iter()
            .next()
            .map_or((None, None), |qty: &cooklang::Quantity| {
                let value = match qty.value() {
                    cooklang::Value::Number(n) => Some(n.value()),
                    cooklang::Value::Range { start, .. } => Some(start.value()),
                    cooklang::Value::Text(t) => t.trim().parse::<f64>().ok(),
                };
                (value, qty.unit().map(String::from))
            });

    Ingredient {
        name: gi.ingredient.display_name().to_string(),
        quantity,
        unit,
        category: None,
        note: gi.ingredient.note.clone(),
    }
}

/// One step per paragraph of the recipe body, markup reduced to plain text.
fn steps_from_source(input: &str) -> Vec<Step> {
    let mut steps = Vec::new();
    let mut paragraph: Vec<String> = Vec::new();
    let mut lines = input.lines().peekable();

    // YAML front matter
    if lines.peek().is_some_and(|l| l.trim() == "---") {
        lines.next();
        for line in lines.by_ref() {
            if line.trim() == "---" {
                break;
            }
        }
    }

    let mut in_block_comment = false;
    for line in lines {
        let mut line = line.to_string();
        if in_block_comment {
            match line.find("-]") {
                Some(end) => {
                    line = line[end + 2..].to_string();
                    in_block_comment = false;
                }
                None => continue,
            }
        }
        while let Some(start) = line.find("[-") {
            if let Some(len) = line[start..].find("-]") {
                line.replace_range(start..start + len + 2, "");
            } else {
                line.truncate(start);
                in_block_comment = true;
            }
        }
        if let Some(idx) = line.find("--") {
            line.truncate(idx);
        }

        let trimmed = line.trim();
        if trimmed.starts_with(">>") || trimmed.starts_with('=') {
            continue;
        }
        if trimmed.is_empty() {
            flush_paragraph(&mut paragraph, &mut steps);
        } else {
            paragraph.push(trimmed.to_string());
        }
    }
    flush_paragraph(&mut paragraph, &mut steps);
    steps
}

fn flush_paragraph(paragraph: &mut Vec<String>, steps: &mut Vec<Step>) {
    if paragraph.is_empty() {
        return;
    }
    let (instruction, timer_minutes) = reduce_markup(&paragraph.join(" "));
    paragraph.clear();
    if !instruction.is_empty() {
        steps.push(Step {
            instruction,
            timer_minutes,
        });
    }
}

/// Strip `@ingredient{..}`, `#cookware{..}` and `~timer{..}` markup, keeping
/// the readable names. Returns the text and the first timer in minutes.
fn reduce_markup(text: &str) -> (String, Option<i64>) {
    let mut out = String::with_capacity(text.len());
    let mut timer_minutes = None;
    let mut rest = text;

    while let Some(pos) = rest.find(['@', '#', '~']) {
        out.push_str(&rest[..pos]);
        let sigil = rest[pos..].chars().next().unwrap_or('@');
        let after = &rest[pos + 1..];
        let (name, body, consumed) = split_component(after);

        if name.is_empty() && body.is_none() {
            out.push(sigil);
            rest = after;
            continue;
        }

        match (sigil, body) {
            ('~', Some(body)) => {
                let (amount, unit) = body.split_once('%').unwrap_or((body, ""));
                let (amount, unit) = (amount.trim(), unit.trim());
                if timer_minutes.is_none() {
                    timer_minutes = timer_to_minutes(amount, unit);
                }
                if name.is_empty() {
                    out.push_str(amount);
                    if !unit.is_empty() {
                        out.push(' ');
                        out.push_str(unit);
                    }
                } else {
                    out.push_str(name);
                }
            }
            _ => out.push_str(name),
        }

        rest = &after[consumed..];
        // Ingredient preparation notes: "@onion{1}(diced)"
        if sigil == '@' && body.is_some() && rest.starts_with('(') {
            if let Some(close) = rest.find(')') {
                rest = &rest[close + 1..];
            }
        }
    }
    out.push_str(rest);

    let collapsed = out.split_whitespace().collect::<Vec<_>>().join(" ");
    (collapsed, timer_minutes)
}

/// Split the text after a sigil into `(name, brace body, bytes consumed)`.
///
/// Multi-word names need a brace block; otherwise the name is one word.
fn split_component(after: &str) -> (&str, Option<&str>, usize) {
    if let Some(open) = after.find('{') {
        let candidate = &after[..open];
        let multiword_ok = candidate
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_' | '\''));
        if multiword_ok {
            if let Some(close) = after[open..].find('}') {
                let body = &after[open + 1..open + close];
                return (candidate.trim(), Some(body), open + close + 1);
            }
        }
    }

    let end = after
        .char_indices()
        .find(|(_, c)| !(c.is_alphanumeric() || matches!(c, '_' | '-')))
        .map_or(after.len(), |(i, _)| i);
    (&after[..end], None, end)
}

fn timer_to_minutes(amount: &str, unit: &str) -> Option<i64> {
    let value: f64 = amount.parse().ok()?;
    let unit = unit.to_lowercase();
    let minutes = if unit.starts_with('h') {
        value * 60.0
    } else if unit.starts_with("min") || unit == "m" {
        value
    } else if unit.starts_with('s') {
        value / 60.0
    } else {
        return None;
    };
    Some(minutes.round() as i64)
}

pub(crate) fn cmd_recipe_list(
    svc: &LarderService,
    owner: &str,
    public: bool,
    json: bool,
) -> Result<()> {
    #[derive(Tabled)]
    struct RecipeRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Servings")]
        servings: String,
        #[tabled(rename = "Ingredients")]
        ingredients: usize,
        #[tabled(rename = "Public")]
        public: &'static str,
    }

    let recipes = if public {
        svc.list_public_recipes()?
    } else {
        svc.list_recipes(owner)?
    };
    if recipes.is_empty() {
        if json {
            println!("[]");
        } else {
            eprintln!("No recipes found");
        }
        process::exit(2);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&recipes)?);
        return Ok(());
    }

    let rows: Vec<RecipeRow> = recipes
        .iter()
        .map(|r| RecipeRow {
            id: r.id.clone(),
            name: truncate(&r.name, 30),
            servings: r.servings.map_or("-".into(), |s| format!("{s}")),
            ingredients: r.ingredients.len(),
            public: if r.is_public { "yes" } else { "" },
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(2..4)).with(Alignment::right()))
        .to_string();
    println!("{table}");
    Ok(())
}

pub(crate) fn cmd_recipe_show(svc: &LarderService, owner: &str, id: &str, json: bool) -> Result<()> {
    let recipe = svc.get_recipe(owner, id)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&recipe)?);
        return Ok(());
    }

    println!("=== {} ===", recipe.name);
    if let Some(description) = &recipe.description {
        println!("  {description}");
    }
    let servings = recipe.servings.map_or("-".into(), |s| format!("{s}"));
    println!(
        "  Servings: {servings}  |  v{}  |  {}\n",
        recipe.sync.sync_version,
        if recipe.is_public { "public" } else { "private" }
    );

    println!("  INGREDIENTS:");
    for ing in &recipe.ingredients {
        let qty = format_quantity(ing.quantity, ing.unit.as_deref());
        match &ing.note {
            Some(note) => println!("    {}: {qty} ({note})", ing.name),
            None => println!("    {}: {qty}", ing.name),
        }
    }

    if !recipe.steps.is_empty() {
        println!("\n  STEPS:");
        for (i, step) in recipe.steps.iter().enumerate() {
            match step.timer_minutes {
                Some(m) => println!("    {}. {} [{m} min]", i + 1, step.instruction),
                None => println!("    {}. {}", i + 1, step.instruction),
            }
        }
    }
    Ok(())
}

pub(crate) fn cmd_recipe_publish(
    svc: &LarderService,
    owner: &str,
    id: &str,
    public: bool,
    json: bool,
) -> Result<()> {
    let recipe = svc.set_recipe_public(owner, id, public)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&recipe)?);
    } else {
        let state = if recipe.is_public { "public" } else { "private" };
        println!("{} is now {state}", recipe.name);
    }
    Ok(())
}
