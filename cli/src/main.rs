mod commands;
mod config;
mod server;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::commands::{
    ImportOptions, cmd_changes, cmd_erase, cmd_import_recipe, cmd_item_add, cmd_item_check,
    cmd_list_all, cmd_list_complete, cmd_list_create, cmd_list_show, cmd_pantry_add,
    cmd_pantry_list, cmd_pantry_remove, cmd_push, cmd_recipe_import, cmd_recipe_list,
    cmd_recipe_publish, cmd_recipe_show,
};
use crate::config::Config;
use larder_core::models::{NewPantryItem, NewShoppingItem};
use larder_core::service::{Deadlines, LarderService};

#[derive(Parser)]
#[command(
    name = "larder",
    version,
    about = "Offline-first sync server for recipes, pantry, shopping lists and meal plans"
)]
struct Cli {
    /// Database file (default: larder.db in the data directory)
    #[arg(long, global = true, env = "LARDER_DB", value_name = "PATH")]
    db: Option<PathBuf>,
    /// Account to act as for local commands
    #[arg(long, global = true, env = "LARDER_OWNER", default_value = "local")]
    owner: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the sync API server
    Serve {
        /// Port to listen on
        #[arg(short, long, env = "LARDER_PORT", default_value = "8080")]
        port: u16,
        /// Address to bind to (default: 127.0.0.1, use 0.0.0.0 to expose to network)
        #[arg(short, long, env = "LARDER_BIND", default_value = "127.0.0.1")]
        bind: String,
        /// Disable API key authentication and trust the X-Larder-Owner header
        #[arg(long)]
        no_auth: bool,
        /// Deadline for mutating requests, in milliseconds
        #[arg(long, env = "LARDER_WRITE_TIMEOUT_MS", default_value = "10000")]
        write_timeout_ms: u64,
        /// Deadline for read-only requests, in milliseconds
        #[arg(long, env = "LARDER_READ_TIMEOUT_MS", default_value = "3000")]
        read_timeout_ms: u64,
    },
    /// Show what changed since a timestamp
    Changes {
        /// Restrict to one entity type (e.g. pantry_items, shopping-lists)
        #[arg(short, long)]
        entity: Option<String>,
        /// RFC 3339 timestamp or YYYY-MM-DD (default: everything)
        #[arg(short, long)]
        since: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Apply a JSON push document the way a syncing client would
    Push {
        /// Path to the push document
        file: PathBuf,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage pantry stock
    Pantry {
        #[command(subcommand)]
        command: PantryCommands,
    },
    /// Manage shopping lists
    Shopping {
        #[command(subcommand)]
        command: ShoppingCommands,
    },
    /// Manage recipes
    Recipe {
        #[command(subcommand)]
        command: RecipeCommands,
    },
    /// Permanently delete every record belonging to --owner
    Erase {
        /// Confirm the erasure
        #[arg(long)]
        yes: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum PantryCommands {
    /// List pantry items
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Add stock (merges into an existing item with the same name and category)
    Add {
        /// Item name
        name: String,
        /// Quantity to add
        #[arg(short, long)]
        quantity: Option<f64>,
        /// Unit (e.g. g, ml, pcs)
        #[arg(short, long)]
        unit: Option<String>,
        /// Category (free text, normalized)
        #[arg(short, long)]
        category: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove an item by ID
    Remove {
        /// Pantry item ID
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ShoppingCommands {
    /// Create a shopping list
    Create {
        /// List name
        name: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List all shopping lists
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show a list and its items
    Show {
        /// Shopping list ID
        list: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Add an item to a list
    Add {
        /// Shopping list ID
        list: String,
        /// Item name
        name: String,
        /// Quantity
        #[arg(short, long)]
        quantity: Option<f64>,
        /// Unit (e.g. g, ml, pcs)
        #[arg(short, long)]
        unit: Option<String>,
        /// Category (free text)
        #[arg(short, long)]
        category: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check (or with --undo, uncheck) an item
    Check {
        /// Shopping item ID
        item: String,
        /// Uncheck instead
        #[arg(long)]
        undo: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Add a recipe's ingredients to a list (once per recipe)
    ImportRecipe {
        /// Shopping list ID
        list: String,
        /// Recipe ID
        recipe: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Move checked items into the pantry
    Complete {
        /// Shopping list ID
        list: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum RecipeCommands {
    /// Import a recipe from a Cooklang (.cook) file
    Import {
        /// Path to the .cook file
        file: PathBuf,
        /// Recipe name override (defaults to metadata title or filename)
        #[arg(long)]
        name: Option<String>,
        /// Servings override (defaults to metadata servings)
        #[arg(long)]
        servings: Option<f64>,
        /// Publish the recipe
        #[arg(long)]
        public: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List recipes
    List {
        /// List every account's published recipes instead
        #[arg(long)]
        public: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show recipe details
    Show {
        /// Recipe ID
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Publish a recipe (or with --undo, make it private again)
    Publish {
        /// Recipe ID
        id: String,
        /// Make private instead
        #[arg(long)]
        undo: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "larder=info,larder_core=info,tower_http=info".into()),
        )
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[allow(clippy::too_many_lines)]
async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.db)?;
    let owner = cli.owner.as_str();

    let svc = LarderService::open(&config.db_path, Deadlines::default())?;

    match cli.command {
        Commands::Serve {
            port,
            bind,
            no_auth,
            write_timeout_ms,
            read_timeout_ms,
        } => {
            drop(svc);
            init_tracing();
            let (api_keys, new_api_keys) = if no_auth {
                (None, false)
            } else {
                let (keys, new) = config.load_or_create_api_keys()?;
                (Some(keys), new)
            };
            let deadlines = Deadlines {
                read: Duration::from_millis(read_timeout_ms),
                write: Duration::from_millis(write_timeout_ms),
            };
            server::start_server(
                config.db_path,
                port,
                &bind,
                api_keys,
                deadlines,
                new_api_keys,
            )
            .await
        }
        Commands::Changes {
            entity,
            since,
            json,
        } => cmd_changes(&svc, owner, entity.as_deref(), since.as_deref(), json),
        Commands::Push { file, json } => cmd_push(&svc, owner, &file, json),
        Commands::Erase { yes, json } => cmd_erase(&svc, owner, yes, json),
        Commands::Pantry { command } => match command {
            PantryCommands::List { json } => cmd_pantry_list(&svc, owner, json),
            PantryCommands::Add {
                name,
                quantity,
                unit,
                category,
                json,
            } => cmd_pantry_add(
                &svc,
                owner,
                &NewPantryItem {
                    name,
                    category,
                    quantity,
                    unit,
                },
                json,
            ),
            PantryCommands::Remove { id, json } => cmd_pantry_remove(&svc, owner, &id, json),
        },
        Commands::Shopping { command } => match command {
            ShoppingCommands::Create { name, json } => cmd_list_create(&svc, owner, &name, json),
            ShoppingCommands::List { json } => cmd_list_all(&svc, owner, json),
            ShoppingCommands::Show { list, json } => cmd_list_show(&svc, owner, &list, json),
            ShoppingCommands::Add {
                list,
                name,
                quantity,
                unit,
                category,
                json,
            } => cmd_item_add(
                &svc,
                owner,
                &list,
                &NewShoppingItem {
                    name,
                    quantity,
                    unit,
                    category,
                    ..NewShoppingItem::default()
                },
                json,
            ),
            ShoppingCommands::Check { item, undo, json } => {
                cmd_item_check(&svc, owner, &item, !undo, json)
            }
            ShoppingCommands::ImportRecipe { list, recipe, json } => {
                cmd_import_recipe(&svc, owner, &list, &recipe, json)
            }
            ShoppingCommands::Complete { list, json } => {
                cmd_list_complete(&svc, owner, &list, json)
            }
        },
        Commands::Recipe { command } => match command {
            RecipeCommands::Import {
                file,
                name,
                servings,
                public,
                json,
            } => cmd_recipe_import(
                &svc,
                owner,
                &file,
                ImportOptions {
                    name,
                    servings,
                    public,
                },
                json,
            ),
            RecipeCommands::List { public, json } => cmd_recipe_list(&svc, owner, public, json),
            RecipeCommands::Show { id, json } => cmd_recipe_show(&svc, owner, &id, json),
            RecipeCommands::Publish { id, undo, json } => {
                cmd_recipe_publish(&svc, owner, &id, !undo, json)
            }
        },
    }
}
