//! Tandem CLI - inspect and edit the persisted resource configuration.
//!
//! Operates on the same store file the application windows use. Running
//! windows pick up `set`, `merge`, `remove` and `disable` through their file
//! watch; `clear` deletes the record, which they do not pick up.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use tandem_app::{AppConfig, AppContext};
use tandem_common::{ActionKind, ResourceId};
use tandem_config::{ConfigEntry, PersistedConfiguration};
use tandem_sync::BroadcastHub;

#[derive(Parser)]
#[command(name = "tandem")]
#[command(about = "Tandem - Persisted resource configuration")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Application config file (JSON).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory holding the store file.
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the whole configuration, or one resource entry.
    Show {
        /// Resource identifier, e.g. "gdrive:".
        resource: Option<String>,
    },

    /// Replace a resource entry.
    Set {
        /// Resource identifier.
        resource: String,

        /// Entry as a JSON object.
        json: String,
    },

    /// Merge top-level keys into a resource entry.
    Merge {
        /// Resource identifier.
        resource: String,

        /// Partial entry as a JSON object.
        json: String,
    },

    /// Remove a resource entry.
    Remove {
        /// Resource identifier.
        resource: String,
    },

    /// Set the disabled action kinds; no kinds enables everything.
    Disable {
        /// Any of: mount, sync, copy, serve.
        kinds: Vec<String>,
    },

    /// Delete the stored configuration.
    ///
    /// Running windows keep their configuration in memory and write it back
    /// on their next change.
    Clear,

    /// Print the configuration every time it changes, until Ctrl-C.
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config =
        AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(dir) = cli.data_dir {
        config = config.with_data_dir(dir);
    }
    // Only `watch` needs to hear about edits made by others.
    config.watch_store = matches!(cli.command, Commands::Watch);
    config.snapshot_wait_ms = 0;

    let hub = BroadcastHub::new();
    let ctx = AppContext::bootstrap(config, &hub)
        .await
        .context("Failed to open store")?;

    let result = match cli.command {
        Commands::Show { resource } => cmd_show(&ctx, resource.as_deref()),
        Commands::Set { resource, json } => cmd_set(&ctx, &resource, &json).await,
        Commands::Merge { resource, json } => cmd_merge(&ctx, &resource, &json).await,
        Commands::Remove { resource } => cmd_remove(&ctx, &resource).await,
        Commands::Disable { kinds } => cmd_disable(&ctx, &kinds).await,
        Commands::Clear => cmd_clear(&ctx).await,
        Commands::Watch => cmd_watch(&ctx).await,
    };

    ctx.shutdown();
    result
}

fn parse_resource(resource: &str) -> Result<ResourceId> {
    ResourceId::new(resource).context("Invalid resource identifier")
}

fn parse_entry(json: &str) -> Result<ConfigEntry> {
    ConfigEntry::from_json(json).context("Entry must be a JSON object")
}

fn parse_kinds(kinds: &[String]) -> Result<BTreeSet<ActionKind>> {
    kinds
        .iter()
        .map(|k| {
            k.parse::<ActionKind>()
                .with_context(|| format!("Unknown action kind '{}'", k))
        })
        .collect()
}

fn print_config(config: &PersistedConfiguration) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

/// Show configuration.
fn cmd_show(ctx: &AppContext, resource: Option<&str>) -> Result<()> {
    match resource {
        None => print_config(&ctx.store().snapshot()),
        Some(resource) => {
            let id = parse_resource(resource)?;
            let entry = ctx
                .store()
                .entry(&id)
                .with_context(|| format!("No configuration for '{}'", id))?;
            println!("{}", serde_json::to_string_pretty(&entry)?);
            Ok(())
        }
    }
}

/// Replace one entry.
async fn cmd_set(ctx: &AppContext, resource: &str, json: &str) -> Result<()> {
    let id = parse_resource(resource)?;
    let entry = parse_entry(json)?;

    ctx.store()
        .set_config(id.clone(), entry)
        .await
        .context("Failed to save configuration")?;

    println!("Configuration for '{}' replaced.", id);
    Ok(())
}

/// Merge into one entry.
async fn cmd_merge(ctx: &AppContext, resource: &str, json: &str) -> Result<()> {
    let id = parse_resource(resource)?;
    let partial = parse_entry(json)?;
    let keys = partial.len();

    ctx.store()
        .merge_config(id.clone(), partial)
        .await
        .context("Failed to save configuration")?;

    println!("Merged {} key(s) into '{}'.", keys, id);
    Ok(())
}

/// Remove one entry.
async fn cmd_remove(ctx: &AppContext, resource: &str) -> Result<()> {
    let id = parse_resource(resource)?;

    let removed = ctx
        .store()
        .remove_config(&id)
        .await
        .context("Failed to save configuration")?;

    if removed {
        println!("Configuration for '{}' removed.", id);
    } else {
        println!("No configuration for '{}'.", id);
    }
    Ok(())
}

/// Replace the disabled action kinds.
async fn cmd_disable(ctx: &AppContext, kinds: &[String]) -> Result<()> {
    let kinds = parse_kinds(kinds)?;

    ctx.store()
        .set_disabled_actions(kinds.clone())
        .await
        .context("Failed to save configuration")?;

    if kinds.is_empty() {
        println!("All actions enabled.");
    } else {
        let names: Vec<&str> = kinds.iter().map(|k| k.as_str()).collect();
        println!("Disabled: {}", names.join(", "));
    }
    Ok(())
}

/// Delete the stored configuration.
async fn cmd_clear(ctx: &AppContext) -> Result<()> {
    info!("Clearing store at {}", ctx.config().store_path().display());

    ctx.store()
        .clear()
        .await
        .context("Failed to clear configuration")?;

    println!("Configuration cleared.");
    Ok(())
}

/// Print every change until interrupted.
async fn cmd_watch(ctx: &AppContext) -> Result<()> {
    print_config(&ctx.store().snapshot())?;
    info!("Watching {}", ctx.config().store_path().display());

    let _subscription = ctx.store().subscribe(|config| {
        if let Err(e) = print_config(config) {
            warn!("Failed to print configuration: {}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    Ok(())
}
