//! safe-store: inspect and edit the application's JSON documents from a shell.
//!
//! Opens the same stores the application does, so migrations run and backups
//! are taken exactly as they would be on application start.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use safe_store::path::set_path;
use safe_store::{backup, Document, Format, RegistryOptions, StoreRegistry};

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "safe-store")]
#[command(about = "Read, edit and watch safe-store documents")]
struct Args {
    /// Directory holding user_settings.json (overrides SAFE_STORE_DATA_DIR)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Write indented JSON
    #[arg(long)]
    pretty: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a document
    Get { name: String },
    /// Replace a document with the given JSON
    Set { name: String, json: String },
    /// Set one dotted path inside a document
    Update {
        name: String,
        path: String,
        json: String,
    },
    /// Log external changes to every document until Ctrl+C
    Watch,
    /// Archive the documents directory now
    Backup,
    /// Print the documents directory
    Path,
}

fn parse_json(text: &str) -> Result<Value> {
    serde_json::from_str(text).with_context(|| format!("Invalid JSON: {}", text))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,safe_store=debug"
    } else {
        "info,safe_store=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env()?;
    let data_dir = args.data_dir.unwrap_or(config.data_dir);
    let format = if args.pretty || config.pretty {
        Format::Pretty
    } else {
        Format::Compact
    };

    let options = RegistryOptions::new(&data_dir)
        .format(format)
        .backup_on_open(matches!(args.command, Command::Watch));
    let registry = StoreRegistry::open(options)
        .await
        .with_context(|| format!("Failed to open stores in {}", data_dir.display()))?;

    let result = run(&registry, args.command).await;
    registry.close_all().await;
    result
}

async fn run(registry: &StoreRegistry, command: Command) -> Result<()> {
    match command {
        Command::Get { name } => {
            let doc = registry.get(&name)?;
            println!("{}", serde_json::to_string_pretty(&*doc)?);
        }
        Command::Set { name, json } => {
            let value = parse_json(&json)?;
            registry.set_queued(&name, value)?.await;
            info!("Updated {}", name);
        }
        Command::Update { name, path, json } => {
            let value = parse_json(&json)?;
            registry
                .update_queued(&name, |cur| {
                    let mut next = cur.clone();
                    set_path(&mut next, &path, value);
                    next
                })?
                .await;
            info!("Updated {}.{}", name, path);
        }
        Command::Watch => watch(registry).await?,
        Command::Backup => match backup::spawn_archive(registry.documents_dir().to_path_buf()).await {
            Some(archive) => println!("{}", archive.display()),
            None => warn!("No backup written"),
        },
        Command::Path => println!("{}", registry.documents_dir().display()),
    }
    Ok(())
}

async fn watch(registry: &StoreRegistry) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<(Document, Value)>();

    let mut subscriptions = Vec::new();
    for doc in Document::ALL {
        let tx = tx.clone();
        subscriptions.push(registry.on_change(doc.name(), move |value| {
            // Receiver dropped means we're shutting down.
            let _ = tx.send((doc, value.clone()));
        })?);
    }
    drop(tx);

    info!(
        "Watching {} documents in {}. Press Ctrl+C to stop.",
        subscriptions.len(),
        registry.documents_dir().display()
    );

    loop {
        tokio::select! {
            Some((doc, value)) = rx.recv() => {
                info!("{} changed externally", doc);
                println!("{}: {}", doc, value);
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    drop(subscriptions);
    Ok(())
}
