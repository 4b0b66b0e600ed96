//! CLI for rfbmc result stores.
//!
//! Provides commands for creating, inspecting, migrating and importing stores
//! kept in a directory-backed key-value store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use rfbmc::backend::cas::CasBackend;
use rfbmc::backend::dir::DirStore;
use rfbmc::backend::{AttributeValue, Backend, Condition, Item};
use rfbmc::codec::{self, CURRENT_VERSION, v0};
use rfbmc::error::BackendError;
use rfbmc::{Params, RfBmcStore, RfmRegistry, StoreConfig};
use tracing_subscriber::EnvFilter;

/// rfbmc — Versioned counting store for RF-BMC sampling results.
#[derive(Parser)]
#[command(name = "rfbmc", version, about)]
struct Cli {
    /// Path to a JSON store configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Allocate a new, empty store and print its identifier.
    Create {
        /// Path to the store directory.
        store_path: PathBuf,

        /// Use this identifier instead of a generated one.
        #[arg(long)]
        ident: Option<String>,

        /// Succeed without changes if the identifier already exists.
        #[arg(long)]
        accept_existing: bool,

        /// Bit width selection count, as WIDTH=COUNT (repeatable).
        #[arg(long = "width", value_parser = parse_width)]
        widths: Vec<(u32, u64)>,
    },

    /// List the stores in a directory with their format versions.
    List {
        /// Path to the store directory.
        store_path: PathBuf,
    },

    /// Display a store's params and result histograms.
    Info {
        /// Path to the store directory.
        store_path: PathBuf,

        /// Store identifier.
        ident: String,

        /// Output format.
        #[arg(long, default_value = "text")]
        format: OutputFormat,
    },

    /// Migrate one store, or every store in the directory, to the current format.
    Migrate {
        /// Path to the store directory.
        store_path: PathBuf,

        /// Store identifier (all stores if omitted).
        ident: Option<String>,
    },

    /// Import a legacy JSON snapshot as a new store, migrating it on the way in.
    Import {
        /// Path to the store directory.
        store_path: PathBuf,

        /// Legacy snapshot file.
        snapshot: PathBuf,

        /// Identifier for the imported store.
        #[arg(long)]
        ident: String,
    },
}

/// Output format for store contents.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Human-readable listing.
    Text,
    /// JSON document.
    Json,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let config = cli.config.as_deref();
    let result = match cli.command {
        Commands::Create {
            store_path,
            ident,
            accept_existing,
            widths,
        } => cmd_create(&store_path, config, ident.as_deref(), accept_existing, widths).map(|ident| {
            println!("{ident}");
        }),
        Commands::List { store_path } => cmd_list(&store_path, config),
        Commands::Info {
            store_path,
            ident,
            format,
        } => cmd_info(&store_path, config, &ident, &format),
        Commands::Migrate { store_path, ident } => cmd_migrate(&store_path, config, ident.as_deref()),
        Commands::Import {
            store_path,
            snapshot,
            ident,
        } => cmd_import(&store_path, config, &snapshot, &ident),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Loads the configuration (defaults if no file is given) and opens the directory backend.
fn open_backend(
    store_path: &Path,
    config_path: Option<&Path>,
) -> Result<(CasBackend<DirStore>, StoreConfig), Box<dyn std::error::Error>> {
    let config = match config_path {
        Some(path) => StoreConfig::from_json_file(path)?,
        None => StoreConfig::default(),
    };
    config.validate()?;
    let store = DirStore::open(store_path, config.lock_timeout())?;
    Ok((CasBackend::with_retry(store, config.retry.clone()), config))
}

/// Implements `rfbmc create <store_path>`.
fn cmd_create(
    store_path: &Path,
    config_path: Option<&Path>,
    ident: Option<&str>,
    accept_existing: bool,
    widths: Vec<(u32, u64)>,
) -> Result<String, Box<dyn std::error::Error>> {
    let (backend, config) = open_backend(store_path, config_path)?;
    let registry = RfmRegistry::with_builtin();
    let ident = RfBmcStore::create_with_config(
        &backend,
        &registry,
        &Params::new(widths),
        ident,
        accept_existing,
        &config,
    )?;
    Ok(ident)
}

/// Implements `rfbmc list <store_path>`.
fn cmd_list(store_path: &Path, config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let (backend, _config) = open_backend(store_path, config_path)?;

    let ids = backend.inner().ids()?;
    println!("Stores: {}", ids.len());
    for id in &ids {
        let version = backend
            .get_item(id)?
            .and_then(|item| item.version())
            .map_or_else(|| "?".to_string(), |v| format!("v{v}"));
        println!("  {id} ({version})");
    }
    Ok(())
}

/// Implements `rfbmc info <store_path> <ident>`.
fn cmd_info(
    store_path: &Path,
    config_path: Option<&Path>,
    ident: &str,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let (backend, config) = open_backend(store_path, config_path)?;
    let registry = RfmRegistry::with_builtin();
    let data = RfBmcStore::load_and_normalize_with_config(&backend, &registry, ident, &config)?;

    // Sorted for stable output.
    let results: BTreeMap<_, BTreeMap<_, u64>> = data
        .rf_bmc_results_map
        .iter()
        .map(|(task, histogram)| (task, histogram.iter().map(|(r, c)| (r, *c)).collect()))
        .collect();

    match format {
        OutputFormat::Text => {
            println!("Store: {ident}");
            println!("Bit widths:");
            for (width, count) in &data.params.bit_width_counter {
                println!("  {width}: {count}");
            }
            println!("Tasks: {}", results.len());
            for (task, histogram) in &results {
                println!("  {task}");
                for (result, count) in histogram {
                    println!("    {result}: {count}");
                }
            }
            println!("Total occurrences: {}", data.total_occurrences());
        }
        OutputFormat::Json => {
            let tasks: Vec<serde_json::Value> = results
                .iter()
                .map(|(task, histogram)| {
                    let histogram: serde_json::Map<String, serde_json::Value> = histogram
                        .iter()
                        .map(|(result, count)| (result.to_string(), serde_json::Value::from(*count)))
                        .collect();
                    serde_json::json!({ "task": task.to_string(), "results": histogram })
                })
                .collect();
            let widths: serde_json::Map<String, serde_json::Value> = data
                .params
                .bit_width_counter
                .iter()
                .map(|(width, count)| (width.to_string(), serde_json::Value::from(*count)))
                .collect();
            let doc = serde_json::json!({
                "ident": ident,
                "version": CURRENT_VERSION,
                "params": { "bit_width_counter": widths },
                "tasks": tasks,
                "total_occurrences": data.total_occurrences(),
            });
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
    }
    Ok(())
}

/// Implements `rfbmc migrate <store_path> [ident]`.
fn cmd_migrate(
    store_path: &Path,
    config_path: Option<&Path>,
    ident: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (backend, config) = open_backend(store_path, config_path)?;
    let registry = RfmRegistry::with_builtin();

    let ids = match ident {
        Some(ident) => vec![ident.to_string()],
        None => backend.inner().ids()?,
    };

    let mut migrated = 0usize;
    for id in &ids {
        let before = backend.get_item(id)?.and_then(|item| item.version());
        RfBmcStore::load_and_normalize_with_config(&backend, &registry, id, &config)?;
        match before {
            Some(version) if version != CURRENT_VERSION => {
                println!("{id}: v{version} -> v{CURRENT_VERSION}");
                migrated += 1;
            }
            _ => println!("{id}: up to date"),
        }
    }
    println!("Migrated {migrated} of {} stores", ids.len());
    Ok(())
}

/// Implements `rfbmc import <store_path> <snapshot> --ident <ident>`.
fn cmd_import(
    store_path: &Path,
    config_path: Option<&Path>,
    snapshot: &Path,
    ident: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let (backend, config) = open_backend(store_path, config_path)?;
    let registry = RfmRegistry::with_builtin();

    let json = std::fs::read_to_string(snapshot)?;
    let item = Item::new(ident).with(v0::SNAPSHOT_ATTRIBUTE, AttributeValue::String(json));

    // Reject bad snapshots before anything is written.
    let (_, data) = codec::decode_item(&registry, &item)?;

    match backend.put_item(item, Condition::NotExists) {
        Ok(()) => {}
        Err(BackendError::ConditionFailed { .. }) => {
            return Err(format!("store '{ident}' already exists").into());
        }
        Err(e) => return Err(e.into()),
    }

    RfBmcStore::load_and_normalize_with_config(&backend, &registry, ident, &config)?;
    println!(
        "Imported {ident}: {} tasks, {} occurrences",
        data.rf_bmc_results_map.len(),
        data.total_occurrences()
    );
    Ok(())
}

/// Parses a `WIDTH=COUNT` pair.
fn parse_width(s: &str) -> Result<(u32, u64), String> {
    let (width, count) = s
        .split_once('=')
        .ok_or_else(|| format!("expected WIDTH=COUNT, got '{s}'"))?;
    let width = width
        .trim()
        .parse()
        .map_err(|e| format!("invalid width '{width}': {e}"))?;
    let count = count
        .trim()
        .parse()
        .map_err(|e| format!("invalid count '{count}': {e}"))?;
    Ok((width, count))
}
