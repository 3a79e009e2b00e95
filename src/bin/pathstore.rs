//! pathstore command-line interface
//!
//! Inspect snapshot stores kept in a directory-backed array file.
//!
//! # Examples
//!
//! ```bash
//! # Summary of types, rows, derived values and cache settings
//! pathstore --store runs/tps info
//!
//! # Print the attributes of the snapshot in slot 5
//! pathstore --store runs/tps show 5
//!
//! # Re-read every stored pair and check its reversal
//! pathstore --store runs/tps verify
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use pathstore::storage::{DirectoryArrayFile, Slot, SnapshotStorage};
use pathstore::StoreConfig;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// pathstore - paired snapshot storage
#[derive(Parser, Debug)]
#[command(name = "pathstore")]
#[command(version = pathstore::VERSION)]
#[command(about = "Inspect paired snapshot stores", long_about = None)]
#[command(author = "Anton Feldmann <anton.feldmann@gmail.com>")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Store directory
    #[arg(long, global = true, default_value = "data/pathstore", env = "PATHSTORE_DIR")]
    store: PathBuf,

    /// Store configuration (TOML)
    #[arg(long, global = true, env = "PATHSTORE_CONFIG")]
    config: Option<PathBuf>,

    /// Write logs to daily files in this directory
    #[arg(long, global = true, env = "PATHSTORE_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn", env = "RUST_LOG")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show registered types, row counts and derived value stores
    Info,

    /// Print one stored snapshot
    Show {
        /// Slot number (odd slots are reversed states)
        slot: u64,
    },

    /// Check that every stored pair decodes and reverses consistently
    Verify,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli)?;

    let config = match &cli.config {
        Some(path) => StoreConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => StoreConfig::default(),
    };

    let file = DirectoryArrayFile::open(&cli.store)
        .with_context(|| format!("Failed to open {}", cli.store.display()))?;
    let mut storage = SnapshotStorage::open(file, config)?;

    let result = match cli.command {
        Commands::Info => info_command(&storage),
        Commands::Show { slot } => show_command(&mut storage, Slot::new(slot)),
        Commands::Verify => verify_command(&mut storage),
    };

    if let Err(e) = &result {
        error!(error = %e, "Command failed");
    }
    result
}

fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::WARN);

    let file_layer = match &cli.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, "pathstore.log");
            Some(fmt::layer().with_writer(appender).with_ansi(false))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!cli.no_color),
        )
        .with(file_layer)
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

fn info_command(storage: &SnapshotStorage<DirectoryArrayFile>) -> anyhow::Result<()> {
    let stats = storage.stats();
    let config = storage.config();

    println!("store:       {}", storage.file().path().display());
    println!("prefix:      {}", config.prefix);
    println!("stored:      {} snapshots in {} rows", storage.len(), stats.stored_pairs);
    println!("reserved:    {} rows", stats.reserved_pairs);
    println!("high water:  {}", stats.high_water);

    println!("types:");
    for (n, descriptor) in storage.descriptors().enumerate() {
        println!("  [{}] {}", n, descriptor);
        for field in descriptor.fields() {
            println!(
                "      {} {:?} {:?} ({:?})",
                field.name, field.var_type, field.dimensions, field.reversal
            );
        }
    }

    println!("derived values:");
    for cv in storage.cvs() {
        let record = cv.record();
        println!(
            "  {} {} {:?} {:?} reversible={} values={}",
            cv.prefix(),
            record.name,
            record.var_type,
            record.shape,
            record.time_reversible,
            cv.len()
        );
    }

    println!("caches:");
    println!("  objects:   capacity {}", config.object_cache_capacity);
    println!(
        "  chunks:    {} chunks of {} rows ({} rows for derived values)",
        config.chunk_cache_max_chunks, config.chunk_rows, config.cv_chunk_rows
    );
    println!("missing types: {}", config.missing_type_policy);
    Ok(())
}

fn show_command(
    storage: &mut SnapshotStorage<DirectoryArrayFile>,
    slot: Slot,
) -> anyhow::Result<()> {
    let snapshot = storage
        .load(slot)
        .with_context(|| format!("Failed to load {}", slot))?;

    println!("{} {}", slot, snapshot.id());
    println!("type: {}", snapshot.descriptor());
    for (name, value) in snapshot.attributes() {
        match (value.as_float(), value.as_int(), value.as_bool()) {
            (Some(a), _, _) => println!("{} = {}", name, a),
            (_, Some(a), _) => println!("{} = {}", name, a),
            (_, _, Some(a)) => println!("{} = {}", name, a),
            _ => println!("{} = ?", name),
        }
    }
    Ok(())
}

fn verify_command(storage: &mut SnapshotStorage<DirectoryArrayFile>) -> anyhow::Result<()> {
    let pairs = storage.verify()?;
    let stats = storage.stats();
    info!(pairs, reads = stats.codec_reads, "Verification finished");
    println!("ok: {} pairs ({} snapshots) verified", pairs, pairs * 2);
    Ok(())
}
