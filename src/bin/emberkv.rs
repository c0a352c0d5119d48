//! emberkv command-line tool
//!
//! Inspects and edits a data directory. Keys live in a named hash map.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use emberkv::store::WAL_FILE;
use emberkv::wal::WalRecovery;
use emberkv::{Config, Db, Location};
use tracing_subscriber::{fmt, EnvFilter};

/// emberkv CLI
#[derive(Parser, Debug)]
#[command(name = "emberkv")]
#[command(about = "Embeddable paged key-value store")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./emberkv_data")]
    data_dir: PathBuf,

    /// Map the key commands operate on
    #[arg(short, long, default_value = "default")]
    map: String,

    /// Segments for newly created maps (power of two)
    #[arg(short, long, default_value_t = emberkv::config::DEFAULT_CONCURRENCY_LEVEL)]
    concurrency: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print store statistics and the named maps
    Stats,

    /// Set a key-value pair and commit
    Put {
        key: String,
        value: String,
    },

    /// Get a value by key
    Get {
        key: String,
    },

    /// Delete a key and commit
    Delete {
        key: String,
    },

    /// Rewrite the data file without free space
    Compact,

    /// Check the WAL without modifying it
    VerifyWal,
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,emberkv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> emberkv::Result<()> {
    if let Commands::VerifyWal = args.command {
        let path = args.data_dir.join(WAL_FILE);
        if !path.exists() {
            println!("no WAL at {}", path.display());
            return Ok(());
        }
        let result = WalRecovery::verify(&path)?;
        println!("entries:      {}", result.entries_recovered);
        println!("corrupted:    {}", result.entries_corrupted);
        println!("last lsn:     {}", result.last_lsn);
        println!("committed:    {}", result.transactions_committed);
        println!("discarded:    {}", result.transactions_discarded);
        return Ok(());
    }

    let config = Config::builder()
        .concurrency_level(args.concurrency)
        .build();
    let db = Db::open(Location::directory(&args.data_dir), config)?;

    match &args.command {
        Commands::Stats => {
            let stats = db.stats().store;
            println!("records:      {}", stats.records);
            println!("max recid:    {}", stats.max_recid);
            println!("volume bytes: {}", stats.volume_bytes);
            println!("tail:         {}", stats.tail);
            println!("free bytes:   {} ({} entries)", stats.free_bytes, stats.free_entries);
            println!("wal bytes:    {}", stats.wal_bytes);
            for (name, kind) in db.maps()? {
                println!("map:          {} ({:?})", name, kind);
            }
        }
        Commands::Put { key, value } => {
            let map = db.hash_map(&args.map)?;
            map.insert(key.as_bytes(), value.as_bytes())?;
            db.commit()?;
        }
        Commands::Get { key } => {
            let map = db.hash_map(&args.map)?;
            match map.get(key.as_bytes())? {
                Some(value) => println!("{}", String::from_utf8_lossy(&value)),
                None => println!("(nil)"),
            }
        }
        Commands::Delete { key } => {
            let map = db.hash_map(&args.map)?;
            let removed = map.remove(key.as_bytes())?.is_some();
            db.commit()?;
            println!("{}", if removed { "deleted" } else { "(nil)" });
        }
        Commands::Compact => {
            db.compact()?;
            let stats = db.stats().store;
            println!("tail:         {}", stats.tail);
        }
        Commands::VerifyWal => {}
    }

    db.close()
}
