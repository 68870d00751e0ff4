//! hashdbm Tool
//!
//! Command-line access to a hashdbm database file.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use hashdbm::{
    Config, Database, DbmError, DumpConfig, DumpFormat, OpenMode, RecoveryConfig, SyncStrategy,
};
use tracing_subscriber::{fmt, EnvFilter};

/// hashdbm database tool
#[derive(Parser, Debug)]
#[command(name = "hashdbm")]
#[command(about = "Inspect and modify hashdbm database files")]
#[command(version)]
struct Args {
    /// Don't take the advisory file lock
    #[arg(long, global = true)]
    no_lock: bool,

    /// fsync after every modification
    #[arg(long, global = true)]
    sync_every_write: bool,

    /// Keep a snapshot pair for crash tolerance
    #[arg(long, global = true)]
    crash_tolerance: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new, empty database (overwrites an existing file)
    Create {
        file: PathBuf,

        /// Block size in bytes
        #[arg(short, long)]
        block_size: Option<u32>,

        /// Fail instead of adjusting an unusable block size
        #[arg(long)]
        exact: bool,

        /// Use the extended (numsync) format
        #[arg(long)]
        numsync: bool,
    },

    /// Print the value stored under a key
    Fetch { file: PathBuf, key: String },

    /// Store a value
    Store {
        file: PathBuf,
        key: String,
        value: String,

        /// Replace an existing value
        #[arg(short, long)]
        replace: bool,
    },

    /// Delete a key
    Delete { file: PathBuf, key: String },

    /// Print every key (and value with --values)
    List {
        file: PathBuf,

        #[arg(short, long)]
        values: bool,
    },

    /// Print the number of records
    Count { file: PathBuf },

    /// Dump all records to a file
    Dump {
        file: PathBuf,
        output: PathBuf,

        #[arg(short, long, value_enum, default_value = "ascii")]
        format: Format,

        /// Fail if the output file exists
        #[arg(long)]
        no_overwrite: bool,
    },

    /// Load records from a dump file
    Load {
        file: PathBuf,
        input: PathBuf,

        /// Replace existing values
        #[arg(short, long)]
        replace: bool,
    },

    /// Create a database from an ASCII dump (the dump names the file)
    Import { dump: PathBuf },

    /// Compact the database file
    Reorganize { file: PathBuf },

    /// Salvage a damaged database
    Recover {
        file: PathBuf,

        /// Keep a copy of the original as <file>.~N~
        #[arg(short, long)]
        backup: bool,

        #[arg(long, default_value = "0")]
        max_failed_keys: usize,

        #[arg(long, default_value = "0")]
        max_failed_buckets: usize,

        #[arg(long, default_value = "0")]
        max_failures: usize,
    },

    /// Roll a crash-tolerant database back to its last good snapshot
    Restore { file: PathBuf },

    /// Print the library version
    Version,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Format {
    Ascii,
    Binary,
}

fn main() -> ExitCode {
    // Initialize tracing/logging (stderr; stdout carries data)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hashdbm=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), DbmError> {
    let open = |file: &PathBuf, mode: OpenMode| {
        let sync_strategy = if args.sync_every_write {
            SyncStrategy::EveryWrite
        } else {
            SyncStrategy::OnSync
        };
        Database::open_with(
            Config::builder()
                .path(file)
                .mode(mode)
                .no_lock(args.no_lock)
                .sync_strategy(sync_strategy)
                .crash_tolerance(args.crash_tolerance && mode.is_writer())
                .build(),
        )
    };

    match &args.command {
        Commands::Create {
            file,
            block_size,
            exact,
            numsync,
        } => {
            let mut builder = Config::builder()
                .path(file)
                .mode(OpenMode::CreateNew)
                .no_lock(args.no_lock)
                .bs_exact(*exact)
                .numsync(*numsync)
                .crash_tolerance(args.crash_tolerance);
            if let Some(size) = block_size {
                builder = builder.block_size(*size);
            }
            let db = Database::open_with(builder.build())?;
            tracing::info!(
                "Created {} (block size {})",
                file.display(),
                db.block_size()?
            );
            db.close()
        }

        Commands::Fetch { file, key } => {
            let db = open(file, OpenMode::ReadOnly)?;
            let value = db.fetch(key.as_bytes())?;
            print_bytes(&value);
            db.close()
        }

        Commands::Store {
            file,
            key,
            value,
            replace,
        } => {
            let db = open(file, OpenMode::ReadWrite)?;
            db.store(key.as_bytes(), value.as_bytes(), *replace)?;
            db.close()
        }

        Commands::Delete { file, key } => {
            let db = open(file, OpenMode::ReadWrite)?;
            db.delete(key.as_bytes())?;
            db.close()
        }

        Commands::List { file, values } => {
            let db = open(file, OpenMode::ReadOnly)?;
            for key in db.keys() {
                let key = key?;
                if *values {
                    let value = db.fetch(&key)?;
                    println!(
                        "{}\t{}",
                        String::from_utf8_lossy(&key),
                        String::from_utf8_lossy(&value)
                    );
                } else {
                    print_bytes(&key);
                }
            }
            db.close()
        }

        Commands::Count { file } => {
            let db = open(file, OpenMode::ReadOnly)?;
            println!("{}", db.count()?);
            db.close()
        }

        Commands::Dump {
            file,
            output,
            format,
            no_overwrite,
        } => {
            let db = open(file, OpenMode::ReadOnly)?;
            let config = DumpConfig {
                format: match format {
                    Format::Ascii => DumpFormat::Ascii,
                    Format::Binary => DumpFormat::Binary,
                },
                overwrite: !no_overwrite,
                ..DumpConfig::ascii(output)
            };
            let count = db.dump(&config)?;
            tracing::info!("{} records dumped", count);
            db.close()
        }

        Commands::Load {
            file,
            input,
            replace,
        } => {
            let db = open(file, OpenMode::ReadWriteCreate)?;
            let count = db.load(input, *replace)?;
            tracing::info!("{} records loaded", count);
            db.close()
        }

        Commands::Import { dump } => {
            let db = open(dump, OpenMode::LoadFromDump)?;
            tracing::info!("Imported {}", db.file_name()?.display());
            db.close()
        }

        Commands::Reorganize { file } => {
            let db = open(file, OpenMode::ReadWrite)?;
            db.reorganize()?;
            db.close()
        }

        Commands::Recover {
            file,
            backup,
            max_failed_keys,
            max_failed_buckets,
            max_failures,
        } => {
            let db = open(file, OpenMode::ReadWrite)?;
            let stats = db.recover(&RecoveryConfig {
                backup: *backup,
                force: true,
                max_failed_keys: *max_failed_keys,
                max_failed_buckets: *max_failed_buckets,
                max_failures: *max_failures,
            })?;
            println!("recovered keys:    {}", stats.recovered_keys);
            println!("recovered buckets: {}", stats.recovered_buckets);
            println!("failed keys:       {}", stats.failed_keys);
            println!("failed buckets:    {}", stats.failed_buckets);
            println!("duplicate keys:    {}", stats.duplicate_keys);
            if let Some(backup) = stats.backup_name {
                println!("backup:            {}", backup.display());
            }
            db.close()
        }

        Commands::Restore { file } => {
            let numsync = hashdbm::restore(file)?;
            tracing::info!("Rolled {} back to commit {}", file.display(), numsync);
            Ok(())
        }

        Commands::Version => {
            println!("{}", hashdbm::version_string());
            Ok(())
        }
    }
}

fn print_bytes(data: &[u8]) {
    let mut out = io::stdout().lock();
    // A closed pipe is not worth an error
    let _ = out.write_all(data).and_then(|_| out.write_all(b"\n"));
}
