//! # sofadb command line
//!
//! Thin wrapper over the library for poking at a store on disk: put, get and delete single
//! documents, bulk-load a JSON dump, or print the raw keys of the store or of one database.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::filter::EnvFilter;

use sofadb::codec;
use sofadb::document::path;
use sofadb::{
    BackendConfig, Engine, GetOptions, Lookup, PutCode, PutResult, RevisionId, SledBackend,
};

/// A CouchDB-style revisioned document store.
#[derive(Parser, Debug)]
#[command(name = "sofadb", version, about = "A CouchDB-style revisioned document store")]
struct Args {
    /// Path to the data directory of the store.
    #[arg(long, default_value = "default.sofadb")]
    data_dir: String,

    /// Backend page cache size in megabytes.
    #[arg(long, default_value_t = 256)]
    cache_size_mb: u64,

    /// How often dirty pages are flushed to disk, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    flush_interval_ms: u64,

    /// Log level - 'trace', 'debug', 'info', 'warn', or 'error'.
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a document revision.
    Put {
        db: String,
        id: String,
        /// Document JSON, or '-' to read it from stdin.
        content: String,
        /// Revision the new content is based on. Omit for a new document.
        #[arg(long)]
        rev: Option<String>,
        /// Keep a conflicting branch instead of refusing a stale revision.
        #[arg(long)]
        merge: bool,
    },

    /// Read a document.
    Get {
        db: String,
        id: String,
        /// Read this revision instead of the winner.
        #[arg(long)]
        rev: Option<String>,
        /// Print the revision log.
        #[arg(long)]
        log: bool,
        /// Print revision metadata.
        #[arg(long)]
        info: bool,
    },

    /// Write a tombstone revision.
    Delete {
        db: String,
        id: String,
        #[arg(long)]
        rev: String,
        #[arg(long)]
        merge: bool,
    },

    /// Bulk-load a JSON array of documents keyed by their `_id` field.
    Load { db: String, file: PathBuf },

    /// Print every raw key and value in the store.
    Dump {
        /// Only print the documents of this database.
        #[arg(long)]
        db: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    initialize_tracing(&args.log_level)?;

    let config = BackendConfig {
        data_dir: PathBuf::from(&args.data_dir),
        cache_size_mb: args.cache_size_mb,
        flush_interval_ms: args.flush_interval_ms,
        ..Default::default()
    };
    let backend = SledBackend::new(config)
        .with_context(|| format!("Failed to open store at {}", args.data_dir))?;
    let engine = Engine::new(Arc::clone(&backend) as Arc<dyn sofadb::StorageBackend>);

    match args.command {
        Command::Put {
            db,
            id,
            content,
            rev,
            merge,
        } => {
            let content = read_content(&content)?;
            let old_rev = parse_rev(rev.as_deref())?;
            let res = engine.create_or_open(&db)?.put(&id, &old_rev, &content, merge)?;
            print_put_result(res);
        }
        Command::Get {
            db,
            id,
            rev,
            log,
            info,
        } => {
            let rev = parse_rev(rev.as_deref())?;
            let options = GetOptions {
                body: true,
                rev_info: info,
                log,
            };
            let target = (!rev.is_empty()).then_some(&rev);
            match engine.create_or_open(&db)?.get(&id, target, options)? {
                Lookup::Found(doc) => {
                    if let Some(info) = doc.rev_info {
                        println!(
                            "rev: {} deleted: {} previous: {}",
                            info.rev, info.deleted, info.previous_rev
                        );
                    }
                    if let Some(log) = doc.rev_log {
                        println!("{}", String::from_utf8_lossy(&codec::encode_log(&log)?));
                    }
                    if let Some(content) = doc.content {
                        println!("{}", serde_json::to_string_pretty(&content)?);
                    }
                }
                Lookup::NotFound => println!("not found"),
                Lookup::Pruned(rev) => println!("pruned: {}", rev),
            }
        }
        Command::Delete { db, id, rev, merge } => {
            let old_rev = parse_rev(Some(&rev))?;
            let res = engine.create_or_open(&db)?.remove(&id, &old_rev, merge)?;
            print_put_result(res);
        }
        Command::Load { db, file } => {
            let raw = std::fs::read(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let (stored, skipped) = load_documents(&engine, &db, &codec::parse(&raw)?)?;
            info!("Loaded {} documents into {} ({} skipped)", stored, db, skipped);
            println!("{} stored, {} skipped", stored, skipped);
        }
        Command::Dump { db } => {
            let count = dump_records(&backend, db.as_deref(), |line| println!("{}", line))?;
            info!("Dumped {} records", count);
        }
    }

    engine.shutdown()?;
    Ok(())
}

/// Initialize the tracing/logging system with the specified log level.
fn initialize_tracing(log_level: &str) -> anyhow::Result<()> {
    let env_filter = match log_level {
        "trace" => EnvFilter::new("trace"),
        "debug" => EnvFilter::new("debug"),
        "info" => EnvFilter::new("info"),
        "warn" => EnvFilter::new("warn"),
        "error" => EnvFilter::new("error"),
        _ => {
            eprintln!("Invalid log level: {}. Using 'info'", log_level);
            EnvFilter::new("info")
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    Ok(())
}

fn print_put_result(res: PutResult) {
    match (res.code, res.assigned_rev) {
        (PutCode::Ok, Some(rev)) => println!("{}", rev),
        _ => println!("conflict"),
    }
}

fn parse_rev(rev: Option<&str>) -> anyhow::Result<RevisionId> {
    Ok(RevisionId::parse(rev.unwrap_or(""))?)
}

/// Parses document JSON from the argument, or from stdin for '-'.
fn read_content(arg: &str) -> anyhow::Result<Value> {
    if arg == "-" {
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .context("Failed to read stdin")?;
        return Ok(codec::parse(&buf)?);
    }
    Ok(codec::parse(arg.as_bytes())?)
}

/// Stores every document of a JSON array under its `_id`. Returns (stored, skipped).
fn load_documents(engine: &Engine, db_name: &str, dump: &Value) -> anyhow::Result<(usize, usize)> {
    let Value::Array(docs) = dump else {
        bail!("Expected a JSON array of documents");
    };

    let db = engine.create_or_open(db_name)?;
    let (mut stored, mut skipped) = (0, 0);

    for doc in docs {
        let (content, reserved) = codec::split_reserved(doc);
        let Some(id) = reserved.get("_id").and_then(Value::as_str) else {
            warn!("Skipping document without a string _id");
            skipped += 1;
            continue;
        };
        let old_rev = parse_rev(reserved.get("_rev").and_then(Value::as_str))?;

        if db.put(id, &old_rev, &content, false)?.is_ok() {
            stored += 1;
        } else {
            warn!("Skipping {}: update conflict", id);
            skipped += 1;
        }
    }

    Ok((stored, skipped))
}

/// Emits one `key : value` line per raw record, of the whole store or of one database.
fn dump_records(
    backend: &SledBackend,
    db_name: Option<&str>,
    mut emit: impl FnMut(String),
) -> anyhow::Result<usize> {
    let Some(db_name) = db_name else {
        return Ok(backend.iter_all(|key, value| {
            emit(format!("{} : {}", printable(key), printable(value)))
        })?);
    };

    let records = backend.scan_prefix(path::database_prefix(db_name).as_bytes(), 0)?;
    for (key, value) in &records {
        emit(format!("{} : {}", printable(key), printable(value)));
    }
    Ok(records.len())
}

/// Renders raw bytes with newlines and non-printable bytes escaped.
fn printable(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        match b {
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            0x20..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\{:02x}", b)),
        }
    }
    out
}
