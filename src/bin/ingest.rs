//! Batch ingestion program (§6 "Exit behavior"): reads a CSV batch
//! descriptor and a config file, ingests each row, and exits non-zero with
//! one stderr line per failed row if anything failed.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use serde::Deserialize;

use imaging_catalog::catalog::Catalog;
use imaging_catalog::config::{self, CliOverrides};
use imaging_catalog::coordinator::{BatchRow, Coordinator, PositionsSpec};
use imaging_catalog::storage::{self, StorageBackend};

#[derive(Parser, Debug)]
#[command(name = "ingest", about = "Ingest a batch of imaging datasets")]
struct Args {
    /// Path to the batch descriptor CSV (§6).
    #[arg(long, env = "INGEST_BATCH_FILE")]
    batch_file: PathBuf,

    /// Path to the config file (TOML or JSON, §1a/§6).
    #[arg(long, env = "INGEST_CONFIG_FILE")]
    config_file: PathBuf,

    /// Path to the credentials JSON file (§6).
    #[arg(long, env = "INGEST_CREDENTIALS_FILE")]
    credentials_file: PathBuf,

    /// Overwrite existing datasets/storage objects instead of failing on
    /// conflict.
    #[arg(long)]
    overwrite: bool,
}

#[derive(Debug, Deserialize)]
struct BatchRowCsv {
    dataset_id: String,
    file_name: PathBuf,
    description: Option<String>,
    parent_dataset_id: Option<String>,
    positions: Option<String>,
    schema_filename: Option<PathBuf>,
}

fn parse_positions(raw: Option<String>) -> Option<PositionsSpec> {
    let raw = raw?;
    if raw.trim() == "all" {
        return Some(PositionsSpec::All);
    }
    serde_json::from_str::<Vec<i64>>(&raw).ok().map(PositionsSpec::List)
}

fn read_batch(path: &PathBuf) -> anyhow::Result<Vec<BatchRow>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        let row: BatchRowCsv = record?;
        rows.push(BatchRow {
            dataset_id: row.dataset_id,
            file_name: row.file_name,
            description: row.description,
            parent_dataset_id: row.parent_dataset_id,
            positions: parse_positions(row.positions),
            schema_filename: row.schema_filename,
        });
    }
    Ok(rows)
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let file_config = config::load_file_config(&args.config_file)?;
    let cli_overrides = CliOverrides { overwrite: Some(args.overwrite), ..Default::default() };
    let config = config::merge(file_config, cli_overrides)?;

    let credentials = config::Credentials::load(&args.credentials_file)?;
    let catalog = Catalog::open(&credentials.dbname)?;

    let worker_count = if config.worker_count == 0 { storage::default_worker_count() } else { config.worker_count };
    let storage_backend: Arc<StorageBackend> = Arc::new(match config.storage.as_str() {
        "local" => StorageBackend::new_local(
            config.storage_access.as_deref().unwrap_or("."),
            "",
            worker_count,
        )?,
        _ => StorageBackend::new_s3(config.storage_access.as_deref().unwrap_or_default(), "", worker_count)?,
    });

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            log::warn!("received interrupt, finishing in-flight work before stopping");
            cancel.store(true, Ordering::SeqCst);
        })?;
    }

    let rows = read_batch(&args.batch_file)?;
    let mut coordinator = Coordinator::new(catalog, storage_backend, config, cancel);
    let outcomes = coordinator.ingest_batch(rows);

    let mut failures = 0;
    for outcome in &outcomes {
        if !outcome.is_success() {
            failures += 1;
            eprintln!("{}: {:?}", outcome.dataset_id, outcome.state);
        }
    }
    if failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}
