//! Batch retrieval program (§4.8, §6): downloads one or more datasets with
//! optional dimension filters, exiting non-zero with one stderr line per
//! failed serial.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgAction, Parser};

use imaging_catalog::catalog::{Catalog, ChannelFilter, FrameFilters};
use imaging_catalog::config;
use imaging_catalog::retrieval::{self, RetrievalOptions};
use imaging_catalog::storage::{self, StorageBackend};

#[derive(Parser, Debug)]
#[command(name = "retrieve", about = "Retrieve imaging datasets by serial")]
struct Args {
    /// Dataset serials to retrieve.
    #[arg(required = true)]
    serials: Vec<String>,

    /// Destination directory; `<serial>/` is created fresh under it.
    #[arg(long)]
    dest: PathBuf,

    /// Path to the credentials JSON file (§6).
    #[arg(long, env = "RETRIEVE_CREDENTIALS_FILE")]
    credentials_file: PathBuf,

    #[arg(long, default_value = "s3")]
    storage: String,

    #[arg(long)]
    storage_access: Option<String>,

    /// Skip downloading plane/file bytes, keeping only the sidecar
    /// metadata.
    #[arg(long = "no-download", action = ArgAction::SetFalse, default_value_t = true)]
    download: bool,

    /// Skip emitting sidecar metadata, keeping only the downloaded bytes.
    #[arg(long = "no-metadata", action = ArgAction::SetFalse, default_value_t = true)]
    metadata: bool,

    #[arg(long, value_delimiter = ',')]
    positions: Option<Vec<i64>>,

    #[arg(long, value_delimiter = ',')]
    times: Option<Vec<i64>>,

    #[arg(long, value_delimiter = ',')]
    slices: Option<Vec<i64>>,

    #[arg(long, value_delimiter = ',')]
    channels: Option<Vec<String>>,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let credentials = config::Credentials::load(&args.credentials_file)?;
    let mut catalog = Catalog::open(&credentials.dbname)?;

    let worker_count = storage::default_worker_count();
    let storage_backend: Arc<StorageBackend> = Arc::new(match args.storage.as_str() {
        "local" => StorageBackend::new_local(args.storage_access.as_deref().unwrap_or("."), "", worker_count)?,
        _ => StorageBackend::new_s3(args.storage_access.as_deref().unwrap_or_default(), "", worker_count)?,
    });

    let channels = args.channels.map(|names| {
        if names.iter().all(|n| n.parse::<i64>().is_ok()) {
            ChannelFilter::Indices(names.iter().map(|n| n.parse().unwrap()).collect())
        } else {
            ChannelFilter::Names(names)
        }
    });

    let options = RetrievalOptions {
        download: args.download,
        metadata: args.metadata,
        filters: FrameFilters { positions: args.positions, times: args.times, channels, slices: args.slices },
    };

    let mut failures = 0;
    for serial in &args.serials {
        if let Err(err) = retrieval::retrieve(&mut catalog, &storage_backend, serial, &args.dest, &options) {
            failures += 1;
            eprintln!("{serial}: {err}");
        }
    }
    if failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}
