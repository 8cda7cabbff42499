//! Ingestion coordinator (C7): drives one batch-descriptor row through
//! splitter → storage → catalog in order, with overwrite semantics and a
//! `Pending → Validating → Uploading → Cataloged`/`Failed` state machine
//! (§4.7).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, info, warn};
use serde_json::json;

use crate::catalog::model::{NewDataset, NewFileGlobal, NewFramesGlobal, NewFrameRow};
use crate::catalog::Catalog;
use crate::codec;
use crate::config::{Config, UploadType};
use crate::error::IngestError;
use crate::serial::parse_serial;
use crate::splitter::{self, SplitterOptions};
use crate::storage::StorageBackend;

/// One row of the batch descriptor (§6 "Batch descriptor (CSV) for
/// ingestion").
#[derive(Clone, Debug)]
pub struct BatchRow {
    pub dataset_id: String,
    pub file_name: PathBuf,
    pub description: Option<String>,
    pub parent_dataset_id: Option<String>,
    pub positions: Option<PositionsSpec>,
    pub schema_filename: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub enum PositionsSpec {
    All,
    List(Vec<i64>),
}

/// Per-dataset lifecycle (§4.7). `Failed` carries the error kind's display
/// text, not the error itself, so outcomes are cheap to collect and log.
#[derive(Clone, Debug)]
pub enum RowState {
    Pending,
    Validating,
    Uploading,
    Cataloged,
    Failed(String),
}

#[derive(Clone, Debug)]
pub struct RowOutcome {
    pub dataset_id: String,
    pub state: RowState,
}

impl RowOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.state, RowState::Cataloged)
    }
}

pub struct Coordinator {
    catalog: Catalog,
    storage: Arc<StorageBackend>,
    config: Config,
    cancel: Arc<AtomicBool>,
}

impl Coordinator {
    pub fn new(catalog: Catalog, storage: Arc<StorageBackend>, config: Config, cancel: Arc<AtomicBool>) -> Self {
        Self { catalog, storage, config, cancel }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Ingests every row in order; datasets are never processed in
    /// parallel (§5) because catalog assertions must be observed in row
    /// order. Stops early (remaining rows left `Pending`) if cancellation
    /// is observed at a between-row boundary.
    pub fn ingest_batch(&mut self, rows: Vec<BatchRow>) -> Vec<RowOutcome> {
        let mut outcomes = Vec::with_capacity(rows.len());
        for row in rows {
            if self.is_cancelled() {
                warn!("ingestion cancelled before row `{}`; leaving it unprocessed", row.dataset_id);
                outcomes.push(RowOutcome { dataset_id: row.dataset_id, state: RowState::Pending });
                continue;
            }
            let outcome = self.ingest_row(row);
            match &outcome.state {
                RowState::Cataloged => info!("dataset `{}` cataloged", outcome.dataset_id),
                RowState::Failed(reason) => error!("dataset `{}` failed: {reason}", outcome.dataset_id),
                _ => {}
            }
            outcomes.push(outcome);
        }
        outcomes
    }

    fn ingest_row(&mut self, row: BatchRow) -> RowOutcome {
        match self.ingest_row_inner(&row) {
            Ok(()) => RowOutcome { dataset_id: row.dataset_id, state: RowState::Cataloged },
            Err(err) => RowOutcome { dataset_id: row.dataset_id, state: RowState::Failed(err.to_string()) },
        }
    }

    fn ingest_row_inner(&mut self, row: &BatchRow) -> Result<(), IngestError> {
        // Validating: dataset_id must match §3.1.
        let _parsed = parse_serial(&row.dataset_id)?;

        if !self.config.overwrite {
            let session = self.catalog.session_scope()?;
            session.assert_unique_id(&row.dataset_id)?;
            session.commit()?;
        }

        match self.config.upload_type {
            UploadType::Frames => self.ingest_frames_row(row),
            UploadType::File => self.ingest_file_row(row),
        }
    }

    fn ingest_frames_row(&mut self, row: &BatchRow) -> Result<(), IngestError> {
        let frames_format = self
            .config
            .frames_format
            .as_deref()
            .ok_or_else(|| IngestError::Other(anyhow::anyhow!("frames_format is required when upload_type=frames")))?;

        let storage_dir = format!("raw_frames/{}", row.dataset_id);
        let mut splitter =
            splitter::build_splitter(frames_format, self.storage.clone(), storage_dir.clone(), self.config.overwrite, row.file_name.clone())?;

        let options = SplitterOptions {
            positions: match &row.positions {
                Some(PositionsSpec::List(list)) => Some(list.clone()),
                _ => None,
            },
            schema_filename: row.schema_filename.clone().or_else(|| self.config.schema_filename.as_ref().map(PathBuf::from)),
            filename_parser: self.config.filename_parser.clone(),
        };

        // Uploading: the splitter uploads planes as it scans.
        splitter.get_frames_and_metadata(&options)?;

        let global = splitter.global_meta()?;
        let frames_meta = splitter.frames_meta()?;

        let new_dataset = NewDataset {
            serial: row.dataset_id.clone(),
            date_time: serial_date_time(&row.dataset_id)?,
            microscope: self.config.microscope.clone(),
            description: row.description.clone(),
            parent_serial: row.parent_dataset_id.clone(),
        };
        let new_global = NewFramesGlobal {
            storage_dir: global.storage_dir.clone(),
            nbr_frames: global.nbr_frames,
            im_width: global.im_width,
            im_height: global.im_height,
            im_colors: global.im_colors,
            bit_depth: global.bit_depth.as_str().to_string(),
            nbr_slices: global.nbr_slices,
            nbr_channels: global.nbr_channels,
            nbr_timepoints: global.nbr_timepoints,
            nbr_positions: global.nbr_positions,
            metadata_json: splitter.global_json()?.to_string(),
        };
        let frames_json = splitter.frames_json()?;
        let new_rows: Vec<NewFrameRow> = frames_meta
            .iter()
            .zip(frames_json.iter())
            .map(|(row, json)| NewFrameRow {
                channel_idx: row.channel_idx,
                slice_idx: row.slice_idx,
                time_idx: row.time_idx,
                pos_idx: row.pos_idx,
                channel_name: row.channel_name.clone(),
                file_name: row.file_name.clone(),
                sha256: row.sha256.clone(),
                metadata_json: json.to_string(),
            })
            .collect();

        // Cataloged: all planes are durable before this transaction opens.
        let session = self.catalog.session_scope()?;
        session.insert_frames(&new_dataset, &new_global, &new_rows, self.config.overwrite)?;
        session.commit()?;
        Ok(())
    }

    fn ingest_file_row(&mut self, row: &BatchRow) -> Result<(), IngestError> {
        if !row.file_name.is_file() {
            return Err(IngestError::Other(anyhow::anyhow!("source file {} does not exist", row.file_name.display())));
        }
        let bytes = std::fs::read(&row.file_name)
            .map_err(|e| IngestError::Other(anyhow::anyhow!("failed to read {}: {e}", row.file_name.display())))?;
        let sha256 = codec::sha256_hex(&bytes);

        let file_name = row
            .file_name
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| IngestError::Other(anyhow::anyhow!("source path has no file name")))?
            .to_string();
        let storage_dir = format!("raw_files/{}", row.dataset_id);
        let key = format!("{storage_dir}/{file_name}");

        if !self.config.overwrite {
            self.storage.assert_unique(&storage_dir)?;
        }
        self.storage.put_file(&key, &row.file_name)?;

        let new_dataset = NewDataset {
            serial: row.dataset_id.clone(),
            date_time: serial_date_time(&row.dataset_id)?,
            microscope: self.config.microscope.clone(),
            description: row.description.clone(),
            parent_serial: row.parent_dataset_id.clone(),
        };
        let new_file = NewFileGlobal { storage_dir, file_name, sha256, metadata_json: json!({}).to_string() };

        let session = self.catalog.session_scope()?;
        session.insert_file(&new_dataset, &new_file, self.config.overwrite)?;
        session.commit()?;
        Ok(())
    }
}

fn serial_date_time(serial: &str) -> Result<String, IngestError> {
    let parsed = parse_serial(serial)?;
    let ts = parsed.timestamp;
    Ok(format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        ts.year, ts.month, ts.day, ts.hour, ts.minute, ts.second
    ))
}

