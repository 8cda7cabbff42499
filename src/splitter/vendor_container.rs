//! Vendor-container splitter (C6, `frames_format = "lif"`): reads a
//! proprietary microscope container through an adapter trait that presents
//! it as an indexed series, the way
//! `original_source/imaging_db/images/lif_splitter.py`'s `LifSplitter`
//! treats a Bio-Formats/PIMS reader — each series is one plane, channel and
//! slice are always 0, and position is the series index.
//!
//! No registry crate speaks Leica's `.lif` container format directly (the
//! original relies on a JVM bridge to Bio-Formats, which has no Rust
//! equivalent); [`TiffSeriesAdapter`] targets any multi-page container the
//! `tiff` crate can open, treating each page as one series, so that a real
//! vendor SDK binding could later implement the same [`VendorContainerAdapter`]
//! trait without the rest of this module changing.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};
use tiff::decoder::{Decoder, DecodingResult};

use crate::codec::{self, BitDepth, Plane};
use crate::error::IngestError;
use crate::storage::StorageBackend;

use super::{FrameMeta, FrameSplitter, SplitterBase, SplitterOptions};

/// One decoded series from a vendor container, plus whatever per-series
/// metadata the adapter can enumerate.
pub struct SeriesFrame {
    pub width: u32,
    pub height: u32,
    pub colors: u8,
    pub bit_depth: BitDepth,
    pub data: Vec<u8>,
    pub metadata: Value,
}

/// Presents a vendor container as an indexed series, decoupling the
/// splitter from any one vendor SDK (§4.6).
pub trait VendorContainerAdapter {
    fn series_count(&mut self) -> Result<usize, IngestError>;
    fn read_series(&mut self, index: usize) -> Result<SeriesFrame, IngestError>;
}

/// Adapter backed by the `tiff` crate: treats every page of a multi-page
/// TIFF as one series. Stands in for a Bio-Formats binding until one
/// exists as a maintained Rust crate (see module docs).
pub struct TiffSeriesAdapter {
    decoder: Decoder<File>,
    count: Option<usize>,
}

impl TiffSeriesAdapter {
    pub fn open(path: &PathBuf) -> Result<Self, IngestError> {
        let file = File::open(path).map_err(|e| IngestError::Other(anyhow::anyhow!("failed to open {}: {e}", path.display())))?;
        let decoder = Decoder::new(file).map_err(|e| IngestError::Other(anyhow::anyhow!("failed to decode {}: {e}", path.display())))?;
        Ok(Self { decoder, count: None })
    }
}

impl VendorContainerAdapter for TiffSeriesAdapter {
    fn series_count(&mut self) -> Result<usize, IngestError> {
        if let Some(count) = self.count {
            return Ok(count);
        }
        let mut count = 1;
        while self.decoder.more_images() {
            self.decoder
                .next_image()
                .map_err(|e| IngestError::Other(anyhow::anyhow!("failed to scan container: {e}")))?;
            count += 1;
        }
        self.count = Some(count);
        Ok(count)
    }

    fn read_series(&mut self, index: usize) -> Result<SeriesFrame, IngestError> {
        self.decoder
            .seek_to_image(index)
            .map_err(|e| IngestError::Other(anyhow::anyhow!("failed to seek to series {index}: {e}")))?;
        let (width, height) =
            self.decoder.dimensions().map_err(|e| IngestError::Other(anyhow::anyhow!("failed to read dimensions: {e}")))?;
        let color_type =
            self.decoder.colortype().map_err(|e| IngestError::Other(anyhow::anyhow!("failed to read color type: {e}")))?;
        let (colors, bit_depth) = match color_type {
            tiff::ColorType::Gray(8) => (1u8, BitDepth::Uint8),
            tiff::ColorType::Gray(16) => (1u8, BitDepth::Uint16),
            tiff::ColorType::RGB(8) => (3u8, BitDepth::Uint8),
            tiff::ColorType::RGB(16) => (3u8, BitDepth::Uint16),
            other => return Err(IngestError::UnsupportedBitDepth(format!("{other:?}"))),
        };
        let image = self.decoder.read_image().map_err(|e| IngestError::Other(anyhow::anyhow!("failed to decode series {index}: {e}")))?;
        let data = match image {
            DecodingResult::U8(data) => data,
            DecodingResult::U16(data) => data.iter().flat_map(|v| v.to_le_bytes()).collect(),
            other => return Err(IngestError::UnsupportedBitDepth(format!("{other:?}"))),
        };
        Ok(SeriesFrame { width, height, colors, bit_depth, data, metadata: json!({ "series_index": index }) })
    }
}

pub struct VendorContainerSplitter {
    base: SplitterBase,
    source_path: PathBuf,
}

impl VendorContainerSplitter {
    pub fn new(storage: Arc<StorageBackend>, storage_dir: String, overwrite: bool, source_path: PathBuf) -> Result<Self, IngestError> {
        Ok(Self { base: SplitterBase::new(storage, storage_dir, overwrite)?, source_path })
    }
}

impl FrameSplitter for VendorContainerSplitter {
    fn set_frame_info(&mut self, width: u32, height: u32, colors: u8, bit_depth: BitDepth) -> Result<(), IngestError> {
        self.base.set_frame_info(width, height, colors, bit_depth)
    }

    fn get_frames_and_metadata(&mut self, _options: &SplitterOptions) -> Result<(), IngestError> {
        if !self.source_path.is_file() {
            return Err(IngestError::ParseError {
                name: self.source_path.display().to_string(),
                reason: "vendor container source must be a single file".to_string(),
            });
        }
        let mut adapter = TiffSeriesAdapter::open(&self.source_path)?;
        let series_count = adapter.series_count()?;

        let mut frames_meta = Vec::with_capacity(series_count);
        let mut frames_json = Vec::with_capacity(series_count);
        let mut upload_items = Vec::with_capacity(series_count);
        let mut dims_fixed = false;

        for series_idx in 0..series_count {
            let series = adapter.read_series(series_idx)?;
            if !dims_fixed {
                self.set_frame_info(series.width, series.height, series.colors, series.bit_depth)?;
                dims_fixed = true;
            }
            let plane = Plane::new(series.width, series.height, series.colors, series.bit_depth, series.data)?;
            let sha256 = plane.sha256_hex();

            // Matches LifSplitter's reading convention: channel and slice
            // are unknown from the adapter, time is always 0, and position
            // is the series index.
            let channel_idx = 0;
            let slice_idx = 0;
            let time_idx = 0;
            let pos_idx = series_idx as i64;

            let file_name = self.base.frame_name(channel_idx, slice_idx, time_idx, pos_idx);
            let encoded = codec::encode_png(&plane)?;
            upload_items.push((format!("{}/{}", self.base.storage_dir, file_name), encoded));
            frames_meta.push(FrameMeta {
                channel_idx,
                slice_idx,
                time_idx,
                pos_idx,
                channel_name: channel_idx.to_string(),
                file_name,
                sha256,
            });
            frames_json.push(series.metadata);
        }

        self.base.storage.upload_planes(upload_items)?;
        self.base.set_frames_json(frames_json);
        self.base.set_global_meta(frames_meta, json!({ "file_origin": self.source_path.display().to_string() }))?;
        Ok(())
    }

    fn frames_meta(&self) -> Result<&[FrameMeta], IngestError> {
        self.base.frames_meta()
    }

    fn frames_json(&self) -> Result<&[Value], IngestError> {
        self.base.frames_json()
    }

    fn global_meta(&self) -> Result<&super::GlobalMeta, IngestError> {
        self.base.global_meta()
    }

    fn global_json(&self) -> Result<&Value, IngestError> {
        self.base.global_json()
    }
}
