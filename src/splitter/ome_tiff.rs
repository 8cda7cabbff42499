//! Ome-tiff splitter (C6): one multi-page container per position; each
//! page carries a `MicroManagerMetadata` tag whose JSON gives
//! `(ChannelIndex, Slice, FrameIndex, Channel, PositionIndex)`. The first
//! page's `IJMetadata` tag gives an `InitialPositionList` used to filter
//! positions by label (§4.6), grounded in
//! `original_source/imaging_db/images/slide_explorer_splitter.py`'s
//! `_validate_file_paths`.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};
use tiff::decoder::{Decoder, DecodingResult};
use tiff::tags::Tag;

use crate::codec::{self, BitDepth, Plane};
use crate::error::IngestError;
use crate::storage::StorageBackend;

use super::{load_schema, filter_by_schema, FrameMeta, FrameSplitter, SplitterBase, SplitterOptions};

/// Private TIFF tag MicroManager writes per-page JSON metadata under.
const MICRO_MANAGER_METADATA_TAG: Tag = Tag::Unknown(51123);
/// Private TIFF tag ImageJ/MicroManager writes whole-file JSON metadata
/// under (first page only); this is where `InitialPositionList` lives.
const IJ_METADATA_TAG: Tag = Tag::Unknown(50839);

pub struct OmeTiffSplitter {
    base: SplitterBase,
    source_path: PathBuf,
}

impl OmeTiffSplitter {
    pub fn new(storage: Arc<StorageBackend>, storage_dir: String, overwrite: bool, source_path: PathBuf) -> Result<Self, IngestError> {
        Ok(Self { base: SplitterBase::new(storage, storage_dir, overwrite)?, source_path })
    }

    fn candidate_files(&self) -> Result<Vec<PathBuf>, IngestError> {
        if self.source_path.is_file() {
            return Ok(vec![self.source_path.clone()]);
        }
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.source_path)
            .map_err(|e| IngestError::Other(anyhow::anyhow!("failed to list {}: {e}", self.source_path.display())))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.to_string_lossy().ends_with(".ome.tif"))
            .collect();
        files.sort();
        if files.is_empty() {
            return Err(IngestError::ParseError {
                name: self.source_path.display().to_string(),
                reason: "no .ome.tif files found".to_string(),
            });
        }
        Ok(files)
    }

    /// Filters `files` to those whose position label (from the first
    /// file's `InitialPositionList`) is in `positions`, or returns `files`
    /// unchanged when `positions` is `None` (= all).
    fn filter_by_positions(
        files: Vec<PathBuf>,
        initial_position_list: Option<&Value>,
        positions: Option<&[i64]>,
    ) -> Result<Vec<PathBuf>, IngestError> {
        let Some(positions) = positions else { return Ok(files) };
        let Some(Value::Array(list)) = initial_position_list else {
            return Err(IngestError::ParseError {
                name: "IJMetadata".to_string(),
                reason: "positions filter given but no InitialPositionList is present".to_string(),
            });
        };
        let labels: Vec<String> = list
            .iter()
            .filter_map(|entry| entry.get("Label").and_then(|l| l.as_str()))
            .enumerate()
            .filter(|(idx, _)| positions.contains(&(*idx as i64)))
            .map(|(_, label)| label.to_string())
            .collect();

        let filtered: Vec<PathBuf> = files
            .into_iter()
            .filter(|path| {
                let name = path.to_string_lossy().to_string();
                labels.iter().any(|label| name.contains(label.as_str()))
            })
            .collect();
        if filtered.is_empty() {
            return Err(IngestError::ParseError {
                name: "positions".to_string(),
                reason: "no positions correspond with IJMetadata PositionList".to_string(),
            });
        }
        Ok(filtered)
    }
}

fn read_page_tags(decoder: &mut Decoder<File>) -> Result<(u32, u32, u8, BitDepth, Vec<u8>, Option<Value>), IngestError> {
    let (width, height) = decoder.dimensions().map_err(|e| IngestError::Other(anyhow::anyhow!("failed to read dimensions: {e}")))?;
    let color_type = decoder.colortype().map_err(|e| IngestError::Other(anyhow::anyhow!("failed to read color type: {e}")))?;
    let (colors, bit_depth) = match color_type {
        tiff::ColorType::Gray(8) => (1u8, BitDepth::Uint8),
        tiff::ColorType::Gray(16) => (1u8, BitDepth::Uint16),
        tiff::ColorType::RGB(8) => (3u8, BitDepth::Uint8),
        tiff::ColorType::RGB(16) => (3u8, BitDepth::Uint16),
        other => return Err(IngestError::UnsupportedBitDepth(format!("{other:?}"))),
    };
    let image = decoder.read_image().map_err(|e| IngestError::Other(anyhow::anyhow!("failed to decode page: {e}")))?;
    let raw = match image {
        DecodingResult::U8(data) => data,
        DecodingResult::U16(data) => data.iter().flat_map(|v| v.to_le_bytes()).collect(),
        other => return Err(IngestError::UnsupportedBitDepth(format!("{other:?}"))),
    };
    let mm_meta = decoder
        .get_tag_ascii_string(MICRO_MANAGER_METADATA_TAG)
        .ok()
        .and_then(|text| serde_json::from_str::<Value>(&text).ok());
    Ok((width, height, colors, bit_depth, raw, mm_meta))
}

fn read_first_page_ij_metadata(decoder: &mut Decoder<File>) -> Option<Value> {
    decoder.get_tag_ascii_string(IJ_METADATA_TAG).ok().and_then(|text| serde_json::from_str::<Value>(&text).ok())
}

fn required_i64(meta: &Value, key: &str, file_name: &str) -> Result<i64, IngestError> {
    meta.get(key).and_then(|v| v.as_i64()).ok_or_else(|| IngestError::ParseError {
        name: file_name.to_string(),
        reason: format!("MicroManagerMetadata is missing `{key}`"),
    })
}

impl FrameSplitter for OmeTiffSplitter {
    fn set_frame_info(&mut self, width: u32, height: u32, colors: u8, bit_depth: BitDepth) -> Result<(), IngestError> {
        self.base.set_frame_info(width, height, colors, bit_depth)
    }

    fn get_frames_and_metadata(&mut self, options: &SplitterOptions) -> Result<(), IngestError> {
        let schema = load_schema(options.schema_filename.as_ref())?;
        let files = self.candidate_files()?;

        let first_file = File::open(&files[0])
            .map_err(|e| IngestError::Other(anyhow::anyhow!("failed to open {}: {e}", files[0].display())))?;
        let mut first_decoder =
            Decoder::new(first_file).map_err(|e| IngestError::Other(anyhow::anyhow!("failed to decode {}: {e}", files[0].display())))?;
        let global_json = read_first_page_ij_metadata(&mut first_decoder).unwrap_or_else(|| json!({}));
        let initial_position_list = global_json.get("InitialPositionList");

        let only_single_file = files.len() == 1;
        let files = if only_single_file {
            files
        } else {
            Self::filter_by_positions(files, initial_position_list, options.positions.as_deref())?
        };

        let mut frames_meta = Vec::new();
        let mut frames_json = Vec::new();
        let mut upload_items = Vec::new();
        let mut dims_fixed = false;

        for (file_idx, path) in files.iter().enumerate() {
            let file_name = path.display().to_string();
            let file = File::open(path).map_err(|e| IngestError::Other(anyhow::anyhow!("failed to open {file_name}: {e}")))?;
            let mut decoder = Decoder::new(file).map_err(|e| IngestError::Other(anyhow::anyhow!("failed to decode {file_name}: {e}")))?;

            loop {
                let (width, height, colors, bit_depth, raw, mm_meta) = read_page_tags(&mut decoder)?;
                if !dims_fixed {
                    self.set_frame_info(width, height, colors, bit_depth)?;
                    dims_fixed = true;
                }
                let plane = Plane::new(width, height, colors, bit_depth, raw)?;
                let sha256 = plane.sha256_hex();

                let mm_meta = mm_meta.unwrap_or_else(|| json!({}));
                let channel_idx = required_i64(&mm_meta, "ChannelIndex", &file_name)?;
                let slice_idx = required_i64(&mm_meta, "Slice", &file_name)?;
                let time_idx = required_i64(&mm_meta, "FrameIndex", &file_name)?;
                let channel_name = mm_meta.get("Channel").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                let pos_idx = mm_meta.get("PositionIndex").and_then(|v| v.as_i64()).unwrap_or(file_idx as i64);

                let file_name_out = self.base.frame_name(channel_idx, slice_idx, time_idx, pos_idx);
                let encoded = codec::encode_png(&plane)?;
                upload_items.push((format!("{}/{}", self.base.storage_dir, file_name_out), encoded));
                frames_meta.push(FrameMeta { channel_idx, slice_idx, time_idx, pos_idx, channel_name, file_name: file_name_out, sha256 });

                let variable = match &schema {
                    Some(schema) => filter_by_schema(mm_meta, schema)?,
                    None => mm_meta,
                };
                frames_json.push(variable);

                if !decoder.more_images() {
                    break;
                }
                decoder
                    .next_image()
                    .map_err(|e| IngestError::Other(anyhow::anyhow!("failed to seek next page in {file_name}: {e}")))?;
            }
        }

        self.base.storage.upload_planes(upload_items)?;
        self.base.set_frames_json(frames_json);
        self.base.set_global_meta(frames_meta, global_json)?;
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
