//! Tiff-folder splitter (C6): a directory of per-plane tiffs, filenames
//! parsed by a named C4 parser, with an optional `metadata.txt` sidecar
//! providing global fields.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Value};
use tiff::decoder::{Decoder, DecodingResult};

use crate::codec::{self, BitDepth, Plane};
use crate::error::IngestError;
use crate::parsers::{parse_idx_from_name, parse_sms_name, ChannelNameAccumulator};
use crate::storage::StorageBackend;

use super::{FrameMeta, FrameSplitter, SplitterBase, SplitterOptions};

pub struct TifFolderSplitter {
    base: SplitterBase,
    source_dir: PathBuf,
}

impl TifFolderSplitter {
    pub fn new(storage: Arc<StorageBackend>, storage_dir: String, overwrite: bool, source_dir: PathBuf) -> Result<Self, IngestError> {
        Ok(Self { base: SplitterBase::new(storage, storage_dir, overwrite)?, source_dir })
    }
}

/// `metadata.txt` sidecar fields (§4.6): `Width, Height, BitDepth,
/// PixelType`, one `key=value` pair per line.
#[derive(Debug, Default)]
struct SidecarMeta {
    width: Option<u32>,
    height: Option<u32>,
    bit_depth: Option<BitDepth>,
}

fn read_sidecar(dir: &Path) -> Result<Option<SidecarMeta>, IngestError> {
    let path = dir.join("metadata.txt");
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&path)
        .map_err(|e| IngestError::Other(anyhow::anyhow!("failed to read {}: {e}", path.display())))?;
    let fields: HashMap<String, String> =
        text.lines().filter_map(|line| line.split_once('=')).map(|(k, v)| (k.trim().to_string(), v.trim().to_string())).collect();
    Ok(Some(SidecarMeta {
        width: fields.get("Width").and_then(|v| v.parse().ok()),
        height: fields.get("Height").and_then(|v| v.parse().ok()),
        bit_depth: fields.get("BitDepth").and_then(|v| match v.as_str() {
            "8" => Some(BitDepth::Uint8),
            "16" => Some(BitDepth::Uint16),
            _ => None,
        }),
    }))
}

fn decode_single_page(path: &Path) -> Result<(u32, u32, u8, BitDepth, Vec<u8>), IngestError> {
    let file = File::open(path).map_err(|e| IngestError::Other(anyhow::anyhow!("failed to open {}: {e}", path.display())))?;
    let mut decoder = Decoder::new(file).map_err(|e| IngestError::Other(anyhow::anyhow!("failed to decode {}: {e}", path.display())))?;
    let (width, height) = decoder
        .dimensions()
        .map_err(|e| IngestError::Other(anyhow::anyhow!("failed to read dimensions of {}: {e}", path.display())))?;
    let color_type = decoder
        .colortype()
        .map_err(|e| IngestError::Other(anyhow::anyhow!("failed to read color type of {}: {e}", path.display())))?;
    let (colors, bit_depth) = match color_type {
        tiff::ColorType::Gray(8) => (1u8, BitDepth::Uint8),
        tiff::ColorType::Gray(16) => (1u8, BitDepth::Uint16),
        tiff::ColorType::RGB(8) => (3u8, BitDepth::Uint8),
        tiff::ColorType::RGB(16) => (3u8, BitDepth::Uint16),
        other => return Err(IngestError::UnsupportedBitDepth(format!("{other:?}"))),
    };
    let image = decoder
        .read_image()
        .map_err(|e| IngestError::Other(anyhow::anyhow!("failed to decode pixels of {}: {e}", path.display())))?;
    let raw = match image {
        DecodingResult::U8(data) => data,
        DecodingResult::U16(data) => data.iter().flat_map(|v| v.to_le_bytes()).collect(),
        other => return Err(IngestError::UnsupportedBitDepth(format!("{other:?}"))),
    };
    Ok((width, height, colors, bit_depth, raw))
}

enum Indices {
    Numbered(i64, i64, i64, i64),
    Named { channel_name: String, slice_idx: i64, time_idx: i64, pos_idx: i64 },
}

impl FrameSplitter for TifFolderSplitter {
    fn set_frame_info(&mut self, width: u32, height: u32, colors: u8, bit_depth: BitDepth) -> Result<(), IngestError> {
        self.base.set_frame_info(width, height, colors, bit_depth)
    }

    fn get_frames_and_metadata(&mut self, options: &SplitterOptions) -> Result<(), IngestError> {
        let use_sms_parser = options.filename_parser.as_deref() != Some("parse_idx_from_name");

        let mut entries: Vec<PathBuf> = std::fs::read_dir(&self.source_dir)
            .map_err(|e| IngestError::Other(anyhow::anyhow!("failed to list {}: {e}", self.source_dir.display())))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().map(|ext| ext == "tif" || ext == "tiff").unwrap_or(false))
            .collect();
        entries.sort();
        if entries.is_empty() {
            return Err(IngestError::ParseError {
                name: self.source_dir.display().to_string(),
                reason: "no .tif files found".to_string(),
            });
        }

        let mut parsed = Vec::with_capacity(entries.len());
        let mut channel_accumulator = ChannelNameAccumulator::new();
        for path in &entries {
            let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            if use_sms_parser {
                let frame = parse_sms_name(file_name)?;
                channel_accumulator.observe(&frame.channel_name);
                parsed.push(Indices::Named {
                    channel_name: frame.channel_name,
                    slice_idx: frame.slice_idx,
                    time_idx: frame.time_idx,
                    pos_idx: frame.pos_idx,
                });
            } else {
                let frame = parse_idx_from_name(file_name)?;
                parsed.push(Indices::Numbered(frame.channel_idx, frame.slice_idx, frame.time_idx, frame.pos_idx));
            }
        }
        let numbering = channel_accumulator.finalize();

        let sidecar = read_sidecar(&self.source_dir)?;

        let mut frames_meta = Vec::with_capacity(entries.len());
        let mut upload_items = Vec::with_capacity(entries.len());
        let mut dims_fixed = false;

        for (path, indices) in entries.iter().zip(parsed.into_iter()) {
            let (mut width, mut height, colors, mut bit_depth, raw) = decode_single_page(path)?;
            if let Some(sidecar) = &sidecar {
                width = sidecar.width.unwrap_or(width);
                height = sidecar.height.unwrap_or(height);
                bit_depth = sidecar.bit_depth.unwrap_or(bit_depth);
            }
            if !dims_fixed {
                self.set_frame_info(width, height, colors, bit_depth)?;
                dims_fixed = true;
            }
            let plane = Plane::new(width, height, colors, bit_depth, raw)?;

            let (channel_idx, slice_idx, time_idx, pos_idx) = match indices {
                Indices::Numbered(c, z, t, p) => (c, z, t, p),
                Indices::Named { channel_name, slice_idx, time_idx, pos_idx } => {
                    (numbering.index_of(&channel_name), slice_idx, time_idx, pos_idx)
                }
            };
            let channel_name = numbering
                .names()
                .get(channel_idx as usize)
                .cloned()
                .unwrap_or_else(|| channel_idx.to_string());

            let sha256 = plane.sha256_hex();
            let file_name = self.base.frame_name(channel_idx, slice_idx, time_idx, pos_idx);
            let encoded = codec::encode_png(&plane)?;
            upload_items.push((format!("{}/{}", self.base.storage_dir, file_name), encoded));
            frames_meta.push(FrameMeta { channel_idx, slice_idx, time_idx, pos_idx, channel_name, file_name, sha256 });
        }

        self.base.storage.upload_planes(upload_items)?;
        self.base.set_frames_json(frames_meta.iter().map(|_| json!({})).collect());
        self.base.set_global_meta(frames_meta, json!({ "has_sidecar": sidecar.is_some() }))?;
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
