//! Embedded-description tiff splitter (C6): a single multi-page file whose
//! first page's `ImageDescription` is an ImageJ-style `key=value` blob
//! (§4.6). Page order is channel-major then slice: slice is the fastest
//! axis, then channel, then time.

use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};
use tiff::decoder::{Decoder, DecodingResult};
use tiff::tags::Tag;

use crate::codec::{self, BitDepth, Plane};
use crate::error::IngestError;
use crate::storage::StorageBackend;

use super::{FrameMeta, FrameSplitter, SplitterBase, SplitterOptions};

pub struct TifIdSplitter {
    base: SplitterBase,
    source_path: PathBuf,
}

impl TifIdSplitter {
    pub fn new(storage: Arc<StorageBackend>, storage_dir: String, overwrite: bool, source_path: PathBuf) -> Result<Self, IngestError> {
        Ok(Self { base: SplitterBase::new(storage, storage_dir, overwrite)?, source_path })
    }
}

/// Parses the ImageJ `ImageDescription` blob (`key=value` lines) into a
/// lookup, the way `tifffile`'s `imagej_metadata` parser does.
fn parse_imagej_description(text: &str) -> HashMap<String, String> {
    text.lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

fn required_usize(fields: &HashMap<String, String>, key: &str, name: &str) -> Result<usize, IngestError> {
    fields
        .get(key)
        .ok_or_else(|| IngestError::ParseError { name: name.to_string(), reason: format!("missing `{key}` in ImageDescription") })?
        .parse()
        .map_err(|_| IngestError::ParseError { name: name.to_string(), reason: format!("`{key}` is not an integer") })
}

impl FrameSplitter for TifIdSplitter {
    fn set_frame_info(&mut self, width: u32, height: u32, colors: u8, bit_depth: BitDepth) -> Result<(), IngestError> {
        self.base.set_frame_info(width, height, colors, bit_depth)
    }

    fn get_frames_and_metadata(&mut self, _options: &SplitterOptions) -> Result<(), IngestError> {
        let name = self.source_path.display().to_string();
        let file = File::open(&self.source_path)
            .map_err(|e| IngestError::Other(anyhow::anyhow!("failed to open {name}: {e}")))?;
        let mut decoder = Decoder::new(file).map_err(|e| IngestError::Other(anyhow::anyhow!("failed to decode tiff {name}: {e}")))?;

        let description: String = decoder
            .get_tag_ascii_string(Tag::ImageDescription)
            .map_err(|e| IngestError::ParseError { name: name.clone(), reason: format!("missing ImageDescription: {e}") })?;
        let fields = parse_imagej_description(&description);
        let channels = required_usize(&fields, "channels", &name)?;
        let slices = required_usize(&fields, "slices", &name)?;
        let images = required_usize(&fields, "images", &name)?;
        if channels == 0 || slices == 0 || images % (channels * slices) != 0 {
            return Err(IngestError::ParseError {
                name,
                reason: format!("images={images} is not divisible by channels({channels}) * slices({slices})"),
            });
        }
        let mut frames_meta = Vec::with_capacity(images);
        let mut upload_items = Vec::with_capacity(images);
        let mut page_idx = 0usize;
        let mut dims: Option<(u32, u32, u8, BitDepth)> = None;

        loop {
            let (width, height, colors, bit_depth, raw) = decode_page(&mut decoder)?;
            if dims.is_none() {
                self.set_frame_info(width, height, colors, bit_depth)?;
                dims = Some((width, height, colors, bit_depth));
            }
            let plane = Plane::new(width, height, colors, bit_depth, raw)?;
            let sha256 = plane.sha256_hex();

            let slice_idx = (page_idx % slices) as i64;
            let channel_idx = ((page_idx / slices) % channels) as i64;
            let time_idx = (page_idx / (slices * channels)) as i64;

            let meta = FrameMeta {
                channel_idx,
                slice_idx,
                time_idx,
                pos_idx: 0,
                channel_name: channel_idx.to_string(),
                file_name: self.base.frame_name(channel_idx, slice_idx, time_idx, 0),
                sha256,
            };
            let encoded = codec::encode_png(&plane)?;
            upload_items.push((format!("{}/{}", self.base.storage_dir, meta.file_name), encoded));
            frames_meta.push(meta);

            page_idx += 1;
            if !decoder.more_images() {
                break;
            }
            decoder.next_image().map_err(|e| IngestError::Other(anyhow::anyhow!("failed to seek next page in {name}: {e}")))?;
        }

        if page_idx != images {
            return Err(IngestError::ParseError {
                name,
                reason: format!("ImageDescription declares {images} images but the file has {page_idx} pages"),
            });
        }

        self.base.storage.upload_planes(upload_items)?;
        self.base.set_frames_json(frames_meta.iter().map(|_| json!({})).collect());
        self.base.set_global_meta(frames_meta, json!({ "ImageDescription": description }))?;
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

/// Decodes the current page into `(width, height, colors, bit_depth,
/// row-major bytes)`.
fn decode_page(decoder: &mut Decoder<File>) -> Result<(u32, u32, u8, BitDepth, Vec<u8>), IngestError> {
    let (width, height) = decoder.dimensions().map_err(|e| IngestError::Other(anyhow::anyhow!("failed to read tiff dimensions: {e}")))?;
    let colors = decoder.colortype().map_err(|e| IngestError::Other(anyhow::anyhow!("failed to read tiff color type: {e}")))?;
    let (colors, bit_depth) = match colors {
        tiff::ColorType::Gray(8) => (1u8, BitDepth::Uint8),
        tiff::ColorType::Gray(16) => (1u8, BitDepth::Uint16),
        tiff::ColorType::RGB(8) => (3u8, BitDepth::Uint8),
        tiff::ColorType::RGB(16) => (3u8, BitDepth::Uint16),
        other => return Err(IngestError::UnsupportedBitDepth(format!("{other:?}"))),
    };
    let image = decoder.read_image().map_err(|e| IngestError::Other(anyhow::anyhow!("failed to decode tiff page: {e}")))?;
    let raw = match image {
        DecodingResult::U8(data) => data,
        DecodingResult::U16(data) => data.iter().flat_map(|v| v.to_le_bytes()).collect(),
        other => {
            return Err(IngestError::UnsupportedBitDepth(format!("{other:?}")));
        }
    };
    Ok((width, height, colors, bit_depth, raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_imagej_key_value_lines() {
        let fields = parse_imagej_description("ImageJ=1.52i\nchannels=3\nslices=2\nimages=6\n");
        assert_eq!(fields.get("channels").map(String::as_str), Some("3"));
        assert_eq!(fields.get("slices").map(String::as_str), Some("2"));
        assert_eq!(fields.get("images").map(String::as_str), Some("6"));
    }

    #[test]
    fn required_usize_rejects_missing_and_non_integer_fields() {
        let fields = parse_imagej_description("channels=abc\n");
        assert!(required_usize(&fields, "channels", "x").is_err());
        assert!(required_usize(&fields, "slices", "x").is_err());
    }

    /// Page order is slice-fastest, then channel, then time (§4.6): a
    /// 2-slice, 3-channel stack's 6th page (index 5) is channel 2, time 0.
    #[test]
    fn page_order_is_slice_then_channel_then_time() {
        let slices = 2usize;
        let channels = 3usize;
        let indices: Vec<(i64, i64, i64)> = (0..slices * channels * 2)
            .map(|page_idx| {
                let slice_idx = (page_idx % slices) as i64;
                let channel_idx = ((page_idx / slices) % channels) as i64;
                let time_idx = (page_idx / (slices * channels)) as i64;
                (slice_idx, channel_idx, time_idx)
            })
            .collect();
        assert_eq!(indices[0], (0, 0, 0));
        assert_eq!(indices[1], (1, 0, 0));
        assert_eq!(indices[2], (0, 1, 0));
        assert_eq!(indices[5], (1, 2, 0));
        assert_eq!(indices[6], (0, 0, 1));
    }
}
