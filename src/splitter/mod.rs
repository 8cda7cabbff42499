//! Splitter framework (C5): the abstract base every concrete reader in
//! [`variants`] implements, plus the `frames_format` registry that the
//! ingestion coordinator dispatches through.
//!
//! Grounded in `original_source/imaging_db/images/file_splitter.py`'s
//! `FileSplitter`: the same four in-memory products (`frames_meta`,
//! `frames_json`, `global_meta`, `global_json`), the same
//! assign-once/read-only-accessor ownership discipline, and the same
//! `set_global_meta`/`validate_global_meta`/`_get_imname` operations,
//! translated from a mutable-attribute Python base class into a Rust
//! struct whose accessors return a `Result` instead of raising
//! `AssertionError`.

pub mod ome_tiff;
pub mod tif_folder;
pub mod tif_id;
pub mod vendor_container;

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;

use crate::codec::BitDepth;
use crate::error::IngestError;
use crate::parsers::render_frame_name;
use crate::storage::StorageBackend;

/// One Frames row's worth of fixed metadata (§3.2), paired with the
/// per-plane pixel bytes by construction (every `FrameMeta` is produced
/// together with the `Plane` it describes).
#[derive(Clone, Debug)]
pub struct FrameMeta {
    pub channel_idx: i64,
    pub slice_idx: i64,
    pub time_idx: i64,
    pub pos_idx: i64,
    pub channel_name: String,
    pub file_name: String,
    pub sha256: String,
}

/// The ten required FramesGlobal fields (§3.2), assembled by
/// `set_global_meta` once every plane has been scanned.
#[derive(Clone, Debug)]
pub struct GlobalMeta {
    pub storage_dir: String,
    pub nbr_frames: i64,
    pub im_width: i64,
    pub im_height: i64,
    pub im_colors: i64,
    pub bit_depth: BitDepth,
    pub nbr_slices: i64,
    pub nbr_channels: i64,
    pub nbr_timepoints: i64,
    pub nbr_positions: i64,
}

/// Per-dataset options threaded through `get_frames_and_metadata` (§4.5,
/// §6).
#[derive(Clone, Debug, Default)]
pub struct SplitterOptions {
    /// `"all"` or an explicit list of position indices to restrict to
    /// (ome-tiff only; §4.6's `InitialPositionList` filter).
    pub positions: Option<Vec<i64>>,
    /// JSON schema file path restricting which variable metadata keys
    /// survive into `frames_json` (ome-tiff only).
    pub schema_filename: Option<PathBuf>,
    /// Name of a C4 parser to use (tiff-folder only: `"parse_sms_name"` or
    /// `"parse_idx_from_name"`).
    pub filename_parser: Option<String>,
}

/// Capability set every concrete splitter implements (§4.5).
pub trait FrameSplitter {
    /// Fixes frame shape, color count, and bit depth from one
    /// representative plane. Must be called (directly or as part of
    /// `get_frames_and_metadata`) before `set_global_meta`.
    fn set_frame_info(&mut self, width: u32, height: u32, colors: u8, bit_depth: BitDepth) -> Result<(), IngestError>;

    /// Drives the whole read: parses source metadata, uploads every plane
    /// to storage, and populates `frames_meta`/`frames_json`/
    /// `global_meta`/`global_json`.
    fn get_frames_and_metadata(&mut self, options: &SplitterOptions) -> Result<(), IngestError>;

    fn frames_meta(&self) -> Result<&[FrameMeta], IngestError>;
    fn frames_json(&self) -> Result<&[Value], IngestError>;
    fn global_meta(&self) -> Result<&GlobalMeta, IngestError>;
    fn global_json(&self) -> Result<&Value, IngestError>;
}

/// Shared state and helpers every variant embeds (composition stands in
/// for the Python base class's mutable attributes). Fields mirror
/// `FileSplitter.__init__`: assigned once, read through accessors that
/// fail instead of returning a silently-wrong default.
pub struct SplitterBase {
    pub storage: Arc<StorageBackend>,
    pub storage_dir: String,
    pub overwrite: bool,
    frame_shape: Option<(u32, u32)>,
    im_colors: Option<u8>,
    bit_depth: Option<BitDepth>,
    frames_meta: Option<Vec<FrameMeta>>,
    frames_json: Option<Vec<Value>>,
    global_meta: Option<GlobalMeta>,
    global_json: Option<Value>,
}

impl SplitterBase {
    /// Constructs the shared base, asserting storage uniqueness unless
    /// `overwrite` (§4.5 "upload discipline").
    pub fn new(storage: Arc<StorageBackend>, storage_dir: String, overwrite: bool) -> Result<Self, IngestError> {
        if !overwrite {
            storage.assert_unique(&storage_dir)?;
        }
        Ok(Self {
            storage,
            storage_dir,
            overwrite,
            frame_shape: None,
            im_colors: None,
            bit_depth: None,
            frames_meta: None,
            frames_json: None,
            global_meta: None,
            global_json: None,
        })
    }

    pub fn set_frame_info(&mut self, width: u32, height: u32, colors: u8, bit_depth: BitDepth) -> Result<(), IngestError> {
        if colors != 1 && colors != 3 {
            return Err(IngestError::ParseError {
                name: "frame_info".to_string(),
                reason: format!("im_colors must be 1 or 3, got {colors}"),
            });
        }
        self.frame_shape = Some((width, height));
        self.im_colors = Some(colors);
        self.bit_depth = Some(bit_depth);
        Ok(())
    }

    pub fn frame_shape(&self) -> Result<(u32, u32), IngestError> {
        self.frame_shape
            .ok_or_else(|| IngestError::Other(anyhow::anyhow!("frame shape has not been assigned yet")))
    }

    pub fn im_colors(&self) -> Result<u8, IngestError> {
        self.im_colors.ok_or_else(|| IngestError::Other(anyhow::anyhow!("im_colors has not been assigned yet")))
    }

    pub fn bit_depth(&self) -> Result<BitDepth, IngestError> {
        self.bit_depth.ok_or_else(|| IngestError::Other(anyhow::anyhow!("bit_depth has not been assigned yet")))
    }

    /// §3.3 invariant 6: the deterministic plane file name.
    pub fn frame_name(&self, channel_idx: i64, slice_idx: i64, time_idx: i64, pos_idx: i64) -> String {
        render_frame_name(channel_idx, slice_idx, time_idx, pos_idx, crate::codec::PLANE_EXT)
    }

    /// `set_global_meta` (§4.5 step 3): derives `nbr_slices/channels/
    /// timepoints/positions` from the already-populated `frames_meta`, then
    /// runs `validate_global_meta`.
    pub fn set_global_meta(&mut self, frames_meta: Vec<FrameMeta>, global_json: Value) -> Result<(), IngestError> {
        let (width, height) = self.frame_shape()?;
        let im_colors = self.im_colors()?;
        let bit_depth = self.bit_depth()?;

        let nbr_frames = frames_meta.len() as i64;
        let nbr_slices = unique_count(frames_meta.iter().map(|f| f.slice_idx));
        let nbr_channels = unique_count(frames_meta.iter().map(|f| f.channel_idx));
        let nbr_timepoints = unique_count(frames_meta.iter().map(|f| f.time_idx));
        let nbr_positions = unique_count(frames_meta.iter().map(|f| f.pos_idx));

        let global_meta = GlobalMeta {
            storage_dir: self.storage_dir.clone(),
            nbr_frames,
            im_width: width as i64,
            im_height: height as i64,
            im_colors: im_colors as i64,
            bit_depth,
            nbr_slices,
            nbr_channels,
            nbr_timepoints,
            nbr_positions,
        };
        validate_global_meta(&global_meta)?;

        self.frames_meta = Some(frames_meta);
        self.global_meta = Some(global_meta);
        self.global_json = Some(global_json);
        Ok(())
    }

    pub fn set_frames_json(&mut self, frames_json: Vec<Value>) {
        self.frames_json = Some(frames_json);
    }

    pub fn frames_meta(&self) -> Result<&[FrameMeta], IngestError> {
        self.frames_meta
            .as_deref()
            .ok_or_else(|| IngestError::Other(anyhow::anyhow!("frames_meta has no values yet")))
    }

    pub fn frames_json(&self) -> Result<&[Value], IngestError> {
        self.frames_json
            .as_deref()
            .ok_or_else(|| IngestError::Other(anyhow::anyhow!("frames_json has no values yet")))
    }

    pub fn global_meta(&self) -> Result<&GlobalMeta, IngestError> {
        self.global_meta.as_ref().ok_or_else(|| IngestError::Other(anyhow::anyhow!("global_meta has no values yet")))
    }

    pub fn global_json(&self) -> Result<&Value, IngestError> {
        self.global_json.as_ref().ok_or_else(|| IngestError::Other(anyhow::anyhow!("global_json has no values yet")))
    }
}

fn unique_count(values: impl Iterator<Item = i64>) -> i64 {
    let set: std::collections::HashSet<i64> = values.collect();
    set.len() as i64
}

/// Fails if any of the ten required FramesGlobal keys would be missing —
/// in practice this can only happen if `set_frame_info` was never called,
/// since every other field is derived arithmetically; kept as an explicit
/// step to mirror `file_splitter.validate_global_meta` and to give that
/// failure a named place to be raised from.
fn validate_global_meta(global_meta: &GlobalMeta) -> Result<(), IngestError> {
    if global_meta.im_width <= 0 || global_meta.im_height <= 0 {
        return Err(IngestError::Other(anyhow::anyhow!("not all required metadata keys are present")));
    }
    Ok(())
}

/// Resolves a schema validator from an optional JSON-schema file path
/// (ome-tiff's `schema_filename`, §4.6).
pub fn load_schema(schema_filename: Option<&PathBuf>) -> Result<Option<jsonschema::JSONSchema>, IngestError> {
    let Some(path) = schema_filename else { return Ok(None) };
    let text = std::fs::read_to_string(path)
        .map_err(|e| IngestError::Other(anyhow::anyhow!("failed to read schema {}: {e}", path.display())))?;
    let schema_json: Value = serde_json::from_str(&text)
        .map_err(|e| IngestError::Other(anyhow::anyhow!("failed to parse schema {}: {e}", path.display())))?;
    let compiled = jsonschema::JSONSchema::compile(&schema_json)
        .map_err(|e| IngestError::Other(anyhow::anyhow!("invalid json schema {}: {e}", path.display())))?;
    Ok(Some(compiled))
}

/// Keeps only the keys `schema` validates, dropping the rest — ome-tiff's
/// `schema_filename` restricts which variable metadata keys are kept in
/// `frames_json` (§4.6). A key fails schema validation if re-checking the
/// object with only that key present is rejected.
pub fn filter_by_schema(value: Value, schema: &jsonschema::JSONSchema) -> Result<Value, IngestError> {
    let Value::Object(map) = value else { return Ok(value) };
    let mut kept = serde_json::Map::new();
    for (key, val) in map {
        let mut probe = serde_json::Map::new();
        probe.insert(key.clone(), val.clone());
        let probe_value = Value::Object(probe);
        if schema.is_valid(&probe_value) {
            kept.insert(key, val);
        }
    }
    if kept.is_empty() {
        return Err(IngestError::SchemaViolation("no variable metadata keys survived schema validation".to_string()));
    }
    Ok(Value::Object(kept))
}

/// Constructs the splitter named by `frames_format` (§6, §9 "dispatch by
/// the config's `frames_format` string via a registry populated at
/// startup").
pub fn build_splitter(
    frames_format: &str,
    storage: Arc<StorageBackend>,
    storage_dir: String,
    overwrite: bool,
    source_path: PathBuf,
) -> Result<Box<dyn FrameSplitter>, IngestError> {
    match frames_format {
        "ome_tiff" => Ok(Box::new(ome_tiff::OmeTiffSplitter::new(storage, storage_dir, overwrite, source_path)?)),
        "tif_folder" => Ok(Box::new(tif_folder::TifFolderSplitter::new(storage, storage_dir, overwrite, source_path)?)),
        "tif_id" => Ok(Box::new(tif_id::TifIdSplitter::new(storage, storage_dir, overwrite, source_path)?)),
        "lif" => Ok(Box::new(vendor_container::VendorContainerSplitter::new(storage, storage_dir, overwrite, source_path)?)),
        other => Err(IngestError::ParseError {
            name: "frames_format".to_string(),
            reason: format!("unknown splitter variant `{other}`"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unique_count_counts_distinct_values_only() {
        assert_eq!(unique_count([0, 0, 1, 2, 1].into_iter()), 3);
        assert_eq!(unique_count(std::iter::empty()), 0);
    }

    #[test]
    fn validate_global_meta_rejects_zero_dimensions() {
        let meta = GlobalMeta {
            storage_dir: "raw_frames/x".to_string(),
            nbr_frames: 1,
            im_width: 0,
            im_height: 4,
            im_colors: 1,
            bit_depth: BitDepth::Uint8,
            nbr_slices: 1,
            nbr_channels: 1,
            nbr_timepoints: 1,
            nbr_positions: 1,
        };
        assert!(validate_global_meta(&meta).is_err());
    }

    #[test]
    fn unknown_frames_format_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Arc::new(StorageBackend::new_local(tmp.path().to_str().unwrap(), "", 1).unwrap());
        let err = build_splitter("not_a_real_format", storage, "raw_frames/x".to_string(), true, tmp.path().to_path_buf());
        assert!(err.is_err());
    }

    #[test]
    fn filter_by_schema_keeps_only_matching_keys() {
        let schema_json = json!({
            "type": "object",
            "properties": { "kept": { "type": "string" } },
            "required": ["kept"],
        });
        let schema = jsonschema::JSONSchema::compile(&schema_json).unwrap();
        let value = json!({ "kept": "yes", "dropped": 1 });
        let filtered = filter_by_schema(value, &schema).unwrap();
        assert_eq!(filtered, json!({ "kept": "yes" }));
    }

    #[test]
    fn filter_by_schema_fails_when_nothing_survives() {
        let schema_json = json!({
            "type": "object",
            "properties": { "kept": { "type": "string" } },
            "required": ["kept"],
        });
        let schema = jsonschema::JSONSchema::compile(&schema_json).unwrap();
        let value = json!({ "other": 1 });
        assert!(filter_by_schema(value, &schema).is_err());
    }

    #[test]
    fn load_schema_returns_none_when_unset() {
        assert!(load_schema(None).unwrap().is_none());
    }
}
