//! Catalog entity types (§3.2).

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataSet {
    pub id: i64,
    pub dataset_serial: String,
    pub date_time: String,
    pub microscope: Option<String>,
    pub description: Option<String>,
    pub frames: bool,
    pub parent_id: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FramesGlobal {
    pub storage_dir: String,
    pub nbr_frames: i64,
    pub im_width: i64,
    pub im_height: i64,
    pub im_colors: i64,
    pub bit_depth: String,
    pub nbr_slices: i64,
    pub nbr_channels: i64,
    pub nbr_timepoints: i64,
    pub nbr_positions: i64,
    pub metadata_json: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameRow {
    pub channel_idx: i64,
    pub slice_idx: i64,
    pub time_idx: i64,
    pub pos_idx: i64,
    pub channel_name: String,
    pub file_name: String,
    pub sha256: String,
    pub metadata_json: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileGlobal {
    pub storage_dir: String,
    pub file_name: String,
    pub sha256: String,
    pub metadata_json: String,
}

/// What to insert for a `frames=true` dataset (catalog side of C5's output).
#[derive(Clone, Debug)]
pub struct NewDataset {
    pub serial: String,
    pub date_time: String,
    pub microscope: Option<String>,
    pub description: Option<String>,
    pub parent_serial: Option<String>,
}

#[derive(Clone, Debug)]
pub struct NewFramesGlobal {
    pub storage_dir: String,
    pub nbr_frames: i64,
    pub im_width: i64,
    pub im_height: i64,
    pub im_colors: i64,
    pub bit_depth: String,
    pub nbr_slices: i64,
    pub nbr_channels: i64,
    pub nbr_timepoints: i64,
    pub nbr_positions: i64,
    pub metadata_json: String,
}

#[derive(Clone, Debug)]
pub struct NewFrameRow {
    pub channel_idx: i64,
    pub slice_idx: i64,
    pub time_idx: i64,
    pub pos_idx: i64,
    pub channel_name: String,
    pub file_name: String,
    pub sha256: String,
    pub metadata_json: String,
}

#[derive(Clone, Debug)]
pub struct NewFileGlobal {
    pub storage_dir: String,
    pub file_name: String,
    pub sha256: String,
    pub metadata_json: String,
}

/// Dimension filters for retrieval (§4.8). `None` means "all".
#[derive(Clone, Debug, Default)]
pub struct FrameFilters {
    pub positions: Option<Vec<i64>>,
    pub times: Option<Vec<i64>>,
    pub channels: Option<ChannelFilter>,
    pub slices: Option<Vec<i64>>,
}

#[derive(Clone, Debug)]
pub enum ChannelFilter {
    Indices(Vec<i64>),
    /// Channel names as given on the CLI; resolved against `channel_idx`
    /// only when every entry parses as a decimal integer (§4.8).
    Names(Vec<String>),
}
