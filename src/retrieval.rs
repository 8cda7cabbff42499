//! Retrieval planner (C8): resolves dimension filters to a plane set,
//! downloads it, and emits sidecar metadata (§4.8).

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::catalog::{Catalog, FrameFilters};
use crate::error::{IngestError, RetrievalError};
use crate::storage::StorageBackend;

#[derive(Clone, Debug, Default)]
pub struct RetrievalOptions {
    pub download: bool,
    pub metadata: bool,
    pub filters: FrameFilters,
}

fn to_retrieval_error(err: IngestError) -> RetrievalError {
    match err {
        IngestError::TransientIo(reason) => RetrievalError::TransientIo(reason),
        other => RetrievalError::Other(anyhow::anyhow!(other.to_string())),
    }
}

#[derive(Serialize)]
struct FileMetadataOut<'a> {
    storage_dir: &'a str,
    file_name: &'a str,
    sha256: &'a str,
    metadata: serde_json::Value,
}

#[derive(Serialize)]
struct GlobalMetadataOut<'a> {
    storage_dir: &'a str,
    nbr_frames: i64,
    im_width: i64,
    im_height: i64,
    im_colors: i64,
    bit_depth: &'a str,
    nbr_slices: i64,
    nbr_channels: i64,
    nbr_timepoints: i64,
    nbr_positions: i64,
    metadata: serde_json::Value,
}

#[derive(Serialize)]
struct FrameMetaCsvRow<'a> {
    channel_idx: i64,
    slice_idx: i64,
    time_idx: i64,
    pos_idx: i64,
    channel_name: &'a str,
    file_name: &'a str,
    sha256: &'a str,
}

/// Runs the full retrieval algorithm for one dataset serial (§4.8).
/// `dest_root` is the parent under which `<serial>/` is freshly created.
pub fn retrieve(catalog: &mut Catalog, storage: &StorageBackend, serial: &str, dest_root: &Path, options: &RetrievalOptions) -> Result<(), RetrievalError> {
    let dest_dir = dest_root.join(serial);
    if dest_dir.exists() {
        return Err(RetrievalError::DestinationExists(dest_dir.display().to_string()));
    }
    if !options.download && !options.metadata {
        return Err(RetrievalError::NothingToDo);
    }
    std::fs::create_dir_all(&dest_dir)
        .map_err(|e| RetrievalError::Other(anyhow::anyhow!("failed to create {}: {e}", dest_dir.display())))?;

    let session = catalog.session_scope().map_err(to_retrieval_error)?;
    let dataset = session.get_dataset(serial)?;

    if !dataset.frames {
        let file = session.get_file_global(serial)?;
        if options.metadata {
            let out = FileMetadataOut {
                storage_dir: &file.storage_dir,
                file_name: &file.file_name,
                sha256: &file.sha256,
                metadata: serde_json::from_str(&file.metadata_json).unwrap_or(serde_json::Value::Null),
            };
            write_json(&dest_dir.join("global_metadata.json"), &out)?;
        }
        if options.download {
            let key = format!("{}/{}", file.storage_dir, file.file_name);
            storage.get_file(&key, &dest_dir.join(&file.file_name)).map_err(to_retrieval_error)?;
        }
        return Ok(());
    }

    let global = session.get_frames_global(serial)?;
    let frames = session.get_frames(serial, &options.filters)?;

    if options.metadata {
        let out = GlobalMetadataOut {
            storage_dir: &global.storage_dir,
            nbr_frames: global.nbr_frames,
            im_width: global.im_width,
            im_height: global.im_height,
            im_colors: global.im_colors,
            bit_depth: &global.bit_depth,
            nbr_slices: global.nbr_slices,
            nbr_channels: global.nbr_channels,
            nbr_timepoints: global.nbr_timepoints,
            nbr_positions: global.nbr_positions,
            metadata: serde_json::from_str(&global.metadata_json).unwrap_or(serde_json::Value::Null),
        };
        write_json(&dest_dir.join("global_metadata.json"), &out)?;
        write_frames_csv(&dest_dir.join("frames_meta.csv"), &frames)?;
    }

    if options.download {
        let items: Vec<(String, PathBuf)> = frames
            .iter()
            .map(|frame| (format!("{}/{}", global.storage_dir, frame.file_name), dest_dir.join(&frame.file_name)))
            .collect();
        storage.download_planes(items).map_err(to_retrieval_error)?;
    }

    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), RetrievalError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| RetrievalError::Other(anyhow::anyhow!("failed to serialize {}: {e}", path.display())))?;
    std::fs::write(path, text).map_err(|e| RetrievalError::Other(anyhow::anyhow!("failed to write {}: {e}", path.display())))
}

fn write_frames_csv(path: &Path, frames: &[crate::catalog::FrameRow]) -> Result<(), RetrievalError> {
    let mut writer = csv::Writer::from_path(path)
        .map_err(|e| RetrievalError::Other(anyhow::anyhow!("failed to open {}: {e}", path.display())))?;
    for frame in frames {
        writer
            .serialize(FrameMetaCsvRow {
                channel_idx: frame.channel_idx,
                slice_idx: frame.slice_idx,
                time_idx: frame.time_idx,
                pos_idx: frame.pos_idx,
                channel_name: &frame.channel_name,
                file_name: &frame.file_name,
                sha256: &frame.sha256,
            })
            .map_err(|e| RetrievalError::Other(anyhow::anyhow!("failed to write {}: {e}", path.display())))?;
    }
    writer.flush().map_err(|e| RetrievalError::Other(anyhow::anyhow!("failed to flush {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::model::{NewDataset, NewFramesGlobal, NewFrameRow};
    use crate::storage::StorageBackend;
    use tempfile::tempdir;

    fn seed_frames_dataset(catalog: &mut Catalog, serial: &str) {
        let session = catalog.session_scope().unwrap();
        let dataset = NewDataset {
            serial: serial.to_string(),
            date_time: "2021-03-11T10:32:05Z".to_string(),
            microscope: None,
            description: None,
            parent_serial: None,
        };
        let global = NewFramesGlobal {
            storage_dir: format!("raw_frames/{serial}"),
            nbr_frames: 1,
            im_width: 4,
            im_height: 4,
            im_colors: 1,
            bit_depth: "uint8".to_string(),
            nbr_slices: 1,
            nbr_channels: 1,
            nbr_timepoints: 1,
            nbr_positions: 1,
            metadata_json: "{}".to_string(),
        };
        let rows = vec![NewFrameRow {
            channel_idx: 0,
            slice_idx: 0,
            time_idx: 0,
            pos_idx: 0,
            channel_name: "0".to_string(),
            file_name: "im_c000_z000_t000_p000.png".to_string(),
            sha256: "deadbeef".to_string(),
            metadata_json: "{}".to_string(),
        }];
        session.insert_frames(&dataset, &global, &rows, false).unwrap();
        session.commit().unwrap();
    }

    #[test]
    fn destination_must_be_freshly_created() {
        let mount = tempdir().unwrap();
        let storage = StorageBackend::new_local(mount.path().to_str().unwrap(), "", 1).unwrap();
        let mut catalog = Catalog::open(":memory:").unwrap();
        seed_frames_dataset(&mut catalog, "ML-2021-03-11-10-32-05-0001");

        let dest = tempdir().unwrap();
        std::fs::create_dir(dest.path().join("ML-2021-03-11-10-32-05-0001")).unwrap();
        let err = retrieve(&mut catalog, &storage, "ML-2021-03-11-10-32-05-0001", dest.path(), &RetrievalOptions { metadata: true, ..Default::default() });
        assert!(matches!(err, Err(RetrievalError::DestinationExists(_))));
    }

    #[test]
    fn neither_download_nor_metadata_fails() {
        let mount = tempdir().unwrap();
        let storage = StorageBackend::new_local(mount.path().to_str().unwrap(), "", 1).unwrap();
        let mut catalog = Catalog::open(":memory:").unwrap();
        seed_frames_dataset(&mut catalog, "ML-2021-03-11-10-32-05-0001");

        let dest = tempdir().unwrap();
        let err = retrieve(
            &mut catalog,
            &storage,
            "ML-2021-03-11-10-32-05-0001",
            dest.path(),
            &RetrievalOptions { download: false, metadata: false, filters: FrameFilters::default() },
        );
        assert!(matches!(err, Err(RetrievalError::NothingToDo)));
    }

    #[test]
    fn metadata_only_emits_sidecar_files_without_planes() {
        let mount = tempdir().unwrap();
        let storage = StorageBackend::new_local(mount.path().to_str().unwrap(), "", 1).unwrap();
        let mut catalog = Catalog::open(":memory:").unwrap();
        seed_frames_dataset(&mut catalog, "ML-2021-03-11-10-32-05-0001");

        let dest = tempdir().unwrap();
        retrieve(
            &mut catalog,
            &storage,
            "ML-2021-03-11-10-32-05-0001",
            dest.path(),
            &RetrievalOptions { metadata: true, download: false, filters: FrameFilters::default() },
        )
        .unwrap();

        let out_dir = dest.path().join("ML-2021-03-11-10-32-05-0001");
        assert!(out_dir.join("global_metadata.json").exists());
        assert!(out_dir.join("frames_meta.csv").exists());
        assert!(!out_dir.join("im_c000_z000_t000_p000.png").exists());
    }
}
