//! Relational metadata catalog (C3): schema, transactional session scope,
//! and the dataset-identifier contract.
//!
//! Schema and transaction style are grounded in the teacher's
//! `storage.rs::ensure_schema`/`SqliteSealedLogStore` — a single
//! `rusqlite::Connection`, schema created with one `execute_batch`, and a
//! scoped session guaranteeing commit-or-rollback.

pub mod model;

use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::error::{IngestError, RetrievalError};
use model::*;

pub use model::{ChannelFilter, DataSet, FileGlobal, FrameFilters, FrameRow, FramesGlobal};

pub struct Catalog {
    conn: Connection,
}

impl Catalog {
    /// Open (creating if absent) the sqlite database at `db_path` and
    /// ensure the schema exists. `db_path` is the `dbname` field of the
    /// rendered credentials URI (§6); `:memory:` is accepted for tests.
    pub fn open(db_path: &str) -> Result<Self, IngestError> {
        let conn = Connection::open(db_path)
            .map_err(|e| IngestError::Other(anyhow::anyhow!("failed to open catalog db {db_path}: {e}")))?;
        let catalog = Self { conn };
        catalog.ensure_schema()?;
        Ok(catalog)
    }

    fn ensure_schema(&self) -> Result<(), IngestError> {
        self.conn
            .execute_batch(
                r#"
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS datasets (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              dataset_serial TEXT NOT NULL UNIQUE,
              date_time TEXT NOT NULL,
              microscope TEXT,
              description TEXT,
              frames INTEGER NOT NULL,
              parent_id INTEGER REFERENCES datasets(id)
            );

            CREATE TABLE IF NOT EXISTS frames_global (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              dataset_id INTEGER NOT NULL UNIQUE REFERENCES datasets(id) ON DELETE CASCADE,
              storage_dir TEXT NOT NULL,
              nbr_frames INTEGER NOT NULL,
              im_width INTEGER NOT NULL,
              im_height INTEGER NOT NULL,
              im_colors INTEGER NOT NULL,
              bit_depth TEXT NOT NULL,
              nbr_slices INTEGER NOT NULL,
              nbr_channels INTEGER NOT NULL,
              nbr_timepoints INTEGER NOT NULL,
              nbr_positions INTEGER NOT NULL,
              metadata_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS frames (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              frames_global_id INTEGER NOT NULL REFERENCES frames_global(id) ON DELETE CASCADE,
              channel_idx INTEGER NOT NULL,
              slice_idx INTEGER NOT NULL,
              time_idx INTEGER NOT NULL,
              pos_idx INTEGER NOT NULL,
              channel_name TEXT NOT NULL,
              file_name TEXT NOT NULL,
              sha256 TEXT NOT NULL,
              metadata_json TEXT NOT NULL,
              UNIQUE(frames_global_id, channel_idx, slice_idx, time_idx, pos_idx)
            );

            CREATE TABLE IF NOT EXISTS file_global (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              dataset_id INTEGER NOT NULL UNIQUE REFERENCES datasets(id) ON DELETE CASCADE,
              storage_dir TEXT NOT NULL,
              file_name TEXT NOT NULL,
              sha256 TEXT NOT NULL,
              metadata_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_frames_dims ON frames(frames_global_id, channel_idx, slice_idx, time_idx, pos_idx);
            "#,
            )
            .map_err(|e| IngestError::Other(anyhow::anyhow!("failed to create catalog schema: {e}")))?;
        Ok(())
    }

    /// Begin a scoped transactional session. Nested scopes are not
    /// supported: the returned `Session` borrows the connection exclusively
    /// until it is committed or dropped (dropping without committing rolls
    /// back, via `rusqlite::Transaction`'s default drop behavior).
    pub fn session_scope(&mut self) -> Result<Session<'_>, IngestError> {
        let tx = self
            .conn
            .transaction()
            .map_err(|e| IngestError::Other(anyhow::anyhow!("failed to open catalog transaction: {e}")))?;
        Ok(Session { tx })
    }
}

pub struct Session<'conn> {
    tx: Transaction<'conn>,
}

impl<'conn> Session<'conn> {
    pub fn commit(self) -> Result<(), IngestError> {
        self.tx
            .commit()
            .map_err(|e| IngestError::Other(anyhow::anyhow!("failed to commit catalog transaction: {e}")))
    }

    /// Invariant §3.3.1: fails if any DataSet with this serial exists.
    pub fn assert_unique_id(&self, serial: &str) -> Result<(), IngestError> {
        let exists: bool = self
            .tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM datasets WHERE dataset_serial = ?1)",
                params![serial],
                |row| row.get(0),
            )
            .map_err(|e| IngestError::Other(anyhow::anyhow!("catalog query failed: {e}")))?;
        if exists {
            return Err(IngestError::DuplicateId(serial.to_string()));
        }
        Ok(())
    }

    fn dataset_id_by_serial(&self, serial: &str) -> Result<Option<i64>, IngestError> {
        self.tx
            .query_row("SELECT id FROM datasets WHERE dataset_serial = ?1", params![serial], |row| row.get(0))
            .optional()
            .map_err(|e| IngestError::Other(anyhow::anyhow!("catalog query failed: {e}")))
    }

    /// Deletes the dataset row (cascading to its FramesGlobal/Frames or
    /// FileGlobal) if present. Used under `overwrite=true` to reclaim a
    /// prior partial or complete ingestion before re-inserting (§4.7).
    fn delete_existing_dataset(&self, serial: &str) -> Result<(), IngestError> {
        self.tx
            .execute("DELETE FROM datasets WHERE dataset_serial = ?1", params![serial])
            .map_err(|e| IngestError::Other(anyhow::anyhow!("failed to delete existing dataset: {e}")))?;
        Ok(())
    }

    fn insert_dataset_row(&self, dataset: &NewDataset, frames: bool) -> Result<i64, IngestError> {
        let parent_id = match &dataset.parent_serial {
            Some(parent_serial) => Some(self.dataset_id_by_serial(parent_serial)?.ok_or_else(|| {
                IngestError::Other(anyhow::anyhow!("parent dataset `{parent_serial}` not found"))
            })?),
            None => None,
        };
        self.tx
            .execute(
                "INSERT INTO datasets(dataset_serial, date_time, microscope, description, frames, parent_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![dataset.serial, dataset.date_time, dataset.microscope, dataset.description, frames, parent_id],
            )
            .map_err(|e| IngestError::Other(anyhow::anyhow!("failed to insert dataset row: {e}")))?;
        Ok(self.tx.last_insert_rowid())
    }

    /// Inserts DataSet (if absent), FramesGlobal, and every Frames row.
    /// Honors invariants §3.3.2-5. Under `overwrite=true` any existing
    /// dataset with the same serial is replaced wholesale.
    pub fn insert_frames(
        &self,
        dataset: &NewDataset,
        global: &NewFramesGlobal,
        rows: &[NewFrameRow],
        overwrite: bool,
    ) -> Result<(), IngestError> {
        if overwrite {
            self.delete_existing_dataset(&dataset.serial)?;
        } else {
            self.assert_unique_id(&dataset.serial)?;
        }

        if global.nbr_frames != rows.len() as i64 {
            return Err(IngestError::Other(anyhow::anyhow!(
                "nbr_frames ({}) does not match the number of frame rows ({})",
                global.nbr_frames,
                rows.len()
            )));
        }
        // time_idx and pos_idx are carried verbatim from source filenames and
        // are not necessarily dense (e.g. a single-position acquisition
        // named `..._p050_...` has nbr_positions=1 but pos_idx=50), so only
        // channel_idx/slice_idx — which this crate always assigns densely
        // from 0 — are range-checked here.
        for row in rows {
            if !(0..global.nbr_channels).contains(&row.channel_idx) || !(0..global.nbr_slices).contains(&row.slice_idx) {
                return Err(IngestError::Other(anyhow::anyhow!(
                    "frame index out of range for ({}, {}, {}, {})",
                    row.channel_idx,
                    row.slice_idx,
                    row.time_idx,
                    row.pos_idx
                )));
            }
        }

        let dataset_id = self.insert_dataset_row(dataset, true)?;

        self.tx
            .execute(
                "INSERT INTO frames_global(dataset_id, storage_dir, nbr_frames, im_width, im_height, im_colors,
                    bit_depth, nbr_slices, nbr_channels, nbr_timepoints, nbr_positions, metadata_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    dataset_id,
                    global.storage_dir,
                    global.nbr_frames,
                    global.im_width,
                    global.im_height,
                    global.im_colors,
                    global.bit_depth,
                    global.nbr_slices,
                    global.nbr_channels,
                    global.nbr_timepoints,
                    global.nbr_positions,
                    global.metadata_json,
                ],
            )
            .map_err(|e| IngestError::Other(anyhow::anyhow!("failed to insert frames_global row: {e}")))?;
        let frames_global_id = self.tx.last_insert_rowid();

        for row in rows {
            self.tx
                .execute(
                    "INSERT INTO frames(frames_global_id, channel_idx, slice_idx, time_idx, pos_idx,
                        channel_name, file_name, sha256, metadata_json)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        frames_global_id,
                        row.channel_idx,
                        row.slice_idx,
                        row.time_idx,
                        row.pos_idx,
                        row.channel_name,
                        row.file_name,
                        row.sha256,
                        row.metadata_json,
                    ],
                )
                .map_err(|e| IngestError::Other(anyhow::anyhow!("failed to insert frames row: {e}")))?;
        }

        Ok(())
    }

    /// Inserts DataSet (if absent) and FileGlobal.
    pub fn insert_file(&self, dataset: &NewDataset, file: &NewFileGlobal, overwrite: bool) -> Result<(), IngestError> {
        if overwrite {
            self.delete_existing_dataset(&dataset.serial)?;
        } else {
            self.assert_unique_id(&dataset.serial)?;
        }

        let dataset_id = self.insert_dataset_row(dataset, false)?;
        self.tx
            .execute(
                "INSERT INTO file_global(dataset_id, storage_dir, file_name, sha256, metadata_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![dataset_id, file.storage_dir, file.file_name, file.sha256, file.metadata_json],
            )
            .map_err(|e| IngestError::Other(anyhow::anyhow!("failed to insert file_global row: {e}")))?;
        Ok(())
    }

    pub fn get_dataset(&self, serial: &str) -> Result<DataSet, RetrievalError> {
        self.tx
            .query_row(
                "SELECT id, dataset_serial, date_time, microscope, description, frames, parent_id
                 FROM datasets WHERE dataset_serial = ?1",
                params![serial],
                |row| {
                    Ok(DataSet {
                        id: row.get(0)?,
                        dataset_serial: row.get(1)?,
                        date_time: row.get(2)?,
                        microscope: row.get(3)?,
                        description: row.get(4)?,
                        frames: row.get(5)?,
                        parent_id: row.get(6)?,
                    })
                },
            )
            .optional()
            .map_err(|e| RetrievalError::Other(anyhow::anyhow!("catalog query failed: {e}")))?
            .ok_or_else(|| RetrievalError::DatasetNotFound(serial.to_string()))
    }

    pub fn get_frames_global(&self, serial: &str) -> Result<FramesGlobal, RetrievalError> {
        self.tx
            .query_row(
                "SELECT fg.storage_dir, fg.nbr_frames, fg.im_width, fg.im_height, fg.im_colors, fg.bit_depth,
                        fg.nbr_slices, fg.nbr_channels, fg.nbr_timepoints, fg.nbr_positions, fg.metadata_json
                 FROM frames_global fg
                 JOIN datasets d ON d.id = fg.dataset_id
                 WHERE d.dataset_serial = ?1",
                params![serial],
                |row| {
                    Ok(FramesGlobal {
                        storage_dir: row.get(0)?,
                        nbr_frames: row.get(1)?,
                        im_width: row.get(2)?,
                        im_height: row.get(3)?,
                        im_colors: row.get(4)?,
                        bit_depth: row.get(5)?,
                        nbr_slices: row.get(6)?,
                        nbr_channels: row.get(7)?,
                        nbr_timepoints: row.get(8)?,
                        nbr_positions: row.get(9)?,
                        metadata_json: row.get(10)?,
                    })
                },
            )
            .optional()
            .map_err(|e| RetrievalError::Other(anyhow::anyhow!("catalog query failed: {e}")))?
            .ok_or_else(|| RetrievalError::DatasetNotFound(serial.to_string()))
    }

    pub fn get_file_global(&self, serial: &str) -> Result<FileGlobal, RetrievalError> {
        self.tx
            .query_row(
                "SELECT fgl.storage_dir, fgl.file_name, fgl.sha256, fgl.metadata_json
                 FROM file_global fgl
                 JOIN datasets d ON d.id = fgl.dataset_id
                 WHERE d.dataset_serial = ?1",
                params![serial],
                |row| {
                    Ok(FileGlobal {
                        storage_dir: row.get(0)?,
                        file_name: row.get(1)?,
                        sha256: row.get(2)?,
                        metadata_json: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(|e| RetrievalError::Other(anyhow::anyhow!("catalog query failed: {e}")))?
            .ok_or_else(|| RetrievalError::DatasetNotFound(serial.to_string()))
    }

    /// Resolves dimension filters to the matching Frames rows (§4.8,
    /// P5). `filters.channels` given as non-numeric names fails with
    /// *channel-name-not-numeric* (the catalog's stable mapping is through
    /// `channel_idx`, so names can only be honored when they parse as the
    /// decimal channel index, matching `parse_idx_from_name`'s convention).
    pub fn get_frames(&self, serial: &str, filters: &FrameFilters) -> Result<Vec<FrameRow>, RetrievalError> {
        let mut sql = String::from(
            "SELECT f.channel_idx, f.slice_idx, f.time_idx, f.pos_idx, f.channel_name, f.file_name, f.sha256, f.metadata_json
             FROM frames f
             JOIN frames_global fg ON fg.id = f.frames_global_id
             JOIN datasets d ON d.id = fg.dataset_id
             WHERE d.dataset_serial = ?1",
        );
        let mut owned_params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(serial.to_string())];

        if let Some(positions) = &filters.positions {
            push_in_clause(&mut sql, &mut owned_params, "f.pos_idx", positions);
        }
        if let Some(times) = &filters.times {
            push_in_clause(&mut sql, &mut owned_params, "f.time_idx", times);
        }
        if let Some(slices) = &filters.slices {
            push_in_clause(&mut sql, &mut owned_params, "f.slice_idx", slices);
        }
        if let Some(channels) = &filters.channels {
            let indices = match channels {
                ChannelFilter::Indices(indices) => indices.clone(),
                ChannelFilter::Names(names) => {
                    let mut indices = Vec::with_capacity(names.len());
                    for name in names {
                        let idx: i64 = name
                            .parse()
                            .map_err(|_| RetrievalError::ChannelNameNotNumeric(name.clone()))?;
                        indices.push(idx);
                    }
                    indices
                }
            };
            push_in_clause(&mut sql, &mut owned_params, "f.channel_idx", &indices);
        }
        sql.push_str(" ORDER BY f.channel_idx, f.slice_idx, f.time_idx, f.pos_idx");

        let params_ref: Vec<&dyn rusqlite::ToSql> = owned_params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = self
            .tx
            .prepare(&sql)
            .map_err(|e| RetrievalError::Other(anyhow::anyhow!("catalog query failed: {e}")))?;
        let rows = stmt
            .query_map(params_ref.as_slice(), |row| {
                Ok(FrameRow {
                    channel_idx: row.get(0)?,
                    slice_idx: row.get(1)?,
                    time_idx: row.get(2)?,
                    pos_idx: row.get(3)?,
                    channel_name: row.get(4)?,
                    file_name: row.get(5)?,
                    sha256: row.get(6)?,
                    metadata_json: row.get(7)?,
                })
            })
            .map_err(|e| RetrievalError::Other(anyhow::anyhow!("catalog query failed: {e}")))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| RetrievalError::Other(anyhow::anyhow!("catalog row decode failed: {e}")))?);
        }
        Ok(out)
    }
}

fn push_in_clause(sql: &mut String, params: &mut Vec<Box<dyn rusqlite::ToSql>>, column: &str, values: &[i64]) {
    sql.push_str(&format!(" AND {column} IN ("));
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            sql.push(',');
        }
        sql.push('?');
        sql.push_str(&(params.len() + 1).to_string());
        params.push(Box::new(*value));
    }
    sql.push(')');
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_dataset(serial: &str) -> NewDataset {
        NewDataset {
            serial: serial.to_string(),
            date_time: "2021-03-11T10:32:05Z".to_string(),
            microscope: Some("scope-1".to_string()),
            description: None,
            parent_serial: None,
        }
    }

    fn sample_global() -> NewFramesGlobal {
        NewFramesGlobal {
            storage_dir: "raw_frames/ML-2021-03-11-10-32-05-0001".to_string(),
            nbr_frames: 2,
            im_width: 15,
            im_height: 10,
            im_colors: 1,
            bit_depth: "uint16".to_string(),
            nbr_slices: 1,
            nbr_channels: 2,
            nbr_timepoints: 1,
            nbr_positions: 1,
            metadata_json: "{}".to_string(),
        }
    }

    fn sample_rows() -> Vec<NewFrameRow> {
        (0..2)
            .map(|c| NewFrameRow {
                channel_idx: c,
                slice_idx: 0,
                time_idx: 0,
                pos_idx: 0,
                channel_name: c.to_string(),
                file_name: format!("im_c{c:03}_z000_t000_p000.png"),
                sha256: format!("hash{c}"),
                metadata_json: "{}".to_string(),
            })
            .collect()
    }

    #[test]
    fn insert_then_get_round_trips() {
        let mut catalog = Catalog::open(":memory:").unwrap();
        let session = catalog.session_scope().unwrap();
        let serial = "ML-2021-03-11-10-32-05-0001";
        session.insert_frames(&sample_dataset(serial), &sample_global(), &sample_rows(), false).unwrap();
        session.commit().unwrap();

        let mut catalog2 = catalog;
        let session = catalog2.session_scope().unwrap();
        let dataset = session.get_dataset(serial).unwrap();
        assert!(dataset.frames);
        let global = session.get_frames_global(serial).unwrap();
        assert_eq!(global.nbr_channels, 2);
        let frames = session.get_frames(serial, &FrameFilters::default()).unwrap();
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn duplicate_id_rejected_without_overwrite() {
        let mut catalog = Catalog::open(":memory:").unwrap();
        let serial = "ML-2021-03-11-10-32-05-0001";
        {
            let session = catalog.session_scope().unwrap();
            session.insert_frames(&sample_dataset(serial), &sample_global(), &sample_rows(), false).unwrap();
            session.commit().unwrap();
        }
        let session = catalog.session_scope().unwrap();
        let err = session.insert_frames(&sample_dataset(serial), &sample_global(), &sample_rows(), false);
        assert!(matches!(err, Err(IngestError::DuplicateId(_))));
    }

    #[test]
    fn overwrite_replaces_existing_dataset() {
        let mut catalog = Catalog::open(":memory:").unwrap();
        let serial = "ML-2021-03-11-10-32-05-0001";
        for _ in 0..2 {
            let session = catalog.session_scope().unwrap();
            session.insert_frames(&sample_dataset(serial), &sample_global(), &sample_rows(), true).unwrap();
            session.commit().unwrap();
        }
        let session = catalog.session_scope().unwrap();
        let frames = session.get_frames(serial, &FrameFilters::default()).unwrap();
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn filter_by_channel_index_projects_rows() {
        let mut catalog = Catalog::open(":memory:").unwrap();
        let serial = "ML-2021-03-11-10-32-05-0001";
        let session = catalog.session_scope().unwrap();
        session.insert_frames(&sample_dataset(serial), &sample_global(), &sample_rows(), false).unwrap();
        session.commit().unwrap();

        let session = catalog.session_scope().unwrap();
        let filters = FrameFilters { channels: Some(ChannelFilter::Indices(vec![1])), ..Default::default() };
        let frames = session.get_frames(serial, &filters).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].channel_idx, 1);
    }

    #[test]
    fn non_numeric_channel_name_filter_fails() {
        let mut catalog = Catalog::open(":memory:").unwrap();
        let serial = "ML-2021-03-11-10-32-05-0001";
        let session = catalog.session_scope().unwrap();
        session.insert_frames(&sample_dataset(serial), &sample_global(), &sample_rows(), false).unwrap();
        session.commit().unwrap();

        let session = catalog.session_scope().unwrap();
        let filters = FrameFilters { channels: Some(ChannelFilter::Names(vec!["phase".to_string()])), ..Default::default() };
        let err = session.get_frames(serial, &filters);
        assert!(matches!(err, Err(RetrievalError::ChannelNameNotNumeric(_))));
    }

    #[test]
    fn dropped_session_rolls_back() {
        let mut catalog = Catalog::open(":memory:").unwrap();
        let serial = "ML-2021-03-11-10-32-05-0001";
        {
            let session = catalog.session_scope().unwrap();
            session.insert_frames(&sample_dataset(serial), &sample_global(), &sample_rows(), false).unwrap();
            // no commit() call: dropped here, should roll back.
        }
        let session = catalog.session_scope().unwrap();
        assert!(session.get_dataset(serial).is_err());
    }

    /// A single-position acquisition named like `..._p050_...` has
    /// `nbr_positions=1` but a `pos_idx` of 50, not 0 — position and time
    /// indices are carried verbatim from filenames and are not dense.
    #[test]
    fn sparse_pos_and_time_idx_are_accepted() {
        let mut catalog = Catalog::open(":memory:").unwrap();
        let serial = "ML-2021-03-11-10-32-05-0001";
        let session = catalog.session_scope().unwrap();
        let global = NewFramesGlobal { nbr_positions: 1, nbr_timepoints: 1, ..sample_global() };
        let rows: Vec<NewFrameRow> = sample_rows()
            .into_iter()
            .map(|row| NewFrameRow { pos_idx: 50, time_idx: 7, ..row })
            .collect();
        session.insert_frames(&sample_dataset(serial), &global, &rows, false).unwrap();
        session.commit().unwrap();

        let session = catalog.session_scope().unwrap();
        let frames = session.get_frames(serial, &FrameFilters::default()).unwrap();
        assert!(frames.iter().all(|f| f.pos_idx == 50 && f.time_idx == 7));
    }
}
