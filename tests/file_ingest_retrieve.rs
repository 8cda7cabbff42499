//! End-to-end coverage for the `upload_type = "file"` path: a batch row is
//! ingested through the coordinator, then retrieved back, and the bytes
//! and catalog rows are checked against what went in.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use imaging_catalog::catalog::Catalog;
use imaging_catalog::config::{Config, UploadType};
use imaging_catalog::coordinator::{BatchRow, Coordinator, RowState};
use imaging_catalog::retrieval::{self, RetrievalOptions};
use imaging_catalog::storage::StorageBackend;

fn file_config(overwrite: bool) -> Config {
    Config {
        upload_type: UploadType::File,
        frames_format: None,
        storage: "local".to_string(),
        storage_access: None,
        microscope: Some("scope-1".to_string()),
        filename_parser: None,
        schema_filename: None,
        worker_count: 1,
        overwrite,
    }
}

#[test]
fn file_round_trips_through_ingest_and_retrieve() {
    let source_dir = tempfile::tempdir().unwrap();
    let source_path = source_dir.path().join("raw.bin");
    std::fs::write(&source_path, b"some raw instrument bytes").unwrap();

    let mount = tempfile::tempdir().unwrap();
    let storage = Arc::new(StorageBackend::new_local(mount.path().to_str().unwrap(), "", 1).unwrap());
    let db_path = source_dir.path().join("catalog.db");
    let catalog = Catalog::open(db_path.to_str().unwrap()).unwrap();

    let row = BatchRow {
        dataset_id: "ML-2021-03-11-10-32-05-0001".to_string(),
        file_name: source_path.clone(),
        description: Some("first acquisition".to_string()),
        parent_dataset_id: None,
        positions: None,
        schema_filename: None,
    };

    let cancel = Arc::new(AtomicBool::new(false));
    let mut coordinator = Coordinator::new(catalog, storage.clone(), file_config(false), cancel);
    let outcomes = coordinator.ingest_batch(vec![row.clone()]);
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0].state, RowState::Cataloged), "unexpected state: {:?}", outcomes[0].state);

    // Re-ingesting without overwrite must fail on the uniqueness check.
    let cancel = Arc::new(AtomicBool::new(false));
    let catalog = Catalog::open(db_path.to_str().unwrap()).unwrap();
    let mut coordinator = Coordinator::new(catalog, storage.clone(), file_config(false), cancel);
    let outcomes = coordinator.ingest_batch(vec![row.clone()]);
    assert!(matches!(outcomes[0].state, RowState::Failed(_)));

    // Overwrite succeeds and replaces the existing row and object.
    let cancel = Arc::new(AtomicBool::new(false));
    let catalog = Catalog::open(db_path.to_str().unwrap()).unwrap();
    let mut coordinator = Coordinator::new(catalog, storage.clone(), file_config(true), cancel);
    let outcomes = coordinator.ingest_batch(vec![row]);
    assert!(matches!(outcomes[0].state, RowState::Cataloged));

    let mut catalog = Catalog::open(db_path.to_str().unwrap()).unwrap();
    let dest = tempfile::tempdir().unwrap();
    retrieval::retrieve(
        &mut catalog,
        &storage,
        "ML-2021-03-11-10-32-05-0001",
        dest.path(),
        &RetrievalOptions { download: true, metadata: true, ..Default::default() },
    )
    .unwrap();

    let out_dir = dest.path().join("ML-2021-03-11-10-32-05-0001");
    assert!(out_dir.join("global_metadata.json").exists());
    let retrieved_bytes = std::fs::read(out_dir.join("raw.bin")).unwrap();
    assert_eq!(retrieved_bytes, b"some raw instrument bytes");
}

#[test]
fn invalid_serial_is_rejected_before_any_upload() {
    let source_dir = tempfile::tempdir().unwrap();
    let source_path = source_dir.path().join("raw.bin");
    std::fs::write(&source_path, b"bytes").unwrap();

    let mount = tempfile::tempdir().unwrap();
    let storage = Arc::new(StorageBackend::new_local(mount.path().to_str().unwrap(), "", 1).unwrap());
    let catalog = Catalog::open(":memory:").unwrap();

    let row = BatchRow {
        dataset_id: "not-a-valid-serial".to_string(),
        file_name: source_path,
        description: None,
        parent_dataset_id: None,
        positions: None,
        schema_filename: None,
    };

    let cancel = Arc::new(AtomicBool::new(false));
    let mut coordinator = Coordinator::new(catalog, storage, file_config(false), cancel);
    let outcomes = coordinator.ingest_batch(vec![row]);
    assert!(matches!(outcomes[0].state, RowState::Failed(_)));
}
