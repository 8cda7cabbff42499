//! Storage backend abstraction (C2): uniform put/get/list/download over
//! either an object store (S3) or a mounted filesystem.
//!
//! Both variants are backed by the [`object_store`] crate — the same crate
//! the pack's `tvix-castore` uses for its own content-addressed blob
//! backend — via [`object_store::aws::AmazonS3`] and
//! [`object_store::local::LocalFileSystem`] respectively. `object_store`'s
//! API is `async`; since every other component in this crate is
//! synchronous, `StorageBackend` owns a small current-thread-per-call
//! `tokio` runtime internally and exposes a synchronous facade — the same
//! shape `reqwest::blocking` uses to wrap an async HTTP client.

mod pool;
mod retry;

use bytes::Bytes;
use futures::stream::StreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::path::Path as StorePath;
use object_store::ObjectStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};

use crate::error::IngestError;
use retry::retry_with_backoff;

/// Default worker count for parallel transfer: number of CPUs, minimum 1.
pub fn default_worker_count() -> usize {
    num_cpus::get().max(1)
}

pub struct StorageBackend {
    store: Arc<dyn ObjectStore>,
    /// Key prefix every relative path is joined under (e.g. the bucket's
    /// logical root, or the mount's sub-path).
    base: StorePath,
    runtime: Runtime,
    worker_count: usize,
}

impl StorageBackend {
    /// Construct an object-store-backed backend (`storage = "s3"`).
    pub fn new_s3(bucket: &str, base_prefix: &str, worker_count: usize) -> Result<Self, IngestError> {
        let store = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .build()
            .map_err(|e| IngestError::Other(anyhow::anyhow!("failed to configure S3 backend: {e}")))?;
        Self::new(Arc::new(store), base_prefix, worker_count)
    }

    /// Construct a filesystem-backed backend (`storage = "local"`), rooted
    /// at `mount_point`.
    pub fn new_local(mount_point: &str, base_prefix: &str, worker_count: usize) -> Result<Self, IngestError> {
        std::fs::create_dir_all(mount_point)
            .map_err(|e| IngestError::Other(anyhow::anyhow!("failed to create mount point {mount_point}: {e}")))?;
        let store = LocalFileSystem::new_with_prefix(mount_point)
            .map_err(|e| IngestError::Other(anyhow::anyhow!("failed to open local backend at {mount_point}: {e}")))?;
        Self::new(Arc::new(store), base_prefix, worker_count)
    }

    fn new(store: Arc<dyn ObjectStore>, base_prefix: &str, worker_count: usize) -> Result<Self, IngestError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_count.max(1))
            .enable_all()
            .build()
            .map_err(|e| IngestError::Other(anyhow::anyhow!("failed to start storage runtime: {e}")))?;
        Ok(Self {
            store,
            base: StorePath::from(base_prefix),
            runtime,
            worker_count: worker_count.max(1),
        })
    }

    fn key(&self, relative: &str) -> StorePath {
        self.base.child(relative)
    }

    /// Fails if `dir` already has any object under it. Used at splitter
    /// construction when `overwrite=false`.
    pub fn assert_unique(&self, dir: &str) -> Result<(), IngestError> {
        let prefix = self.key(dir);
        let store = self.store.clone();
        let any = self.runtime.block_on(async move {
            let mut stream = store.list(Some(&prefix));
            stream.next().await.is_some()
        });
        if any {
            return Err(IngestError::StorageExists(dir.to_string()));
        }
        Ok(())
    }

    pub fn put_plane(&self, key: &str, bytes: Vec<u8>) -> Result<(), IngestError> {
        let path = self.key(key);
        let store = self.store.clone();
        self.runtime.block_on(async move {
            retry_with_backoff(|| {
                let store = store.clone();
                let path = path.clone();
                let payload: Bytes = bytes.clone().into();
                async move { store.put(&path, payload.into()).await }
            })
            .await
            .map_err(|e| IngestError::TransientIo(e.to_string()))?;
            Ok(())
        })
    }

    pub fn put_file(&self, key: &str, local_path: &Path) -> Result<(), IngestError> {
        let bytes = std::fs::read(local_path)
            .map_err(|e| IngestError::Other(anyhow::anyhow!("failed to read {}: {e}", local_path.display())))?;
        self.put_plane(key, bytes)
    }

    pub fn get_plane(&self, key: &str) -> Result<Vec<u8>, IngestError> {
        let path = self.key(key);
        let store = self.store.clone();
        self.runtime.block_on(async move {
            let bytes = retry_with_backoff(|| {
                let store = store.clone();
                let path = path.clone();
                async move {
                    let result = store.get(&path).await?;
                    result.bytes().await
                }
            })
            .await
            .map_err(|e| IngestError::TransientIo(e.to_string()))?;
            Ok(bytes.to_vec())
        })
    }

    pub fn get_file(&self, key: &str, local_path: &Path) -> Result<(), IngestError> {
        let bytes = self.get_plane(key)?;
        if let Some(parent) = local_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| IngestError::Other(anyhow::anyhow!("failed to create {}: {e}", parent.display())))?;
        }
        std::fs::write(local_path, bytes)
            .map_err(|e| IngestError::Other(anyhow::anyhow!("failed to write {}: {e}", local_path.display())))?;
        Ok(())
    }

    pub fn list_prefix(&self, dir: &str) -> Result<Vec<String>, IngestError> {
        let prefix = self.key(dir);
        let store = self.store.clone();
        self.runtime.block_on(async move {
            let mut stream = store.list(Some(&prefix));
            let mut keys = Vec::new();
            while let Some(meta) = stream.next().await {
                let meta = meta.map_err(|e| IngestError::TransientIo(e.to_string()))?;
                keys.push(meta.location.to_string());
            }
            Ok(keys)
        })
    }

    /// Upload every `(key, bytes)` pair with bounded parallelism. Fails if
    /// any single item exhausts its retry budget; collects every failure
    /// before returning so operators see all of them.
    pub fn upload_planes(&self, items: Vec<(String, Vec<u8>)>) -> Result<(), IngestError> {
        let store = self.store.clone();
        let base = self.base.clone();
        let workers = self.worker_count;
        self.runtime.block_on(async move {
            let results = pool::run_bounded(items, workers, move |(key, bytes)| {
                let store = store.clone();
                let path = base.child(key.as_str());
                async move {
                    retry_with_backoff(|| {
                        let store = store.clone();
                        let path = path.clone();
                        let payload: Bytes = bytes.clone().into();
                        async move { store.put(&path, payload.into()).await }
                    })
                    .await
                    .map(|_| ())
                    .map_err(|e| (key, e.to_string()))
                }
            })
            .await;
            collect_transfer_errors(results)
        })
    }

    /// Download every `(key, local_path)` pair with bounded parallelism.
    pub fn download_planes(&self, items: Vec<(String, PathBuf)>) -> Result<(), IngestError> {
        let store = self.store.clone();
        let base = self.base.clone();
        let workers = self.worker_count;
        self.runtime.block_on(async move {
            let results = pool::run_bounded(items, workers, move |(key, local_path)| {
                let store = store.clone();
                let path = base.child(key.as_str());
                async move {
                    let bytes = retry_with_backoff(|| {
                        let store = store.clone();
                        let path = path.clone();
                        async move {
                            let result = store.get(&path).await?;
                            result.bytes().await
                        }
                    })
                    .await
                    .map_err(|e| (key.clone(), e.to_string()))?;
                    if let Some(parent) = local_path.parent() {
                        tokio::fs::create_dir_all(parent)
                            .await
                            .map_err(|e| (key.clone(), e.to_string()))?;
                    }
                    tokio::fs::write(&local_path, bytes).await.map_err(|e| (key, e.to_string()))
                }
            })
            .await;
            collect_transfer_errors(results)
        })
    }
}

fn collect_transfer_errors(results: Vec<Result<(), (String, String)>>) -> Result<(), IngestError> {
    let failures: Vec<String> = results
        .into_iter()
        .filter_map(|r| r.err())
        .map(|(key, reason)| format!("{key}: {reason}"))
        .collect();
    if failures.is_empty() {
        Ok(())
    } else {
        Err(IngestError::TransientIo(failures.join("; ")))
    }
}
