use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};
use yadisk_dav::{CollectionStatus, DavError};

use super::backoff::RetryPolicy;
use super::key::ObjectKey;
use super::paths::{PathError, scratch_path_for};
use crate::destination::Destination;
use crate::source::{ObjectSource, SourceError};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("download failed: {0}")]
    Download(#[from] SourceError),
    #[error("upload failed: {0}")]
    Upload(#[from] DavError),
    #[error("scratch path error: {0}")]
    Path(#[from] PathError),
    #[error("concurrency limiter is closed")]
    ConcurrencyClosed,
}

/// Destination folders already created during the current pass.
///
/// Creation happens under the lock so each folder gets at most one MKCOL per
/// pass even when several transfers into it start at once.
#[derive(Debug, Default)]
pub struct FolderMemo {
    state: Mutex<FolderState>,
}

#[derive(Debug, Default)]
struct FolderState {
    root_done: bool,
    folders: HashSet<String>,
}

impl FolderMemo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensures the destination root and `subfolder` exist. Failures are
    /// logged and not retried within the pass; the upload that follows
    /// reports whether the folder is really missing.
    pub async fn ensure(&self, destination: &dyn Destination, subfolder: &str) {
        let mut state = self.state.lock().await;
        if !state.root_done {
            state.root_done = true;
            log_folder_outcome("<root>", destination.ensure_root().await);
        }
        if state.folders.insert(subfolder.to_string()) {
            log_folder_outcome(subfolder, destination.ensure_folder(subfolder).await);
        }
    }

    pub async fn ensured(&self) -> usize {
        self.state.lock().await.folders.len()
    }
}

fn log_folder_outcome(folder: &str, outcome: Result<CollectionStatus, DavError>) {
    match outcome {
        Ok(CollectionStatus::Created) => info!(folder, "created destination folder"),
        Ok(CollectionStatus::AlreadyExists) => debug!(folder, "destination folder exists"),
        Err(err) => warn!(folder, error = %err, "failed to create destination folder"),
    }
}

#[derive(Clone)]
pub struct TransferStage {
    source: Arc<dyn ObjectSource>,
    destination: Arc<dyn Destination>,
    scratch_root: PathBuf,
    limit: Arc<Semaphore>,
    retry: RetryPolicy,
}

impl TransferStage {
    pub fn new(
        source: Arc<dyn ObjectSource>,
        destination: Arc<dyn Destination>,
        scratch_root: PathBuf,
        concurrency: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            source,
            destination,
            scratch_root,
            limit: Arc::new(Semaphore::new(concurrency.max(1))),
            retry,
        }
    }

    /// Copies one object from the source into its destination folder.
    ///
    /// The object is staged in the scratch directory, which is cleaned up
    /// whether or not the upload succeeds.
    pub async fn transfer(
        &self,
        object: &ObjectKey,
        folders: &FolderMemo,
    ) -> Result<(), TransferError> {
        let _permit = self
            .limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)?;
        let scratch = scratch_path_for(&self.scratch_root, &object.subfolder, &object.filename)?;

        let result = self.download_then_upload(object, &scratch, folders).await;
        if let Err(err) = tokio::fs::remove_file(&scratch).await
            && err.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %scratch.display(), error = %err, "failed to remove scratch file");
        }
        result
    }

    async fn download_then_upload(
        &self,
        object: &ObjectKey,
        scratch: &Path,
        folders: &FolderMemo,
    ) -> Result<(), TransferError> {
        self.retry
            .run(
                "download",
                || self.source.download(&object.key, scratch),
                SourceError::is_retryable,
            )
            .await?;
        debug!(key = %object, "downloaded");

        folders.ensure(self.destination.as_ref(), &object.subfolder).await;

        self.retry
            .run(
                "upload",
                || {
                    self.destination
                        .upload(&object.subfolder, &object.filename, scratch)
                },
                DavError::is_retryable,
            )
            .await?;
        info!(key = %object, path = %object.remote_path(), "uploaded");
        Ok(())
    }
}
