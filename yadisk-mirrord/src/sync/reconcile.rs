//! One reconciliation pass: enumerate the source, build the destination
//! index, transfer what is missing, then apply the deletion policy.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use yadisk_dav::DavError;

use super::backoff::RetryPolicy;
use super::index::ExistingIndex;
use super::key::{ObjectKey, is_directory_marker};
use super::ledger::{Ledger, LedgerError};
use super::transfer::{FolderMemo, TransferStage};
use crate::destination::Destination;
use crate::source::{ObjectSource, SourceError};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("source error: {0}")]
    Source(#[from] SourceError),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// What happens to source objects after the transfer stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeletePolicy {
    /// Never delete.
    #[default]
    Keep,
    /// Delete objects the destination does not hold.
    Missing,
    /// Delete objects once the destination holds them.
    Uploaded,
}

impl FromStr for DeletePolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "keep" | "off" | "none" => Ok(DeletePolicy::Keep),
            "missing" => Ok(DeletePolicy::Missing),
            "uploaded" | "move" => Ok(DeletePolicy::Uploaded),
            other => Err(format!("unknown delete policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassStage {
    ListingSource,
    BuildingIndex,
    Transferring,
    Deleting,
    Done,
}

impl fmt::Display for PassStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PassStage::ListingSource => "listing_source",
            PassStage::BuildingIndex => "building_index",
            PassStage::Transferring => "transferring",
            PassStage::Deleting => "deleting",
            PassStage::Done => "done",
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Keys listed under the prefix, directory markers excluded.
    pub enumerated: usize,
    /// Keys not shaped `prefix/subfolder/filename`.
    pub rejected: usize,
    /// Keys already present at the destination.
    pub skipped: usize,
    pub uploaded: usize,
    pub transfer_failed: usize,
    pub deleted: usize,
    /// Deletion candidates kept because the direct check disagreed.
    pub kept: usize,
    pub delete_failed: usize,
}

/// State owned by a single pass.
#[derive(Debug, Default)]
pub struct PassContext {
    pub index: ExistingIndex,
    pub folders: FolderMemo,
    /// Subfolders whose destination listing failed; their index entries are
    /// a guess, not an observation.
    degraded: Mutex<HashSet<String>>,
}

impl PassContext {
    pub fn new(index: ExistingIndex) -> Self {
        Self {
            index,
            ..Self::default()
        }
    }

    pub fn mark_degraded(&self, subfolder: &str) {
        self.degraded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(subfolder.to_string());
    }

    pub fn is_degraded(&self, subfolder: &str) -> bool {
        self.degraded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(subfolder)
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub prefix: String,
    pub concurrency: usize,
    pub delete_policy: DeletePolicy,
    pub retry: RetryPolicy,
}

enum KeyOutcome {
    Uploaded,
    Failed,
}

enum DeleteOutcome {
    Deleted,
    Kept,
    Failed,
}

pub struct Reconciler {
    source: Arc<dyn ObjectSource>,
    destination: Arc<dyn Destination>,
    transfer: TransferStage,
    ledger: Option<Ledger>,
    settings: ReconcileSettings,
}

impl Reconciler {
    pub fn new(
        source: Arc<dyn ObjectSource>,
        destination: Arc<dyn Destination>,
        transfer: TransferStage,
        ledger: Option<Ledger>,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            source,
            destination,
            transfer,
            ledger,
            settings,
        }
    }

    pub async fn run_pass(&self) -> Result<PassReport, ReconcileError> {
        let (report, _) = self.run_pass_with_context().await?;
        Ok(report)
    }

    /// Runs a pass and hands back its context, so callers can inspect the
    /// final state of the index.
    pub async fn run_pass_with_context(
        &self,
    ) -> Result<(PassReport, PassContext), ReconcileError> {
        let mut report = PassReport::default();

        enter(PassStage::ListingSource);
        let objects = self.enumerate(&mut report).await?;

        enter(PassStage::BuildingIndex);
        let ctx = self.build_context(&objects).await?;
        debug!(entries = ctx.index.len(), "destination index built");

        enter(PassStage::Transferring);
        self.transfer_missing(&ctx, &objects, &mut report).await;

        if self.settings.delete_policy != DeletePolicy::Keep {
            enter(PassStage::Deleting);
            self.apply_deletions(&ctx, &objects, &mut report).await;
        }

        enter(PassStage::Done);
        Ok((report, ctx))
    }

    async fn enumerate(&self, report: &mut PassReport) -> Result<Vec<ObjectKey>, ReconcileError> {
        let prefix = self.settings.prefix.as_str();
        let keys = self
            .settings
            .retry
            .run(
                "list source",
                || self.source.list_keys(prefix),
                SourceError::is_retryable,
            )
            .await?;

        let mut objects = Vec::with_capacity(keys.len());
        for key in keys.iter().filter(|key| !is_directory_marker(key)) {
            report.enumerated += 1;
            match ObjectKey::parse(key, prefix) {
                Ok(object) => objects.push(object),
                Err(err) => {
                    warn!(error = %err, "rejecting key");
                    report.rejected += 1;
                }
            }
        }
        info!(
            enumerated = report.enumerated,
            rejected = report.rejected,
            "enumerated source"
        );
        Ok(objects)
    }

    /// With a ledger, presence is taken from the ledger alone. Without one,
    /// every subfolder seen in this pass is listed at the destination.
    pub async fn build_context(&self, objects: &[ObjectKey]) -> Result<PassContext, ReconcileError> {
        if let Some(ledger) = &self.ledger {
            let rows = ledger.present_rows().await?;
            return Ok(PassContext::new(ExistingIndex::from_entries(
                rows.into_iter().map(|row| (row.subfolder, row.filename)),
            )));
        }

        let subfolders: BTreeSet<&str> = objects
            .iter()
            .map(|object| object.subfolder.as_str())
            .collect();
        let ctx = PassContext::default();
        let limit = Semaphore::new(self.concurrency());
        join_all(
            subfolders
                .into_iter()
                .map(|subfolder| self.index_folder(&ctx, &limit, subfolder)),
        )
        .await;
        Ok(ctx)
    }

    /// A failed listing indexes the folder as empty and marks it degraded.
    async fn index_folder(&self, ctx: &PassContext, limit: &Semaphore, subfolder: &str) {
        let listed = match limit.acquire().await {
            Ok(_permit) => self.list_folder(subfolder).await.map_err(|err| err.to_string()),
            Err(err) => Err(err.to_string()),
        };
        let files = match listed {
            Ok(files) => files,
            Err(err) => {
                warn!(subfolder, error = %err, "destination listing failed, treating folder as empty");
                ctx.mark_degraded(subfolder);
                HashSet::new()
            }
        };
        ctx.index.replace_folder(subfolder, files);
    }

    async fn list_folder(&self, subfolder: &str) -> Result<HashSet<String>, DavError> {
        self.settings
            .retry
            .run(
                "list destination folder",
                || self.destination.list_folder(subfolder),
                DavError::is_retryable,
            )
            .await
    }

    pub async fn transfer_missing(
        &self,
        ctx: &PassContext,
        objects: &[ObjectKey],
        report: &mut PassReport,
    ) {
        let mut pending = Vec::new();
        for object in objects {
            if ctx.index.contains(&object.subfolder, &object.filename) {
                debug!(key = %object, "already at destination");
                report.skipped += 1;
            } else {
                pending.push(object);
            }
        }

        // The transfer stage's own limiter bounds how many run at once.
        let outcomes = join_all(
            pending
                .into_iter()
                .map(|object| self.transfer_one(ctx, object)),
        )
        .await;
        for outcome in outcomes {
            match outcome {
                KeyOutcome::Uploaded => report.uploaded += 1,
                KeyOutcome::Failed => report.transfer_failed += 1,
            }
        }
        info!(
            uploaded = report.uploaded,
            skipped = report.skipped,
            failed = report.transfer_failed,
            "transfer stage finished"
        );
    }

    async fn transfer_one(&self, ctx: &PassContext, object: &ObjectKey) -> KeyOutcome {
        if let Err(err) = self.transfer.transfer(object, &ctx.folders).await {
            warn!(key = %object, error = %err, "transfer failed");
            return KeyOutcome::Failed;
        }
        ctx.index.insert(&object.subfolder, &object.filename);
        self.record_present(object).await;
        KeyOutcome::Uploaded
    }

    pub async fn apply_deletions(
        &self,
        ctx: &PassContext,
        objects: &[ObjectKey],
        report: &mut PassReport,
    ) {
        for object in objects {
            let indexed = ctx.index.contains(&object.subfolder, &object.filename);
            let outcome = match self.settings.delete_policy {
                DeletePolicy::Keep => continue,
                DeletePolicy::Missing if indexed => continue,
                DeletePolicy::Uploaded if !indexed => continue,
                DeletePolicy::Missing => self.delete_if_missing(ctx, object).await,
                DeletePolicy::Uploaded => self.delete_if_uploaded(ctx, object).await,
            };
            match outcome {
                DeleteOutcome::Deleted => report.deleted += 1,
                DeleteOutcome::Kept => report.kept += 1,
                DeleteOutcome::Failed => report.delete_failed += 1,
            }
        }
        info!(
            deleted = report.deleted,
            kept = report.kept,
            failed = report.delete_failed,
            "deletion stage finished"
        );
    }

    async fn delete_if_missing(&self, ctx: &PassContext, object: &ObjectKey) -> DeleteOutcome {
        // Only a successful listing taken in this pass may stand in for a
        // direct check.
        if self.ledger.is_some() || ctx.is_degraded(&object.subfolder) {
            match self.check_exists(object).await {
                Ok(false) => {}
                Ok(true) => {
                    info!(key = %object, "index was stale, destination holds the file");
                    ctx.index.insert(&object.subfolder, &object.filename);
                    self.record_present(object).await;
                    return DeleteOutcome::Kept;
                }
                Err(err) => {
                    warn!(key = %object, error = %err, "existence check failed, keeping source object");
                    return DeleteOutcome::Failed;
                }
            }
        }

        if let Err(err) = self.delete_source(object).await {
            warn!(key = %object, error = %err, "failed to delete source object");
            return DeleteOutcome::Failed;
        }
        info!(key = %object, "deleted source object missing at destination");
        self.record_absent(object).await;
        DeleteOutcome::Deleted
    }

    async fn delete_if_uploaded(&self, ctx: &PassContext, object: &ObjectKey) -> DeleteOutcome {
        match self.check_exists(object).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(key = %object, "destination no longer holds the file, keeping source object");
                ctx.index.remove(&object.subfolder, &object.filename);
                self.record_absent(object).await;
                return DeleteOutcome::Kept;
            }
            Err(err) => {
                warn!(key = %object, error = %err, "existence check failed, keeping source object");
                return DeleteOutcome::Failed;
            }
        }

        if let Err(err) = self.delete_source(object).await {
            warn!(key = %object, error = %err, "failed to delete source object");
            return DeleteOutcome::Failed;
        }
        info!(key = %object, "deleted mirrored source object");
        DeleteOutcome::Deleted
    }

    async fn check_exists(&self, object: &ObjectKey) -> Result<bool, DavError> {
        self.settings
            .retry
            .run(
                "destination existence check",
                || self.destination.exists(&object.subfolder, &object.filename),
                DavError::is_retryable,
            )
            .await
    }

    async fn delete_source(&self, object: &ObjectKey) -> Result<(), SourceError> {
        self.settings
            .retry
            .run(
                "delete source object",
                || self.source.delete(&object.key),
                SourceError::is_retryable,
            )
            .await
    }

    async fn record_present(&self, object: &ObjectKey) {
        if let Some(ledger) = &self.ledger
            && let Err(err) = ledger.upsert_present(object).await
        {
            warn!(key = %object, error = %err, "failed to record key in ledger");
        }
    }

    async fn record_absent(&self, object: &ObjectKey) {
        if let Some(ledger) = &self.ledger
            && let Err(err) = ledger.mark_absent(object).await
        {
            warn!(key = %object, error = %err, "failed to mark key absent in ledger");
        }
    }

    fn concurrency(&self) -> usize {
        self.settings.concurrency.max(1)
    }
}

fn enter(stage: PassStage) {
    info!(%stage, "pass stage");
}

#[cfg(test)]
#[path = "reconcile_tests.rs"]
mod tests;
