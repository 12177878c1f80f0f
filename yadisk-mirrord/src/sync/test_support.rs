//! In-memory source and destination used by the sync tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use yadisk_dav::{CollectionStatus, DavError, StatusCode};

use super::backoff::{Backoff, RetryPolicy};
use super::ledger::Ledger;
use crate::destination::Destination;
use crate::source::{ObjectSource, SourceError};

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(
        Backoff::new(Duration::from_millis(1), Duration::from_millis(2), false),
        3,
    )
}

pub async fn memory_ledger() -> Ledger {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let ledger = Ledger::from_pool(pool);
    ledger.init().await.unwrap();
    ledger
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap()
}

fn permanent(what: &str) -> DavError {
    DavError::Api {
        status: StatusCode::FORBIDDEN,
        body: what.to_string(),
    }
}

#[derive(Default)]
pub struct FakeSource {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    downloads: Mutex<Vec<String>>,
    deletes: Mutex<Vec<String>>,
    failing_downloads: Mutex<HashSet<String>>,
    failing_listing: AtomicBool,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_objects<I, K, V>(objects: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<[u8]>,
    {
        let source = Self::new();
        lock(&source.objects).extend(
            objects
                .into_iter()
                .map(|(key, body)| (key.into(), body.as_ref().to_vec())),
        );
        source
    }

    pub fn fail_download(&self, key: &str) {
        lock(&self.failing_downloads).insert(key.to_string());
    }

    pub fn fail_listing(&self) {
        self.failing_listing.store(true, Ordering::SeqCst);
    }

    pub fn download_calls(&self) -> Vec<String> {
        let mut calls = lock(&self.downloads).clone();
        calls.sort();
        calls
    }

    pub fn delete_calls(&self) -> Vec<String> {
        lock(&self.deletes).clone()
    }

    pub fn contains(&self, key: &str) -> bool {
        lock(&self.objects).contains_key(key)
    }
}

#[async_trait]
impl ObjectSource for FakeSource {
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, SourceError> {
        if self.failing_listing.load(Ordering::SeqCst) {
            return Err(SourceError::Request {
                message: "listing disabled".into(),
                retryable: false,
            });
        }
        Ok(lock(&self.objects)
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn download(&self, key: &str, target: &Path) -> Result<(), SourceError> {
        lock(&self.downloads).push(key.to_string());
        if lock(&self.failing_downloads).contains(key) {
            return Err(SourceError::Request {
                message: format!("download of {key} refused"),
                retryable: false,
            });
        }
        let body = lock(&self.objects)
            .get(key)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(key.to_string()))?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(target, body).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), SourceError> {
        lock(&self.deletes).push(key.to_string());
        lock(&self.objects).remove(key);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeDestination {
    files: Mutex<HashMap<(String, String), Vec<u8>>>,
    mkcols: Mutex<Vec<String>>,
    uploads: Mutex<Vec<String>>,
    listings: Mutex<Vec<String>>,
    exists_checks: Mutex<Vec<String>>,
    failing_mkcols: Mutex<HashSet<String>>,
    failing_listings: Mutex<HashSet<String>>,
    failing_uploads: Mutex<HashSet<String>>,
    transient_upload_failures: AtomicUsize,
    failing_exists: AtomicBool,
}

impl FakeDestination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_files<'a>(files: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let destination = Self::new();
        for (subfolder, filename) in files {
            destination.place(subfolder, filename);
        }
        destination
    }

    /// Puts a file at the destination without going through `upload`.
    pub fn place(&self, subfolder: &str, filename: &str) {
        lock(&self.files).insert(
            (subfolder.to_string(), filename.to_string()),
            b"existing".to_vec(),
        );
    }

    pub fn remove(&self, subfolder: &str, filename: &str) {
        lock(&self.files).remove(&(subfolder.to_string(), filename.to_string()));
    }

    pub fn file(&self, subfolder: &str, filename: &str) -> Option<Vec<u8>> {
        lock(&self.files)
            .get(&(subfolder.to_string(), filename.to_string()))
            .cloned()
    }

    pub fn fail_mkcol(&self, folder: &str) {
        lock(&self.failing_mkcols).insert(folder.to_string());
    }

    pub fn fail_listing(&self, subfolder: &str) {
        lock(&self.failing_listings).insert(subfolder.to_string());
    }

    pub fn fail_upload(&self, subfolder: &str, filename: &str) {
        lock(&self.failing_uploads).insert(format!("{subfolder}/{filename}"));
    }

    pub fn fail_uploads_transiently(&self, count: usize) {
        self.transient_upload_failures
            .store(count, Ordering::SeqCst);
    }

    pub fn fail_exists(&self) {
        self.failing_exists.store(true, Ordering::SeqCst);
    }

    pub fn mkcol_calls(&self) -> Vec<String> {
        lock(&self.mkcols).clone()
    }

    pub fn upload_calls(&self) -> Vec<String> {
        let mut calls = lock(&self.uploads).clone();
        calls.sort();
        calls
    }

    pub fn listing_calls(&self) -> Vec<String> {
        let mut calls = lock(&self.listings).clone();
        calls.sort();
        calls
    }

    pub fn exists_calls(&self) -> Vec<String> {
        lock(&self.exists_checks).clone()
    }

    fn make_folder(&self, folder: &str) -> Result<CollectionStatus, DavError> {
        lock(&self.mkcols).push(folder.to_string());
        if lock(&self.failing_mkcols).contains(folder) {
            return Err(permanent("mkcol refused"));
        }
        Ok(CollectionStatus::Created)
    }
}

#[async_trait]
impl Destination for FakeDestination {
    async fn ensure_root(&self) -> Result<CollectionStatus, DavError> {
        self.make_folder("<root>")
    }

    async fn ensure_folder(&self, subfolder: &str) -> Result<CollectionStatus, DavError> {
        self.make_folder(subfolder)
    }

    async fn list_folder(&self, subfolder: &str) -> Result<HashSet<String>, DavError> {
        lock(&self.listings).push(subfolder.to_string());
        if lock(&self.failing_listings).contains(subfolder) {
            return Err(permanent("listing refused"));
        }
        Ok(lock(&self.files)
            .keys()
            .filter(|(folder, _)| folder == subfolder)
            .map(|(_, filename)| filename.clone())
            .collect())
    }

    async fn upload(
        &self,
        subfolder: &str,
        filename: &str,
        source: &Path,
    ) -> Result<(), DavError> {
        let target = format!("{subfolder}/{filename}");
        lock(&self.uploads).push(target.clone());
        if self
            .transient_upload_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DavError::Api {
                status: StatusCode::SERVICE_UNAVAILABLE,
                body: "try later".into(),
            });
        }
        if lock(&self.failing_uploads).contains(&target) {
            return Err(permanent("upload refused"));
        }
        let body = tokio::fs::read(source).await?;
        lock(&self.files).insert((subfolder.to_string(), filename.to_string()), body);
        Ok(())
    }

    async fn exists(&self, subfolder: &str, filename: &str) -> Result<bool, DavError> {
        lock(&self.exists_checks).push(format!("{subfolder}/{filename}"));
        if self.failing_exists.load(Ordering::SeqCst) {
            return Err(DavError::Api {
                status: StatusCode::BAD_GATEWAY,
                body: "unavailable".into(),
            });
        }
        Ok(self.file(subfolder, filename).is_some())
    }
}
