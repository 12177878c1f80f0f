//! Destination side of the mirror: folders under a root collection on the
//! WebDAV file service.

use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use yadisk_dav::{CollectionStatus, DavClient, DavError};

#[async_trait]
pub trait Destination: Send + Sync {
    /// Creates the root collection every subfolder lives in.
    async fn ensure_root(&self) -> Result<CollectionStatus, DavError>;

    async fn ensure_folder(&self, subfolder: &str) -> Result<CollectionStatus, DavError>;

    /// Filenames in `subfolder`. A missing folder lists as empty.
    async fn list_folder(&self, subfolder: &str) -> Result<HashSet<String>, DavError>;

    /// Writes `source` as `subfolder/filename`, overwriting an existing file.
    async fn upload(&self, subfolder: &str, filename: &str, source: &Path)
    -> Result<(), DavError>;

    async fn exists(&self, subfolder: &str, filename: &str) -> Result<bool, DavError>;
}

#[derive(Clone)]
pub struct DavDestination {
    client: DavClient,
    root: String,
}

impl DavDestination {
    pub fn new(client: DavClient, root: impl Into<String>) -> Self {
        Self {
            client,
            root: root.into().trim_matches('/').to_string(),
        }
    }

    fn path(&self, parts: &[&str]) -> String {
        std::iter::once(self.root.as_str())
            .chain(parts.iter().copied())
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("/")
    }
}

#[async_trait]
impl Destination for DavDestination {
    async fn ensure_root(&self) -> Result<CollectionStatus, DavError> {
        self.client.create_collection(&self.path(&[])).await
    }

    async fn ensure_folder(&self, subfolder: &str) -> Result<CollectionStatus, DavError> {
        self.client
            .create_collection(&self.path(&[subfolder]))
            .await
    }

    async fn list_folder(&self, subfolder: &str) -> Result<HashSet<String>, DavError> {
        let entries = self
            .client
            .list_collection(&self.path(&[subfolder]))
            .await?;
        Ok(entries
            .into_iter()
            .filter(|entry| !entry.is_collection)
            .map(|entry| entry.name)
            .collect())
    }

    async fn upload(
        &self,
        subfolder: &str,
        filename: &str,
        source: &Path,
    ) -> Result<(), DavError> {
        self.client
            .put_file(&self.path(&[subfolder, filename]), source)
            .await
    }

    async fn exists(&self, subfolder: &str, filename: &str) -> Result<bool, DavError> {
        self.client
            .exists(&self.path(&[subfolder, filename]))
            .await
    }
}
