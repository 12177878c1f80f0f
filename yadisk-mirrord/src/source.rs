//! Source side of the mirror: an S3-compatible bucket.

use std::fmt;
use std::io;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::timeout::TimeoutConfig;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("object storage request failed: {message}")]
    Request { message: String, retryable: bool },
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SourceError::Request { retryable, .. } => *retryable,
            SourceError::NotFound(_) => false,
            SourceError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
            ),
        }
    }
}

/// Object store operations a reconciliation pass needs.
#[async_trait]
pub trait ObjectSource: Send + Sync {
    /// Every key under `prefix`, across all result pages.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, SourceError>;

    /// Writes the object body to `target`, creating parent directories.
    async fn download(&self, key: &str, target: &Path) -> Result<(), SourceError>;

    async fn delete(&self, key: &str) -> Result<(), SourceError>;
}

#[derive(Clone)]
pub struct S3Settings {
    pub bucket: String,
    pub endpoint: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub force_path_style: bool,
    pub timeout: Duration,
}

impl fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Settings")
            .field("bucket", &self.bucket)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("force_path_style", &self.force_path_style)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

pub struct S3Source {
    client: Client,
    bucket: String,
}

impl S3Source {
    pub fn new(settings: &S3Settings) -> Self {
        let credentials = aws_credential_types::Credentials::new(
            &settings.access_key_id,
            &settings.secret_access_key,
            None,
            None,
            "yadisk-mirrord",
        );
        let timeouts = TimeoutConfig::builder()
            .connect_timeout(settings.timeout)
            .operation_attempt_timeout(settings.timeout)
            .build();

        let config = aws_sdk_s3::Config::builder()
            .region(aws_types::region::Region::new(settings.region.clone()))
            .credentials_provider(credentials)
            .endpoint_url(&settings.endpoint)
            .force_path_style(settings.force_path_style)
            .timeout_config(timeouts)
            .behavior_version_latest()
            .build();

        Self::from_client(Client::from_conf(config), settings.bucket.clone())
    }

    pub fn from_client(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl ObjectSource for S3Source {
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, SourceError> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|err| map_sdk_error("list objects", err))?;

            keys.extend(
                output
                    .contents()
                    .iter()
                    .filter_map(|object| object.key().map(str::to_string)),
            );

            match (output.is_truncated(), output.next_continuation_token()) {
                (Some(true), Some(token)) => continuation = Some(token.to_string()),
                _ => break,
            }
        }
        debug!(bucket = %self.bucket, prefix, count = keys.len(), "listed source keys");
        Ok(keys)
    }

    async fn download(&self, key: &str, target: &Path) -> Result<(), SourceError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                if err
                    .as_service_error()
                    .is_some_and(|service| service.is_no_such_key())
                {
                    SourceError::NotFound(key.to_string())
                } else {
                    map_sdk_error("get object", err)
                }
            })?;

        let parent = target
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "target has no parent"))?;
        tokio::fs::create_dir_all(parent).await?;

        // The staging file is created exclusively under a random name, so no
        // key's scratch path can ever share it. Dropping `partial` removes it.
        let (std_file, partial) = tempfile::Builder::new()
            .prefix(".download-")
            .suffix(".partial")
            .tempfile_in(parent)?
            .into_parts();
        let mut file = tokio::fs::File::from_std(std_file);
        let mut body = output.body.into_async_read();
        tokio::io::copy(&mut body, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;
        partial.persist(target).map_err(|err| err.error)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), SourceError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| map_sdk_error("delete object", err))?;
        Ok(())
    }
}

fn map_sdk_error<E>(operation: &str, err: SdkError<E>) -> SourceError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let retryable = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            true
        }
        SdkError::ServiceError(service) => {
            let status = service.raw().status().as_u16();
            status == 429 || status >= 500
        }
        _ => false,
    };
    SourceError::Request {
        message: format!("{operation}: {}", DisplayErrorContext(&err)),
        retryable,
    }
}
