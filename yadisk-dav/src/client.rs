use std::path::Path;
use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use thiserror::Error;
use tokio_util::io::ReaderStream;
use url::Url;

use crate::multistatus::{DavEntry, parse_multistatus};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum DavError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("url cannot carry a path: {0}")]
    CannotBeBase(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("malformed multistatus response: {0}")]
    Parse(String),
    #[error("invalid request method: {0}")]
    Method(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

/// Outcome of a successful MKCOL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionStatus {
    Created,
    AlreadyExists,
}

#[derive(Clone)]
pub struct DavClient {
    http: Client,
    base_url: Url,
    login: String,
    password: String,
}

impl DavClient {
    pub fn with_base_url(
        base_url: &str,
        login: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, DavError> {
        Self::with_timeout(base_url, login, password, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        base_url: &str,
        login: impl Into<String>,
        password: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, DavError> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(DavError::CannotBeBase(base_url.to_string()));
        }
        Ok(Self {
            http: Client::builder().timeout(timeout).build()?,
            base_url,
            login: login.into(),
            password: password.into(),
        })
    }

    /// Creates the collection at `path`. Both a fresh collection and one that
    /// already exists count as success.
    pub async fn create_collection(&self, path: &str) -> Result<CollectionStatus, DavError> {
        let url = self.resource_url(path)?;
        let response = self
            .http
            .request(dav_method("MKCOL")?, url)
            .basic_auth(&self.login, Some(&self.password))
            .send()
            .await?;
        match response.status() {
            StatusCode::CREATED => Ok(CollectionStatus::Created),
            StatusCode::METHOD_NOT_ALLOWED => Ok(CollectionStatus::AlreadyExists),
            _ => Err(Self::api_error(response).await),
        }
    }

    /// Lists the direct children of the collection at `path`.
    ///
    /// A missing collection yields an empty listing.
    pub async fn list_collection(&self, path: &str) -> Result<Vec<DavEntry>, DavError> {
        let url = self.resource_url(path)?;
        let response = self
            .http
            .request(dav_method("PROPFIND")?, url.clone())
            .basic_auth(&self.login, Some(&self.password))
            .header("Depth", "1")
            .send()
            .await?;
        match response.status() {
            StatusCode::MULTI_STATUS => {
                let body = response.text().await?;
                let entries = parse_multistatus(&body)?;
                let own_path = normalize_path(url.path());
                Ok(entries
                    .into_iter()
                    .filter(|entry| entry.path.trim_end_matches('/') != own_path)
                    .collect())
            }
            StatusCode::NOT_FOUND => Ok(Vec::new()),
            _ => Err(Self::api_error(response).await),
        }
    }

    /// Uploads the file at `source` to `path`, replacing any existing file.
    pub async fn put_file(&self, path: &str, source: &Path) -> Result<(), DavError> {
        let url = self.resource_url(path)?;
        let file = tokio::fs::File::open(source).await?;
        let length = file.metadata().await?.len();
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let response = self
            .http
            .put(url)
            .basic_auth(&self.login, Some(&self.password))
            .header(reqwest::header::CONTENT_LENGTH, length)
            .body(body)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::api_error(response).await)
        }
    }

    pub async fn exists(&self, path: &str) -> Result<bool, DavError> {
        let url = self.resource_url(path)?;
        let response = self
            .http
            .head(url)
            .basic_auth(&self.login, Some(&self.password))
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(Self::api_error(response).await),
        }
    }

    fn resource_url(&self, path: &str) -> Result<Url, DavError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| DavError::CannotBeBase(self.base_url.to_string()))?;
            segments.pop_if_empty();
            segments.extend(path.split('/').filter(|segment| !segment.is_empty()));
        }
        Ok(url)
    }

    async fn api_error(response: reqwest::Response) -> DavError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        DavError::Api { status, body }
    }
}

impl DavError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            DavError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            DavError::Request(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            _ => matches!(
                self.classification(),
                Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
            ),
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

fn dav_method(name: &'static str) -> Result<Method, DavError> {
    Method::from_bytes(name.as_bytes()).map_err(|_| DavError::Method(name))
}

fn normalize_path(path: &str) -> String {
    let decoded = percent_encoding::percent_decode_str(path).decode_utf8_lossy();
    decoded.trim_end_matches('/').to_string()
}
