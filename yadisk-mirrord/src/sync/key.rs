use std::fmt;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("key is outside the watched prefix: {0}")]
    OutsidePrefix(String),
    #[error("key has no subfolder: {0}")]
    Ungrouped(String),
    #[error("key is nested below its subfolder: {0}")]
    Nested(String),
}

/// A source key of the form `<prefix>/<subfolder>/<filename>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub key: String,
    pub subfolder: String,
    pub filename: String,
}

impl ObjectKey {
    pub fn parse(key: &str, prefix: &str) -> Result<Self, KeyError> {
        let rest = if prefix.is_empty() {
            key
        } else {
            let trimmed = prefix.trim_end_matches('/');
            key.strip_prefix(trimmed)
                .and_then(|rest| rest.strip_prefix('/'))
                .ok_or_else(|| KeyError::OutsidePrefix(key.to_string()))?
        };

        let mut parts = rest.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(subfolder), Some(filename), None)
                if !subfolder.is_empty() && !filename.is_empty() =>
            {
                Ok(Self {
                    key: key.to_string(),
                    subfolder: subfolder.to_string(),
                    filename: filename.to_string(),
                })
            }
            (_, Some(_), Some(_)) => Err(KeyError::Nested(key.to_string())),
            _ => Err(KeyError::Ungrouped(key.to_string())),
        }
    }

    /// Path of the mirrored file below the destination root.
    pub fn remote_path(&self) -> String {
        format!("{}/{}", self.subfolder, self.filename)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Directory placeholders created by some S3 clients.
pub fn is_directory_marker(key: &str) -> bool {
    key.ends_with('/')
}
