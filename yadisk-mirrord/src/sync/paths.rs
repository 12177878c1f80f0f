use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("scratch path segment is empty")]
    Empty,
    #[error("scratch path segment contains unsupported component: {0}")]
    UnsupportedComponent(String),
}

/// Maps a `(subfolder, filename)` pair to a file under `scratch_root`.
///
/// Each part must be a single plain path component so that a crafted key can
/// never escape the scratch directory.
pub fn scratch_path_for(
    scratch_root: &Path,
    subfolder: &str,
    filename: &str,
) -> Result<PathBuf, PathError> {
    let mut out = scratch_root.to_path_buf();
    for part in [subfolder, filename] {
        if part.is_empty() {
            return Err(PathError::Empty);
        }
        let mut components = Path::new(part).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(segment)), None) => out.push(segment),
            _ => return Err(PathError::UnsupportedComponent(part.to_string())),
        }
    }
    Ok(out)
}
