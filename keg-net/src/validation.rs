// keg-net/src/validation.rs
use std::path::PathBuf;

use keg_common::error::{KegError, Result};
use url::Url;

/// Where an artifact is fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocation {
    Remote(Url),
    Local(PathBuf),
}

/// Accepts `https://` and `file://` URLs and plain absolute paths. Anything
/// else, including `http://`, is a validation error.
pub fn validate_url(url_str: &str) -> Result<SourceLocation> {
    if url_str.starts_with('/') {
        return Ok(SourceLocation::Local(PathBuf::from(url_str)));
    }
    let url = Url::parse(url_str)
        .map_err(|e| KegError::Validation(format!("Failed to parse URL '{url_str}': {e}")))?;
    match url.scheme() {
        "https" => Ok(SourceLocation::Remote(url)),
        "file" => url
            .to_file_path()
            .map(SourceLocation::Local)
            .map_err(|_| KegError::Validation(format!("Invalid file URL '{url_str}'"))),
        other => Err(KegError::Validation(format!(
            "Invalid URL scheme for '{url_str}': must be https or file, but got '{other}'"
        ))),
    }
}
