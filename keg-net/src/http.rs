// keg-net/src/http.rs
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::StreamExt;
use keg_aio::checksum::{verify_checksum_async, verify_or_discard};
use keg_common::cache::Cache;
use keg_common::error::{KegError, Result};
use keg_common::model::plan::ActiveSource;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::{Client, StatusCode};
use tempfile::NamedTempFile;
use tokio::fs::File as TokioFile;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

use crate::validation::{validate_url, SourceLocation};

const DOWNLOAD_TIMEOUT_SECS: u64 = 300;
const CONNECT_TIMEOUT_SECS: u64 = 30;
const USER_AGENT_STRING: &str = "keg recipe evaluator (Rust)";

/// Returns a verified copy of `source` in the cache, downloading it if
/// needed. A cached file is re-verified on every call; a stale or corrupt one
/// is discarded and fetched again. The primary URL is tried first, then the
/// mirrors. A digest mismatch from any location is fatal.
pub async fn fetch_source(target_id: &str, source: &ActiveSource, cache: &Cache) -> Result<PathBuf> {
    let cache_path = cache.artifact_path(&source.sha256, &source.url);
    debug!(
        "Preparing to fetch '{}' from {} into {}",
        target_id,
        source.url,
        cache_path.display()
    );

    if cache_path.is_file() {
        match verify_checksum_async(&cache_path, &source.sha256).await {
            Ok(()) => {
                debug!("Using valid cached file: {}", cache_path.display());
                return Ok(cache_path);
            }
            Err(e) => {
                debug!("Cached file {} is unusable ({}). Refetching.", cache_path.display(), e);
                cache.clear_file(&cache_path)?;
            }
        }
    }

    let mut client: Option<Client> = None;
    let mut last_error: Option<KegError> = None;
    for url in source.candidates() {
        let location = validate_url(url)?;
        debug!("Attempting fetch from: {}", url);
        let attempt = match &location {
            SourceLocation::Local(path) => copy_and_verify(path, &cache_path, &source.sha256).await,
            SourceLocation::Remote(_) => {
                let c = match &client {
                    Some(c) => c.clone(),
                    None => client.insert(build_http_client()?).clone(),
                };
                download_and_verify(&c, url, &cache_path, &source.sha256).await
            }
        };
        match attempt {
            Ok(path) => return Ok(path),
            Err(e) if e.is_integrity() => return Err(e),
            Err(e) => {
                error!("Fetch attempt failed from {}: {}", url, e);
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        KegError::Download(
            target_id.to_string(),
            source.url.clone(),
            "All download attempts failed.".to_string(),
        )
    }))
}

/// A fresh hidden file next to `final_path`. Every attempt gets its own, so
/// concurrent fetches of the same artifact never share partial bytes.
fn partial_file(final_path: &Path) -> Result<NamedTempFile> {
    let dir = final_path.parent().unwrap_or_else(|| Path::new("."));
    let name = final_path.file_name().unwrap_or_default().to_string_lossy();
    Ok(tempfile::Builder::new()
        .prefix(&format!(".{name}."))
        .suffix(".part")
        .tempfile_in(dir)?)
}

async fn finish(partial: NamedTempFile, final_path: &Path, sha256_expected: &str) -> Result<PathBuf> {
    verify_or_discard(partial.path(), sha256_expected).await?;
    match partial.persist(final_path) {
        Ok(_) => debug!("Moved verified file to {}", final_path.display()),
        Err(e) => {
            // Another fetch may have published the same artifact meanwhile.
            if verify_checksum_async(final_path, sha256_expected).await.is_ok() {
                debug!("{} was published concurrently", final_path.display());
            } else {
                return Err(e.error.into());
            }
        }
    }
    Ok(final_path.to_path_buf())
}

async fn copy_and_verify(src: &Path, final_path: &Path, sha256_expected: &str) -> Result<PathBuf> {
    if !src.is_file() {
        return Err(KegError::NotFound(format!("Local source {} does not exist", src.display())));
    }
    let partial = partial_file(final_path)?;
    tokio::fs::copy(src, partial.path()).await?;
    finish(partial, final_path, sha256_expected).await
}

fn build_http_client() -> Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_STRING));
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    Ok(Client::builder()
        .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .default_headers(headers)
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()?)
}

async fn download_and_verify(
    client: &Client,
    url: &str,
    final_path: &Path,
    sha256_expected: &str,
) -> Result<PathBuf> {
    let response = client.get(url).send().await?;
    let status = response.status();
    debug!("Received HTTP status: {} for {}", status, url);
    if !status.is_success() {
        let file_name = final_path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let reason = match status {
            StatusCode::NOT_FOUND => "Resource not found (404)".to_string(),
            StatusCode::FORBIDDEN => "Access forbidden (403)".to_string(),
            other => format!("HTTP error {other}"),
        };
        return Err(KegError::Download(file_name, url.to_string(), reason));
    }

    let partial = partial_file(final_path)?;
    let mut file = TokioFile::from_std(partial.reopen()?);
    let mut stream = response.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    drop(file);
    debug!("Wrote {} bytes to {}", written, partial.path().display());

    finish(partial, final_path, sha256_expected).await
}
