// keg-common/src/cache.rs
// Download cache: fetched sources and patches keyed by their digest.

use std::fs;
use std::path::{Path, PathBuf};

use super::error::Result;
use crate::Config;

#[derive(Debug, Clone)]
pub struct Cache {
    cache_dir: PathBuf,
}

impl Cache {
    pub fn new(config: &Config) -> Result<Self> {
        Self::at(config.cache_dir())
    }

    pub fn at(cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let cache_dir = cache_dir.into();
        if !cache_dir.exists() {
            fs::create_dir_all(&cache_dir)?;
        }
        Ok(Self { cache_dir })
    }

    pub fn get_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Cache location for an artifact: `<sha256 prefix>--<url basename>`.
    /// Keyed by digest so two recipes sharing a file name never collide.
    pub fn artifact_path(&self, sha256: &str, url: &str) -> PathBuf {
        let base = url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .and_then(|s| s.split(['?', '#']).next())
            .filter(|s| !s.is_empty())
            .unwrap_or("download");
        let short = &sha256[..sha256.len().min(16)];
        self.cache_dir.join(format!("{}--{base}", short.to_ascii_lowercase()))
    }

    pub fn clear_file(&self, path: &Path) -> Result<()> {
        if path.starts_with(&self.cache_dir) && path.exists() {
            tracing::debug!("Removing cached file {}", path.display());
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_path_uses_digest_and_basename() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::at(dir.path()).unwrap();
        let path = cache.artifact_path(
            "ABCDEF0123456789aaaa",
            "https://ftp.gnu.org/gnu/gcc/gcc-10.2.0.tar.xz?raw=1",
        );
        assert_eq!(path, dir.path().join("abcdef0123456789--gcc-10.2.0.tar.xz"));
    }

    #[test]
    fn clear_file_stays_inside_cache() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::NamedTempFile::new().unwrap();
        let cache = Cache::at(dir.path().join("c")).unwrap();
        cache.clear_file(outside.path()).unwrap();
        assert!(outside.path().exists());
    }
}
