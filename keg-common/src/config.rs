// keg-common/src/config.rs
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use super::error::{KegError, Result};

// Fallback if KEG_PREFIX is not set or is empty.
const DEFAULT_FALLBACK_KEG_ROOT: &str = "/opt/keg";
const DEFAULT_SYSTEM_PREFIX: &str = "/usr";
const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(60 * 60);
const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct Config {
    pub keg_root: PathBuf,
    pub recipes_dir: PathBuf,
    pub system_prefix: PathBuf,
    /// Upper bound for a single build step subprocess.
    pub step_timeout: Duration,
    /// Upper bound for a single test step subprocess.
    pub test_timeout: Duration,
    /// Leave build/test workspaces of failed runs on disk for inspection.
    pub keep_failed_workspaces: bool,
}

impl Config {
    pub fn load() -> Result<Self> {
        debug!("Loading keg configuration");

        let keg_root_str = env::var("KEG_PREFIX")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| {
                debug!(
                    "KEG_PREFIX environment variable not set or empty, falling back to default: {}",
                    DEFAULT_FALLBACK_KEG_ROOT
                );
                DEFAULT_FALLBACK_KEG_ROOT.to_string()
            });
        let mut config = Self::with_root(keg_root_str);

        if let Some(dir) = env::var_os("KEG_RECIPES").filter(|s| !s.is_empty()) {
            config.recipes_dir = PathBuf::from(dir);
        }
        if let Some(prefix) = env::var_os("KEG_SYSTEM_PREFIX").filter(|s| !s.is_empty()) {
            config.system_prefix = PathBuf::from(prefix);
        }
        if let Some(timeout) = duration_from_env("KEG_STEP_TIMEOUT")? {
            config.step_timeout = timeout;
        }
        if let Some(timeout) = duration_from_env("KEG_TEST_TIMEOUT")? {
            config.test_timeout = timeout;
        }
        config.keep_failed_workspaces = env::var("KEG_KEEP_FAILED").is_ok_and(|v| v == "1");

        debug!(
            "Configuration loaded: root={}, recipes={}",
            config.keg_root.display(),
            config.recipes_dir.display()
        );
        Ok(config)
    }

    /// Builds a configuration rooted at `root` with default settings, ignoring
    /// the process environment.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let keg_root = root.into();
        Self {
            recipes_dir: keg_root.join("Library").join("Recipes"),
            keg_root,
            system_prefix: PathBuf::from(DEFAULT_SYSTEM_PREFIX),
            step_timeout: DEFAULT_STEP_TIMEOUT,
            test_timeout: DEFAULT_TEST_TIMEOUT,
            keep_failed_workspaces: false,
        }
    }

    pub fn keg_root(&self) -> &Path {
        &self.keg_root
    }

    pub fn cellar_dir(&self) -> PathBuf {
        self.keg_root.join("Cellar")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.keg_root.join("keg_cache")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.keg_root.join("keg_logs")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.keg_root.join("tmp")
    }

    pub fn recipe_cellar_dir(&self, recipe_name: &str) -> PathBuf {
        self.cellar_dir().join(recipe_name)
    }

    pub fn keg_path(&self, recipe_name: &str, pkg_version: &str) -> PathBuf {
        self.recipe_cellar_dir(recipe_name).join(pkg_version)
    }
}

fn duration_from_env(key: &str) -> Result<Option<Duration>> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => humantime::parse_duration(raw.trim())
            .map(Some)
            .map_err(|e| KegError::Configuration(format!("Invalid duration in {key}='{raw}': {e}"))),
        _ => Ok(None),
    }
}

pub fn load_config() -> Result<Config> {
    Config::load()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_derive_from_root() {
        let config = Config::with_root("/tmp/kegroot");
        assert_eq!(config.cellar_dir(), PathBuf::from("/tmp/kegroot/Cellar"));
        assert_eq!(
            config.keg_path("libgccjit", "10.2.0_1"),
            PathBuf::from("/tmp/kegroot/Cellar/libgccjit/10.2.0_1")
        );
        assert_eq!(
            config.recipes_dir,
            PathBuf::from("/tmp/kegroot/Library/Recipes")
        );
        assert_eq!(config.system_prefix, PathBuf::from("/usr"));
        assert!(!config.keep_failed_workspaces);
    }
}
