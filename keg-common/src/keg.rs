// keg-common/src/keg.rs
use std::fs;
use std::path::PathBuf;

use tracing::{debug, warn};

use super::config::Config;
use super::error::Result;
use super::model::version::lenient_version;

/// Represents an installed package version (a keg) in the Cellar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledKeg {
    pub name: String,
    pub pkg_version: String,
    pub path: PathBuf,
}

/// Queries installed kegs under `<root>/Cellar`.
#[derive(Debug, Clone)]
pub struct KegRegistry {
    config: Config,
}

impl KegRegistry {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn cellar_path(&self) -> PathBuf {
        self.config.cellar_dir()
    }

    /// Newest installed keg for `name`, if any. Versions are compared as
    /// lenient semver, falling back to string order when one does not parse.
    pub fn get_installed_keg(&self, name: &str) -> Result<Option<InstalledKeg>> {
        let recipe_dir = self.config.recipe_cellar_dir(name);
        if !recipe_dir.is_dir() {
            debug!("[KEG_REGISTRY:{name}] no cellar directory at {}", recipe_dir.display());
            return Ok(None);
        }

        let mut latest: Option<InstalledKeg> = None;
        for keg in self.kegs_in(name, &recipe_dir)? {
            let newer = match &latest {
                None => true,
                Some(current) => is_newer(&keg.pkg_version, &current.pkg_version),
            };
            if newer {
                latest = Some(keg);
            }
        }

        match &latest {
            Some(keg) => debug!("[KEG_REGISTRY:{name}] latest keg {}", keg.path.display()),
            None => debug!("[KEG_REGISTRY:{name}] no keg versions in {}", recipe_dir.display()),
        }
        Ok(latest)
    }

    fn kegs_in(&self, name: &str, recipe_dir: &std::path::Path) -> Result<Vec<InstalledKeg>> {
        let mut kegs = Vec::new();
        for entry in fs::read_dir(recipe_dir)? {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("[KEG_REGISTRY:{name}] error reading version entry: {e}. Skipping.");
                    continue;
                }
            };
            let path = entry.path();
            // Half-written installs are staged under a leading dot.
            match path.file_name().and_then(|n| n.to_str()) {
                Some(version) if path.is_dir() && !version.starts_with('.') => {
                    kegs.push(InstalledKeg {
                        name: name.to_string(),
                        pkg_version: version.to_string(),
                        path: path.clone(),
                    });
                }
                _ => debug!("[KEG_REGISTRY:{name}] ignoring {}", path.display()),
            }
        }
        Ok(kegs)
    }
}

fn is_newer(candidate: &str, current: &str) -> bool {
    // `_N` revision suffix sorts after the bare version.
    let split = |v: &str| match v.rsplit_once('_') {
        Some((base, rev)) if rev.chars().all(|c| c.is_ascii_digit()) => {
            (base.to_string(), rev.parse::<u32>().unwrap_or(0))
        }
        _ => (v.to_string(), 0),
    };
    let (cand_base, cand_rev) = split(candidate);
    let (cur_base, cur_rev) = split(current);
    match (lenient_version(&cand_base), lenient_version(&cur_base)) {
        (Ok(a), Ok(b)) if a != b => a > b,
        (Ok(_), Ok(_)) => cand_rev > cur_rev,
        _ => candidate > current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_newest_semver_keg() {
        let root = tempfile::tempdir().unwrap();
        let config = Config::with_root(root.path());
        for v in ["9.3.0", "10.2.0", "10.2.0_1", ".10.3.0"] {
            fs::create_dir_all(config.keg_path("gcc", v)).unwrap();
        }
        let registry = KegRegistry::new(config);
        let keg = registry.get_installed_keg("gcc").unwrap().unwrap();
        assert_eq!(keg.pkg_version, "10.2.0_1");
        assert!(registry.get_installed_keg("gmp").unwrap().is_none());
    }

    #[test]
    fn revision_ordering() {
        assert!(is_newer("1.0_2", "1.0_1"));
        assert!(is_newer("1.1", "1.0_9"));
        assert!(!is_newer("1.0", "1.0_1"));
    }
}
