// keg-core/src/prune.rs
// Post-install pruning. Directories always survive; every other entry
// (symlinks included) survives only if its basename passes a keep rule.

use std::fs;
use std::path::{Path, PathBuf};

use glob::Pattern;
use keg_aio::fs::is_within;
use keg_common::error::{KegError, Result};
use keg_common::model::recipe::AllowRule;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    /// Removed entries, in walk order.
    pub removed: Vec<PathBuf>,
    /// Non-directory entries left in place.
    pub kept: usize,
}

enum KeepRule {
    Prefix(String),
    Glob(Pattern),
}

impl KeepRule {
    fn compile(rule: &AllowRule) -> Result<Self> {
        match rule {
            AllowRule::Prefix(prefix) => Ok(Self::Prefix(prefix.clone())),
            AllowRule::Glob { glob } => Pattern::new(glob).map(Self::Glob).map_err(|e| {
                KegError::Configuration(format!("Invalid keep glob '{glob}': {e}"))
            }),
        }
    }

    fn keeps(&self, basename: &str) -> bool {
        match self {
            Self::Prefix(prefix) => basename.starts_with(prefix.as_str()),
            Self::Glob(pattern) => pattern.matches(basename),
        }
    }
}

/// Removes every non-directory entry under `prefix` whose basename fails all
/// `rules`. An empty rule list prunes nothing.
#[instrument(skip(rules), fields(rules = rules.len()))]
pub fn prune(prefix: &Path, rules: &[AllowRule]) -> Result<PruneReport> {
    let mut report = PruneReport::default();
    if rules.is_empty() {
        debug!("No keep rules for {}, skipping prune", prefix.display());
        return Ok(report);
    }
    let rules = rules.iter().map(KeepRule::compile).collect::<Result<Vec<_>>>()?;

    let mut doomed = Vec::new();
    for entry in WalkDir::new(prefix)
        .follow_links(false)
        .follow_root_links(false)
        .min_depth(1)
    {
        let entry = entry.map_err(std::io::Error::from)?;
        // Symlinks report their own type here, so a link to a directory is
        // treated like a file and never descended into.
        if entry.file_type().is_dir() {
            continue;
        }
        let basename = entry.file_name().to_string_lossy();
        if rules.iter().any(|rule| rule.keeps(&basename)) {
            report.kept += 1;
        } else {
            doomed.push(entry.into_path());
        }
    }

    for path in doomed {
        if !is_within(prefix, &path) {
            warn!("Refusing to remove {} outside {}", path.display(), prefix.display());
            continue;
        }
        let meta = fs::symlink_metadata(&path)?;
        if meta.is_dir() {
            continue;
        }
        debug!("Pruning {}", path.display());
        fs::remove_file(&path)?;
        report.removed.push(path);
    }
    info!(
        "Pruned {} entries from {} ({} kept)",
        report.removed.len(),
        prefix.display(),
        report.kept
    );
    Ok(report)
}

/// [`prune`] on the blocking pool, so a large prefix never stalls other
/// installs sharing the runtime.
pub async fn prune_async(prefix: &Path, rules: &[AllowRule]) -> Result<PruneReport> {
    let prefix = prefix.to_path_buf();
    let rules = rules.to_vec();
    tokio::task::spawn_blocking(move || prune(&prefix, &rules))
        .await
        .map_err(|e| KegError::Generic(format!("JoinError in prune: {e}")))?
}
