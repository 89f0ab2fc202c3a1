// keg-core/src/install/receipt.rs
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use keg_aio::fs::atomic_write_file;
use keg_common::error::Result;
use keg_common::model::plan::BuildPlan;
use keg_common::model::EnvironmentFacts;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::prune::PruneReport;

pub const RECEIPT_FILE: &str = "INSTALL_RECEIPT.json";

/// Written into the prefix once pruning is done, so it is never pruned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallReceipt {
    pub name: String,
    pub version: String,
    pub revision: u32,
    pub pkg_version: String,
    pub time: String,
    pub source_url: String,
    pub source_sha256: String,
    pub patches: Vec<String>,
    pub runtime_dependencies: Vec<String>,
    pub built_on: EnvironmentFacts,
    pub pruned_files: usize,
}

impl InstallReceipt {
    pub fn new(plan: &BuildPlan, prune: &PruneReport) -> Self {
        Self {
            name: plan.name.clone(),
            version: plan.version.clone(),
            revision: plan.revision,
            pkg_version: plan.pkg_version.clone(),
            time: humantime::format_rfc3339_seconds(SystemTime::now()).to_string(),
            source_url: plan.source.url.clone(),
            source_sha256: plan.source.sha256.clone(),
            patches: plan.patches.iter().map(|p| p.url.clone()).collect(),
            runtime_dependencies: plan.runtime_dependencies().map(|d| d.name.clone()).collect(),
            built_on: plan.facts.clone(),
            pruned_files: prune.removed.len(),
        }
    }
}

pub fn write_receipt(plan: &BuildPlan, prune: &PruneReport) -> Result<PathBuf> {
    let path = plan.prefix.join(RECEIPT_FILE);
    let receipt = InstallReceipt::new(plan, prune);
    atomic_write_file(&path, &serde_json::to_vec_pretty(&receipt)?)?;
    debug!("Wrote receipt {}", path.display());
    Ok(path)
}

pub fn read_receipt(prefix: &Path) -> Result<InstallReceipt> {
    let raw = std::fs::read(prefix.join(RECEIPT_FILE))?;
    Ok(serde_json::from_slice(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_plan;

    #[test]
    fn receipt_round_trips_through_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let plan = sample_plan(dir.path());
        std::fs::create_dir_all(&plan.prefix).unwrap();
        let prune = PruneReport {
            removed: vec![plan.prefix.join("drop.txt")],
            kept: 1,
        };
        write_receipt(&plan, &prune).unwrap();

        let receipt = read_receipt(&plan.prefix).unwrap();
        assert_eq!(receipt.name, "demo");
        assert_eq!(receipt.pkg_version, "1.0");
        assert_eq!(receipt.pruned_files, 1);
        assert_eq!(receipt.built_on, plan.facts);
    }
}
