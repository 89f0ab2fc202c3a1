// keg-core/src/pipeline/engine.rs
// Several unrelated installs at once. Only the read-only formulary and the
// cache directory are shared; every job gets its own prefix and workspace.

use std::collections::BTreeSet;
use std::time::Instant;

use futures::future::join_all;
use keg_common::error::{KegError, Result};
use keg_common::model::EnvironmentFacts;
use keg_common::pipeline::InstallEvent;
use tracing::{debug, info, instrument};

use crate::install::{InstallResult, Installer};

/// Runs every install concurrently and returns the results in input order.
/// Duplicate names are rejected before anything starts.
#[instrument(skip_all, fields(jobs = names.len()))]
pub async fn install_many(
    installer: &Installer,
    names: &[String],
    facts: &EnvironmentFacts,
) -> Result<Vec<(String, InstallResult)>> {
    let mut seen = BTreeSet::new();
    for name in names {
        if !seen.insert(name.as_str()) {
            return Err(KegError::Configuration(format!(
                "'{name}' was requested more than once"
            )));
        }
    }

    let started = Instant::now();
    installer.emit(InstallEvent::PipelineStarted {
        total_jobs: names.len(),
    });
    debug!("Starting {} install jobs", names.len());

    let results = join_all(names.iter().map(|name| installer.install(name, facts))).await;

    let success_count = results.iter().filter(|r| r.is_ok()).count();
    let fail_count = results.len() - success_count;
    installer.emit(InstallEvent::PipelineFinished {
        duration_secs: started.elapsed().as_secs_f64(),
        success_count,
        fail_count,
    });
    info!("{success_count} installed, {fail_count} failed");

    Ok(names.iter().cloned().zip(results).collect())
}
