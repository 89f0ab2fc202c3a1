// keg-core/src/test_support.rs
// Shared fixtures for unit tests.

use std::collections::BTreeMap;
use std::path::Path;

use keg_common::model::env::EnvOverlay;
use keg_common::model::facts::{Arch, EnvironmentFacts, OsFamily};
use keg_common::model::plan::{ActiveSource, BuildPlan, PlannedPostInstall};

/// A plan for `demo 1.0` installed under `<root>/Cellar`, with no steps.
pub(crate) fn sample_plan(root: &Path) -> BuildPlan {
    let prefix = root.join("Cellar/demo/1.0");
    let variables = BTreeMap::from([
        ("prefix".to_string(), prefix.display().to_string()),
        ("bin".to_string(), prefix.join("bin").display().to_string()),
        ("version".to_string(), "1.0".to_string()),
        ("cc".to_string(), "/usr/bin/clang".to_string()),
    ]);
    BuildPlan {
        name: "demo".into(),
        version: "1.0".into(),
        revision: 0,
        pkg_version: "1.0".into(),
        prefix,
        facts: EnvironmentFacts::new(Arch::X86_64, OsFamily::Linux, 6),
        source: ActiveSource {
            url: "file:///dev/null".into(),
            mirrors: vec![],
            sha256: "0".repeat(64),
        },
        patches: vec![],
        dependencies: vec![],
        variables,
        env: EnvOverlay::default(),
        steps: vec![],
        post_install: PlannedPostInstall::default(),
        test: None,
        caveats: None,
        runtime_env: BTreeMap::new(),
    }
}
