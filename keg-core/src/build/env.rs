// keg-core/src/build/env.rs
// Sanitized subprocess environment. Each step gets a fresh copy of the base
// map with its own overlay applied; nothing is written back.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use keg_common::config::Config;
use keg_common::model::env::EnvOverlay;
use keg_common::model::plan::BuildPlan;
use tracing::debug;

/// Inherited variables that survive sanitizing. Everything else, PATH
/// included, is dropped and rebuilt.
const ENV_VARS_TO_KEEP: &[&str] = &[
    "USER", "LOGNAME", "TERM", "SHELL", "LANG", "LC_ALL", "LC_CTYPE", "TZ",
];

const SYSTEM_PATH_DIRS: &[&str] = &["/usr/bin", "/bin", "/usr/sbin", "/sbin"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildEnvironment {
    vars: BTreeMap<String, String>,
}

impl BuildEnvironment {
    /// Environment for build and post-install steps. `scratch` holds the
    /// private HOME and TMPDIR.
    pub fn for_build(plan: &BuildPlan, config: &Config, scratch: &Path) -> Self {
        let mut path_dirs = dependency_path_dirs(plan);
        path_dirs.push(config.keg_root().join("bin"));
        let mut env = Self::sanitized(path_dirs, scratch);
        env.set("CC", plan.variables.get("cc").cloned().unwrap_or_else(|| "cc".into()));
        let jobs = std::thread::available_parallelism().map_or(1, |n| n.get());
        env.set("MAKEFLAGS", format!("-j{jobs}"));
        env
    }

    /// Environment for test steps: the installed keg's `bin` comes first.
    pub fn for_test(plan: &BuildPlan, config: &Config, scratch: &Path) -> Self {
        let mut path_dirs = vec![plan.prefix.join("bin"), plan.prefix.join("sbin")];
        path_dirs.extend(dependency_path_dirs(plan));
        path_dirs.push(config.keg_root().join("bin"));
        Self::sanitized(path_dirs, scratch)
    }

    fn sanitized(extra_path_dirs: Vec<PathBuf>, scratch: &Path) -> Self {
        let mut vars: BTreeMap<String, String> = env::vars()
            .filter(|(key, _)| ENV_VARS_TO_KEEP.contains(&key.as_str()))
            .collect();

        let mut path_dirs: Vec<String> = Vec::new();
        for dir in extra_path_dirs
            .iter()
            .map(|p| p.display().to_string())
            .chain(SYSTEM_PATH_DIRS.iter().map(|s| s.to_string()))
        {
            if !path_dirs.contains(&dir) {
                path_dirs.push(dir);
            }
        }
        vars.insert("PATH".into(), path_dirs.join(":"));
        vars.insert("HOME".into(), scratch.join("home").display().to_string());
        vars.insert("TMPDIR".into(), scratch.join("tmp").display().to_string());
        debug!("Sanitized environment has {} variables", vars.len());
        Self { vars }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    /// Applies an already-rendered overlay to the base environment.
    pub fn apply(&mut self, overlay: &EnvOverlay) {
        overlay.apply_to(&mut self.vars);
    }

    /// Environment for one subprocess: the base plus `overlay`.
    pub fn for_step(&self, overlay: &EnvOverlay) -> BTreeMap<String, String> {
        let mut vars = self.vars.clone();
        overlay.apply_to(&mut vars);
        vars
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    /// The private HOME and TMPDIR directories named by this environment.
    pub fn scratch_dirs(&self) -> impl Iterator<Item = PathBuf> + '_ {
        ["HOME", "TMPDIR"]
            .into_iter()
            .filter_map(|key| self.vars.get(key).map(PathBuf::from))
    }
}

fn dependency_path_dirs(plan: &BuildPlan) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    for dep in plan.build_dependencies() {
        if dep.prefix.starts_with("/usr") || dep.prefix == Path::new("/") {
            continue;
        }
        for sub in ["bin", "sbin"] {
            let dir = dep.prefix.join(sub);
            if dir.is_dir() {
                dirs.push(dir);
            }
        }
    }
    dirs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_plan;

    #[test]
    fn drops_inherited_noise_and_rebuilds_path() {
        env::set_var("KEG_ENV_TEST_NOISE", "1");
        let scratch = Path::new("/tmp/scratch");
        let plan = sample_plan(Path::new("/opt/keg"));
        let env = BuildEnvironment::for_build(&plan, &Config::with_root("/opt/keg"), scratch);
        let vars = env.vars();
        assert!(!vars.contains_key("KEG_ENV_TEST_NOISE"));
        assert!(vars["PATH"].starts_with("/opt/keg/bin:"));
        assert!(vars["PATH"].ends_with("/usr/bin:/bin:/usr/sbin:/sbin"));
        assert_eq!(vars["HOME"], "/tmp/scratch/home");
        assert_eq!(vars["CC"], "/usr/bin/clang");
    }

    #[test]
    fn step_overlay_does_not_leak() {
        let plan = sample_plan(Path::new("/k"));
        let mut env = BuildEnvironment::for_build(&plan, &Config::with_root("/k"), Path::new("/s"));
        env.apply(&EnvOverlay::default().set("LD", "/usr/bin/ld"));

        let step_one = env.for_step(&EnvOverlay::default().unset("LD").set("CFLAGS", "-O0"));
        assert!(!step_one.contains_key("LD"));
        assert_eq!(step_one["CFLAGS"], "-O0");

        let step_two = env.for_step(&EnvOverlay::default());
        assert_eq!(step_two["LD"], "/usr/bin/ld");
        assert!(!step_two.contains_key("CFLAGS"));
    }

    #[test]
    fn test_environment_prefers_keg_bin() {
        let plan = sample_plan(Path::new("/k"));
        let env = BuildEnvironment::for_test(&plan, &Config::with_root("/k"), Path::new("/s"));
        assert!(env.vars()["PATH"].starts_with("/k/Cellar/demo/1.0/bin:/k/Cellar/demo/1.0/sbin:/k/bin:"));
    }
}
