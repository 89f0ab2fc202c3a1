// keg-common/src/model/plan.rs
// The resolved, environment-specific form of a recipe. Every `when` guard has
// been evaluated away; templates are still raw because `buildpath` and
// captured values only exist once the build runs.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::env::EnvOverlay;
use super::facts::EnvironmentFacts;
use super::recipe::{AllowRule, Substitution};
use super::test_spec::TestSpec;
use crate::dependency::DependencyTag;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPlan {
    pub name: String,
    pub version: String,
    pub revision: u32,
    pub pkg_version: String,
    /// `<root>/Cellar/<name>/<pkg_version>`.
    pub prefix: PathBuf,
    pub facts: EnvironmentFacts,
    pub source: ActiveSource,
    pub patches: Vec<ActivePatch>,
    pub dependencies: Vec<ResolvedDependency>,
    /// Fixed template variables: built-ins, `deps.<name>` and recipe variables.
    pub variables: BTreeMap<String, String>,
    pub env: EnvOverlay,
    pub steps: Vec<PlannedStep>,
    pub post_install: PlannedPostInstall,
    pub test: Option<TestSpec>,
    pub caveats: Option<String>,
    pub runtime_env: BTreeMap<String, String>,
}

impl BuildPlan {
    pub fn build_dependencies(&self) -> impl Iterator<Item = &ResolvedDependency> {
        self.dependencies.iter()
    }

    pub fn runtime_dependencies(&self) -> impl Iterator<Item = &ResolvedDependency> {
        self.dependencies
            .iter()
            .filter(|d| d.tags.intersects(DependencyTag::RUNTIME | DependencyTag::SYSTEM))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSource {
    pub url: String,
    pub mirrors: Vec<String>,
    pub sha256: String,
}

impl ActiveSource {
    /// Primary URL first, then mirrors in declaration order.
    pub fn candidates(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.url.as_str()).chain(self.mirrors.iter().map(String::as_str))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivePatch {
    pub url: String,
    pub mirrors: Vec<String>,
    pub sha256: String,
    pub strip: u32,
}

impl ActivePatch {
    pub fn as_source(&self) -> ActiveSource {
        ActiveSource {
            url: self.url.clone(),
            mirrors: self.mirrors.clone(),
            sha256: self.sha256.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedDependency {
    pub name: String,
    pub tags: DependencyTag,
    /// Installed keg for recipe dependencies, the system prefix otherwise.
    pub prefix: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlannedStep {
    Run {
        command: String,
        args: Vec<String>,
        workdir: Option<String>,
        env: EnvOverlay,
        capture: Option<String>,
    },
    Inreplace {
        file: String,
        substitutions: Vec<Substitution>,
    },
    Install {
        from: Vec<String>,
        into: String,
        rename: Option<String>,
    },
    Mkdir {
        path: String,
    },
}

impl PlannedStep {
    /// Human readable one-liner used in logs and errors.
    pub fn describe(&self) -> String {
        match self {
            Self::Run { command, args, .. } => std::iter::once(command.as_str())
                .chain(args.iter().map(String::as_str))
                .collect::<Vec<_>>()
                .join(" "),
            Self::Inreplace { file, .. } => format!("inreplace {file}"),
            Self::Install { from, into, .. } => format!("install {} -> {into}", from.join(" ")),
            Self::Mkdir { path } => format!("mkdir {path}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedPostInstall {
    pub mkdirs: Vec<String>,
    pub steps: Vec<PlannedStep>,
    pub keep: Vec<AllowRule>,
}
