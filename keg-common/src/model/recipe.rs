// keg-common/src/model/recipe.rs
// A recipe describes how to fetch, build, install and verify one package.
// Fields that depend on the host carry `when` predicates; nothing here is
// evaluated until variant selection.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use super::condition::{Conditional, Guarded, Predicate};
use super::env::EnvOverlay;
use super::test_spec::{TestSpec, TestStep};
use crate::dependency::{Dependency, Requirement};
use crate::error::{KegError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Recipe {
    pub name: String,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub license: Vec<String>,
    pub version: String,
    #[serde(default)]
    pub revision: u32,
    #[serde(default)]
    pub caveats: Option<String>,
    #[serde(rename = "source")]
    pub sources: Vec<SourceDescriptor>,
    #[serde(default, rename = "patch")]
    pub patches: Vec<PatchSpec>,
    #[serde(default, rename = "dependency")]
    pub dependencies: Vec<Dependency>,
    #[serde(default, rename = "requirement")]
    pub requirements: Vec<Requirement>,
    /// Declared user options, name -> description.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default, rename = "variable")]
    pub variables: Vec<Variable>,
    /// Overlay applied to every build step.
    #[serde(default)]
    pub env: EnvOverlay,
    #[serde(default, rename = "step")]
    pub steps: Vec<BuildStep>,
    #[serde(default)]
    pub post_install: Option<PostInstall>,
    /// Variables a user must export to use the installed package, e.g.
    /// `LIBRARY_PATH`. Reported, never enforced.
    #[serde(default)]
    pub runtime_env: BTreeMap<String, String>,
    #[serde(default)]
    pub test: Option<TestSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceDescriptor {
    pub url: String,
    pub sha256: String,
    #[serde(default)]
    pub mirrors: Vec<String>,
    /// Overrides the recipe version when this source is active.
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub when: Option<Predicate>,
}

impl Guarded for SourceDescriptor {
    fn guard(&self) -> Option<&Predicate> {
        self.when.as_ref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatchSpec {
    pub url: String,
    pub sha256: String,
    #[serde(default)]
    pub mirrors: Vec<String>,
    #[serde(default = "default_strip")]
    pub strip: u32,
    #[serde(default)]
    pub when: Option<Predicate>,
}

fn default_strip() -> u32 {
    1
}

impl Guarded for PatchSpec {
    fn guard(&self) -> Option<&Predicate> {
        self.when.as_ref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    #[serde(flatten)]
    pub value: Conditional<String>,
}

/// A command argument, optionally present only when a predicate holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Arg {
    Plain(String),
    Guarded { args: Vec<String>, when: Predicate },
}

impl Guarded for Arg {
    fn guard(&self) -> Option<&Predicate> {
        match self {
            Self::Plain(_) => None,
            Self::Guarded { when, .. } => Some(when),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildStep {
    Run(RunStep),
    Inreplace(InreplaceStep),
    Install(InstallStep),
    Mkdir(MkdirStep),
}

impl Guarded for BuildStep {
    fn guard(&self) -> Option<&Predicate> {
        match self {
            Self::Run(s) => s.when.as_ref(),
            Self::Inreplace(s) => s.when.as_ref(),
            Self::Install(s) => s.when.as_ref(),
            Self::Mkdir(s) => s.when.as_ref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunStep {
    pub command: String,
    #[serde(default)]
    pub args: Vec<Arg>,
    /// Sub-directory of the build directory, created on demand.
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub env: EnvOverlay,
    /// Stores trimmed stdout under this name for later steps.
    #[serde(default)]
    pub capture: Option<String>,
    #[serde(default)]
    pub when: Option<Predicate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InreplaceStep {
    /// Path relative to the build directory.
    pub file: String,
    #[serde(rename = "replace")]
    pub substitutions: Vec<Substitution>,
    #[serde(default)]
    pub when: Option<Predicate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Substitution {
    /// Regular expression.
    pub pattern: String,
    /// Replacement template; `$1` style group references are honoured.
    pub with: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstallStep {
    /// Paths relative to the build directory.
    pub from: Vec<String>,
    /// Destination directory template, e.g. `{{bin}}`.
    pub into: String,
    /// New file name; only valid with a single `from` entry.
    #[serde(default)]
    pub rename: Option<String>,
    #[serde(default)]
    pub when: Option<Predicate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MkdirStep {
    pub path: String,
    #[serde(default)]
    pub when: Option<Predicate>,
}

/// Keep rule for post-install pruning, evaluated against a file's basename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AllowRule {
    Prefix(String),
    Glob { glob: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostInstall {
    #[serde(default)]
    pub mkdirs: Vec<String>,
    #[serde(default, rename = "step")]
    pub steps: Vec<BuildStep>,
    /// Empty means nothing is pruned.
    #[serde(default)]
    pub keep: Vec<AllowRule>,
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

/// Variable names provided by the evaluator; recipes may not redefine them.
pub const BUILTIN_VARIABLES: &[&str] = &[
    "name",
    "version",
    "version_major",
    "revision",
    "pkg_version",
    "prefix",
    "bin",
    "sbin",
    "lib",
    "libexec",
    "include",
    "share",
    "etc",
    "var",
    "buildpath",
    "testpath",
    "host_triple",
    "cpu",
    "arch",
    "os",
    "os_major",
    "cc",
];

impl Recipe {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let recipe: Recipe = toml::from_str(raw)?;
        recipe.validate()?;
        Ok(recipe)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let recipe: Recipe = serde_json::from_str(raw)?;
        recipe.validate()?;
        Ok(recipe)
    }

    /// Loads a `.toml` or `.json` recipe file. The file stem must equal the
    /// recipe name.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!("Loading recipe from {}", path.display());
        let raw = fs::read_to_string(path)?;
        let recipe = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&raw),
            Some("json") => Self::from_json_str(&raw),
            _ => Err(KegError::Parse(
                "recipe",
                format!("Unsupported recipe file type: {}", path.display()),
            )),
        }
        .map_err(|e| match e {
            KegError::Configuration(msg) => {
                KegError::Configuration(format!("{}: {msg}", path.display()))
            }
            other => other,
        })?;

        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        if stem != recipe.name {
            return Err(KegError::Configuration(format!(
                "Recipe file {} declares name '{}'",
                path.display(),
                recipe.name
            )));
        }
        Ok(recipe)
    }

    /// `version` plus `_revision` when the revision is non-zero.
    pub fn pkg_version_for(version: &str, revision: u32) -> String {
        if revision > 0 {
            format!("{version}_{revision}")
        } else {
            version.to_string()
        }
    }

    /// Every predicate in the recipe, for validation passes.
    fn predicates(&self) -> Vec<&Predicate> {
        let mut all: Vec<&Predicate> = Vec::new();
        all.extend(self.sources.iter().filter_map(Guarded::guard));
        all.extend(self.patches.iter().filter_map(Guarded::guard));
        all.extend(self.dependencies.iter().filter_map(Guarded::guard));
        for var in &self.variables {
            all.extend(var.value.branches.iter().map(|b| &b.when));
        }
        let post_steps = self.post_install.iter().flat_map(|p| p.steps.iter());
        for step in self.steps.iter().chain(post_steps) {
            all.extend(step.guard());
            if let BuildStep::Run(run) = step {
                all.extend(run.args.iter().filter_map(Guarded::guard));
            }
        }
        all
    }

    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| KegError::Configuration(format!("recipe '{}': {msg}", self.name));

        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@' | '+'))
        {
            return Err(bad("name must be non-empty and contain only [A-Za-z0-9-_.@+]".to_string()));
        }
        if self.version.trim().is_empty() {
            return Err(bad("version must not be empty".to_string()));
        }
        if self.sources.is_empty() {
            return Err(bad("at least one [[source]] is required".to_string()));
        }
        for source in &self.sources {
            validate_sha256(&source.sha256).map_err(|e| bad(format!("source {}: {e}", source.url)))?;
        }
        for patch in &self.patches {
            validate_sha256(&patch.sha256).map_err(|e| bad(format!("patch {}: {e}", patch.url)))?;
        }

        for predicate in self.predicates() {
            predicate.validate()?;
            for option in predicate.referenced_options() {
                if !self.options.contains_key(option) {
                    return Err(bad(format!("predicate refers to undeclared option '{option}'")));
                }
            }
        }
        for requirement in &self.requirements {
            if let Requirement::Toolchain(v) = requirement {
                super::version::lenient_version(v)?;
            }
        }

        let mut defined: HashSet<&str> = HashSet::new();
        for var in &self.variables {
            if BUILTIN_VARIABLES.contains(&var.name.as_str()) || var.name.starts_with("deps.") {
                return Err(bad(format!("variable '{}' shadows a built-in", var.name)));
            }
            if !defined.insert(var.name.as_str()) {
                return Err(bad(format!("variable '{}' is declared twice", var.name)));
            }
        }
        let post_steps = self.post_install.iter().flat_map(|p| p.steps.iter());
        for step in self.steps.iter().chain(post_steps) {
            match step {
                BuildStep::Run(RunStep {
                    capture: Some(name), ..
                }) => {
                    if BUILTIN_VARIABLES.contains(&name.as_str()) || !defined.insert(name.as_str()) {
                        return Err(bad(format!("capture '{name}' collides with another variable")));
                    }
                }
                BuildStep::Install(install) if install.rename.is_some() && install.from.len() != 1 => {
                    return Err(bad(format!(
                        "install into '{}' renames but lists {} files",
                        install.into,
                        install.from.len()
                    )));
                }
                _ => {}
            }
        }

        if let Some(post) = &self.post_install {
            for rule in &post.keep {
                if let AllowRule::Glob { glob } = rule {
                    glob::Pattern::new(glob)
                        .map_err(|e| bad(format!("invalid keep glob '{glob}': {e}")))?;
                }
                if matches!(rule, AllowRule::Prefix(p) if p.is_empty()) {
                    return Err(bad("empty keep prefix would keep every file".to_string()));
                }
            }
        }
        if let Some(test) = &self.test {
            for step in &test.steps {
                if let TestStep::Daemon(daemon) = step {
                    daemon.grace()?;
                }
            }
        }
        Ok(())
    }
}

fn validate_sha256(digest: &str) -> std::result::Result<(), String> {
    if digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(format!("sha256 '{digest}' is not 64 hex characters"))
    }
}
