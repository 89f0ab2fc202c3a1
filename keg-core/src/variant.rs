// keg-core/src/variant.rs
//! Variant selection: turns a recipe plus environment facts into a concrete
//! [`BuildPlan`]. Every `when` guard is evaluated exactly once, here.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use keg_common::error::{KegError, Result};
use keg_common::formulary::Formulary;
use keg_common::model::condition::{all_matching, first_match, Guarded};
use keg_common::model::plan::{
    ActivePatch, ActiveSource, BuildPlan, PlannedPostInstall, PlannedStep, ResolvedDependency,
};
use keg_common::model::recipe::{Arg, BuildStep, Recipe};
use keg_common::model::test_spec::{Matcher, Readiness, TestCommand, TestSpec, TestStep};
use keg_common::model::version::version_major;
use keg_common::model::EnvironmentFacts;
use tracing::{debug, instrument};

use crate::build::template::{referenced_names, render};

/// Template names bound only while a build or test is running.
pub const BUILDPATH_VAR: &str = "buildpath";
pub const TESTPATH_VAR: &str = "testpath";

pub struct VariantSelector<'a> {
    formulary: &'a Formulary,
    compiler: Option<PathBuf>,
}

impl<'a> VariantSelector<'a> {
    pub fn new(formulary: &'a Formulary) -> Self {
        Self {
            formulary,
            compiler: None,
        }
    }

    /// Value of the `cc` variable; defaults to plain `cc` resolved via PATH.
    pub fn with_compiler(mut self, compiler: PathBuf) -> Self {
        self.compiler = Some(compiler);
        self
    }

    #[instrument(skip_all, fields(recipe = %recipe.name))]
    pub fn select(&self, recipe: &Recipe, facts: &EnvironmentFacts) -> Result<BuildPlan> {
        for option in &facts.options {
            if !recipe.options.contains_key(option) {
                return Err(KegError::Configuration(format!(
                    "Option '{option}' is not declared by recipe '{}' (declared: [{}])",
                    recipe.name,
                    recipe.options.keys().cloned().collect::<Vec<_>>().join(", ")
                )));
            }
        }
        for requirement in &recipe.requirements {
            requirement.check(facts)?;
        }

        let source = first_match(&recipe.sources, facts)?.ok_or_else(|| {
            let tried: Vec<String> = recipe
                .sources
                .iter()
                .map(|s| s.when.as_ref().map_or("always".to_string(), |p| p.to_string()))
                .collect();
            KegError::Configuration(format!(
                "No source of '{}' matches the environment (tried: [{}])",
                recipe.name,
                tried.join("; ")
            ))
        })?;
        let version = source.version.clone().unwrap_or_else(|| recipe.version.clone());
        let pkg_version = Recipe::pkg_version_for(&version, recipe.revision);
        let prefix = self.formulary.config().keg_path(&recipe.name, &pkg_version);
        debug!("Active source {} (version {})", source.url, version);

        let patches = all_matching(&recipe.patches, facts)?
            .into_iter()
            .map(|p| ActivePatch {
                url: p.url.clone(),
                mirrors: p.mirrors.clone(),
                sha256: p.sha256.clone(),
                strip: p.strip,
            })
            .collect();

        let mut dependencies: Vec<ResolvedDependency> = Vec::new();
        for dep in all_matching(&recipe.dependencies, facts)? {
            dependencies.push(self.formulary.resolve_dependency(dep)?);
        }

        let mut variables = self.builtin_variables(recipe, facts, &version, &pkg_version, &prefix);
        for dep in &dependencies {
            variables.insert(format!("deps.{}", dep.name), dep.prefix.display().to_string());
        }
        // Declaration order: a variable sees the built-ins, dependency
        // prefixes and the variables declared before it.
        for var in &recipe.variables {
            let raw = var.value.select(&var.name, facts)?;
            let value = render(&raw, &variables).map_err(|e| match e {
                KegError::Configuration(msg) => {
                    KegError::Configuration(format!("variable '{}': {msg}", var.name))
                }
                other => other,
            })?;
            variables.insert(var.name.clone(), value);
        }

        let steps = plan_steps(&recipe.steps, facts)?;
        let post_install = match &recipe.post_install {
            Some(post) => PlannedPostInstall {
                mkdirs: post.mkdirs.clone(),
                steps: plan_steps(&post.steps, facts)?,
                keep: post.keep.clone(),
            },
            None => PlannedPostInstall::default(),
        };

        let plan = BuildPlan {
            name: recipe.name.clone(),
            version,
            revision: recipe.revision,
            pkg_version,
            prefix,
            facts: facts.clone(),
            source: ActiveSource {
                url: source.url.clone(),
                mirrors: source.mirrors.clone(),
                sha256: source.sha256.clone(),
            },
            patches,
            dependencies,
            variables,
            env: recipe.env.clone(),
            steps,
            post_install,
            test: recipe.test.clone(),
            caveats: recipe.caveats.clone(),
            runtime_env: recipe.runtime_env.clone(),
        };
        check_templates(&plan)?;
        debug!(
            "Planned {} build steps, {} patches, {} dependencies",
            plan.steps.len(),
            plan.patches.len(),
            plan.dependencies.len()
        );
        Ok(plan)
    }

    fn builtin_variables(
        &self,
        recipe: &Recipe,
        facts: &EnvironmentFacts,
        version: &str,
        pkg_version: &str,
        prefix: &Path,
    ) -> BTreeMap<String, String> {
        let root = self.formulary.config().keg_root();
        let path = |p: PathBuf| p.display().to_string();
        let cc = self
            .compiler
            .as_ref()
            .map_or_else(|| "cc".to_string(), |c| c.display().to_string());

        BTreeMap::from([
            ("name".to_string(), recipe.name.clone()),
            ("version".to_string(), version.to_string()),
            ("version_major".to_string(), version_major(version)),
            ("revision".to_string(), recipe.revision.to_string()),
            ("pkg_version".to_string(), pkg_version.to_string()),
            ("prefix".to_string(), path(prefix.to_path_buf())),
            ("bin".to_string(), path(prefix.join("bin"))),
            ("sbin".to_string(), path(prefix.join("sbin"))),
            ("lib".to_string(), path(prefix.join("lib"))),
            ("libexec".to_string(), path(prefix.join("libexec"))),
            ("include".to_string(), path(prefix.join("include"))),
            ("share".to_string(), path(prefix.join("share"))),
            // Configuration and state outlive a single keg.
            ("etc".to_string(), path(root.join("etc"))),
            ("var".to_string(), path(root.join("var"))),
            ("host_triple".to_string(), facts.host_triple()),
            ("cpu".to_string(), facts.arch.cpu().to_string()),
            ("arch".to_string(), facts.arch.to_string()),
            ("os".to_string(), facts.os.to_string()),
            ("os_major".to_string(), facts.os_major.to_string()),
            ("cc".to_string(), cc),
        ])
    }
}

fn plan_steps(steps: &[BuildStep], facts: &EnvironmentFacts) -> Result<Vec<PlannedStep>> {
    let mut planned = Vec::new();
    for step in all_matching(steps, facts)? {
        planned.push(match step {
            BuildStep::Run(run) => {
                let mut args = Vec::new();
                for arg in &run.args {
                    match arg {
                        Arg::Plain(a) => args.push(a.clone()),
                        Arg::Guarded { args: fragment, .. } => {
                            if arg.applies(facts)? {
                                args.extend(fragment.iter().cloned());
                            }
                        }
                    }
                }
                PlannedStep::Run {
                    command: run.command.clone(),
                    args,
                    workdir: run.workdir.clone(),
                    env: run.env.clone(),
                    capture: run.capture.clone(),
                }
            }
            BuildStep::Inreplace(s) => PlannedStep::Inreplace {
                file: s.file.clone(),
                substitutions: s.substitutions.clone(),
            },
            BuildStep::Install(s) => PlannedStep::Install {
                from: s.from.clone(),
                into: s.into.clone(),
                rename: s.rename.clone(),
            },
            BuildStep::Mkdir(s) => PlannedStep::Mkdir { path: s.path.clone() },
        });
    }
    Ok(planned)
}

fn step_templates(step: &PlannedStep) -> Vec<&str> {
    match step {
        PlannedStep::Run {
            command,
            args,
            workdir,
            env,
            ..
        } => std::iter::once(command.as_str())
            .chain(args.iter().map(String::as_str))
            .chain(workdir.as_deref())
            .chain(env.set.values().map(String::as_str))
            .collect(),
        PlannedStep::Inreplace { file, substitutions } => std::iter::once(file.as_str())
            .chain(substitutions.iter().map(|s| s.with.as_str()))
            .collect(),
        PlannedStep::Install { from, into, rename } => from
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(into.as_str()))
            .chain(rename.as_deref())
            .collect(),
        PlannedStep::Mkdir { path } => vec![path.as_str()],
    }
}

fn command_templates(cmd: &TestCommand) -> Vec<&str> {
    let expect = cmd.expect.as_ref().map(|m| match m {
        Matcher::Equals(s) | Matcher::Contains(s) | Matcher::Matches(s) => s.as_str(),
    });
    std::iter::once(cmd.command.as_str())
        .chain(cmd.args.iter().map(String::as_str))
        .chain(cmd.env.set.values().map(String::as_str))
        .chain(expect)
        .collect()
}

fn test_templates(spec: &TestSpec) -> Vec<&str> {
    let mut all: Vec<&str> = spec.files.values().map(String::as_str).collect();
    for step in &spec.steps {
        match step {
            TestStep::Run(cmd) => all.extend(command_templates(cmd)),
            TestStep::Daemon(daemon) => {
                all.push(&daemon.command);
                all.extend(daemon.args.iter().map(String::as_str));
                all.extend(daemon.env.set.values().map(String::as_str));
                match &daemon.ready {
                    Some(Readiness::Path(p)) | Some(Readiness::Tcp(p)) => all.push(p),
                    Some(Readiness::Command(argv)) => all.extend(argv.iter().map(String::as_str)),
                    None => {}
                }
                for query in &daemon.queries {
                    all.extend(command_templates(query));
                }
            }
        }
    }
    all
}

fn ensure_known(templates: &[&str], known: &BTreeSet<&str>, context: &str) -> Result<()> {
    for template in templates {
        for name in referenced_names(template)? {
            if !known.contains(name) {
                return Err(KegError::Configuration(format!(
                    "{context}: unknown template variable '{name}' in '{template}'"
                )));
            }
        }
    }
    Ok(())
}

/// Rejects templates that reference names no stage could ever define. A
/// capture is only visible to steps after the one that declares it.
fn check_templates(plan: &BuildPlan) -> Result<()> {
    let mut known: BTreeSet<&str> = plan.variables.keys().map(String::as_str).collect();
    known.insert(BUILDPATH_VAR);
    ensure_known(
        &plan.env.set.values().map(String::as_str).collect::<Vec<_>>(),
        &known,
        "environment",
    )?;

    let post_steps = plan.post_install.steps.iter();
    for (index, step) in plan.steps.iter().chain(post_steps).enumerate() {
        ensure_known(&step_templates(step), &known, &format!("step {}", index + 1))?;
        if let PlannedStep::Run {
            capture: Some(name),
            ..
        } = step
        {
            known.insert(name.as_str());
        }
    }
    ensure_known(
        &plan.post_install.mkdirs.iter().map(String::as_str).collect::<Vec<_>>(),
        &known,
        "post_install",
    )?;

    let mut texts: Vec<&str> = plan.runtime_env.values().map(String::as_str).collect();
    texts.extend(plan.caveats.as_deref());
    ensure_known(&texts, &known, "caveats")?;

    if let Some(test) = &plan.test {
        known.insert(TESTPATH_VAR);
        ensure_known(&test_templates(test), &known, "test")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use keg_common::config::Config;
    use keg_common::model::facts::{Arch, OsFamily};
    use keg_common::model::version::lenient_version;

    const SHA_ARM: &str = "e4ec9a37bc96adb6a29e88dbef1b2dbe43e0b4014e91450d6b95ec7d238cdddb";
    const SHA_INTEL: &str = "b8dd4368bb9c7f0b98188317ee0254dd8cc99d1e3a18d0ff146c855fe16c1d8c";

    fn recipe() -> String {
        format!(
            r#"
name = "libgccjit"
version = "10.2.0"
revision = 1
runtime_env = {{ LIBRARY_PATH = "{{{{lib}}}}/gcc/{{{{version_major}}}}" }}

[options]
host-shared = "build position independent code"

[[source]]
url = "https://github.com/fxcoudert/gcc/archive/gcc-10-arm-20201228.tar.gz"
sha256 = "{SHA_ARM}"
version = "10.2.0"
when = {{ arch = "arm64" }}

[[source]]
url = "https://ftp.gnu.org/gnu/gcc/gcc-10.2.0/gcc-10.2.0.tar.xz"
sha256 = "{SHA_INTEL}"

[[patch]]
url = "https://patches.example.org/gcc/bigsur.diff"
sha256 = "{SHA_INTEL}"
when = {{ not_arch = "arm64" }}

[[dependency]]
name = "zlib"
mode = "system"

[[step]]
kind = "run"
command = "../configure"
workdir = "build-jit"
args = [
  "--prefix={{{{prefix}}}}",
  "--build={{{{host_triple}}}}",
  {{ args = ["--disable-multilib"], when = {{ toolchain_min = "1000" }} }},
  {{ args = ["--enable-host-shared"], when = {{ option = "host-shared" }} }},
]

[[step]]
kind = "run"
command = "make"
workdir = "build-jit"
"#
        )
    }

    fn formulary(root: &Path) -> Formulary {
        let mut config = Config::with_root(root);
        config.system_prefix = PathBuf::from("/usr");
        let mut formulary = Formulary::new(config);
        formulary.insert_toml(&recipe()).unwrap();
        formulary
    }

    fn arm() -> EnvironmentFacts {
        EnvironmentFacts::new(Arch::Arm64, OsFamily::Macos, 20)
            .with_toolchain(lenient_version("1200").unwrap())
    }

    fn intel() -> EnvironmentFacts {
        EnvironmentFacts::new(Arch::X86_64, OsFamily::Macos, 19)
            .with_toolchain(lenient_version("11.0").unwrap())
    }

    #[test]
    fn arm_selects_first_source_and_skips_patch() {
        let root = tempfile::tempdir().unwrap();
        let formulary = formulary(root.path());
        let recipe = formulary.get("libgccjit").unwrap();
        let plan = VariantSelector::new(&formulary).select(&recipe, &arm()).unwrap();

        assert_eq!(plan.source.sha256, SHA_ARM);
        assert!(plan.patches.is_empty());
        assert_eq!(plan.pkg_version, "10.2.0_1");
        assert_eq!(plan.prefix, root.path().join("Cellar/libgccjit/10.2.0_1"));
        assert_eq!(plan.variables["deps.zlib"], "/usr");
        assert_eq!(plan.variables["host_triple"], "aarch64-apple-darwin20");
        match &plan.steps[0] {
            PlannedStep::Run { args, .. } => {
                assert!(args.contains(&"--disable-multilib".to_string()));
                assert!(!args.contains(&"--enable-host-shared".to_string()));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn intel_falls_through_to_default_source() {
        let root = tempfile::tempdir().unwrap();
        let formulary = formulary(root.path());
        let recipe = formulary.get("libgccjit").unwrap();
        let facts = intel().with_option("host-shared");
        let plan = VariantSelector::new(&formulary).select(&recipe, &facts).unwrap();

        assert_eq!(plan.source.sha256, SHA_INTEL);
        assert_eq!(plan.patches.len(), 1);
        match &plan.steps[0] {
            PlannedStep::Run { args, .. } => {
                assert!(!args.contains(&"--disable-multilib".to_string()));
                assert!(args.contains(&"--enable-host-shared".to_string()));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn identical_facts_give_identical_plans() {
        let root = tempfile::tempdir().unwrap();
        let formulary = formulary(root.path());
        let recipe = formulary.get("libgccjit").unwrap();
        let selector = VariantSelector::new(&formulary);
        let a = serde_json::to_vec(&selector.select(&recipe, &arm()).unwrap()).unwrap();
        let b = serde_json::to_vec(&selector.select(&recipe, &arm()).unwrap()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn undeclared_option_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let formulary = formulary(root.path());
        let recipe = formulary.get("libgccjit").unwrap();
        let err = VariantSelector::new(&formulary)
            .select(&recipe, &arm().with_option("with-jit"))
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn no_matching_source_is_configuration_error() {
        let root = tempfile::tempdir().unwrap();
        let formulary = Formulary::new(Config::with_root(root.path()));
        let raw = format!(
            "name = \"armonly\"\nversion = \"1\"\n[[source]]\nurl = \"https://x/a.tgz\"\nsha256 = \"{SHA_ARM}\"\nwhen = {{ arch = \"arm64\" }}\n"
        );
        let recipe = Recipe::from_toml_str(&raw).unwrap();
        let err = VariantSelector::new(&formulary).select(&recipe, &intel()).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("arch == arm64"));
    }

    #[test]
    fn unresolved_dependency_fails_planning() {
        let root = tempfile::tempdir().unwrap();
        let formulary = Formulary::new(Config::with_root(root.path()));
        let raw = format!(
            "name = \"mpfr\"\nversion = \"4.1\"\n[[source]]\nurl = \"https://x/m.tgz\"\nsha256 = \"{SHA_ARM}\"\n[[dependency]]\nname = \"gmp\"\n"
        );
        let recipe = Recipe::from_toml_str(&raw).unwrap();
        let err = VariantSelector::new(&formulary).select(&recipe, &arm()).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("gmp"));
    }

    #[test]
    fn variables_expand_in_declaration_order() {
        let root = tempfile::tempdir().unwrap();
        let formulary = Formulary::new(Config::with_root(root.path()));
        let raw = format!(
            "name = \"gccjit\"\nversion = \"10.2.0\"\n[[source]]\nurl = \"https://x/g.tgz\"\nsha256 = \"{SHA_ARM}\"\n[[variable]]\nname = \"libdir\"\ndefault = \"{{{{lib}}}}/gcc/{{{{version_major}}}}\"\n[[variable]]\nname = \"libflag\"\ndefault = \"--libdir={{{{libdir}}}}\"\n"
        );
        let recipe = Recipe::from_toml_str(&raw).unwrap();
        let plan = VariantSelector::new(&formulary).select(&recipe, &arm()).unwrap();
        let lib = root.path().join("Cellar/gccjit/10.2.0/lib/gcc/10");
        assert_eq!(plan.variables["libdir"], lib.display().to_string());
        assert_eq!(plan.variables["libflag"], format!("--libdir={}", lib.display()));
    }

    #[test]
    fn variable_referencing_later_or_unknown_name_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let formulary = Formulary::new(Config::with_root(root.path()));
        let raw = format!(
            "name = \"v\"\nversion = \"1\"\n[[source]]\nurl = \"https://x/v.tgz\"\nsha256 = \"{SHA_ARM}\"\n[[variable]]\nname = \"first\"\ndefault = \"{{{{second}}}}\"\n[[variable]]\nname = \"second\"\ndefault = \"x\"\n"
        );
        let recipe = Recipe::from_toml_str(&raw).unwrap();
        let err = VariantSelector::new(&formulary).select(&recipe, &arm()).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("variable 'first'"), "{err}");
    }

    #[test]
    fn unknown_template_and_capture_order() {
        let root = tempfile::tempdir().unwrap();
        let formulary = Formulary::new(Config::with_root(root.path()));
        let base = format!(
            "name = \"t\"\nversion = \"1\"\n[[source]]\nurl = \"https://x/t.tgz\"\nsha256 = \"{SHA_ARM}\"\n"
        );

        let typo = format!("{base}[[step]]\nkind = \"run\"\ncommand = \"echo\"\nargs = [\"{{{{prefx}}}}\"]\n");
        let recipe = Recipe::from_toml_str(&typo).unwrap();
        let err = VariantSelector::new(&formulary).select(&recipe, &arm()).unwrap_err();
        assert!(err.to_string().contains("prefx"));

        let ordered = format!(
            "{base}[[step]]\nkind = \"run\"\ncommand = \"echo\"\ncapture = \"rev\"\n[[step]]\nkind = \"run\"\ncommand = \"echo\"\nargs = [\"{{{{rev}}}}\"]\n"
        );
        let recipe = Recipe::from_toml_str(&ordered).unwrap();
        assert!(VariantSelector::new(&formulary).select(&recipe, &arm()).is_ok());

        let reversed = format!(
            "{base}[[step]]\nkind = \"run\"\ncommand = \"echo\"\nargs = [\"{{{{rev}}}}\"]\n[[step]]\nkind = \"run\"\ncommand = \"echo\"\ncapture = \"rev\"\n"
        );
        let recipe = Recipe::from_toml_str(&reversed).unwrap();
        assert!(VariantSelector::new(&formulary).select(&recipe, &arm()).is_err());
    }
}
