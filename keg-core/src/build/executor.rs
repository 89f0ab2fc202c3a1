// keg-core/src/build/executor.rs
// Runs a plan's steps in a private build directory. Templates are rendered
// per step against the plan variables, `buildpath` and the captures recorded
// so far, so a value only moves between steps through a declared capture.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use keg_aio::extract::extract_archive_async;
use keg_aio::fs::{copy_recursive, create_dir_all, is_within, resolve_under};
use keg_aio::process::{stderr_tail, CapturedOutput, ScopedCommand, STDERR_TAIL_LINES};
use keg_common::config::Config;
use keg_common::error::{KegError, Result};
use keg_common::model::env::EnvOverlay;
use keg_common::model::plan::{ActivePatch, BuildPlan, PlannedStep};
use keg_common::model::recipe::Substitution;
use keg_common::pipeline::InstallEvent;
use regex::Regex;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument};

use super::env::BuildEnvironment;
use super::template::{render, render_all};
use crate::variant::BUILDPATH_VAR;

/// Which step list is running; decides the default working directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepPhase {
    Build,
    PostInstall,
}

pub struct BuildExecutor<'a> {
    plan: &'a BuildPlan,
    config: &'a Config,
    buildpath: PathBuf,
    env: BuildEnvironment,
    captures: BTreeMap<String, String>,
    events: Option<broadcast::Sender<InstallEvent>>,
}

impl<'a> BuildExecutor<'a> {
    /// Lays out `workspace` (`src/` is the build directory, `scratch/` holds
    /// HOME and TMPDIR) and prepares the step environment.
    pub fn new(plan: &'a BuildPlan, config: &'a Config, workspace: &Path) -> Result<Self> {
        let buildpath = workspace.join("src");
        let scratch = workspace.join("scratch");
        create_dir_all(&buildpath)?;

        let mut env = BuildEnvironment::for_build(plan, config, &scratch);
        for dir in env.scratch_dirs().collect::<Vec<_>>() {
            create_dir_all(&dir)?;
        }
        let mut executor = Self {
            plan,
            config,
            buildpath,
            env: env.clone(),
            captures: BTreeMap::new(),
            events: None,
        };
        let overlay = executor.render_overlay(&plan.env, &executor.template_context())?;
        env.apply(&overlay);
        executor.env = env;
        Ok(executor)
    }

    /// Publishes a `StepStarted` event for every step.
    pub fn with_events(mut self, events: broadcast::Sender<InstallEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn buildpath(&self) -> &Path {
        &self.buildpath
    }

    pub fn captures(&self) -> &BTreeMap<String, String> {
        &self.captures
    }

    /// Unpacks the verified source into the build directory and applies the
    /// patches in order.
    pub async fn prepare_source(&self, archive: &Path, patches: &[(ActivePatch, PathBuf)]) -> Result<()> {
        info!("Unpacking {} into {}", archive.display(), self.buildpath.display());
        extract_archive_async(archive, &self.buildpath).await?;

        for (patch, file) in patches {
            let cmd = ScopedCommand {
                program: "patch".into(),
                args: vec![
                    format!("-p{}", patch.strip),
                    "-i".into(),
                    file.display().to_string(),
                ],
                cwd: self.buildpath.clone(),
                env: self.env.vars().clone(),
                timeout: self.config.step_timeout,
            };
            debug!("Applying patch {}", patch.url);
            let output = cmd.run().await?;
            if !output.success() {
                return Err(KegError::CommandExec(format!(
                    "Patch {} did not apply ({}):\n{}",
                    patch.url,
                    output.describe_status(cmd.timeout),
                    stderr_tail(&combined(&output), STDERR_TAIL_LINES)
                )));
            }
        }
        Ok(())
    }

    /// Runs the build steps in order, stopping at the first failure.
    #[instrument(skip(self), fields(name = %self.plan.name))]
    pub async fn run_build_steps(&mut self) -> Result<()> {
        let plan = self.plan;
        info!("Running {} build steps", plan.steps.len());
        for (i, step) in plan.steps.iter().enumerate() {
            self.run_step(i + 1, step, StepPhase::Build).await?;
        }
        Ok(())
    }

    /// Creates the post-install directories, then runs the post-install
    /// steps from inside the prefix. Build captures stay visible.
    #[instrument(skip(self), fields(name = %self.plan.name))]
    pub async fn run_post_install(&mut self) -> Result<()> {
        let plan = self.plan;
        let post = &plan.post_install;
        let ctx = self.template_context();
        for dir in &post.mkdirs {
            let path = self.destination(&render(dir, &ctx)?)?;
            debug!("Creating {}", path.display());
            create_dir_all(&path)?;
        }
        for (i, step) in post.steps.iter().enumerate() {
            self.run_step(i + 1, step, StepPhase::PostInstall).await?;
        }
        Ok(())
    }

    /// Plan variables, `buildpath` and every capture recorded so far.
    pub fn template_context(&self) -> BTreeMap<String, String> {
        let mut vars = self.plan.variables.clone();
        vars.insert(BUILDPATH_VAR.into(), self.buildpath.display().to_string());
        vars.extend(self.captures.iter().map(|(k, v)| (k.clone(), v.clone())));
        vars
    }

    fn render_overlay(&self, overlay: &EnvOverlay, ctx: &BTreeMap<String, String>) -> Result<EnvOverlay> {
        let mut rendered = EnvOverlay {
            set: BTreeMap::new(),
            unset: overlay.unset.clone(),
        };
        for (key, value) in &overlay.set {
            rendered.set.insert(key.clone(), render(value, ctx)?);
        }
        Ok(rendered)
    }

    fn work_root(&self, phase: StepPhase) -> &Path {
        match phase {
            StepPhase::Build => &self.buildpath,
            StepPhase::PostInstall => &self.plan.prefix,
        }
    }

    /// A path read or written by a step. Relative paths hang off the phase's
    /// working root; absolute ones must stay in the build directory or the
    /// prefix.
    fn locate(&self, phase: StepPhase, rendered: &str) -> Result<PathBuf> {
        let path = Path::new(rendered);
        if path.is_absolute() {
            if is_within(&self.buildpath, path) || is_within(&self.plan.prefix, path) {
                return Ok(path.to_path_buf());
            }
            return Err(KegError::Configuration(format!(
                "Path '{rendered}' is outside the build directory and the prefix"
            )));
        }
        resolve_under(self.work_root(phase), rendered)
    }

    /// A directory created or filled by a step. Relative paths hang off the
    /// prefix; absolute ones must be in the prefix or the shared `etc`/`var`.
    fn destination(&self, rendered: &str) -> Result<PathBuf> {
        let path = Path::new(rendered);
        if !path.is_absolute() {
            return resolve_under(&self.plan.prefix, rendered);
        }
        let root = self.config.keg_root();
        let allowed = [self.plan.prefix.clone(), root.join("etc"), root.join("var")];
        if allowed.iter().any(|dir| is_within(dir, path)) {
            Ok(path.to_path_buf())
        } else {
            Err(KegError::Configuration(format!(
                "Destination '{rendered}' is outside the install prefix"
            )))
        }
    }

    async fn run_step(&mut self, index: usize, step: &PlannedStep, phase: StepPhase) -> Result<()> {
        info!("==> [{index}] {}", step.describe());
        if let Some(events) = &self.events {
            let _ = events.send(InstallEvent::StepStarted {
                target_id: self.plan.name.clone(),
                index,
                command: step.describe(),
            });
        }
        let ctx = self.template_context();
        match step {
            PlannedStep::Run {
                command,
                args,
                workdir,
                env,
                capture,
            } => {
                let program = render(command, &ctx)?;
                let args = render_all(args, &ctx)?;
                let cwd = match workdir {
                    Some(dir) => self.locate(phase, &render(dir, &ctx)?)?,
                    None => self.work_root(phase).to_path_buf(),
                };
                create_dir_all(&cwd)?;
                let overlay = self.render_overlay(env, &ctx)?;
                let cmd = ScopedCommand {
                    program,
                    args,
                    cwd,
                    env: self.env.for_step(&overlay),
                    timeout: self.config.step_timeout,
                };
                let output = match cmd.run().await {
                    Ok(output) => output,
                    Err(e) => {
                        return Err(KegError::BuildStep {
                            index,
                            command: cmd.display_line(),
                            status: "failed to start".into(),
                            stderr_tail: e.to_string(),
                        })
                    }
                };
                if !output.success() {
                    return Err(KegError::BuildStep {
                        index,
                        command: cmd.display_line(),
                        status: output.describe_status(cmd.timeout),
                        stderr_tail: stderr_tail(&output.stderr, STDERR_TAIL_LINES),
                    });
                }
                if let Some(name) = capture {
                    let value = output.stdout.trim().to_string();
                    debug!("Captured {name}={value}");
                    self.captures.insert(name.clone(), value);
                }
            }
            PlannedStep::Inreplace { file, substitutions } => {
                let path = self.locate(phase, &render(file, &ctx)?)?;
                self.inreplace(index, &path, substitutions, &ctx)?;
            }
            PlannedStep::Install { from, into, rename } => {
                let dest_dir = self.destination(&render(into, &ctx)?)?;
                create_dir_all(&dest_dir)?;
                for entry in render_all(from, &ctx)? {
                    let src = self.locate(phase, &entry)?;
                    if fs::symlink_metadata(&src).is_err() {
                        return Err(step_error(index, step, format!("{} does not exist", src.display())));
                    }
                    let file_name = match rename {
                        Some(name) => render(name, &ctx)?,
                        None => match src.file_name() {
                            Some(n) => n.to_string_lossy().into_owned(),
                            None => {
                                return Err(step_error(index, step, format!("{entry} has no file name")))
                            }
                        },
                    };
                    copy_recursive(&src, &resolve_under(&dest_dir, &file_name)?)?;
                }
            }
            PlannedStep::Mkdir { path } => {
                let dir = self.destination(&render(path, &ctx)?)?;
                create_dir_all(&dir)?;
            }
        }
        Ok(())
    }

    fn inreplace(
        &self,
        index: usize,
        path: &Path,
        substitutions: &[Substitution],
        ctx: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut contents = fs::read_to_string(path)?;
        // Substituted values are literal text; only `$` written in the
        // recipe itself refers to a capture group.
        let literal: BTreeMap<String, String> = ctx
            .iter()
            .map(|(k, v)| (k.clone(), v.replace('$', "$$")))
            .collect();
        for sub in substitutions {
            let re = Regex::new(&sub.pattern).map_err(|e| {
                KegError::Configuration(format!("Invalid inreplace pattern '{}': {e}", sub.pattern))
            })?;
            if !re.is_match(&contents) {
                return Err(KegError::BuildStep {
                    index,
                    command: format!("inreplace {}", path.display()),
                    status: "no match".into(),
                    stderr_tail: format!("Pattern '{}' matched nothing", sub.pattern),
                });
            }
            let with = render(&sub.with, &literal)?;
            contents = re.replace_all(&contents, with.as_str()).into_owned();
        }
        fs::write(path, contents)?;
        Ok(())
    }
}

fn step_error(index: usize, step: &PlannedStep, detail: String) -> KegError {
    KegError::BuildStep {
        index,
        command: step.describe(),
        status: "failed".into(),
        stderr_tail: detail,
    }
}

fn combined(output: &CapturedOutput) -> String {
    format!("{}{}", output.stdout, output.stderr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keg_common::model::plan::PlannedPostInstall;

    use crate::test_support::sample_plan;

    fn plan(root: &Path, steps: Vec<PlannedStep>) -> BuildPlan {
        let mut plan = sample_plan(root);
        plan.env = EnvOverlay::default().set("GREETING", "hello");
        plan.steps = steps;
        plan
    }

    fn sh(script: &str) -> PlannedStep {
        PlannedStep::Run {
            command: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
            workdir: None,
            env: EnvOverlay::default(),
            capture: None,
        }
    }

    #[tokio::test]
    async fn capture_flows_to_later_step() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_root(dir.path());
        let mut first = sh("echo 42");
        if let PlannedStep::Run { capture, .. } = &mut first {
            *capture = Some("answer".into());
        }
        let plan = plan(
            dir.path(),
            vec![first, sh("echo {{answer}}-$GREETING > out.txt")],
        );
        let mut exec = BuildExecutor::new(&plan, &config, &dir.path().join("ws")).unwrap();
        exec.run_build_steps().await.unwrap();

        let out = fs::read_to_string(exec.buildpath().join("out.txt")).unwrap();
        assert_eq!(out.trim(), "42-hello");
        assert_eq!(exec.captures()["answer"], "42");
    }

    #[tokio::test]
    async fn failing_step_reports_index_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_root(dir.path());
        let plan = plan(
            dir.path(),
            vec![sh("true"), sh("echo boom >&2; exit 3"), sh("touch never")],
        );
        let mut exec = BuildExecutor::new(&plan, &config, &dir.path().join("ws")).unwrap();
        match exec.run_build_steps().await {
            Err(KegError::BuildStep { index, stderr_tail, .. }) => {
                assert_eq!(index, 2);
                assert_eq!(stderr_tail, "boom");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(!exec.buildpath().join("never").exists());
    }

    #[tokio::test]
    async fn inreplace_install_and_mkdir() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_root(dir.path());
        let steps = vec![
            sh("printf 'VERSION=0\\n' > tool.sh"),
            PlannedStep::Inreplace {
                file: "tool.sh".into(),
                substitutions: vec![Substitution {
                    pattern: "VERSION=\\d+".into(),
                    with: "VERSION={{version}}".into(),
                }],
            },
            PlannedStep::Install {
                from: vec!["tool.sh".into()],
                into: "{{bin}}".into(),
                rename: Some("tool".into()),
            },
            PlannedStep::Mkdir {
                path: "{{prefix}}/share/demo".into(),
            },
        ];
        let plan = plan(dir.path(), steps);
        let mut exec = BuildExecutor::new(&plan, &config, &dir.path().join("ws")).unwrap();
        exec.run_build_steps().await.unwrap();

        let installed = fs::read_to_string(plan.prefix.join("bin/tool")).unwrap();
        assert_eq!(installed, "VERSION=1.0\n");
        assert!(plan.prefix.join("share/demo").is_dir());
    }

    #[tokio::test]
    async fn inreplace_keeps_dollar_signs_in_values() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_root(dir.path());
        let mut price = sh("printf 'cost$1'");
        if let PlannedStep::Run { capture, .. } = &mut price {
            *capture = Some("price".into());
        }
        let steps = vec![
            sh("printf 'KEY=0\\n' > conf"),
            price,
            PlannedStep::Inreplace {
                file: "conf".into(),
                substitutions: vec![Substitution {
                    pattern: "(KEY)=\\d+".into(),
                    with: "${1}={{price}}".into(),
                }],
            },
        ];
        let plan = plan(dir.path(), steps);
        let mut exec = BuildExecutor::new(&plan, &config, &dir.path().join("ws")).unwrap();
        exec.run_build_steps().await.unwrap();

        let conf = fs::read_to_string(exec.buildpath().join("conf")).unwrap();
        assert_eq!(conf, "KEY=cost$1\n");
    }

    #[tokio::test]
    async fn inreplace_without_match_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_root(dir.path());
        let steps = vec![
            sh("echo hi > f"),
            PlannedStep::Inreplace {
                file: "f".into(),
                substitutions: vec![Substitution {
                    pattern: "absent".into(),
                    with: "x".into(),
                }],
            },
        ];
        let plan = plan(dir.path(), steps);
        let mut exec = BuildExecutor::new(&plan, &config, &dir.path().join("ws")).unwrap();
        assert!(matches!(
            exec.run_build_steps().await,
            Err(KegError::BuildStep { index: 2, .. })
        ));
    }

    #[tokio::test]
    async fn workdir_cannot_escape_build_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_root(dir.path());
        let step = PlannedStep::Run {
            command: "true".into(),
            args: vec![],
            workdir: Some("../outside".into()),
            env: EnvOverlay::default(),
            capture: None,
        };
        let plan = plan(dir.path(), vec![step]);
        let mut exec = BuildExecutor::new(&plan, &config, &dir.path().join("ws")).unwrap();
        let err = exec.run_build_steps().await.unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn post_install_runs_in_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_root(dir.path());
        let mut plan = plan(dir.path(), vec![]);
        plan.post_install = PlannedPostInstall {
            mkdirs: vec!["{{prefix}}/var/run".into()],
            steps: vec![sh("touch marker")],
            keep: vec![],
        };
        fs::create_dir_all(&plan.prefix).unwrap();
        let mut exec = BuildExecutor::new(&plan, &config, &dir.path().join("ws")).unwrap();
        exec.run_post_install().await.unwrap();
        assert!(plan.prefix.join("var/run").is_dir());
        assert!(plan.prefix.join("marker").is_file());
    }
}
