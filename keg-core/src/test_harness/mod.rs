// keg-core/src/test_harness/mod.rs
// Post-install smoke tests. Every run happens in a throwaway directory
// (`testpath`) that is removed afterwards unless failed workspaces are kept.

mod daemon;
pub mod matcher;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use keg_aio::fs::{create_dir_all, resolve_under};
use keg_aio::process::{stderr_tail, CapturedOutput, ScopedCommand, STDERR_TAIL_LINES};
use keg_common::config::Config;
use keg_common::error::{KegError, Result};
use keg_common::model::env::EnvOverlay;
use keg_common::model::plan::BuildPlan;
use keg_common::model::test_spec::{TestCommand, TestSpec, TestStep};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::build::env::BuildEnvironment;
use crate::build::template::{render, render_all};
use crate::variant::TESTPATH_VAR;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    /// The recipe declares no test.
    Skipped,
    Passed { steps: usize },
}

/// What every test step needs: where to run, with which environment and
/// template values.
pub(crate) struct StepContext {
    pub testpath: PathBuf,
    pub env: BuildEnvironment,
    pub vars: BTreeMap<String, String>,
    pub timeout: Duration,
}

impl StepContext {
    fn render_overlay(&self, overlay: &EnvOverlay) -> Result<EnvOverlay> {
        let mut rendered = EnvOverlay {
            set: BTreeMap::new(),
            unset: overlay.unset.clone(),
        };
        for (key, value) in &overlay.set {
            rendered.set.insert(key.clone(), render(value, &self.vars)?);
        }
        Ok(rendered)
    }

    pub(crate) fn command(
        &self,
        command: &str,
        args: &[String],
        env: &EnvOverlay,
        timeout: Duration,
    ) -> Result<ScopedCommand> {
        Ok(ScopedCommand {
            program: render(command, &self.vars)?,
            args: render_all(args, &self.vars)?,
            cwd: self.testpath.clone(),
            env: self.env.for_step(&self.render_overlay(env)?),
            timeout,
        })
    }
}

pub struct TestHarness<'a> {
    plan: &'a BuildPlan,
    config: &'a Config,
    vars: BTreeMap<String, String>,
}

impl<'a> TestHarness<'a> {
    /// `vars` is the template context the build finished with (plan
    /// variables plus captures); `testpath` is added per run.
    pub fn new(plan: &'a BuildPlan, config: &'a Config, vars: BTreeMap<String, String>) -> Self {
        Self { plan, config, vars }
    }

    #[instrument(skip(self), fields(name = %self.plan.name))]
    pub async fn run(&self) -> Result<TestOutcome> {
        let Some(spec) = &self.plan.test else {
            debug!("No test declared for {}", self.plan.name);
            return Ok(TestOutcome::Skipped);
        };

        let tmp_root = self.config.tmp_dir();
        create_dir_all(&tmp_root)?;
        let workspace = tempfile::Builder::new()
            .prefix(&format!("{}-test-", self.plan.name))
            .tempdir_in(&tmp_root)?;

        let result = self.run_in(spec, workspace.path()).await;
        if result.is_err() && self.config.keep_failed_workspaces {
            let kept = workspace.keep();
            warn!("Keeping failed test workspace at {}", kept.display());
        }
        result
    }

    async fn run_in(&self, spec: &TestSpec, testpath: &Path) -> Result<TestOutcome> {
        let scratch = testpath.join(".keg");
        let env = BuildEnvironment::for_test(self.plan, self.config, &scratch);
        for dir in env.scratch_dirs().collect::<Vec<_>>() {
            create_dir_all(&dir)?;
        }
        let mut vars = self.vars.clone();
        vars.insert(TESTPATH_VAR.into(), testpath.display().to_string());
        let ctx = StepContext {
            testpath: testpath.to_path_buf(),
            env,
            vars,
            timeout: self.config.test_timeout,
        };

        for (name, contents) in &spec.files {
            let path = resolve_under(testpath, name)?;
            if let Some(parent) = path.parent() {
                create_dir_all(parent)?;
            }
            fs::write(&path, render(contents, &ctx.vars)?)?;
            debug!("Wrote test file {}", path.display());
        }

        for (i, step) in spec.steps.iter().enumerate() {
            info!("==> test [{}] {}", i + 1, step.label());
            match step {
                TestStep::Run(cmd) => run_check(cmd, &ctx).await?,
                TestStep::Daemon(daemon) => daemon::run_daemon(daemon, &ctx).await?,
            }
        }
        info!("All {} test steps passed", spec.steps.len());
        Ok(TestOutcome::Passed {
            steps: spec.steps.len(),
        })
    }
}

/// Runs one command and checks its exit status and output.
pub(crate) async fn run_check(cmd: &TestCommand, ctx: &StepContext) -> Result<()> {
    let scoped = ctx.command(&cmd.command, &cmd.args, &cmd.env, ctx.timeout)?;
    let step = scoped.display_line();
    let output = scoped.run().await.map_err(|e| KegError::TestFailure {
        step: step.clone(),
        reason: "could not start".into(),
        output: e.to_string(),
    })?;

    if output.exit_code() != Some(cmd.exit_code) {
        return Err(KegError::TestFailure {
            step,
            reason: format!(
                "expected exit status {}, got {}",
                cmd.exit_code,
                output.describe_status(ctx.timeout)
            ),
            output: output_tail(&output),
        });
    }

    if let Some(expect) = &cmd.expect {
        let expect = matcher::render_matcher(expect, &ctx.vars)?;
        let text = if cmd.merge_stderr {
            format!("{}{}", output.stdout, output.stderr)
        } else {
            output.stdout.clone()
        };
        if !matcher::is_match(&expect, &text)? {
            return Err(KegError::TestFailure {
                step,
                reason: format!("output did not satisfy: {expect}"),
                output: stderr_tail(&text, STDERR_TAIL_LINES),
            });
        }
    }
    debug!("Test step `{step}` passed");
    Ok(())
}

fn output_tail(output: &CapturedOutput) -> String {
    stderr_tail(
        &format!("{}{}", output.stdout, output.stderr),
        STDERR_TAIL_LINES,
    )
}
