// keg-core/src/install/mod.rs
// One install, start to finish: plan, fetch, build, post-install, prune,
// receipt, test. Each stage only runs once the previous one succeeded.

pub mod receipt;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use keg_aio::fs::{create_dir_all, remove_directory_recursive};
use keg_common::cache::Cache;
use keg_common::config::Config;
use keg_common::error::{KegError, Result};
use keg_common::formulary::Formulary;
use keg_common::model::plan::{ActiveSource, BuildPlan};
use keg_common::model::EnvironmentFacts;
use keg_common::pipeline::{InstallEvent, InstallStage};
use keg_net::fetch_source;
use serde::Serialize;
use tempfile::TempDir;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

use crate::build::devtools::find_compiler;
use crate::build::template::render;
use crate::build::BuildExecutor;
use crate::prune::{prune_async, PruneReport};
use crate::test_harness::{TestHarness, TestOutcome};
use crate::variant::VariantSelector;

const EVENT_CAPACITY: usize = 256;

/// A failed install and the stage it failed in.
#[derive(Debug, Clone, Error)]
#[error("{stage} failed: {error}")]
pub struct InstallFailure {
    pub stage: InstallStage,
    pub error: KegError,
}

impl InstallFailure {
    pub fn new(stage: InstallStage, error: KegError) -> Self {
        Self { stage, error }
    }

    /// Non-zero process exit status for this failure.
    pub fn exit_code(&self) -> i32 {
        self.stage.exit_code()
    }
}

pub type InstallResult = std::result::Result<InstallReport, InstallFailure>;

#[derive(Debug, Clone, Serialize)]
pub struct InstallReport {
    pub prefix: PathBuf,
    pub plan: BuildPlan,
    pub prune: PruneReport,
    pub test: TestOutcome,
    pub receipt: PathBuf,
    pub caveats: Option<String>,
    /// Rendered runtime variables, e.g. a `LIBRARY_PATH` hint.
    pub runtime_env: BTreeMap<String, String>,
}

#[derive(Clone)]
pub struct Installer {
    formulary: Arc<Formulary>,
    cache: Arc<Cache>,
    compiler: Option<PathBuf>,
    events: broadcast::Sender<InstallEvent>,
}

impl Installer {
    /// Uses the configured cache directory and the `cc` found on this host.
    pub fn new(formulary: Arc<Formulary>) -> Result<Self> {
        let cache = Arc::new(Cache::new(formulary.config())?);
        let compiler = match find_compiler("cc") {
            Ok(path) => Some(path),
            Err(e) => {
                debug!("No C compiler detected: {e}");
                None
            }
        };
        Ok(Self::with_cache(formulary, cache).with_compiler_opt(compiler))
    }

    pub fn with_cache(formulary: Arc<Formulary>, cache: Arc<Cache>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            formulary,
            cache,
            compiler: None,
            events,
        }
    }

    pub fn with_compiler(self, compiler: PathBuf) -> Self {
        self.with_compiler_opt(Some(compiler))
    }

    fn with_compiler_opt(mut self, compiler: Option<PathBuf>) -> Self {
        self.compiler = compiler;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InstallEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: InstallEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn config(&self) -> &Config {
        self.formulary.config()
    }

    pub fn formulary(&self) -> &Formulary {
        &self.formulary
    }

    /// Variant selection only; nothing touches the filesystem.
    pub fn plan(&self, name: &str, facts: &EnvironmentFacts) -> Result<BuildPlan> {
        let recipe = self.formulary.get(name)?;
        let mut selector = VariantSelector::new(&self.formulary);
        if let Some(cc) = &self.compiler {
            selector = selector.with_compiler(cc.clone());
        }
        selector.select(&recipe, facts)
    }

    #[instrument(skip(self, facts), fields(host = %facts.host_triple()))]
    pub async fn install(&self, name: &str, facts: &EnvironmentFacts) -> InstallResult {
        let result = self.run_stages(name, facts).await;
        match &result {
            Ok(report) => {
                info!("Installed {} into {}", name, report.prefix.display());
                self.emit(InstallEvent::JobSuccess {
                    target_id: name.to_string(),
                    prefix: report.prefix.clone(),
                });
            }
            Err(failure) => {
                error!("Install of {} failed during {}: {}", name, failure.stage, failure.error);
                self.emit(InstallEvent::job_failed(name.to_string(), failure.stage, &failure.error));
            }
        }
        result
    }

    fn stage(&self, name: &str, stage: InstallStage) {
        info!("==> {name}: {stage}");
        self.emit(InstallEvent::StageStarted {
            target_id: name.to_string(),
            stage,
        });
    }

    async fn run_stages(&self, name: &str, facts: &EnvironmentFacts) -> InstallResult {
        let config = self.config();
        let at = |stage: InstallStage| move |e: KegError| InstallFailure::new(stage, e);

        self.stage(name, InstallStage::Plan);
        let plan = self.plan(name, facts).map_err(at(InstallStage::Plan))?;

        self.stage(name, InstallStage::Fetch);
        let source = self.fetch(name, &plan.source).await.map_err(at(InstallStage::Fetch))?;
        let mut patches = Vec::with_capacity(plan.patches.len());
        for patch in &plan.patches {
            let path = self
                .fetch(name, &patch.as_source())
                .await
                .map_err(at(InstallStage::Fetch))?;
            patches.push((patch.clone(), path));
        }

        self.stage(name, InstallStage::Build);
        let workspace = new_workspace(config, name).map_err(at(InstallStage::Build))?;
        reset_prefix(&plan.prefix).map_err(at(InstallStage::Build))?;
        let mut executor = match BuildExecutor::new(&plan, config, workspace.path()) {
            Ok(executor) => executor.with_events(self.events.clone()),
            Err(e) => return Err(self.abandon(&plan, workspace, InstallStage::Build, e)),
        };
        let built: Result<()> = async {
            executor.prepare_source(&source, &patches).await?;
            executor.run_build_steps().await
        }
        .await;
        if let Err(e) = built {
            return Err(self.abandon(&plan, workspace, InstallStage::Build, e));
        }

        self.stage(name, InstallStage::PostInstall);
        if let Err(e) = executor.run_post_install().await {
            return Err(self.abandon(&plan, workspace, InstallStage::PostInstall, e));
        }
        let vars = executor.template_context();
        drop(executor);
        drop(workspace);

        self.stage(name, InstallStage::Prune);
        let pruned = prune_async(&plan.prefix, &plan.post_install.keep)
            .await
            .and_then(|report| receipt::write_receipt(&plan, &report).map(|path| (report, path)));
        let (prune_report, receipt) = match pruned {
            Ok(done) => done,
            Err(e) => {
                let _ = remove_directory_recursive(&plan.prefix);
                return Err(InstallFailure::new(InstallStage::Prune, e));
            }
        };

        // A failed test leaves the install in place for inspection.
        self.stage(name, InstallStage::Test);
        let test = TestHarness::new(&plan, config, vars.clone())
            .run()
            .await
            .map_err(at(InstallStage::Test))?;

        let caveats = plan
            .caveats
            .as_deref()
            .map(|text| render(text, &vars))
            .transpose()
            .map_err(at(InstallStage::Test))?;
        let mut runtime_env = BTreeMap::new();
        for (key, value) in &plan.runtime_env {
            runtime_env.insert(key.clone(), render(value, &vars).map_err(at(InstallStage::Test))?);
        }

        Ok(InstallReport {
            prefix: plan.prefix.clone(),
            plan,
            prune: prune_report,
            test,
            receipt,
            caveats,
            runtime_env,
        })
    }

    async fn fetch(&self, name: &str, source: &ActiveSource) -> Result<PathBuf> {
        self.emit(InstallEvent::DownloadStarted {
            target_id: name.to_string(),
            url: source.url.clone(),
        });
        let path = fetch_source(name, source, &self.cache).await?;
        let size_bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        self.emit(InstallEvent::DownloadFinished {
            target_id: name.to_string(),
            path: path.clone(),
            size_bytes,
        });
        Ok(path)
    }

    /// Cleans up after a failed build or post-install: the partial prefix is
    /// removed, the workspace too unless failed workspaces are kept.
    fn abandon(&self, plan: &BuildPlan, workspace: TempDir, stage: InstallStage, error: KegError) -> InstallFailure {
        if let Err(e) = remove_directory_recursive(&plan.prefix) {
            warn!("Could not remove partial prefix {}: {}", plan.prefix.display(), e);
        }
        if self.config().keep_failed_workspaces {
            let kept = workspace.keep();
            let message = format!("Keeping failed workspace for {} at {}", plan.name, kept.display());
            warn!("{message}");
            self.emit(InstallEvent::LogWarn { message });
        }
        InstallFailure::new(stage, error)
    }
}

fn new_workspace(config: &Config, name: &str) -> Result<TempDir> {
    let tmp_root = config.tmp_dir();
    create_dir_all(&tmp_root)?;
    Ok(tempfile::Builder::new()
        .prefix(&format!("{name}-build-"))
        .tempdir_in(&tmp_root)?)
}

/// Any previous install of the same version is replaced.
fn reset_prefix(prefix: &Path) -> Result<()> {
    if prefix.exists() {
        info!("Replacing existing install at {}", prefix.display());
        remove_directory_recursive(prefix)?;
    }
    create_dir_all(prefix)
}
