// keg-common/src/pipeline.rs
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::KegError;

/// Stages of a single install, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStage {
    Plan,
    Fetch,
    Build,
    PostInstall,
    Prune,
    Test,
}

impl InstallStage {
    /// Process exit status reported when this stage fails.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Plan => 2,
            Self::Fetch => 3,
            Self::Build => 4,
            Self::PostInstall => 5,
            Self::Prune => 6,
            Self::Test => 7,
        }
    }
}

impl fmt::Display for InstallStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Plan => "plan",
            Self::Fetch => "fetch",
            Self::Build => "build",
            Self::PostInstall => "post-install",
            Self::Prune => "prune",
            Self::Test => "test",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InstallEvent {
    PipelineStarted {
        total_jobs: usize,
    },
    PipelineFinished {
        duration_secs: f64,
        success_count: usize,
        fail_count: usize,
    },
    StageStarted {
        target_id: String,
        stage: InstallStage,
    },
    DownloadStarted {
        target_id: String,
        url: String,
    },
    DownloadFinished {
        target_id: String,
        path: PathBuf,
        size_bytes: u64,
    },
    StepStarted {
        target_id: String,
        index: usize,
        command: String,
    },
    JobSuccess {
        target_id: String,
        prefix: PathBuf,
    },
    JobFailed {
        target_id: String,
        stage: InstallStage,
        error: String,
    },
    LogWarn {
        message: String,
    },
}

impl InstallEvent {
    pub fn job_failed(target_id: String, stage: InstallStage, error: &KegError) -> Self {
        InstallEvent::JobFailed {
            target_id,
            stage,
            error: error.to_string(),
        }
    }
}
