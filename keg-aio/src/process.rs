// keg-aio/src/process.rs
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Output as StdOutput, Stdio};
use std::time::Duration;

use keg_common::error::{KegError, Result};
use tokio::process::Command;
use tracing::{debug, error, warn};

/// Lines of stderr kept for error reports.
pub const STDERR_TAIL_LINES: usize = 20;

/// Runs a helper command with the inherited environment and captures its output.
pub async fn run_command_async(
    command: &str,
    args: &[&str],
    cwd: Option<PathBuf>,
) -> Result<StdOutput> {
    debug!("Async Running command: {} {:?} (cwd: {:?})", command, args, cwd);

    let mut cmd = Command::new(command);
    cmd.args(args);
    cmd.kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.stdin(Stdio::null());

    match cmd.output().await {
        Ok(output) => {
            if !output.status.success() {
                debug!("Async Command failed with status: {}", output.status);
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.trim().is_empty() {
                    debug!("Stderr:\n{}", stderr.trim());
                }
            }
            Ok(output)
        }
        Err(e) => {
            error!("Async Failed to execute command: {}", e);
            Err(KegError::CommandExec(format!("{command}: {e}")))
        }
    }
}

/// A subprocess invocation whose environment is exactly `env`; nothing from
/// the parent leaks through.
#[derive(Debug, Clone)]
pub struct ScopedCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CapturedOutput {
    /// `None` when the command was killed for exceeding its timeout.
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        self.status.is_some_and(|s| s.success())
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }

    pub fn describe_status(&self, timeout: Duration) -> String {
        match self.status {
            Some(status) => status.to_string(),
            None => format!("timed out after {}", humantime::format_duration(timeout)),
        }
    }
}

impl ScopedCommand {
    pub fn display_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Unspawned command with the sanitized environment and its own process
    /// group. Stdio is left for the caller.
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&self.cwd)
            .env_clear()
            .envs(&self.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    /// Runs to completion or until the timeout. A timed-out command has its
    /// whole process group killed.
    pub async fn run(&self) -> Result<CapturedOutput> {
        debug!(
            "Running `{}` in {} ({} env vars)",
            self.display_line(),
            self.cwd.display(),
            self.env.len()
        );
        let mut cmd = self.to_command();
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        let child = cmd
            .spawn()
            .map_err(|e| KegError::CommandExec(format!("{}: {e}", self.program)))?;
        let pid = child.id();

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => {
                let output = output?;
                Ok(CapturedOutput {
                    status: Some(output.status),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                })
            }
            Err(_) => {
                warn!("`{}` exceeded {:?}, killing", self.display_line(), self.timeout);
                if let Some(pid) = pid {
                    signal_group(pid, libc::SIGKILL);
                }
                Ok(CapturedOutput {
                    status: None,
                    stdout: String::new(),
                    stderr: String::new(),
                })
            }
        }
    }
}

/// Last `lines` lines of `text`.
pub fn stderr_tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.trim_end().lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

/// Sends `signal` to the process group led by `pid`. Returns false if the
/// group no longer exists.
pub fn signal_group(pid: u32, signal: i32) -> bool {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: killpg has no memory-safety preconditions.
    unsafe { libc::killpg(pgid, signal) == 0 }
}

/// True while any process of the group led by `pid` exists.
pub fn group_alive(pid: u32) -> bool {
    signal_group(pid, 0)
}

/// True while a process with `pid` exists (including zombies).
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 only performs the existence check.
    unsafe { libc::kill(pid, 0) == 0 }
}
