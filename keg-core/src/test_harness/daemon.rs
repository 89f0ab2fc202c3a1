// keg-core/src/test_harness/daemon.rs
// Daemon tests: start a server in its own process group, wait for it to
// come up, run the queries, then take the whole group down.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use keg_aio::fs::resolve_under;
use keg_aio::process::{group_alive, signal_group, stderr_tail, STDERR_TAIL_LINES};
use keg_common::error::{KegError, Result};
use keg_common::model::env::EnvOverlay;
use keg_common::model::test_spec::{DaemonTest, Readiness};
use tokio::net::TcpStream;
use tokio::process::Child;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

use super::{run_check, StepContext};
use crate::build::template::{render, render_all};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);
/// How long a group gets between SIGTERM and SIGKILL.
const TERM_WAIT: Duration = Duration::from_secs(3);
const LOG_FILE: &str = ".keg/daemon.log";

/// Kills the process group when dropped while armed, so an interrupted test
/// never leaves a server behind.
struct GroupGuard {
    pid: Option<u32>,
}

impl GroupGuard {
    fn disarm(&mut self) {
        self.pid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.pid.take() {
            warn!("Daemon test interrupted, killing process group {pid}");
            signal_group(pid, libc::SIGKILL);
        }
    }
}

pub(super) async fn run_daemon(daemon: &DaemonTest, ctx: &StepContext) -> Result<()> {
    let grace = daemon.grace()?;
    let scoped = ctx.command(&daemon.command, &daemon.args, &daemon.env, grace)?;
    let step = scoped.display_line();

    let log_path = ctx.testpath.join(LOG_FILE);
    let log = File::create(&log_path)?;
    let mut cmd = scoped.to_command();
    cmd.stdout(Stdio::from(log.try_clone()?))
        .stderr(Stdio::from(log));

    let mut child = cmd.spawn().map_err(|e| KegError::TestFailure {
        step: step.clone(),
        reason: "could not start".into(),
        output: e.to_string(),
    })?;
    let Some(pid) = child.id() else {
        return Err(KegError::TestFailure {
            step,
            reason: "exited immediately".into(),
            output: read_log(&log_path),
        });
    };
    let mut guard = GroupGuard { pid: Some(pid) };
    debug!("Started `{step}` as process group {pid}");

    let outcome: Result<()> = async {
        wait_until_ready(daemon, ctx, &mut child, &step, grace, &log_path).await?;
        for query in &daemon.queries {
            run_check(query, ctx).await.map_err(|e| attach_log(e, &log_path))?;
        }
        Ok(())
    }
    .await;

    terminate(&mut child, pid).await;
    guard.disarm();
    outcome
}

async fn wait_until_ready(
    daemon: &DaemonTest,
    ctx: &StepContext,
    child: &mut Child,
    step: &str,
    grace: Duration,
    log_path: &Path,
) -> Result<()> {
    let deadline = Instant::now() + grace;
    loop {
        if probe(daemon.ready.as_ref(), ctx).await? {
            debug!("`{step}` is ready");
            return Ok(());
        }
        if let Some(status) = child.try_wait()? {
            return Err(KegError::TestFailure {
                step: step.to_string(),
                reason: format!("exited before becoming ready ({status})"),
                output: read_log(log_path),
            });
        }
        if Instant::now() >= deadline {
            // Without a probe, surviving the grace period counts as ready.
            if daemon.ready.is_none() {
                return Ok(());
            }
            return Err(KegError::TestTimeout {
                step: step.to_string(),
                waited: grace,
            });
        }
        sleep(POLL_INTERVAL).await;
    }
}

async fn probe(ready: Option<&Readiness>, ctx: &StepContext) -> Result<bool> {
    match ready {
        None => Ok(false),
        Some(Readiness::Path(path)) => {
            let rendered = render(path, &ctx.vars)?;
            let path = if Path::new(&rendered).is_absolute() {
                PathBuf::from(rendered)
            } else {
                resolve_under(&ctx.testpath, &rendered)?
            };
            Ok(path.exists())
        }
        Some(Readiness::Tcp(addr)) => {
            let addr = render(addr, &ctx.vars)?;
            Ok(matches!(
                timeout(PROBE_TIMEOUT, TcpStream::connect(addr.as_str())).await,
                Ok(Ok(_))
            ))
        }
        Some(Readiness::Command(argv)) => {
            let argv = render_all(argv, &ctx.vars)?;
            let Some((program, args)) = argv.split_first() else {
                return Err(KegError::Configuration("Empty readiness command".into()));
            };
            let probe = ctx.command(program, args, &EnvOverlay::default(), PROBE_TIMEOUT)?;
            Ok(probe.run().await.map(|out| out.success()).unwrap_or(false))
        }
    }
}

/// SIGTERM to the group, a bounded wait for the leader, then SIGKILL for
/// anything still alive.
async fn terminate(child: &mut Child, pid: u32) {
    if let Ok(Some(status)) = child.try_wait() {
        debug!("Daemon {pid} already exited ({status})");
    } else {
        signal_group(pid, libc::SIGTERM);
        match timeout(TERM_WAIT, child.wait()).await {
            Ok(Ok(status)) => debug!("Daemon {pid} stopped ({status})"),
            Ok(Err(e)) => warn!("Waiting for daemon {pid} failed: {e}"),
            Err(_) => {
                warn!("Daemon {pid} ignored SIGTERM, killing");
                signal_group(pid, libc::SIGKILL);
                let _ = child.wait().await;
            }
        }
    }
    if group_alive(pid) {
        debug!("Killing leftover members of process group {pid}");
        signal_group(pid, libc::SIGKILL);
    }
}

fn read_log(path: &Path) -> String {
    std::fs::read_to_string(path)
        .map(|text| stderr_tail(&text, STDERR_TAIL_LINES))
        .unwrap_or_default()
}

fn attach_log(err: KegError, log_path: &Path) -> KegError {
    match err {
        KegError::TestFailure { step, reason, output } => {
            let log = read_log(log_path);
            let output = if log.is_empty() {
                output
            } else {
                format!("{output}\n--- daemon log ---\n{log}")
            };
            KegError::TestFailure { step, reason, output }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use keg_aio::process::process_alive;
    use keg_common::config::Config;
    use keg_common::model::test_spec::{Matcher, TestCommand};

    use crate::build::env::BuildEnvironment;
    use crate::test_support::sample_plan;

    fn ctx(testpath: &Path) -> StepContext {
        std::fs::create_dir_all(testpath.join(".keg")).unwrap();
        let env = BuildEnvironment::for_test(
            &sample_plan(testpath),
            &Config::with_root(testpath),
            &testpath.join(".keg"),
        );
        StepContext {
            testpath: testpath.to_path_buf(),
            env,
            vars: BTreeMap::new(),
            timeout: Duration::from_secs(10),
        }
    }

    fn daemon(script: &str, ready: Option<Readiness>, grace: &str) -> DaemonTest {
        DaemonTest {
            command: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
            env: EnvOverlay::default(),
            ready,
            grace: grace.into(),
            queries: vec![],
        }
    }

    fn read_pid(dir: &Path) -> u32 {
        std::fs::read_to_string(dir.join("pid")).unwrap().trim().parse().unwrap()
    }

    #[tokio::test]
    async fn never_ready_times_out_and_leaves_no_process() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        let d = daemon(
            "echo $$ > pid; exec sleep 30",
            Some(Readiness::Path("never.sock".into())),
            "500ms",
        );
        let err = run_daemon(&d, &ctx).await.unwrap_err();
        assert!(matches!(err, KegError::TestTimeout { .. }), "{err}");
        assert!(!process_alive(read_pid(dir.path())));
    }

    #[tokio::test]
    async fn ready_daemon_answers_queries_then_is_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        let mut d = daemon(
            "echo $$ > pid; echo up > state; exec sleep 30",
            Some(Readiness::Path("state".into())),
            "5s",
        );
        let mut query = TestCommand::new("cat");
        query.args = vec!["state".into()];
        query.expect = Some(Matcher::Equals("up".into()));
        d.queries.push(query);

        run_daemon(&d, &ctx).await.unwrap();
        assert!(!process_alive(read_pid(dir.path())));
    }

    #[tokio::test]
    async fn failed_query_still_stops_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        let mut d = daemon(
            "echo $$ > pid; trap '' TERM; touch ready; while true; do sleep 1; done",
            Some(Readiness::Path("ready".into())),
            "5s",
        );
        d.queries.push(TestCommand::new("false"));

        let err = run_daemon(&d, &ctx).await.unwrap_err();
        assert!(matches!(err, KegError::TestFailure { .. }));
        assert!(!process_alive(read_pid(dir.path())));
    }

    /// Running and not yet a zombie. An orphan reparented to a non-reaping
    /// init stays a zombie forever, which `process_alive` still reports.
    #[cfg(target_os = "linux")]
    fn running(pid: u32) -> bool {
        std::fs::read_to_string(format!("/proc/{pid}/stat"))
            .ok()
            .and_then(|stat| {
                let (_, rest) = stat.rsplit_once(')')?;
                rest.trim_start().chars().next()
            })
            .is_some_and(|state| state != 'Z' && state != 'X')
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn interrupted_test_kills_the_whole_group() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        let mut d = daemon(
            "sleep 300 & echo $! > child; touch ready; wait",
            Some(Readiness::Path("ready".into())),
            "5s",
        );
        let mut query = TestCommand::new("sleep");
        query.args = vec!["30".into()];
        d.queries.push(query);

        let interrupted = timeout(Duration::from_secs(1), run_daemon(&d, &ctx)).await;
        assert!(interrupted.is_err(), "query should still be running");

        let grandchild: u32 = std::fs::read_to_string(dir.path().join("child"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while running(grandchild) && Instant::now() < deadline {
            sleep(POLL_INTERVAL).await;
        }
        assert!(!running(grandchild));
    }

    #[tokio::test]
    async fn early_exit_is_test_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        let d = daemon("echo crashing; exit 1", Some(Readiness::Path("sock".into())), "5s");
        match run_daemon(&d, &ctx).await {
            Err(KegError::TestFailure { reason, output, .. }) => {
                assert!(reason.contains("exited before becoming ready"));
                assert!(output.contains("crashing"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn probe_command_readiness() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        let d = daemon(
            "sleep 0.2; touch flag; exec sleep 30",
            Some(Readiness::Command(vec!["test".into(), "-e".into(), "flag".into()])),
            "5s",
        );
        run_daemon(&d, &ctx).await.unwrap();
    }
}
