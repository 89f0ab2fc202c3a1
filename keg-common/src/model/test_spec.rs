// keg-common/src/model/test_spec.rs
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::env::EnvOverlay;
use crate::error::{KegError, Result};

const DEFAULT_GRACE: &str = "1s";

/// Post-install smoke test: files to write into a scratch directory, then
/// steps to run against the installed prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSpec {
    /// Relative file name -> contents. Contents are templates.
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    #[serde(default, rename = "step")]
    pub steps: Vec<TestStep>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TestStep {
    Run(TestCommand),
    Daemon(DaemonTest),
}

impl TestStep {
    pub fn label(&self) -> &str {
        match self {
            Self::Run(cmd) => &cmd.command,
            Self::Daemon(daemon) => &daemon.command,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestCommand {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "EnvOverlay::is_empty")]
    pub env: EnvOverlay,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect: Option<Matcher>,
    /// Expected exit status; `shell_output(cmd, 2)` style checks set this.
    #[serde(default)]
    pub exit_code: i32,
    /// Match against stdout followed by stderr.
    #[serde(default)]
    pub merge_stderr: bool,
}

impl TestCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: EnvOverlay::default(),
            expect: None,
            exit_code: 0,
            merge_stderr: false,
        }
    }

    pub fn display_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A long-running process started for the duration of its queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonTest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "EnvOverlay::is_empty")]
    pub env: EnvOverlay,
    /// Without a probe the harness simply waits out the grace period.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<Readiness>,
    /// humantime duration, e.g. `"2s"`.
    #[serde(default = "default_grace")]
    pub grace: String,
    #[serde(default, rename = "query")]
    pub queries: Vec<TestCommand>,
}

fn default_grace() -> String {
    DEFAULT_GRACE.to_string()
}

impl DaemonTest {
    pub fn grace(&self) -> Result<Duration> {
        humantime::parse_duration(&self.grace).map_err(|e| {
            KegError::Configuration(format!(
                "Invalid grace period '{}' for daemon `{}`: {e}",
                self.grace, self.command
            ))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    /// A file or socket appears, relative to the test directory.
    Path(String),
    /// A TCP connect to `host:port` succeeds.
    Tcp(String),
    /// A probe command exits successfully.
    Command(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Matcher {
    /// Output equals the template after trailing whitespace is trimmed.
    Equals(String),
    Contains(String),
    /// Regular expression searched anywhere in the output.
    Matches(String),
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Equals(s) => write!(f, "equals {s:?}"),
            Self::Contains(s) => write!(f, "contains {s:?}"),
            Self::Matches(s) => write!(f, "matches /{s}/"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_daemon_with_queries() {
        let spec: TestSpec = toml::from_str(
            r#"
            [files]
            "sd.ini" = "[supervisord]\nloglevel=debug\n"

            [[step]]
            kind = "daemon"
            command = "{{bin}}/supervisord"
            args = ["--nodaemon", "-c", "sd.ini"]
            ready = { path = "supervisor.sock" }
            grace = "2s"

            [[step.query]]
            command = "{{bin}}/supervisorctl"
            args = ["-c", "sd.ini", "version"]
            expect = { contains = "{{version}}" }
            "#,
        )
        .unwrap();
        assert_eq!(spec.files.len(), 1);
        match &spec.steps[0] {
            TestStep::Daemon(d) => {
                assert_eq!(d.grace().unwrap(), Duration::from_secs(2));
                assert_eq!(d.ready, Some(Readiness::Path("supervisor.sock".into())));
                assert_eq!(d.queries.len(), 1);
                assert_eq!(d.queries[0].expect, Some(Matcher::Contains("{{version}}".into())));
            }
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn run_step_defaults() {
        let step: TestStep =
            toml::from_str("kind = \"run\"\ncommand = \"./test\"\nexpect = { equals = \"hello world\" }")
                .unwrap();
        match step {
            TestStep::Run(cmd) => {
                assert_eq!(cmd.exit_code, 0);
                assert!(!cmd.merge_stderr);
                assert_eq!(cmd.display_line(), "./test");
            }
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn bad_grace_is_configuration_error() {
        let mut d = DaemonTest {
            command: "srv".into(),
            args: vec![],
            env: EnvOverlay::default(),
            ready: None,
            grace: "soon".into(),
            queries: vec![],
        };
        assert!(d.grace().unwrap_err().is_configuration());
        d.grace = default_grace();
        assert_eq!(d.grace().unwrap(), Duration::from_secs(1));
    }
}
