// keg-common/src/model/facts.rs
use std::collections::BTreeSet;
use std::fmt;

use semver::Version;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    Arm64,
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(untagged)]
    Other(String),
}

impl Arch {
    pub fn current() -> Self {
        match std::env::consts::ARCH {
            "aarch64" => Self::Arm64,
            "x86_64" => Self::X86_64,
            other => Self::Other(other.to_string()),
        }
    }

    /// CPU name as used in GNU target triples.
    pub fn cpu(&self) -> &str {
        match self {
            Self::Arm64 => "aarch64",
            Self::X86_64 => "x86_64",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Arm64 => f.write_str("arm64"),
            Self::X86_64 => f.write_str("x86_64"),
            Self::Other(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsFamily {
    Macos,
    Linux,
}

impl OsFamily {
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Self::Macos
        } else {
            Self::Linux
        }
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Macos => f.write_str("macos"),
            Self::Linux => f.write_str("linux"),
        }
    }
}

/// Everything variant selection is allowed to look at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentFacts {
    pub arch: Arch,
    pub os: OsFamily,
    /// Kernel major version (`uname -r`), e.g. 20 for Big Sur.
    pub os_major: u32,
    #[serde(default)]
    pub toolchain: Option<Version>,
    #[serde(default)]
    pub options: BTreeSet<String>,
}

impl EnvironmentFacts {
    pub fn new(arch: Arch, os: OsFamily, os_major: u32) -> Self {
        Self {
            arch,
            os,
            os_major,
            toolchain: None,
            options: BTreeSet::new(),
        }
    }

    pub fn with_toolchain(mut self, toolchain: Version) -> Self {
        self.toolchain = Some(toolchain);
        self
    }

    pub fn with_option(mut self, option: impl Into<String>) -> Self {
        self.options.insert(option.into());
        self
    }

    pub fn host_triple(&self) -> String {
        match self.os {
            OsFamily::Macos => format!("{}-apple-darwin{}", self.arch.cpu(), self.os_major),
            OsFamily::Linux => format!("{}-unknown-linux-gnu", self.arch.cpu()),
        }
    }
}
