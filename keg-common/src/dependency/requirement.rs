// keg-common/src/dependency/requirement.rs
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{KegError, Result};
use crate::model::facts::{EnvironmentFacts, OsFamily};
use crate::model::version::lenient_version;

/// Host capabilities a recipe needs before anything is fetched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Requirement {
    /// Minimum toolchain version, e.g. Xcode `"11.1"`.
    Toolchain(String),
    /// Minimum OS major version.
    OsMajor(u32),
    Os(OsFamily),
}

impl Requirement {
    pub fn check(&self, facts: &EnvironmentFacts) -> Result<()> {
        let satisfied = match self {
            Self::Toolchain(min) => {
                let min = lenient_version(min)?;
                facts.toolchain.as_ref().is_some_and(|v| *v >= min)
            }
            Self::OsMajor(min) => facts.os_major >= *min,
            Self::Os(os) => facts.os == *os,
        };
        if satisfied {
            Ok(())
        } else {
            Err(KegError::Configuration(format!(
                "Unsatisfied requirement: {self} (host: {} {} {}, toolchain {})",
                facts.os,
                facts.os_major,
                facts.arch,
                facts
                    .toolchain
                    .as_ref()
                    .map_or_else(|| "unknown".to_string(), |v| v.to_string())
            )))
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Toolchain(v) => write!(f, "toolchain >= {v}"),
            Self::OsMajor(v) => write!(f, "OS major >= {v}"),
            Self::Os(os) => write!(f, "OS == {os}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::facts::Arch;

    #[test]
    fn toolchain_requirement() {
        let facts = EnvironmentFacts::new(Arch::X86_64, OsFamily::Macos, 20)
            .with_toolchain(lenient_version("12.2").unwrap());
        assert!(Requirement::Toolchain("11.1".into()).check(&facts).is_ok());
        let err = Requirement::Toolchain("13".into()).check(&facts).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("toolchain >= 13"));
    }

    #[test]
    fn os_requirements() {
        let facts = EnvironmentFacts::new(Arch::X86_64, OsFamily::Linux, 6);
        assert!(Requirement::OsMajor(5).check(&facts).is_ok());
        assert!(Requirement::Os(OsFamily::Macos).check(&facts).is_err());
    }
}
