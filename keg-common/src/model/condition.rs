// keg-common/src/model/condition.rs
//! Predicates over [`EnvironmentFacts`] and the first-match selection rule
//! shared by every conditional recipe field.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::facts::{Arch, EnvironmentFacts, OsFamily};
use super::version::lenient_version;
use crate::error::{KegError, Result};

/// A conjunction of fact tests. Every field that is present must hold; an
/// empty predicate always holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Predicate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<Arch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_arch: Option<Arch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<OsFamily>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_major_min: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_major_max: Option<u32>,
    /// Holds when the toolchain version is at least this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toolchain_min: Option<String>,
    /// Holds when the toolchain version is strictly below this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toolchain_below: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub option: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub without_option: Option<String>,
}

impl Predicate {
    pub fn arch(arch: Arch) -> Self {
        Self {
            arch: Some(arch),
            ..Self::default()
        }
    }

    pub fn option(name: impl Into<String>) -> Self {
        Self {
            option: Some(name.into()),
            ..Self::default()
        }
    }

    /// Evaluates the predicate. Errors only when a version bound in the
    /// predicate itself cannot be parsed.
    pub fn matches(&self, facts: &EnvironmentFacts) -> Result<bool> {
        if let Some(arch) = &self.arch {
            if &facts.arch != arch {
                return Ok(false);
            }
        }
        if let Some(arch) = &self.not_arch {
            if &facts.arch == arch {
                return Ok(false);
            }
        }
        if let Some(os) = self.os {
            if facts.os != os {
                return Ok(false);
            }
        }
        if let Some(min) = self.os_major_min {
            if facts.os_major < min {
                return Ok(false);
            }
        }
        if let Some(max) = self.os_major_max {
            if facts.os_major > max {
                return Ok(false);
            }
        }
        if let Some(min) = &self.toolchain_min {
            let min = lenient_version(min)?;
            match &facts.toolchain {
                Some(v) if *v >= min => {}
                _ => return Ok(false),
            }
        }
        if let Some(below) = &self.toolchain_below {
            let below = lenient_version(below)?;
            match &facts.toolchain {
                Some(v) if *v < below => {}
                _ => return Ok(false),
            }
        }
        if let Some(option) = &self.option {
            if !facts.options.contains(option) {
                return Ok(false);
            }
        }
        if let Some(option) = &self.without_option {
            if facts.options.contains(option) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Option names this predicate refers to.
    pub fn referenced_options(&self) -> impl Iterator<Item = &str> {
        self.option
            .iter()
            .chain(self.without_option.iter())
            .map(String::as_str)
    }

    /// Checks that every version bound parses.
    pub fn validate(&self) -> Result<()> {
        for bound in self.toolchain_min.iter().chain(self.toolchain_below.iter()) {
            lenient_version(bound)?;
        }
        Ok(())
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(a) = &self.arch {
            parts.push(format!("arch == {a}"));
        }
        if let Some(a) = &self.not_arch {
            parts.push(format!("arch != {a}"));
        }
        if let Some(os) = &self.os {
            parts.push(format!("os == {os}"));
        }
        if let Some(v) = self.os_major_min {
            parts.push(format!("os_major >= {v}"));
        }
        if let Some(v) = self.os_major_max {
            parts.push(format!("os_major <= {v}"));
        }
        if let Some(v) = &self.toolchain_min {
            parts.push(format!("toolchain >= {v}"));
        }
        if let Some(v) = &self.toolchain_below {
            parts.push(format!("toolchain < {v}"));
        }
        if let Some(o) = &self.option {
            parts.push(format!("with {o}"));
        }
        if let Some(o) = &self.without_option {
            parts.push(format!("without {o}"));
        }
        if parts.is_empty() {
            f.write_str("always")
        } else {
            f.write_str(&parts.join(" && "))
        }
    }
}

/// Anything that may carry a `when` guard.
pub trait Guarded {
    fn guard(&self) -> Option<&Predicate>;

    /// Unguarded items always apply.
    fn applies(&self, facts: &EnvironmentFacts) -> Result<bool> {
        match self.guard() {
            Some(predicate) => predicate.matches(facts),
            None => Ok(true),
        }
    }
}

/// Returns the first item, in declaration order, whose guard holds.
pub fn first_match<'a, T: Guarded>(items: &'a [T], facts: &EnvironmentFacts) -> Result<Option<&'a T>> {
    for item in items {
        if item.applies(facts)? {
            return Ok(Some(item));
        }
    }
    Ok(None)
}

/// Keeps every item whose guard holds, preserving order.
pub fn all_matching<'a, T: Guarded>(items: &'a [T], facts: &EnvironmentFacts) -> Result<Vec<&'a T>> {
    let mut selected = Vec::with_capacity(items.len());
    for item in items {
        if item.applies(facts)? {
            selected.push(item);
        }
    }
    Ok(selected)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch<T> {
    pub when: Predicate,
    pub value: T,
}

impl<T> Guarded for Branch<T> {
    fn guard(&self) -> Option<&Predicate> {
        Some(&self.when)
    }
}

/// A field whose value depends on the environment: first matching branch
/// wins, then the default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conditional<T> {
    #[serde(default, rename = "branch")]
    pub branches: Vec<Branch<T>>,
    #[serde(default)]
    pub default: Option<T>,
}

impl<T: Clone> Conditional<T> {
    pub fn select(&self, field: &str, facts: &EnvironmentFacts) -> Result<T> {
        if let Some(branch) = first_match(&self.branches, facts)? {
            return Ok(branch.value.clone());
        }
        self.default.clone().ok_or_else(|| {
            let tried: Vec<String> = self.branches.iter().map(|b| b.when.to_string()).collect();
            KegError::Configuration(format!(
                "No branch of '{field}' matches the environment (tried: [{}]) and no default is declared",
                tried.join("; ")
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac_arm() -> EnvironmentFacts {
        EnvironmentFacts::new(Arch::Arm64, OsFamily::Macos, 20)
            .with_toolchain(lenient_version("1200").unwrap())
    }

    #[test]
    fn empty_predicate_always_holds() {
        assert!(Predicate::default().matches(&mac_arm()).unwrap());
        assert_eq!(Predicate::default().to_string(), "always");
    }

    #[test]
    fn every_present_field_must_hold() {
        let p = Predicate {
            arch: Some(Arch::Arm64),
            os_major_min: Some(21),
            ..Predicate::default()
        };
        assert!(!p.matches(&mac_arm()).unwrap());
        let p = Predicate {
            arch: Some(Arch::Arm64),
            os_major_min: Some(20),
            ..Predicate::default()
        };
        assert!(p.matches(&mac_arm()).unwrap());
    }

    #[test]
    fn toolchain_bounds() {
        let at_least = Predicate {
            toolchain_min: Some("1000".to_string()),
            ..Predicate::default()
        };
        assert!(at_least.matches(&mac_arm()).unwrap());

        let below = Predicate {
            toolchain_below: Some("1000".to_string()),
            ..Predicate::default()
        };
        assert!(!below.matches(&mac_arm()).unwrap());

        // Unknown toolchain never satisfies a bound.
        let no_tc = EnvironmentFacts::new(Arch::X86_64, OsFamily::Linux, 5);
        assert!(!at_least.matches(&no_tc).unwrap());
    }

    #[test]
    fn options_and_negations() {
        let facts = mac_arm().with_option("with-jit");
        assert!(Predicate::option("with-jit").matches(&facts).unwrap());
        let without = Predicate {
            without_option: Some("with-jit".to_string()),
            ..Predicate::default()
        };
        assert!(!without.matches(&facts).unwrap());
        let not_arm = Predicate {
            not_arch: Some(Arch::Arm64),
            ..Predicate::default()
        };
        assert!(!not_arm.matches(&facts).unwrap());
    }

    #[test]
    fn conditional_first_branch_wins() {
        let cond = Conditional {
            branches: vec![
                Branch {
                    when: Predicate::arch(Arch::Arm64),
                    value: "first".to_string(),
                },
                Branch {
                    when: Predicate::default(),
                    value: "second".to_string(),
                },
            ],
            default: Some("fallback".to_string()),
        };
        assert_eq!(cond.select("cpu", &mac_arm()).unwrap(), "first");
    }

    #[test]
    fn conditional_without_match_or_default_is_configuration_error() {
        let cond: Conditional<String> = Conditional {
            branches: vec![Branch {
                when: Predicate::arch(Arch::X86_64),
                value: "intel".to_string(),
            }],
            default: None,
        };
        let err = cond.select("cpu", &mac_arm()).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("arch == x86_64"));
    }

    #[test]
    fn unknown_predicate_keys_are_rejected() {
        let parsed: std::result::Result<Predicate, _> =
            serde_json::from_str(r#"{"cpu": "arm64"}"#);
        assert!(parsed.is_err());
    }
}
