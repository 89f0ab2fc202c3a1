// keg-common/src/dependency/definition.rs
use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::model::condition::{Guarded, Predicate};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct DependencyTag: u8 {
        const RUNTIME = 0b00000001;
        const BUILD   = 0b00000010;
        /// Provided by the host system rather than by another recipe.
        const SYSTEM  = 0b00000100;
    }
}

impl Default for DependencyTag {
    fn default() -> Self {
        Self::RUNTIME
    }
}

impl DependencyTag {
    pub fn mode_name(&self) -> &'static str {
        if self.contains(Self::SYSTEM) {
            "system"
        } else if self.contains(Self::RUNTIME) {
            "runtime"
        } else {
            "build"
        }
    }

    fn from_mode_name(mode: &str) -> Option<Self> {
        match mode {
            "runtime" => Some(Self::RUNTIME),
            "build" | "build-only" | "build_only" => Some(Self::BUILD),
            "system" | "from-system" | "from_system" => Some(Self::SYSTEM),
            _ => None,
        }
    }
}

impl fmt::Display for DependencyTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mode_name())
    }
}

// Recipes spell the resolution mode as a word, not as raw flags.
impl Serialize for DependencyTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.mode_name())
    }
}

impl<'de> Deserialize<'de> for DependencyTag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::from_mode_name(&raw).ok_or_else(|| {
            serde::de::Error::custom(format!(
                "unknown dependency mode '{raw}' (expected runtime, build or system)"
            ))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    #[serde(default, rename = "mode")]
    pub tags: DependencyTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<Predicate>,
}

impl Dependency {
    pub fn new_runtime(name: impl Into<String>) -> Self {
        Self::new_with_tags(name, DependencyTag::RUNTIME)
    }

    pub fn new_with_tags(name: impl Into<String>, tags: DependencyTag) -> Self {
        Self {
            name: name.into(),
            tags,
            when: None,
        }
    }

    pub fn is_system(&self) -> bool {
        self.tags.contains(DependencyTag::SYSTEM)
    }
}

impl Guarded for Dependency {
    fn guard(&self) -> Option<&Predicate> {
        self.when.as_ref()
    }
}
