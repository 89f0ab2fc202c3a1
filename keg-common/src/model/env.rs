// keg-common/src/model/env.rs
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Explicit environment changes for a subprocess. Removals are applied
/// before assignments, so a variable both unset and set ends up set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvOverlay {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub set: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub unset: BTreeSet<String>,
}

impl EnvOverlay {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set.insert(key.into(), value.into());
        self
    }

    pub fn unset(mut self, key: impl Into<String>) -> Self {
        self.unset.insert(key.into());
        self
    }

    /// Layers `top` over `self`: anything `top` removes is gone even if
    /// `self` assigned it, anything `top` assigns wins.
    pub fn layered(&self, top: &EnvOverlay) -> EnvOverlay {
        let mut merged = self.clone();
        for key in &top.unset {
            merged.set.remove(key);
            merged.unset.insert(key.clone());
        }
        for (key, value) in &top.set {
            merged.unset.remove(key);
            merged.set.insert(key.clone(), value.clone());
        }
        merged
    }

    pub fn apply_to(&self, vars: &mut BTreeMap<String, String>) {
        for key in &self.unset {
            vars.remove(key);
        }
        for (key, value) in &self.set {
            vars.insert(key.clone(), value.clone());
        }
    }
}
