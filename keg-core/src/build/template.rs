// keg-core/src/build/template.rs
//! `{{name}}` substitution for step arguments, paths and test files.

use std::collections::BTreeMap;

use keg_common::error::{KegError, Result};

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Names referenced by `template`, in order of appearance.
pub fn referenced_names(template: &str) -> Result<Vec<&str>> {
    let mut names = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find(OPEN) {
        let after = &rest[start + OPEN.len()..];
        let end = after.find(CLOSE).ok_or_else(|| {
            KegError::Configuration(format!("Unterminated '{{{{' in template '{template}'"))
        })?;
        let name = after[..end].trim();
        if name.is_empty() {
            return Err(KegError::Configuration(format!(
                "Empty placeholder in template '{template}'"
            )));
        }
        names.push(name);
        rest = &after[end + CLOSE.len()..];
    }
    Ok(names)
}

/// Expands every placeholder. Unknown names are configuration errors.
pub fn render(template: &str, vars: &BTreeMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + OPEN.len()..];
        let end = after.find(CLOSE).ok_or_else(|| {
            KegError::Configuration(format!("Unterminated '{{{{' in template '{template}'"))
        })?;
        let name = after[..end].trim();
        let value = vars.get(name).ok_or_else(|| {
            KegError::Configuration(format!(
                "Unknown template variable '{name}' in '{template}'"
            ))
        })?;
        out.push_str(value);
        rest = &after[end + CLOSE.len()..];
    }
    out.push_str(rest);
    Ok(out)
}

pub fn render_all(templates: &[String], vars: &BTreeMap<String, String>) -> Result<Vec<String>> {
    templates.iter().map(|t| render(t, vars)).collect()
}
