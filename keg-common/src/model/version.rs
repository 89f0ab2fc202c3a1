// keg-common/src/model/version.rs
use semver::Version;

use crate::error::{KegError, Result};

/// Parses versions the way recipes write them: `"11.1"` becomes `11.1.0`,
/// `"1000"` becomes `1000.0.0`. Anything after the numeric core (`-rc1`,
/// `+build`) is handled by semver itself.
pub fn lenient_version(raw: &str) -> Result<Version> {
    let trimmed = raw.trim().trim_start_matches('v');
    let (core, rest) = match trimmed.find(['-', '+']) {
        Some(idx) => trimmed.split_at(idx),
        None => (trimmed, ""),
    };
    let padded = match core.split('.').count() {
        1 => format!("{core}.0.0{rest}"),
        2 => format!("{core}.0{rest}"),
        _ => trimmed.to_string(),
    };
    Version::parse(&padded)
        .map_err(|e| KegError::Parse("version", format!("Invalid version '{raw}': {e}")))
}

/// Leading numeric component of a version string (`"10.2.0"` -> `"10"`).
pub fn version_major(raw: &str) -> String {
    raw.split(['.', '-', '_'])
        .next()
        .unwrap_or(raw)
        .to_string()
}
