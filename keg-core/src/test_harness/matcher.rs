// keg-core/src/test_harness/matcher.rs
use std::collections::BTreeMap;

use keg_common::error::{KegError, Result};
use keg_common::model::test_spec::Matcher;
use regex::Regex;

use crate::build::template::render;

/// Expands the matcher's template against `vars`.
pub fn render_matcher(matcher: &Matcher, vars: &BTreeMap<String, String>) -> Result<Matcher> {
    Ok(match matcher {
        Matcher::Equals(s) => Matcher::Equals(render(s, vars)?),
        Matcher::Contains(s) => Matcher::Contains(render(s, vars)?),
        Matcher::Matches(s) => Matcher::Matches(render(s, vars)?),
    })
}

/// Applies an already-rendered matcher. Equality ignores trailing
/// whitespace on both sides.
pub fn is_match(matcher: &Matcher, output: &str) -> Result<bool> {
    Ok(match matcher {
        Matcher::Equals(expected) => output.trim_end() == expected.trim_end(),
        Matcher::Contains(needle) => output.contains(needle.as_str()),
        Matcher::Matches(pattern) => Regex::new(pattern)
            .map_err(|e| KegError::Configuration(format!("Invalid expect pattern '{pattern}': {e}")))?
            .is_match(output),
    })
}
