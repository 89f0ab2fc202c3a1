// keg-core/src/lib.rs
// Recipe evaluation: variant selection, building, pruning, smoke tests and
// the install pipeline that strings them together.

pub mod build;
pub mod install;
pub mod pipeline;
pub mod prune;
pub mod test_harness;
pub mod variant;

#[cfg(test)]
mod test_support;

pub use build::devtools::detect_environment_facts;
pub use install::{InstallFailure, InstallReport, InstallResult, Installer};
pub use pipeline::install_many;
pub use prune::{prune, prune_async, PruneReport};
pub use test_harness::{TestHarness, TestOutcome};
pub use variant::VariantSelector;
