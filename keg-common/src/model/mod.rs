// keg-common/src/model/mod.rs
pub mod condition;
pub mod env;
pub mod facts;
pub mod plan;
pub mod recipe;
pub mod test_spec;
pub mod version;

pub use condition::{Branch, Conditional, Guarded, Predicate};
pub use env::EnvOverlay;
pub use facts::{Arch, EnvironmentFacts, OsFamily};
pub use plan::{ActivePatch, ActiveSource, BuildPlan, PlannedPostInstall, PlannedStep, ResolvedDependency};
pub use recipe::{AllowRule, BuildStep, PostInstall, Recipe};
pub use test_spec::{DaemonTest, Matcher, Readiness, TestCommand, TestSpec, TestStep};
