// keg-common/src/lib.rs
pub mod cache;
pub mod config;
pub mod dependency;
pub mod error;
pub mod formulary;
pub mod keg;
pub mod logging;
pub mod model;
pub mod pipeline;

pub use cache::Cache;
pub use config::Config;
pub use error::{KegError, Result};
pub use formulary::Formulary;
pub use model::{BuildPlan, EnvironmentFacts, Recipe};
