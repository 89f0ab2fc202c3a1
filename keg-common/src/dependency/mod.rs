// keg-common/src/dependency/mod.rs
pub mod definition;
pub mod requirement;

pub use definition::{Dependency, DependencyTag};
pub use requirement::Requirement;
