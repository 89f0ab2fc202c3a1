// keg-core/src/build/mod.rs
// Everything needed to turn a plan into a populated prefix.

pub mod devtools;
pub mod env;
pub mod executor;
pub mod template;

pub use env::BuildEnvironment;
pub use executor::BuildExecutor;
