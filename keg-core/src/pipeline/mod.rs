// keg-core/src/pipeline/mod.rs
pub mod engine;

pub use engine::install_many;
