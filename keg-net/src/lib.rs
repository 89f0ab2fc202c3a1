// keg-net/src/lib.rs
pub mod http;
pub mod validation;

pub use http::fetch_source;
pub use validation::{validate_url, SourceLocation};
