// keg-aio/src/lib.rs
//! Filesystem, archive, checksum and subprocess primitives for keg.

pub mod checksum;
pub mod extract;
pub mod fs;
pub mod process;

pub use checksum::{verify_bytes, verify_checksum_async, verify_or_discard};
pub use extract::extract_archive_async;
pub use process::{run_command_async, CapturedOutput, ScopedCommand};
