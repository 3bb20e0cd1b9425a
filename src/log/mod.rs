//! The two persistent append-only logs: the build log (text, command
//! hashes) and the deps log (binary, discovered header dependencies).

pub mod build_log;
pub mod deps_log;

pub use build_log::{BuildLog, BuildLogEntry};
pub use deps_log::{DepsLog, DepsRecord};
