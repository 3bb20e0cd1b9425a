//! A small, fast build executor in the ninja/make tradition: parses a
//! manifest into a dependency graph, figures out what's dirty, and drives a
//! pool of child processes to bring it up to date.

pub mod arena;
pub mod builder;
pub mod config;
pub mod disk;
pub mod dirty;
pub mod error;
pub mod eval;
pub mod graph;
pub mod hash_cache;
pub mod log;
pub mod parse;
pub mod plan;
pub mod runner;
pub mod status;

pub use builder::{Builder, Paths};
pub use config::BuildConfig;
pub use error::NinjaError;
pub use graph::{EdgeId, NodeId, State};
