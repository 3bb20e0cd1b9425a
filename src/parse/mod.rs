//! Parsing: the shared lexer cursor plus the manifest, depfile, and dyndep
//! grammars built on top of it.

pub mod depfile;
pub mod dyndep;
pub mod lexer;
pub mod manifest;

pub use depfile::{parse_depfile, DepfileContents, DistinctTargetLinesPolicy};
pub use dyndep::{apply_dyndep, parse_dyndep, DyndepFile, DyndepRecord};
pub use manifest::{parse_manifest, FileReader, RealFileReader};
