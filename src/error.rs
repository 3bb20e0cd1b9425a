//! Unified error taxonomy.
//!
//! Each subsystem gets its own `#[derive(Error)]` enum; `NinjaError` unifies
//! them. Fatal vs. recoverable is a property of *where* an error is
//! handled, not of the type, except for `Interrupted` which the driver uses
//! to pick exit code 2.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the manifest/depfile/dyndep lexer and parsers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{file}:{line}:{col}: {message}\n{context}\n{caret}")]
pub struct ParseError {
    pub file: String,
    pub line: usize,
    pub col: usize,
    pub message: String,
    pub context: String,
    pub caret: String,
}

impl ParseError {
    pub fn new(file: impl Into<String>, line: usize, col: usize, message: impl Into<String>, full_line: &str) -> Self {
        let context: String = full_line.chars().take(72).collect();
        let caret_col = col.min(context.chars().count());
        let caret = format!("{}^", " ".repeat(caret_col));
        Self {
            file: file.into(),
            line,
            col,
            message: message.into(),
            context,
            caret,
        }
    }
}

/// Graph-integrity errors: duplicate producers, unknown rules, missing
/// `command =`, bad invariants.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("{path}: multiple rules generate {path}")]
    MultipleProducers { path: String },

    #[error("unknown build rule '{name}'")]
    UnknownRule { name: String },

    #[error("rule '{name}' has no command")]
    MissingCommand { name: String },

    #[error("depfile is only allowed on edges with exactly one explicit output (rule '{rule}')")]
    DepfileMultipleOutputs { rule: String },

    #[error("duplicate rule '{name}'")]
    DuplicateRule { name: String },

    #[error("dependency cycle detected at '{path}'")]
    Cycle { path: String },

    #[error("'{path}' is a leaf node with no rule to build it")]
    MissingInput { path: String },

    #[error("unknown target '{path}'")]
    UnknownTarget { path: String },
}

/// Persistent-log errors. These are recoverable: callers log a warning and
/// continue with a truncated/empty log.
#[derive(Error, Debug)]
pub enum LogError {
    #[error("io error on {path}: {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },

    #[error("premature end of file; recovering")]
    Truncated,

    #[error("bad deps log signature or version; starting over")]
    BadSignature,

    #[error("concurrent writer detected; discarding record")]
    ConcurrentWriter,
}

/// Command-runner / process errors.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("failed to spawn command: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("jobserver protocol error: {0}")]
    Jobserver(String),

    #[error("build interrupted")]
    Interrupted,
}

/// Top-level error type returned by builder entry points.
#[derive(Error, Debug)]
pub enum NinjaError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Run(#[from] RunError),
    #[error("{failed} command(s) failed")]
    BuildFailed { failed: usize },
    #[error("interrupted")]
    Interrupted,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl NinjaError {
    /// Exit code a driver should use.
    pub fn exit_code(&self) -> i32 {
        match self {
            NinjaError::Interrupted | NinjaError::Run(RunError::Interrupted) => 2,
            _ => 1,
        }
    }
}
