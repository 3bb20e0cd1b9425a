//! CLI driver: load a manifest, recompute dirtiness, and run the build.
//! Kept synchronous throughout — there's no async runtime anywhere in this
//! crate, just one thread per in-flight child process.

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;

use nicorn::builder::{default_paths, Builder};
use nicorn::config::BuildConfig;
use nicorn::disk::RealDiskInterface;
use nicorn::error::NinjaError;
use nicorn::graph::{NodeId, State};
use nicorn::parse::{parse_manifest, RealFileReader};
use nicorn::runner::PosixCommandRunner;
use nicorn::status::TracingStatus;

#[derive(Parser, Debug)]
#[command(name = "nicorn", about = "A small build executor in the ninja tradition")]
struct Cli {
    /// Targets to build. Defaults to the manifest's `default` statement(s),
    /// or every output if none was given.
    targets: Vec<String>,

    /// Change to this directory before doing anything else.
    #[arg(short = 'C', long = "directory")]
    directory: Option<String>,

    /// Path to the input manifest, relative to the build directory.
    #[arg(short = 'f', long = "file", default_value = "build.ninja")]
    file: String,

    /// Number of jobs to run in parallel.
    #[arg(short = 'j', long = "jobs")]
    jobs: Option<usize>,

    /// Number of failed commands to tolerate before stopping.
    #[arg(short = 'k', long = "keep-going", default_value_t = 1)]
    keep_going: usize,

    /// Recompute dirtiness and report what would run, without running it.
    #[arg(short = 'n', long = "dry-run")]
    dry_run: bool,

    /// Explain why each rebuilt output is considered dirty.
    #[arg(short = 'd', long = "debug")]
    explain: bool,
}

fn run() -> Result<(), NinjaError> {
    let cli = Cli::parse();
    let build_dir = cli.directory.as_deref().map(Path::new).unwrap_or_else(|| Path::new("."));

    let disk = RealDiskInterface;
    let reader = RealFileReader { base_dir: build_dir.to_path_buf() };
    let status = TracingStatus::new();

    let manifest_path = cli.file.clone();
    let content = reader
        .read(&manifest_path)
        .map_err(|e| NinjaError::Parse(nicorn::error::ParseError::new(manifest_path.clone(), 0, 0, format!("{e}"), "")))?;

    let mut state = State::new();
    parse_manifest(&mut state, &manifest_path, &content, &reader)?;

    let targets: Vec<NodeId> = if cli.targets.is_empty() {
        if state.defaults.is_empty() {
            all_output_nodes(&state)
        } else {
            state.defaults.clone()
        }
    } else {
        cli.targets
            .iter()
            .map(|t| state.lookup_node(t).ok_or_else(|| nicorn::error::GraphError::UnknownTarget { path: t.clone() }))
            .collect::<Result<Vec<_>, _>>()?
    };

    let config = BuildConfig {
        parallelism: cli.jobs.unwrap_or_else(|| BuildConfig::default().parallelism),
        failures_allowed: cli.keep_going.max(1),
        build_dir: Some(build_dir.to_path_buf()),
        explain: cli.explain,
        dry_run: cli.dry_run,
        ..BuildConfig::default()
    };

    let paths = default_paths(build_dir);
    let runner = Box::new(PosixCommandRunner::new(config.parallelism));
    let mut builder = Builder::new(&mut state, &disk, &reader, &status, config, runner, paths);
    builder.build(&targets)
}

fn all_output_nodes(state: &State) -> Vec<NodeId> {
    state
        .edges
        .iter()
        .flat_map(|e| e.explicit_outputs().iter().copied())
        .collect()
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("nicorn: {e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
