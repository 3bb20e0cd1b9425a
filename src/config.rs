//! Build-wide configuration, assembled by the driver binary from CLI args
//! and handed down to the builder.

#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Max concurrently running children (before the jobserver's `+1`).
    pub parallelism: usize,
    /// How many command failures to tolerate before aborting the build.
    pub failures_allowed: usize,
    /// Directory to chdir into before doing anything else (`-C`).
    pub build_dir: Option<std::path::PathBuf>,
    /// Emit `tracing::debug!` explanations for each dirty node.
    pub explain: bool,
    /// Recompute dirtiness and print what would run, without running it.
    pub dry_run: bool,
    /// What a leaf depfile line naming the same target twice should do.
    pub depfile_distinct_target_lines: crate::parse::DistinctTargetLinesPolicy,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            failures_allowed: 1,
            build_dir: None,
            explain: false,
            dry_run: false,
            depfile_distinct_target_lines: crate::parse::DistinctTargetLinesPolicy::Warn,
        }
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_allows_at_least_one_failure_and_one_job() {
        let config = BuildConfig::default();
        assert!(config.failures_allowed >= 1);
        assert!(config.parallelism >= 1);
        assert!(!config.explain);
        assert!(!config.dry_run);
    }
}
