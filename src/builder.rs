//! Glues the plan, the runner, and the two persistent logs into one build
//! cycle: pull ready work off the plan, hand it to the runner, and fold
//! each finished edge's effects (build log, deps log, restat) back in
//! before asking the plan what's ready next.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::config::BuildConfig;
use crate::disk::DiskInterface;
use crate::dirty::{recompute_dirty, recompute_dirty_shallow, DirtyContext};
use crate::error::{NinjaError, RunError};
use crate::graph::{EdgeId, MTime, NodeId, State};
use crate::hash_cache::{fnv1a64, HashCache};
use crate::log::{BuildLog, BuildLogEntry, DepsLog};
use crate::parse::manifest::FileReader;
use crate::plan::{Plan, Want};
use crate::runner::{CommandRunner, RspFileSpec, Task};
use crate::status::{EdgeResult, StatusSink};

pub struct Paths {
    pub build_log: PathBuf,
    pub deps_log: PathBuf,
    pub hash_cache: PathBuf,
}

pub struct Builder<'a> {
    state: &'a mut State,
    disk: &'a dyn DiskInterface,
    reader: &'a dyn FileReader,
    status: &'a dyn StatusSink,
    config: BuildConfig,
    runner: Box<dyn CommandRunner + 'a>,
    build_log: BuildLog,
    deps_log: DepsLog,
    hash_cache: HashCache,
    paths: Paths,
    now_ms: u64,
    /// Output mtimes captured just before a `restat = 1` edge runs, so
    /// `record_success` can tell a no-op run from one that actually changed
    /// the output.
    restat_pre_mtimes: HashMap<EdgeId, Vec<MTime>>,
}

impl<'a> Builder<'a> {
    pub fn new(
        state: &'a mut State,
        disk: &'a dyn DiskInterface,
        reader: &'a dyn FileReader,
        status: &'a dyn StatusSink,
        config: BuildConfig,
        runner: Box<dyn CommandRunner + 'a>,
        paths: Paths,
    ) -> Self {
        let build_log = BuildLog::load(&paths.build_log).unwrap_or_else(|_| BuildLog::new());
        let deps_log = DepsLog::load(&paths.deps_log).unwrap_or_else(|_| DepsLog::new());
        let hash_cache = HashCache::load(&paths.hash_cache);
        Self {
            state,
            disk,
            reader,
            status,
            config,
            runner,
            build_log,
            deps_log,
            hash_cache,
            paths,
            now_ms: 0,
            restat_pre_mtimes: HashMap::new(),
        }
    }

    fn next_timestamp(&mut self) -> u64 {
        self.now_ms += 1;
        self.now_ms
    }

    /// Recompute dirtiness for every target, seed the plan, then run the
    /// build to completion (or to the `failures_allowed` threshold).
    pub fn build(&mut self, targets: &[NodeId]) -> Result<(), NinjaError> {
        let ctx = DirtyContext {
            disk: self.disk,
            build_log: &self.build_log,
            deps_log: &self.deps_log,
            hash_cache: Some(&self.hash_cache),
            reader: self.reader,
            explain: self.config.explain,
        };
        for &target in targets {
            recompute_dirty(self.state, target, &ctx)?;
        }

        let mut plan = Plan::new(self.config.failures_allowed);
        for &target in targets {
            plan.add_target(self.state, target);
        }

        self.status.build_started();
        if self.config.dry_run {
            self.status.info("dry run: not executing any commands");
            self.status.build_finished(0);
            return Ok(());
        }

        self.run_plan(&mut plan)?;

        self.persist_logs();
        self.status.build_finished(plan.failure_count());

        if plan.is_aborted() || plan.failure_count() > 0 {
            return Err(NinjaError::BuildFailed { failed: plan.failure_count() });
        }
        Ok(())
    }

    fn run_plan(&mut self, plan: &mut Plan) -> Result<(), NinjaError> {
        loop {
            while plan.has_ready_work() && self.runner.can_start_more() {
                let Some(edge_id) = plan.find_work() else { break };
                if self.state.edge(edge_id).is_phony() {
                    self.finish_phony(plan, edge_id);
                    continue;
                }
                self.start_edge(plan, edge_id)?;
            }

            if !self.runner.is_running() {
                break;
            }

            self.runner.wait_for_any().map_err(|e| self.interrupted_or(e))?;
            while let Some(finished) = self.runner.next_finished() {
                self.finish_edge(plan, finished.edge, finished.result.success, finished.result.output);
            }

            if plan.is_complete() {
                break;
            }
        }
        Ok(())
    }

    fn interrupted_or(&self, e: RunError) -> NinjaError {
        match e {
            RunError::Interrupted => NinjaError::Interrupted,
            other => NinjaError::Run(other),
        }
    }

    fn finish_phony(&mut self, plan: &mut Plan, edge_id: EdgeId) {
        self.status.edge_finished("phony", &EdgeResult { success: true, output: String::new() });
        plan.edge_finished(self.state, edge_id, true);
    }

    fn start_edge(&mut self, plan: &mut Plan, edge_id: EdgeId) -> Result<(), NinjaError> {
        let edge = self.state.edge(edge_id);
        let command = self.state.evaluate_command(edge);
        let description = self.state.evaluate_binding(edge, "description");
        let label = if description.is_empty() { command.clone() } else { description };
        let use_console = edge.pool == "console";

        let rspfile = self.state.evaluate_binding(edge, "rspfile");
        let rspfile = if rspfile.is_empty() {
            None
        } else {
            let content = self.state.evaluate_binding(edge, "rspfile_content");
            Some(RspFileSpec { path: PathBuf::from(rspfile), content })
        };

        if edge.restat {
            let pre: Vec<MTime> = edge.explicit_outputs().iter().map(|&o| self.disk.stat(&self.state.node(o).path)).collect();
            self.restat_pre_mtimes.insert(edge_id, pre);
        }

        self.status.edge_started(&label, 1, 1);
        match self.runner.start(Task { edge: edge_id, command, rspfile, use_console }) {
            Ok(()) => Ok(()),
            Err(RunError::Interrupted) => Err(NinjaError::Interrupted),
            Err(e) => Err(NinjaError::Run(e)),
        }?;
        let _ = plan;
        Ok(())
    }

    fn finish_edge(&mut self, plan: &mut Plan, edge_id: EdgeId, success: bool, output: String) {
        let label = self.state.evaluate_command(self.state.edge(edge_id));
        self.status.edge_finished(&label, &EdgeResult { success, output: output.clone() });

        if !success {
            self.status.warning(&format!("{label}: failed\n{output}"));
            plan.edge_finished(self.state, edge_id, false);
            return;
        }

        let restat_noop = match self.record_success(edge_id) {
            Ok(noop) => noop,
            Err(e) => {
                self.status.warning(&format!("post-build bookkeeping failed for an edge: {e}"));
                false
            }
        };
        plan.edge_finished(self.state, edge_id, true);
        if restat_noop {
            self.skip_restat_unchanged_dependents(plan, edge_id);
        }
    }

    /// After a successful run: ingest the depfile (if any), record the
    /// build log entry, and update the deps log / hash cache. Returns
    /// whether this was a `restat = 1` edge whose outputs came out of the
    /// run with the same mtime they had going in (a no-op run).
    fn record_success(&mut self, edge_id: EdgeId) -> Result<bool, NinjaError> {
        self.ingest_depfile(edge_id)?;

        let edge = self.state.edge(edge_id);
        let command = self.state.evaluate_command(edge);
        let command_hash = fnv1a64(command.as_bytes());
        let pre_mtimes = self.restat_pre_mtimes.remove(&edge_id);
        let mut restat_noop = self.state.edge(edge_id).restat && pre_mtimes.is_some();
        let start_ms = self.next_timestamp();
        let end_ms = self.next_timestamp();

        let outputs = self.state.edge(edge_id).explicit_outputs().to_vec();
        for (i, &out) in outputs.iter().enumerate() {
            let path = self.state.node(out).path.clone();
            let mtime = self.disk.stat(&path);
            if pre_mtimes.as_ref().and_then(|p| p.get(i)) != Some(&mtime) {
                restat_noop = false;
            }
            let stamp = mtime.as_stamp().unwrap_or(0);
            self.state.node_mut(out).mtime = mtime;
            self.state.node_mut(out).dirty = false;
            self.build_log.record(&path, BuildLogEntry { start_ms, end_ms, output_mtime: stamp, command_hash });
            if let Ok(content) = self.disk.read_file(&path) {
                self.hash_cache.record(&path, fnv1a64(content.as_bytes()), stamp);
            }
            self.build_log.append_record(&self.paths.build_log, &path, self.build_log.get(&path).unwrap())?;
        }
        Ok(restat_noop)
    }

    /// A `restat = 1` edge just finished without actually changing its
    /// output. Dependents already queued behind it were marked dirty only
    /// because this edge itself was dirty; now that its output (and build
    /// log entry) are known unchanged, re-run dirtiness on each dependent
    /// still waiting to start and skip it if it turns out not to need the
    /// rebuild after all. Mirrors `Plan::CleanNode` in upstream ninja.
    fn skip_restat_unchanged_dependents(&mut self, plan: &mut Plan, edge_id: EdgeId) {
        let outputs = self.state.edge(edge_id).outputs.clone();
        let mut dependents = Vec::new();
        for out in &outputs {
            for &dep in &self.state.node(*out).out_edges {
                if !dependents.contains(&dep) {
                    dependents.push(dep);
                }
            }
        }

        for dep_edge in dependents {
            if plan.want(dep_edge) != Want::Start {
                continue;
            }
            let dep_outputs = self.state.edge(dep_edge).explicit_outputs().to_vec();
            if dep_outputs.iter().all(|&o| !self.state.node(o).dirty) {
                continue;
            }
            let ctx = DirtyContext {
                disk: self.disk,
                build_log: &self.build_log,
                deps_log: &self.deps_log,
                hash_cache: Some(&self.hash_cache),
                reader: self.reader,
                explain: self.config.explain,
            };
            for &dep_out in &dep_outputs {
                if recompute_dirty_shallow(self.state, dep_out, &ctx).is_err() {
                    return;
                }
            }
            if dep_outputs.iter().all(|&o| !self.state.node(o).dirty) {
                plan.skip_edge(self.state, dep_edge);
                self.skip_restat_unchanged_dependents(plan, dep_edge);
            }
        }
    }

    fn ingest_depfile(&mut self, edge_id: EdgeId) -> Result<(), NinjaError> {
        let edge = self.state.edge(edge_id);
        let depfile_path = self.state.evaluate_binding(edge, "depfile");
        if depfile_path.is_empty() {
            return Ok(());
        }
        let content = match self.disk.read_file(&depfile_path) {
            Ok(c) => c,
            Err(_) => return Ok(()),
        };
        let parsed = crate::parse::parse_depfile(&depfile_path, &content, self.config.depfile_distinct_target_lines)?;

        let deps_format = self.state.lookup_edge_var(self.state.edge(edge_id), "deps");
        let output_path = self.state.edge_out_str(self.state.edge(edge_id));
        if matches!(deps_format.as_deref(), Some("gcc")) {
            let out_mtime = self.disk.stat(&output_path).as_stamp().unwrap_or(0);
            self.deps_log.append_record(&self.paths.deps_log, &output_path, out_mtime, &parsed.deps)?;
        }

        for dep in &parsed.deps {
            let node = self.state.node_id(dep);
            self.state.edge_mut(edge_id).discovered_ins.push(node);
        }
        Ok(())
    }

    fn persist_logs(&mut self) {
        if self.deps_log.needs_recompaction() {
            let is_dead = |path: &str| self.state.lookup_node(path).is_none();
            if let Err(e) = self.deps_log.recompact(&self.paths.deps_log, is_dead) {
                self.status.warning(&format!("deps log recompaction failed: {e}"));
            }
        }
        if let Err(e) = self.hash_cache.save(&self.paths.hash_cache) {
            self.status.warning(&format!("failed to write hash cache: {e}"));
        }
    }
}

pub fn default_paths(build_dir: &Path) -> Paths {
    Paths {
        build_log: build_dir.join(".ninja_log"),
        deps_log: build_dir.join(".ninja_deps"),
        hash_cache: build_dir.join(".ninja_hashes"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::fake::FakeDisk;
    use crate::eval::{BindingEnv, EvalString};
    use crate::graph::Rule;
    use crate::runner::fake::ScriptedRunner;
    use crate::runner::TaskResult;
    use crate::status::NullStatus;
    use std::collections::HashMap;

    struct NoopReader;
    impl FileReader for NoopReader {
        fn read(&self, _path: &str) -> std::io::Result<String> {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no includes"))
        }
    }

    #[test]
    fn builds_a_single_dirty_edge_and_records_it() {
        let mut s = State::new();
        let mut rule = Rule::new("cc");
        rule.bindings.set("command", EvalString::parse("cc $in -o $out", "").0);
        s.rules.insert("cc".to_string(), rule);
        let inp = s.node_id("a.c");
        let out = s.node_id("a.o");
        s.add_edge("cc".to_string(), BindingEnv::new(), vec![inp], vec![out], 0, 0, 0, String::new()).unwrap();

        let disk = FakeDisk::new();
        disk.set("a.c", "int main(){}", 10);
        let reader = NoopReader;
        let status = NullStatus::new();
        let dir = tempfile::tempdir().unwrap();
        let paths = default_paths(dir.path());

        let edge_id = s.node(out).in_edge.unwrap();
        let mut scripts = HashMap::new();
        scripts.insert(edge_id, TaskResult { success: true, output: String::new() });
        let runner = Box::new(ScriptedRunner::new(1, scripts));

        let config = BuildConfig { parallelism: 1, ..BuildConfig::default() };
        let mut builder = Builder::new(&mut s, &disk, &reader, &status, config, runner, paths);
        builder.build(&[out]).unwrap();

        assert!(!builder.state.node(out).dirty);
        assert!(builder.build_log.get("a.o").is_some());
    }

    #[test]
    fn up_to_date_target_runs_nothing() {
        let mut s = State::new();
        let mut rule = Rule::new("cc");
        rule.bindings.set("command", EvalString::parse("cc $in -o $out", "").0);
        s.rules.insert("cc".to_string(), rule);
        let inp = s.node_id("a.c");
        let out = s.node_id("a.o");
        s.add_edge("cc".to_string(), BindingEnv::new(), vec![inp], vec![out], 0, 0, 0, String::new()).unwrap();

        let disk = FakeDisk::new();
        disk.set("a.c", "src", 10);
        disk.set("a.o", "obj", 20);
        let reader = NoopReader;
        let status = NullStatus::new();
        let dir = tempfile::tempdir().unwrap();
        let paths = default_paths(dir.path());

        let command = s.evaluate_command(s.edge(s.node(out).in_edge.unwrap()));
        let mut build_log = BuildLog::new();
        build_log.record("a.o", BuildLogEntry { start_ms: 0, end_ms: 1, output_mtime: 20, command_hash: fnv1a64(command.as_bytes()) });
        build_log.write_all(&paths.build_log).unwrap();

        let runner = Box::new(ScriptedRunner::new(1, HashMap::new()));
        let config = BuildConfig { parallelism: 1, ..BuildConfig::default() };
        let mut builder = Builder::new(&mut s, &disk, &reader, &status, config, runner, paths);
        builder.build(&[out]).unwrap();

        assert!(!builder.runner.is_running());
    }

    #[test]
    fn failed_edge_surfaces_as_build_failed_error() {
        let mut s = State::new();
        let mut rule = Rule::new("cc");
        rule.bindings.set("command", EvalString::parse("cc $in -o $out", "").0);
        s.rules.insert("cc".to_string(), rule);
        let inp = s.node_id("a.c");
        let out = s.node_id("a.o");
        s.add_edge("cc".to_string(), BindingEnv::new(), vec![inp], vec![out], 0, 0, 0, String::new()).unwrap();

        let disk = FakeDisk::new();
        disk.set("a.c", "src", 10);
        let reader = NoopReader;
        let status = NullStatus::new();
        let dir = tempfile::tempdir().unwrap();
        let paths = default_paths(dir.path());

        let edge_id = s.node(out).in_edge.unwrap();
        let mut scripts = HashMap::new();
        scripts.insert(edge_id, TaskResult { success: false, output: "boom".to_string() });
        let runner = Box::new(ScriptedRunner::new(1, scripts));

        let config = BuildConfig { parallelism: 1, failures_allowed: 1, ..BuildConfig::default() };
        let mut builder = Builder::new(&mut s, &disk, &reader, &status, config, runner, paths);
        assert!(builder.build(&[out]).is_err());
    }
}
