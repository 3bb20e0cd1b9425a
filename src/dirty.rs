//! The dirtiness evaluator: recursively decides which nodes need rebuilding
//! given mtimes, command hashes, recorded deps, and restat semantics.

use std::collections::HashSet;

use crate::disk::DiskInterface;
use crate::error::GraphError;
use crate::graph::{EdgeId, MTime, NodeId, State};
use crate::hash_cache::{fnv1a64, HashCache};
use crate::log::{BuildLog, DepsLog};
use crate::parse::dyndep::{apply_dyndep, parse_dyndep, DyndepFile};
use crate::parse::manifest::FileReader;

pub struct DirtyContext<'a> {
    pub disk: &'a dyn DiskInterface,
    pub build_log: &'a BuildLog,
    pub deps_log: &'a DepsLog,
    pub hash_cache: Option<&'a HashCache>,
    pub reader: &'a dyn FileReader,
    pub explain: bool,
}

fn explain(ctx: &DirtyContext, path: &str, reason: impl std::fmt::Display) {
    if ctx.explain {
        tracing::debug!(target: "nicorn::explain", node = path, "{reason}");
    }
}

/// Recompute dirtiness for `node` and everything it transitively depends
/// on. Returns an error on a dependency cycle or a dirty leaf node with no
/// producing rule.
pub fn recompute_dirty(state: &mut State, node: NodeId, ctx: &DirtyContext) -> Result<(), GraphError> {
    let mut visiting = HashSet::new();
    recompute_dirty_inner(state, node, ctx, &mut visiting)
}

fn recompute_dirty_inner(
    state: &mut State,
    node_id: NodeId,
    ctx: &DirtyContext,
    visiting: &mut HashSet<NodeId>,
) -> Result<(), GraphError> {
    if !visiting.insert(node_id) {
        return Err(GraphError::Cycle { path: state.node(node_id).path.clone() });
    }

    let edge_id = state.node(node_id).in_edge;

    let Some(edge_id) = edge_id else {
        stat_if_needed(state, node_id, ctx);
        if state.node(node_id).mtime == MTime::Missing {
            state.node_mut(node_id).dirty = true;
            return Err(GraphError::MissingInput { path: state.node(node_id).path.clone() });
        }
        visiting.remove(&node_id);
        return Ok(());
    };

    load_dyndep_if_pending(state, edge_id, ctx)?;

    let inputs = state.edge(edge_id).inputs.clone();
    for &input in &inputs {
        recompute_dirty_inner(state, input, ctx, visiting)?;
    }

    evaluate_edge_dirty(state, node_id, edge_id, ctx)?;
    visiting.remove(&node_id);
    Ok(())
}

/// Re-derive whether `node_id` (produced by `edge_id`) is dirty, using
/// whatever dirty/mtime state its inputs currently hold rather than
/// recursing into them. Shared by the full recursive scan and by
/// [`recompute_dirty_shallow`], which re-checks a single dependent edge
/// after one of its inputs finished without actually changing.
fn evaluate_edge_dirty(state: &mut State, node_id: NodeId, edge_id: EdgeId, ctx: &DirtyContext) -> Result<(), GraphError> {
    stat_if_needed(state, node_id, ctx);
    let inputs = state.edge(edge_id).inputs.clone();
    for &input in &inputs {
        stat_if_needed(state, input, ctx);
    }

    let edge = state.edge(edge_id);
    let dirtying = edge.dirtying_inputs().to_vec();
    let mut any_input_dirty = false;
    let mut most_recent_input: Option<i64> = None;
    for &inp in &dirtying {
        let n = state.node(inp);
        if n.dirty {
            any_input_dirty = true;
        } else if let Some(t) = n.mtime.as_stamp() {
            most_recent_input = Some(most_recent_input.map_or(t, |m: i64| m.max(t)));
        }
    }

    let is_phony = state.edge(edge_id).is_phony();
    let mut dirty = any_input_dirty;

    if !dirty {
        let out_mtime = state.node(node_id).mtime;
        if out_mtime == MTime::Missing {
            dirty = true;
            explain(ctx, &state.node(node_id).path, "output is missing");
        } else if let (Some(out_ts), Some(in_ts)) = (out_mtime.as_stamp(), most_recent_input) {
            if in_ts > out_ts {
                if !restat_clean_covers(state, edge_id, &dirtying, ctx, out_ts) {
                    dirty = true;
                    explain(ctx, &state.node(node_id).path, "an input is newer than the output");
                }
            }
        }
    }

    if !dirty && !is_phony {
        let out_path = state.node(node_id).path.clone();
        match ctx.build_log.get(&out_path) {
            None => {
                dirty = true;
                explain(ctx, &out_path, "no build log entry for this output");
            }
            Some(record) => {
                let command = state.evaluate_command(state.edge(edge_id));
                let hash = fnv1a64(command.as_bytes());
                if record.command_hash != hash {
                    dirty = true;
                    explain(ctx, &out_path, "command line changed");
                }
            }
        }
    }

    if !dirty && !is_phony {
        let deps_format = state.lookup_edge_var(state.edge(edge_id), "deps");
        if matches!(deps_format.as_deref(), Some("gcc") | Some("msvc")) {
            let out_path = state.node(node_id).path.clone();
            let out_mtime_on_disk = state.node(node_id).mtime.as_stamp();
            match ctx.deps_log.get(&out_path) {
                None => {
                    dirty = true;
                    explain(ctx, &out_path, "deps are missing from the deps log");
                }
                Some(deps) => {
                    if let Some(disk_mtime) = out_mtime_on_disk {
                        if deps.mtime < disk_mtime {
                            dirty = true;
                            explain(ctx, &out_path, "recorded deps are older than the output on disk");
                        }
                        if !dirty {
                            for &dep_id in &deps.inputs {
                                let Some(dep_path) = ctx.deps_log.paths.get(dep_id as usize) else { continue };
                                if let Some(dep_ts) = ctx.disk.stat(dep_path).as_stamp() {
                                    if dep_ts > disk_mtime {
                                        dirty = true;
                                        explain(ctx, &out_path, format!("recorded dependency '{dep_path}' is newer than the output"));
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    state.node_mut(node_id).dirty = dirty;
    Ok(())
}

/// Re-check a single dependent edge's dirtiness without recursing into its
/// inputs, leaving their already-resolved dirty/mtime state alone. Used
/// after a `restat = 1` edge finishes as a no-op: a full recursive
/// [`recompute_dirty`] would re-derive upstream nodes from their raw mtimes
/// and could flip a just-cleaned node back to dirty, undoing the no-op.
pub fn recompute_dirty_shallow(state: &mut State, node_id: NodeId, ctx: &DirtyContext) -> Result<(), GraphError> {
    let Some(edge_id) = state.node(node_id).in_edge else { return Ok(()) };
    evaluate_edge_dirty(state, node_id, edge_id, ctx)
}

/// Step 6's restat-clean carve-out: an input newer than the output does
/// NOT make the output dirty if that input is itself a generated file
/// whose producing edge has `restat = 1` and the build log shows the
/// input's recorded mtime was already ≤ the output's mtime.
fn restat_clean_covers(state: &State, _edge_id: EdgeId, dirtying: &[NodeId], ctx: &DirtyContext, out_ts: i64) -> bool {
    for &inp in dirtying {
        // A raw source file (no producing edge) being newer is never
        // covered by restat - only a generated file's own no-op run is.
        let Some(producing) = state.node(inp).in_edge else { return false };
        if !state.edge(producing).restat {
            return false;
        }
        let input_path = &state.node(inp).path;
        match ctx.build_log.get(input_path) {
            Some(record) if record.output_mtime <= out_ts => continue,
            _ => return false,
        }
    }
    true
}

/// Stat a node, then run the result through the hash cache: a file whose
/// mtime advanced but whose content hash didn't is reported at its old,
/// cached mtime so a touch without a real change can't force a rebuild.
fn stat_if_needed(state: &mut State, node_id: NodeId, ctx: &DirtyContext) {
    if state.node(node_id).is_stat_known() {
        return;
    }
    let path = state.node(node_id).path.clone();
    let mtime = ctx.disk.stat(&path);
    let mtime = match (ctx.hash_cache, mtime.as_stamp()) {
        (Some(cache), Some(stamp)) => match ctx.disk.read_file(&path) {
            Ok(content) => MTime::Stamp(cache.effective_stamp(&path, stamp, fnv1a64(content.as_bytes()))),
            Err(_) => mtime,
        },
        _ => mtime,
    };
    state.node_mut(node_id).mtime = mtime;
}

fn load_dyndep_if_pending(state: &mut State, edge_id: EdgeId, ctx: &DirtyContext) -> Result<(), GraphError> {
    let Some(dyndep_node) = state.edge(edge_id).dyndep else { return Ok(()) };
    if !state.node(dyndep_node).dyndep_pending {
        return Ok(());
    }
    let path = state.node(dyndep_node).path.clone();
    let content = ctx.reader.read(&path).map_err(|_| GraphError::UnknownTarget { path: path.clone() })?;
    let file: DyndepFile = parse_dyndep(state, &path, &content)
        .map_err(|_| GraphError::UnknownTarget { path: path.clone() })?;
    apply_dyndep(state, &file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::fake::FakeDisk;
    use crate::eval::BindingEnv;
    use crate::graph::Rule;
    use crate::log::{BuildLog, BuildLogEntry, DepsLog};

    struct NoopReader;
    impl FileReader for NoopReader {
        fn read(&self, _path: &str) -> std::io::Result<String> {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no dyndep"))
        }
    }

    fn ctx<'a>(disk: &'a FakeDisk, log: &'a BuildLog, deps: &'a DepsLog, reader: &'a NoopReader) -> DirtyContext<'a> {
        DirtyContext { disk, build_log: log, deps_log: deps, hash_cache: None, reader, explain: false }
    }

    #[test]
    fn missing_output_is_dirty() {
        let mut s = State::new();
        let mut rule = Rule::new("cc");
        rule.bindings.set("command", crate::eval::EvalString::parse("cc $in -o $out", "").0);
        s.rules.insert("cc".to_string(), rule);
        let inp = s.node_id("a.c");
        let out = s.node_id("a.o");
        s.add_edge("cc".to_string(), BindingEnv::new(), vec![inp], vec![out], 0, 0, 0, String::new()).unwrap();

        let disk = FakeDisk::new();
        disk.set("a.c", "src", 10);
        let log = BuildLog::new();
        let deps = DepsLog::new();
        let reader = NoopReader;
        let c = ctx(&disk, &log, &deps, &reader);

        recompute_dirty(&mut s, out, &c).unwrap();
        assert!(s.node(out).dirty);
    }

    #[test]
    fn up_to_date_output_is_clean() {
        let mut s = State::new();
        let mut rule = Rule::new("cc");
        rule.bindings.set("command", crate::eval::EvalString::parse("cc $in -o $out", "").0);
        s.rules.insert("cc".to_string(), rule);
        let inp = s.node_id("a.c");
        let out = s.node_id("a.o");
        s.add_edge("cc".to_string(), BindingEnv::new(), vec![inp], vec![out], 0, 0, 0, String::new()).unwrap();

        let disk = FakeDisk::new();
        disk.set("a.c", "src", 10);
        disk.set("a.o", "obj", 20);
        let mut log = BuildLog::new();
        let command = s.evaluate_command(s.edge(s.node(out).in_edge.unwrap()));
        log.record("a.o", BuildLogEntry { start_ms: 0, end_ms: 1, output_mtime: 20, command_hash: fnv1a64(command.as_bytes()) });
        let deps = DepsLog::new();
        let reader = NoopReader;
        let c = ctx(&disk, &log, &deps, &reader);

        recompute_dirty(&mut s, out, &c).unwrap();
        assert!(!s.node(out).dirty);
    }

    #[test]
    fn command_hash_change_forces_dirty() {
        let mut s = State::new();
        let mut rule = Rule::new("cc");
        rule.bindings.set("command", crate::eval::EvalString::parse("cc -O2 $in -o $out", "").0);
        s.rules.insert("cc".to_string(), rule);
        let inp = s.node_id("a.c");
        let out = s.node_id("a.o");
        s.add_edge("cc".to_string(), BindingEnv::new(), vec![inp], vec![out], 0, 0, 0, String::new()).unwrap();

        let disk = FakeDisk::new();
        disk.set("a.c", "src", 10);
        disk.set("a.o", "obj", 20);
        let mut log = BuildLog::new();
        log.record("a.o", BuildLogEntry { start_ms: 0, end_ms: 1, output_mtime: 20, command_hash: 0 });
        let deps = DepsLog::new();
        let reader = NoopReader;
        let c = ctx(&disk, &log, &deps, &reader);

        recompute_dirty(&mut s, out, &c).unwrap();
        assert!(s.node(out).dirty);
    }

    #[test]
    fn dirty_leaf_with_no_rule_is_error() {
        let mut s = State::new();
        let leaf = s.node_id("missing.h");
        let disk = FakeDisk::new();
        let log = BuildLog::new();
        let deps = DepsLog::new();
        let reader = NoopReader;
        let c = ctx(&disk, &log, &deps, &reader);
        assert!(recompute_dirty(&mut s, leaf, &c).is_err());
    }

    #[test]
    fn recorded_gcc_dependency_newer_than_output_forces_dirty() {
        let mut s = State::new();
        let mut rule = Rule::new("cc");
        rule.bindings.set("command", crate::eval::EvalString::parse("cc $in -o $out", "").0);
        rule.bindings.set("deps", crate::eval::EvalString::parse("gcc", "").0);
        s.rules.insert("cc".to_string(), rule);
        let inp = s.node_id("a.c");
        let out = s.node_id("a.o");
        s.add_edge("cc".to_string(), BindingEnv::new(), vec![inp], vec![out], 0, 0, 0, String::new()).unwrap();

        let disk = FakeDisk::new();
        disk.set("a.c", "src", 10);
        disk.set("a.o", "obj", 20);
        disk.set("a.h", "header", 25);
        let mut log = BuildLog::new();
        let command = s.evaluate_command(s.edge(s.node(out).in_edge.unwrap()));
        log.record("a.o", BuildLogEntry { start_ms: 0, end_ms: 1, output_mtime: 20, command_hash: fnv1a64(command.as_bytes()) });
        let mut deps = DepsLog::new();
        deps.record_deps("a.o", 20, &["a.h".to_string()]);
        let reader = NoopReader;
        let c = ctx(&disk, &log, &deps, &reader);

        recompute_dirty(&mut s, out, &c).unwrap();
        assert!(s.node(out).dirty, "a.h's recorded mtime (25) is newer than a.o's (20)");
    }

    #[test]
    fn cycle_is_detected() {
        let mut s = State::new();
        s.rules.insert("r".to_string(), Rule::new("r"));
        let a = s.node_id("a");
        let b = s.node_id("b");
        s.add_edge("r".to_string(), BindingEnv::new(), vec![b], vec![a], 0, 0, 0, String::new()).unwrap();
        // Force a cycle by hand: b's producing edge also depends on a.
        s.add_edge("r".to_string(), BindingEnv::new(), vec![a], vec![b], 0, 0, 0, String::new());
        let disk = FakeDisk::new();
        let log = BuildLog::new();
        let deps = DepsLog::new();
        let reader = NoopReader;
        let c = ctx(&disk, &log, &deps, &reader);
        let result = recompute_dirty(&mut s, a, &c);
        assert!(result.is_err());
    }
}
