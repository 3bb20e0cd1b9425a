//! The dependency graph: nodes (files), edges (build statements), rules,
//! and pools.
//!
//! Nodes and edges live in arenas addressed by dense integer ids
//! (`NodeId`/`EdgeId`) rather than behind raw pointers with cyclic
//! back-references. This makes
//! serialization to the deps log trivial and sidesteps Rust's aliasing
//! rules entirely.

use std::collections::HashMap;

use crate::arena::canon::canon_path;
use crate::eval::{BindingEnv, EvalString};

/// Dense id for a [`Node`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

/// Dense id for an [`Edge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(pub u32);

/// A node's last-known modification time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MTime {
    Unknown,
    Missing,
    Stamp(i64),
}

impl MTime {
    pub fn as_stamp(&self) -> Option<i64> {
        match self {
            MTime::Stamp(t) => Some(*t),
            _ => None,
        }
    }
}

/// A file tracked by the graph.
#[derive(Debug)]
pub struct Node {
    pub path: String,
    pub slash_bits: u64,
    pub mtime: MTime,
    pub dirty: bool,
    pub dyndep_pending: bool,
    /// Dense id in the deps log, assigned lazily on first appearance,
    /// dense in first-seen order.
    pub deps_log_id: Option<u32>,
    pub in_edge: Option<EdgeId>,
    pub out_edges: Vec<EdgeId>,
    pub generated_by_dep_loader: bool,
}

impl Node {
    fn new(path: String, slash_bits: u64) -> Self {
        Self {
            path,
            slash_bits,
            mtime: MTime::Unknown,
            dirty: false,
            dyndep_pending: false,
            deps_log_id: None,
            in_edge: None,
            out_edges: Vec::new(),
            generated_by_dep_loader: false,
        }
    }

    pub fn is_stat_known(&self) -> bool {
        !matches!(self.mtime, MTime::Unknown)
    }
}

/// `deps =` binding values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DepsFormat {
    #[default]
    None,
    Gcc,
    Msvc,
}

/// A named rule: a template for edges.
#[derive(Debug, Clone, Default)]
pub struct Rule {
    pub name: String,
    pub bindings: BindingEnv,
}

impl Rule {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), bindings: BindingEnv::new() }
    }

    pub fn is_phony(&self) -> bool {
        self.name == "phony"
    }
}

/// A named concurrency bucket.
#[derive(Debug, Clone)]
pub struct Pool {
    pub name: String,
    pub depth: usize,
    pub current: usize,
    /// FIFO queue of edges waiting for a slot in this pool.
    pub queue: std::collections::VecDeque<EdgeId>,
}

impl Pool {
    pub fn new(name: impl Into<String>, depth: usize) -> Self {
        Self { name: name.into(), depth, current: 0, queue: std::collections::VecDeque::new() }
    }

    pub fn is_unlimited(&self) -> bool {
        self.depth == 0
    }

    pub fn has_capacity(&self) -> bool {
        self.is_unlimited() || self.current < self.depth
    }

    /// The built-in depth-1 console pool.
    pub fn console() -> Self {
        Self::new("console", 1)
    }
}

/// A build statement.
pub struct Edge {
    pub id: EdgeId,
    pub rule: String,
    pub env: BindingEnv,
    pub inputs: Vec<NodeId>,
    pub outputs: Vec<NodeId>,
    pub implicit_deps_count: usize,
    pub order_only_deps_count: usize,
    pub implicit_outs_count: usize,
    pub pool: String,
    pub dyndep: Option<NodeId>,
    pub deps_loaded: bool,
    pub deps_missing: bool,
    /// Additional inputs discovered via a depfile or dyndep;
    /// these invalidate the output like implicit deps but are not part of
    /// `inputs` itself because they may change between runs.
    pub discovered_ins: Vec<NodeId>,
    /// restat flag after evaluation / dyndep loading.
    pub restat: bool,
}

impl Edge {
    pub fn explicit_inputs(&self) -> &[NodeId] {
        &self.inputs[0..self.inputs.len() - self.implicit_deps_count - self.order_only_deps_count]
    }

    /// Inputs whose mtime can mark the edge dirty: explicit + implicit,
    /// excluding order-only.
    pub fn dirtying_inputs(&self) -> &[NodeId] {
        &self.inputs[0..self.inputs.len() - self.order_only_deps_count]
    }

    pub fn order_only_inputs(&self) -> &[NodeId] {
        &self.inputs[self.inputs.len() - self.order_only_deps_count..]
    }

    pub fn explicit_outputs(&self) -> &[NodeId] {
        &self.outputs[0..self.outputs.len() - self.implicit_outs_count]
    }

    pub fn is_phony(&self) -> bool {
        self.rule == "phony"
    }
}

/// The full manifest-level state: interned nodes, edges, rules, pools, and
/// global bindings.
#[derive(Default)]
pub struct State {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub rules: HashMap<String, Rule>,
    pub pools: HashMap<String, Pool>,
    path_to_id: HashMap<String, NodeId>,
    pub root_env: BindingEnv,
    pub defaults: Vec<NodeId>,
}

impl State {
    pub fn new() -> Self {
        let mut s = State { ..Default::default() };
        s.rules.insert("phony".to_string(), Rule::new("phony"));
        s.pools.insert("console".to_string(), Pool::console());
        s
    }

    /// Intern a path, canonicalizing it first, returning its stable
    /// [`NodeId`].
    pub fn node_id(&mut self, raw_path: &str) -> NodeId {
        let canon = canon_path(raw_path);
        if let Some(&id) = self.path_to_id.get(&canon.path) {
            return id;
        }
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node::new(canon.path.clone(), canon.slash_bits));
        self.path_to_id.insert(canon.path, id);
        id
    }

    pub fn lookup_node(&self, raw_path: &str) -> Option<NodeId> {
        let canon = canon_path(raw_path);
        self.path_to_id.get(&canon.path).copied()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0 as usize]
    }

    pub fn edge(&self, id: EdgeId) -> &Edge {
        &self.edges[id.0 as usize]
    }

    pub fn edge_mut(&mut self, id: EdgeId) -> &mut Edge {
        &mut self.edges[id.0 as usize]
    }

    /// Add a new edge, wiring invariants 2 and 3: every output's
    /// `in_edge` points back at this edge, and every input's `out_edges`
    /// contains it. Invariant 1 (at most one producer per node) is checked
    /// here and reported as a `GraphError`.
    pub fn add_edge(
        &mut self,
        rule: String,
        env: BindingEnv,
        inputs: Vec<NodeId>,
        outputs: Vec<NodeId>,
        implicit_deps_count: usize,
        order_only_deps_count: usize,
        implicit_outs_count: usize,
        pool: String,
    ) -> Result<EdgeId, crate::error::GraphError> {
        let id = EdgeId(self.edges.len() as u32);
        for &out in &outputs {
            if let Some(existing) = self.node(out).in_edge {
                // Allow dyndep to rewrite; manifest-time duplicates are fatal.
                let _ = existing;
                return Err(crate::error::GraphError::MultipleProducers {
                    path: self.node(out).path.clone(),
                });
            }
        }
        for &inp in &inputs {
            self.node_mut(inp).out_edges.push(id);
        }
        for &out in &outputs {
            self.node_mut(out).in_edge = Some(id);
        }
        self.edges.push(Edge {
            id,
            rule,
            env,
            inputs,
            outputs,
            implicit_deps_count,
            order_only_deps_count,
            implicit_outs_count,
            pool,
            dyndep: None,
            deps_loaded: false,
            deps_missing: false,
            discovered_ins: Vec::new(),
            restat: false,
        });
        Ok(id)
    }

    /// Evaluate a `$var` binding for `edge`, walking edge env -> rule
    /// bindings -> root env.
    pub fn lookup_edge_var(&self, edge: &Edge, key: &str) -> Option<String> {
        let rule = self.rules.get(&edge.rule)?;
        if let Some(raw) = edge.env.get_raw(key) {
            return Some(raw.evaluate(&[&edge.env, &rule.bindings, &self.root_env]));
        }
        if let Some(raw) = rule.bindings.get_raw(key) {
            return Some(raw.evaluate(&[&rule.bindings, &self.root_env]));
        }
        self.root_env.lookup(key, &[])
    }

    pub fn edge_in_str(&self, edge: &Edge) -> String {
        edge.explicit_inputs().iter().map(|&n| self.node(n).path.clone()).collect::<Vec<_>>().join(" ")
    }

    pub fn edge_out_str(&self, edge: &Edge) -> String {
        edge.explicit_outputs().iter().map(|&n| self.node(n).path.clone()).collect::<Vec<_>>().join(" ")
    }

    /// Fully evaluate an edge's command line, substituting `$in`/`$out` and
    /// any other bindings.
    pub fn evaluate_command(&self, edge: &Edge) -> String {
        self.evaluate_binding(edge, "command")
    }

    pub fn evaluate_binding(&self, edge: &Edge, key: &str) -> String {
        let rule = match self.rules.get(&edge.rule) {
            Some(r) => r,
            None => return String::new(),
        };
        let mut in_env = BindingEnv::new();
        in_env.set("in", EvalString::parse(&shell_quote_join(&self.in_paths(edge)), "").0);
        in_env.set("in_newline", EvalString::parse(&self.in_paths(edge).join("\n"), "").0);
        in_env.set("out", EvalString::parse(&shell_quote_join(&self.out_paths(edge)), "").0);

        if let Some(raw) = edge.env.get_raw(key) {
            return raw.evaluate(&[&edge.env, &in_env, &rule.bindings, &self.root_env]);
        }
        if let Some(raw) = rule.bindings.get_raw(key) {
            return raw.evaluate(&[&rule.bindings, &in_env, &edge.env, &self.root_env]);
        }
        self.root_env.lookup(key, &[]).unwrap_or_default()
    }

    fn in_paths(&self, edge: &Edge) -> Vec<String> {
        edge.explicit_inputs().iter().map(|&n| self.node(n).path.clone()).collect()
    }

    fn out_paths(&self, edge: &Edge) -> Vec<String> {
        edge.explicit_outputs().iter().map(|&n| self.node(n).path.clone()).collect()
    }
}

/// `$in`/`$out` substitution doesn't shell-quote; paths are simply space-joined.
fn shell_quote_join(paths: &[String]) -> String {
    paths.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_state() -> (State, EdgeId) {
        let mut s = State::new();
        let mut rule = Rule::new("cc");
        rule.bindings.set("command", EvalString::parse("cc -c $in -o $out", "").0);
        s.rules.insert("cc".to_string(), rule);
        let inp = s.node_id("a.c");
        let out = s.node_id("a.o");
        let edge = s.add_edge("cc".to_string(), BindingEnv::new(), vec![inp], vec![out], 0, 0, 0, "".to_string()).unwrap();
        (s, edge)
    }

    #[test]
    fn add_edge_wires_invariants() {
        let (s, edge_id) = simple_state();
        let edge = s.edge(edge_id);
        let out = edge.outputs[0];
        let inp = edge.inputs[0];
        assert_eq!(s.node(out).in_edge, Some(edge_id));
        assert!(s.node(inp).out_edges.contains(&edge_id));
    }

    #[test]
    fn duplicate_output_is_fatal() {
        let mut s = State::new();
        let out = s.node_id("dup.o");
        let inp1 = s.node_id("a.c");
        let inp2 = s.node_id("b.c");
        s.rules.insert("cc".to_string(), Rule::new("cc"));
        s.add_edge("cc".to_string(), BindingEnv::new(), vec![inp1], vec![out], 0, 0, 0, "".to_string()).unwrap();
        let err = s.add_edge("cc".to_string(), BindingEnv::new(), vec![inp2], vec![out], 0, 0, 0, "".to_string());
        assert!(err.is_err());
    }

    #[test]
    fn command_evaluation_substitutes_in_out() {
        let (s, edge_id) = simple_state();
        let cmd = s.evaluate_command(s.edge(edge_id));
        assert_eq!(cmd, "cc -c a.c -o a.o");
    }

    #[test]
    fn node_interning_is_stable() {
        let mut s = State::new();
        let a = s.node_id("./a.c");
        let b = s.node_id("a.c");
        assert_eq!(a, b);
    }
}
