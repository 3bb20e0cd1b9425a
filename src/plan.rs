//! The plan/scheduler: tracks which edges still need to run, their
//! readiness, and pool concurrency limits. Owns no child processes itself —
//! it only decides what's allowed to start next.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::graph::{EdgeId, NodeId, State};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Want {
    Nothing,
    Start,
    Finish,
}

pub struct Plan {
    want: HashMap<EdgeId, Want>,
    unready_inputs: HashMap<EdgeId, usize>,
    ready: VecDeque<EdgeId>,
    remaining: usize,
    failures: usize,
    pub failures_allowed: usize,
    aborted: bool,
}

impl Plan {
    pub fn new(failures_allowed: usize) -> Self {
        Self {
            want: HashMap::new(),
            unready_inputs: HashMap::new(),
            ready: VecDeque::new(),
            remaining: 0,
            failures: 0,
            failures_allowed: failures_allowed.max(1),
            aborted: false,
        }
    }

    pub fn want(&self, edge: EdgeId) -> Want {
        self.want.get(&edge).copied().unwrap_or(Want::Nothing)
    }

    /// Add `node` as a build target. Walks up to the producing edge and, if
    /// the node is dirty, recursively adds every input (explicit, implicit,
    /// and order-only) and enqueues the edge once all of them are ready.
    /// Returns whether the node needed to be added (i.e. is dirty).
    pub fn add_target(&mut self, state: &mut State, node: NodeId) -> bool {
        let Some(edge_id) = state.node(node).in_edge else { return false };
        if !state.node(node).dirty {
            return false;
        }
        if self.want.contains_key(&edge_id) {
            return true;
        }
        self.want.insert(edge_id, Want::Start);
        self.remaining += 1;

        let all_inputs = state.edge(edge_id).inputs.clone();
        let mut unready = 0usize;
        for &inp in &all_inputs {
            if self.add_target(state, inp) {
                unready += 1;
            }
        }
        self.unready_inputs.insert(edge_id, unready);
        if unready == 0 {
            self.enqueue(state, edge_id);
        }
        true
    }

    fn enqueue(&mut self, state: &mut State, edge_id: EdgeId) {
        let pool_name = state.edge(edge_id).pool.clone();
        if pool_name.is_empty() {
            self.ready.push_back(edge_id);
            return;
        }
        match state.pools.get_mut(&pool_name) {
            Some(pool) => {
                pool.queue.push_back(edge_id);
                self.drain_pool(state, &pool_name);
            }
            None => self.ready.push_back(edge_id),
        }
    }

    /// Move as many queued edges from `pool_name` into the ready queue as
    /// its depth currently allows.
    fn drain_pool(&mut self, state: &mut State, pool_name: &str) {
        loop {
            let Some(pool) = state.pools.get_mut(pool_name) else { return };
            if !pool.has_capacity() {
                return;
            }
            let Some(edge_id) = pool.queue.pop_front() else { return };
            pool.current += 1;
            self.ready.push_back(edge_id);
        }
    }

    /// Pop the next edge the runner is allowed to start, transitioning it
    /// to `WANT_TO_FINISH`. `None` means nothing is ready right now (which
    /// may still mean the plan has in-flight work to wait on).
    pub fn find_work(&mut self) -> Option<EdgeId> {
        if self.aborted {
            return None;
        }
        let edge_id = self.ready.pop_front()?;
        self.want.insert(edge_id, Want::Finish);
        Some(edge_id)
    }

    pub fn has_ready_work(&self) -> bool {
        !self.aborted && !self.ready.is_empty()
    }

    /// Whether every added target has finished (successfully or not).
    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn failure_count(&self) -> usize {
        self.failures
    }

    /// Record that `edge_id` finished. On success, newly-ready dependents
    /// are enqueued and returned (sorted by id for determinism); on
    /// failure, dependents are left at `WANT_NOTHING` and dropped from the
    /// plan, and the failure counts against `failures_allowed`.
    pub fn edge_finished(&mut self, state: &mut State, edge_id: EdgeId, success: bool) -> Vec<EdgeId> {
        self.remaining -= 1;
        self.release_pool_slot(state, edge_id);

        if !success {
            self.failures += 1;
            if self.failures >= self.failures_allowed {
                self.aborted = true;
            }
            return Vec::new();
        }

        self.propagate_readiness(state, edge_id)
    }

    /// Mark `edge_id` finished without having run it — used by the builder
    /// when a restat no-op determines a dependent edge didn't actually need
    /// to rebuild after all. Pulls it out of the ready queue too, in case it
    /// had already become ready on its other inputs.
    pub fn skip_edge(&mut self, state: &mut State, edge_id: EdgeId) -> Vec<EdgeId> {
        self.ready.retain(|&e| e != edge_id);
        self.remaining -= 1;
        self.release_pool_slot(state, edge_id);
        self.propagate_readiness(state, edge_id)
    }

    fn release_pool_slot(&mut self, state: &mut State, edge_id: EdgeId) {
        let pool_name = state.edge(edge_id).pool.clone();
        if pool_name.is_empty() {
            return;
        }
        if let Some(pool) = state.pools.get_mut(&pool_name) {
            pool.current = pool.current.saturating_sub(1);
        }
        self.drain_pool(state, &pool_name);
    }

    fn propagate_readiness(&mut self, state: &mut State, edge_id: EdgeId) -> Vec<EdgeId> {
        let outputs = state.edge(edge_id).outputs.clone();
        let mut dependents: HashSet<EdgeId> = HashSet::new();
        for out in outputs {
            for &dep in &state.node(out).out_edges {
                dependents.insert(dep);
            }
        }
        let mut dependents: Vec<EdgeId> = dependents.into_iter().collect();
        dependents.sort_by_key(|e| e.0);

        let mut newly_ready = Vec::new();
        for dep_edge in dependents {
            if self.want(dep_edge) != Want::Start {
                continue;
            }
            if let Some(count) = self.unready_inputs.get_mut(&dep_edge) {
                *count -= 1;
                if *count == 0 {
                    self.enqueue(state, dep_edge);
                    newly_ready.push(dep_edge);
                }
            }
        }
        newly_ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::BindingEnv;
    use crate::graph::{Pool, Rule};

    fn chain_state() -> (State, NodeId, NodeId, NodeId) {
        let mut s = State::new();
        s.rules.insert("cc".to_string(), Rule::new("cc"));
        let a = s.node_id("a.c");
        let b = s.node_id("b.o");
        let c = s.node_id("c.exe");
        s.add_edge("cc".to_string(), BindingEnv::new(), vec![a], vec![b], 0, 0, 0, String::new()).unwrap();
        s.add_edge("cc".to_string(), BindingEnv::new(), vec![b], vec![c], 0, 0, 0, String::new()).unwrap();
        s.node_mut(a).dirty = false;
        s.node_mut(b).dirty = true;
        s.node_mut(c).dirty = true;
        (s, a, b, c)
    }

    #[test]
    fn adding_target_seeds_only_ready_edges() {
        let (mut s, _a, b, c) = chain_state();
        let mut plan = Plan::new(1);
        assert!(plan.add_target(&mut s, c));

        // c's edge depends on b, which is itself dirty, so c isn't ready yet.
        assert!(!plan.has_ready_work());
        let b_edge = s.node(b).in_edge.unwrap();
        assert_eq!(plan.want(b_edge), Want::Start);

        let ready = plan.find_work();
        assert_eq!(ready, Some(b_edge));
    }

    #[test]
    fn finishing_an_edge_unlocks_its_dependent() {
        let (mut s, _a, b, c) = chain_state();
        let mut plan = Plan::new(1);
        plan.add_target(&mut s, c);

        let b_edge = plan.find_work().unwrap();
        let newly_ready = plan.edge_finished(&mut s, b_edge, true);
        assert_eq!(newly_ready.len(), 1);

        let c_edge = plan.find_work().unwrap();
        assert_eq!(c_edge, s.node(c).in_edge.unwrap());
        plan.edge_finished(&mut s, c_edge, true);
        assert!(plan.is_complete());
    }

    #[test]
    fn failure_blocks_dependents_and_counts_toward_threshold() {
        let (mut s, _a, b, c) = chain_state();
        let mut plan = Plan::new(1);
        plan.add_target(&mut s, c);

        let b_edge = plan.find_work().unwrap();
        let newly_ready = plan.edge_finished(&mut s, b_edge, false);
        assert!(newly_ready.is_empty());
        assert!(plan.is_aborted());
        assert!(!plan.has_ready_work());
    }

    #[test]
    fn pool_depth_one_serializes_members() {
        let mut s = State::new();
        s.rules.insert("r".to_string(), Rule::new("r"));
        s.pools.insert("serial".to_string(), Pool::new("serial", 1));
        let out1 = s.node_id("out1");
        let out2 = s.node_id("out2");
        s.add_edge("r".to_string(), BindingEnv::new(), vec![], vec![out1], 0, 0, 0, "serial".to_string()).unwrap();
        s.add_edge("r".to_string(), BindingEnv::new(), vec![], vec![out2], 0, 0, 0, "serial".to_string()).unwrap();
        s.node_mut(out1).dirty = true;
        s.node_mut(out2).dirty = true;

        let mut plan = Plan::new(1);
        plan.add_target(&mut s, out1);
        plan.add_target(&mut s, out2);

        let first = plan.find_work().unwrap();
        assert!(plan.find_work().is_none(), "pool depth 1 must not release a second edge concurrently");

        plan.edge_finished(&mut s, first, true);
        assert!(plan.find_work().is_some(), "finishing the first should free the pool slot for the second");
    }

    #[test]
    fn two_failures_with_allowance_one_aborts_after_first() {
        let (mut s, _a, b, _c) = chain_state();
        let mut plan = Plan::new(1);
        plan.add_target(&mut s, b);
        let edge = plan.find_work().unwrap();
        plan.edge_finished(&mut s, edge, false);
        assert_eq!(plan.failure_count(), 1);
        assert!(plan.is_aborted());
    }
}
