//! [`Graph`]: the directed multigraph of units connected by `ordering` and
//! `data` edges.
//!
//! Nodes double as the unit set: a [`Graph`]'s `nodes` map is simultaneously
//! "the set of units in the graph" and "the graph's node set", so invariant
//! (iv) of the data model ("no node is a member of the graph without also
//! being a member of the unit set") holds by construction rather than by a
//! second bookkeeping structure kept in sync with the first.

use crate::error::GraphError;
use crate::scheduler::{ControlLoop, SchedulingMode};
use crate::unit::{ArgSlot, Unit, UnitId};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// The two edge kinds a [`Graph`] distinguishes. Both participate equally in
/// topological ordering; only `Data` edges carry the argument-resolution
/// contract described on [`crate::depref::DepRef`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// A plain "must finish before" constraint with no data flowing along it.
    Ordering,
    /// A `DepRef`-induced edge: the consumer reads the producer's output.
    Data,
}

#[derive(Debug, Clone)]
struct Edge {
    to: UnitId,
    kind: EdgeKind,
}

/// The acyclic directed graph of units and their ordering/data edges.
#[derive(Clone)]
pub struct Graph {
    nodes: HashMap<UnitId, Arc<Unit>>,
    forward: HashMap<UnitId, Vec<Edge>>,
    /// The in-flight or most recently finished run, if `start` has been
    /// called. Shared (not deep-copied) across `Clone`s of a `Graph`,
    /// including the scratch copies `add_tasks`/`add_precedence` validate
    /// mutations against — those never touch this field.
    run: Arc<Mutex<Option<Arc<ControlLoop>>>>,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    /// An empty graph.
    pub fn new() -> Self {
        Graph {
            nodes: HashMap::new(),
            forward: HashMap::new(),
            run: Arc::new(Mutex::new(None)),
        }
    }

    /// Build a graph already containing `units`, with no edges beyond the
    /// `data` edges their own `DepRef` slots induce among themselves.
    ///
    /// # Errors
    ///
    /// Returns a [`GraphError`] under the same conditions as
    /// [`Graph::add_tasks`] on an empty graph.
    pub fn with_units(units: &[Arc<Unit>]) -> Result<Self, GraphError> {
        let mut graph = Graph::new();
        graph.add_tasks(units)?;
        Ok(graph)
    }

    /// True iff `id` names a unit currently in the graph.
    pub fn contains(&self, id: UnitId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// How many units are currently in the graph.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True iff the graph has no units.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The units currently in the graph.
    pub fn units(&self) -> impl Iterator<Item = &Arc<Unit>> {
        self.nodes.values()
    }

    pub(crate) fn unit(&self, id: UnitId) -> Option<&Arc<Unit>> {
        self.nodes.get(&id)
    }

    fn add_edge_unique(&mut self, from: UnitId, to: UnitId, kind: EdgeKind) {
        let edges = self.forward.entry(from).or_default();
        if !edges.iter().any(|e| e.to == to && e.kind == kind) {
            edges.push(Edge { to, kind });
        }
    }

    /// Add `units` to the graph. For every `DepRef` slot on an added unit,
    /// a `data` edge is added from the referenced producer to the unit,
    /// provided the producer is already a member of the graph (either from a
    /// prior call, or from this same call — order within `units` does not
    /// matter for that check, since every unit in `units` is registered
    /// before any edges are derived).
    ///
    /// The whole call is transactional: it is evaluated against a scratch
    /// copy of the graph, and only committed if it leaves the graph acyclic.
    /// On error the graph is left exactly as it was before the call.
    pub fn add_tasks(&mut self, units: &[Arc<Unit>]) -> Result<(), GraphError> {
        let mut trial = self.clone();
        for unit in units {
            trial.nodes.insert(unit.id(), Arc::clone(unit));
            trial.forward.entry(unit.id()).or_default();
        }
        for unit in units {
            let mut deps = Vec::new();
            for slot in unit.args_snapshot() {
                if let ArgSlot::Dep(dep) = slot {
                    deps.push(dep);
                }
            }
            for slot in unit.kwargs_snapshot().into_values() {
                if let ArgSlot::Dep(dep) = slot {
                    deps.push(dep);
                }
            }
            for dep in deps {
                if !trial.nodes.contains_key(&dep.producer_id()) {
                    return Err(GraphError::UnknownProducer {
                        producer: dep.producer_name().to_string(),
                    });
                }
                trial.add_edge_unique(dep.producer_id(), unit.id(), EdgeKind::Data);
            }
        }
        if trial.has_cycle() {
            return Err(GraphError::CycleDetected);
        }
        *self = trial;
        Ok(())
    }

    /// Remove each of `units` and all edges incident to it. Units not
    /// currently in the graph are silently ignored.
    pub fn remove_tasks(&mut self, units: &[Arc<Unit>]) {
        let removed: HashSet<UnitId> = units.iter().map(|u| u.id()).collect();
        for id in &removed {
            self.nodes.remove(id);
            self.forward.remove(id);
        }
        for edges in self.forward.values_mut() {
            edges.retain(|e| !removed.contains(&e.to));
        }
    }

    /// Add `ordering` edges between each consecutive pair in `units`
    /// (`units[0] -> units[1] -> units[2] -> ...`). Any unit not already in
    /// the graph is added as a bare node (mirroring how an edge endpoint
    /// implicitly joins the graph in the originating implementation).
    ///
    /// # Errors
    ///
    /// [`GraphError::PrecedenceArity`] if fewer than two units are given.
    /// [`GraphError::CycleDetected`] if the new edges would create a cycle
    /// (in which case none of them are added).
    pub fn add_precedence(&mut self, units: &[Arc<Unit>]) -> Result<(), GraphError> {
        if units.len() < 2 {
            return Err(GraphError::PrecedenceArity);
        }
        let mut trial = self.clone();
        for unit in units {
            trial.nodes.entry(unit.id()).or_insert_with(|| Arc::clone(unit));
            trial.forward.entry(unit.id()).or_default();
        }
        for pair in units.windows(2) {
            trial.add_edge_unique(pair[0].id(), pair[1].id(), EdgeKind::Ordering);
        }
        if trial.has_cycle() {
            return Err(GraphError::CycleDetected);
        }
        *self = trial;
        Ok(())
    }

    /// Take a snapshot of this graph and hand it to a fresh scheduler
    /// running in `mode`. Returns as soon as the coordinator thread is
    /// launched; call [`Graph::wait`] to block for completion.
    ///
    /// Mutating this graph after `start` does not affect the in-flight run,
    /// which owns its own snapshot.
    ///
    /// # Errors
    ///
    /// [`GraphError::EmptyGraph`] if the graph has no units.
    pub fn start(&self, mode: SchedulingMode) -> Result<(), GraphError> {
        let snapshot = self.clone();
        let control = ControlLoop::start(snapshot, mode)?;
        *self.run.lock() = Some(control);
        Ok(())
    }

    /// Block until the most recent run's coordinator thread finishes, or
    /// `timeout` elapses. Returns `false` immediately if `start` was never
    /// called.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        match self.run.lock().clone() {
            Some(control) => control.wait(timeout),
            None => false,
        }
    }

    /// Request cancellation of the most recent run. A no-op if `start` was
    /// never called, or the run has already finished.
    pub fn cancel(&self) {
        if let Some(control) = self.run.lock().clone() {
            control.cancel();
        }
    }

    /// Successful outputs of the most recent run, keyed by unit id. Empty if
    /// `start` was never called.
    pub fn results(&self) -> HashMap<UnitId, Value> {
        self.run
            .lock()
            .clone()
            .map(|c| c.results())
            .unwrap_or_default()
    }

    /// Failures collected from the most recent run. Empty if `start` was
    /// never called.
    pub fn errors(&self) -> Vec<Value> {
        self.run
            .lock()
            .clone()
            .map(|c| c.errors())
            .unwrap_or_default()
    }

    /// Check all graph invariants, returning the first violation found (if
    /// any). Used internally after speculative mutation, and exposed so
    /// callers can sanity-check a graph without mutating it.
    pub fn verify_constraints(&self) -> Option<GraphError> {
        if self.has_cycle() {
            return Some(GraphError::CycleDetected);
        }
        None
    }

    fn has_cycle(&self) -> bool {
        #[derive(PartialEq, Clone, Copy)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }
        let mut marks: HashMap<UnitId, Mark> =
            self.nodes.keys().map(|id| (*id, Mark::Unvisited)).collect();

        fn visit(
            node: UnitId,
            forward: &HashMap<UnitId, Vec<Edge>>,
            marks: &mut HashMap<UnitId, Mark>,
        ) -> bool {
            match marks.get(&node).copied() {
                Some(Mark::InProgress) => return true,
                Some(Mark::Done) => return false,
                _ => {}
            }
            marks.insert(node, Mark::InProgress);
            if let Some(edges) = forward.get(&node) {
                for edge in edges {
                    if visit(edge.to, forward, marks) {
                        return true;
                    }
                }
            }
            marks.insert(node, Mark::Done);
            false
        }

        let ids: Vec<UnitId> = self.nodes.keys().copied().collect();
        for id in ids {
            if marks.get(&id).copied() == Some(Mark::Unvisited) && visit(id, &self.forward, &mut marks)
            {
                return true;
            }
        }
        false
    }

    fn in_degrees(&self) -> HashMap<UnitId, usize> {
        let mut degrees: HashMap<UnitId, usize> = self.nodes.keys().map(|id| (*id, 0)).collect();
        for edges in self.forward.values() {
            for edge in edges {
                *degrees.entry(edge.to).or_insert(0) += 1;
            }
        }
        degrees
    }

    fn successors(&self, id: UnitId) -> impl Iterator<Item = UnitId> + '_ {
        self.forward
            .get(&id)
            .into_iter()
            .flatten()
            .map(|e| e.to)
    }

    /// The distinct successor units of `id`, collapsing any `ordering` and
    /// `data` edge that happen to connect the same pair into one entry.
    pub(crate) fn distinct_successors(&self, id: UnitId) -> HashSet<UnitId> {
        self.successors(id).collect()
    }

    /// For every node, the number of *distinct* predecessor units it has
    /// (an `ordering` edge and a `data` edge both present between the same
    /// pair count once). The scheduler decrements this once per predecessor
    /// completion to know when a unit has no predecessors left to wait on.
    pub(crate) fn predecessor_counts(&self) -> HashMap<UnitId, usize> {
        let mut predecessors: HashMap<UnitId, HashSet<UnitId>> =
            self.nodes.keys().map(|id| (*id, HashSet::new())).collect();
        for (&from, edges) in &self.forward {
            for edge in edges {
                predecessors.entry(edge.to).or_default().insert(from);
            }
        }
        predecessors.into_iter().map(|(id, set)| (id, set.len())).collect()
    }

    /// Units with no predecessors: the first topological generation, and the
    /// scheduler's initial frontier.
    pub fn source_nodes(&self) -> Vec<UnitId> {
        let degrees = self.in_degrees();
        degrees
            .into_iter()
            .filter(|(_, d)| *d == 0)
            .map(|(id, _)| id)
            .collect()
    }

    /// The immediate successors (by either edge kind) of `id`.
    pub fn successors_of(&self, id: UnitId) -> Vec<UnitId> {
        self.successors(id).collect()
    }

    /// Every edge currently in the graph, as `(from, to, kind)` triples.
    /// Order is unspecified; intended for tests and debugging, not for
    /// driving scheduling logic.
    pub fn edges(&self) -> Vec<(UnitId, UnitId, EdgeKind)> {
        let mut out: Vec<(UnitId, UnitId, EdgeKind)> = self
            .forward
            .iter()
            .flat_map(|(from, edges)| edges.iter().map(move |e| (*from, e.to, e.kind)))
            .collect();
        out.sort_by_key(|(from, to, kind)| (from.to_owned(), to.to_owned(), *kind as u8));
        out
    }

    /// A full topological order (Kahn's algorithm), one unit per step. Used
    /// by the scheduler's serial execution mode. Assumes the graph is
    /// acyclic (true of any graph that was only ever mutated through the
    /// validating methods above).
    pub fn topological_order(&self) -> Vec<UnitId> {
        let mut degrees = self.in_degrees();
        let mut frontier: Vec<UnitId> = degrees
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        frontier.sort();
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut queue = frontier;
        while let Some(id) = queue.pop() {
            order.push(id);
            let mut newly_ready = Vec::new();
            for succ in self.successors(id) {
                let d = degrees.get_mut(&succ).expect("edge target not a node");
                *d -= 1;
                if *d == 0 {
                    newly_ready.push(succ);
                }
            }
            newly_ready.sort();
            queue.extend(newly_ready);
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::Unit;
    use std::collections::HashMap as Map;

    fn unit(name: &str) -> Arc<Unit> {
        Arc::new(Unit::new(None, Some(name.to_string()), Vec::new(), Map::new()))
    }

    #[test]
    fn empty_graph_has_no_units() {
        let g = Graph::new();
        assert!(g.is_empty());
        assert!(g.verify_constraints().is_none());
    }

    #[test]
    fn add_tasks_tracks_membership() {
        let mut g = Graph::new();
        let a = unit("a");
        g.add_tasks(&[Arc::clone(&a)]).unwrap();
        assert!(g.contains(a.id()));
    }

    #[test]
    fn remove_tasks_is_idempotent_on_missing_units() {
        let mut g = Graph::new();
        let a = unit("a");
        g.remove_tasks(&[a]); // not present; must not panic
        assert!(g.is_empty());
    }

    #[test]
    fn add_precedence_requires_two_or_more() {
        let mut g = Graph::new();
        let a = unit("a");
        assert!(matches!(
            g.add_precedence(&[]),
            Err(GraphError::PrecedenceArity)
        ));
        assert!(matches!(
            g.add_precedence(&[a]),
            Err(GraphError::PrecedenceArity)
        ));
    }

    #[test]
    fn add_precedence_self_loop_is_rejected_and_rolled_back() {
        let mut g = Graph::new();
        let a = unit("a");
        let err = g.add_precedence(&[Arc::clone(&a), Arc::clone(&a)]);
        assert!(matches!(err, Err(GraphError::CycleDetected)));
        assert!(g.verify_constraints().is_none());
        assert!(!g.contains(a.id()));
    }

    #[test]
    fn add_precedence_cycle_rolls_back_fully() {
        let mut g = Graph::new();
        let a = unit("a");
        let b = unit("b");
        g.add_tasks(&[Arc::clone(&a), Arc::clone(&b)]).unwrap();
        let before = g.topological_order();
        let err = g.add_precedence(&[Arc::clone(&a), Arc::clone(&b), Arc::clone(&a)]);
        assert!(matches!(err, Err(GraphError::CycleDetected)));
        assert_eq!(before.len(), g.topological_order().len());
        assert!(g.verify_constraints().is_none());
    }

    #[test]
    fn topological_order_respects_precedence() {
        let mut g = Graph::new();
        let a = unit("a");
        let b = unit("b");
        g.add_tasks(&[Arc::clone(&a), Arc::clone(&b)]).unwrap();
        g.add_precedence(&[Arc::clone(&b), Arc::clone(&a)]).unwrap();
        let order = g.topological_order();
        let pos_a = order.iter().position(|id| *id == a.id()).unwrap();
        let pos_b = order.iter().position(|id| *id == b.id()).unwrap();
        assert!(pos_b < pos_a);
    }

    #[test]
    fn duplicate_data_edges_are_idempotent() {
        use crate::depref::DepRef;
        let p = unit("p");
        let c = Arc::new(Unit::new(
            None,
            Some("c".to_string()),
            vec![ArgSlot::Dep(DepRef::new(&p, None::<String>))],
            Map::new(),
        ));
        let mut g = Graph::new();
        g.add_tasks(&[Arc::clone(&p)]).unwrap();
        g.add_tasks(&[Arc::clone(&c)]).unwrap();
        // Re-adding c (e.g. after a later add_tasks call) must not create a
        // parallel data edge.
        g.add_tasks(&[Arc::clone(&c)]).unwrap();
        assert_eq!(g.successors_of(p.id()), vec![c.id()]);
    }

    #[test]
    fn data_dependency_on_unregistered_producer_is_rejected() {
        use crate::depref::DepRef;
        let p = unit("p");
        let c = Arc::new(Unit::new(
            None,
            Some("c".to_string()),
            vec![ArgSlot::Dep(DepRef::new(&p, None::<String>))],
            Map::new(),
        ));
        let mut g = Graph::new();
        let err = g.add_tasks(&[Arc::clone(&c)]);
        assert!(matches!(err, Err(GraphError::UnknownProducer { .. })));
        assert!(g.is_empty());
    }
}
