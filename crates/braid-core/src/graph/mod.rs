//! In-memory dependency graph and scheduling queries.
//!
//! [`DepGraph`] keeps adjacency for all edge kinds but only `blocks`
//! edges carry scheduling meaning: they feed cycle prevention, the
//! ready/blocked sets, and topological ordering. The graph stores no
//! issue fields; queries that need status or priority take the store's
//! issue map as an argument, so graph and projection can never disagree
//! about who owns what.
//!
//! ## Submodules
//!
//! - [`cycles`]: targeted and full cycle detection over `blocks` edges

pub mod cycles;

pub use cycles::CycleError;

use std::collections::{BinaryHeap, HashMap, HashSet};
use std::cmp::Reverse;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::model::dependency::{DepEdge, DepKind};
use crate::model::issue::{Issue, Priority};
use crate::model::issue_id::IssueId;

use std::collections::BTreeMap;

/// Dependency graph over issue ids.
///
/// Mutated only while replaying or appending records, under the same
/// workspace lock as the store. `add_edge` preserves the acyclicity of
/// the `blocks` subgraph; everything else is bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct DepGraph {
    graph: DiGraph<IssueId, DepKind>,
    nodes: HashMap<IssueId, NodeIndex>,
}

impl DepGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from raw edges without acyclicity enforcement.
    ///
    /// The reconciler uses this to probe a merged edge union for cycles
    /// before deciding which `dep_add` records to keep.
    #[must_use]
    pub fn from_edges_unchecked<'a>(edges: impl IntoIterator<Item = &'a DepEdge>) -> Self {
        let mut graph = Self::new();
        for edge in edges {
            if graph.contains_edge(edge) {
                continue;
            }
            let source = graph.ensure_node(&edge.source);
            let target = graph.ensure_node(&edge.target);
            graph.graph.add_edge(source, target, edge.kind);
        }
        graph
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    #[must_use]
    pub fn contains_node(&self, id: &IssueId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Register an issue id as a node, returning its index.
    pub fn ensure_node(&mut self, id: &IssueId) -> NodeIndex {
        if let Some(&idx) = self.nodes.get(id) {
            return idx;
        }
        let idx = self.graph.add_node(id.clone());
        self.nodes.insert(id.clone(), idx);
        idx
    }

    /// Probe whether `edge` could be added, without mutating anything.
    ///
    /// The workspace runs this before a `dep_add` record is appended to
    /// the log, so a rejected edge never reaches disk.
    ///
    /// # Errors
    ///
    /// Returns the cycle walk a `blocks` edge would close.
    pub fn check_edge(&self, edge: &DepEdge) -> Result<(), CycleError> {
        if !edge.kind.is_ordering() || self.contains_edge(edge) {
            return Ok(());
        }
        let (Some(&source), Some(&target)) =
            (self.nodes.get(&edge.source), self.nodes.get(&edge.target))
        else {
            // A missing endpoint has no edges yet, so no path back.
            return Ok(());
        };
        if let Some(walk) = cycles::would_close_cycle(&self.graph, source, target) {
            return Err(CycleError {
                path: self.translate(&walk),
            });
        }
        Ok(())
    }

    /// Add an edge, rejecting any `blocks` edge that would close a cycle.
    ///
    /// Adding an edge that is already present is a no-op, so replays are
    /// idempotent. On rejection the edge set is unchanged.
    pub fn add_edge(&mut self, edge: &DepEdge) -> Result<(), CycleError> {
        if self.contains_edge(edge) {
            return Ok(());
        }
        let source = self.ensure_node(&edge.source);
        let target = self.ensure_node(&edge.target);
        if edge.kind.is_ordering() {
            if let Some(walk) = cycles::would_close_cycle(&self.graph, source, target) {
                return Err(CycleError {
                    path: self.translate(&walk),
                });
            }
        }
        self.graph.add_edge(source, target, edge.kind);
        Ok(())
    }

    /// Remove an edge. Returns whether it was present.
    pub fn remove_edge(&mut self, edge: &DepEdge) -> bool {
        let (Some(&source), Some(&target)) =
            (self.nodes.get(&edge.source), self.nodes.get(&edge.target))
        else {
            return false;
        };
        let Some(edge_id) = self
            .graph
            .edges_connecting(source, target)
            .find(|e| *e.weight() == edge.kind)
            .map(|e| e.id())
        else {
            return false;
        };
        self.graph.remove_edge(edge_id).is_some()
    }

    #[must_use]
    pub fn contains_edge(&self, edge: &DepEdge) -> bool {
        let (Some(&source), Some(&target)) =
            (self.nodes.get(&edge.source), self.nodes.get(&edge.target))
        else {
            return false;
        };
        self.graph
            .edges_connecting(source, target)
            .any(|e| *e.weight() == edge.kind)
    }

    /// Remove every edge touching `id`, keeping the node. Soft-deleted
    /// issues stay known to the graph but stop constraining anything.
    pub fn detach(&mut self, id: &IssueId) {
        let Some(&idx) = self.nodes.get(id) else {
            return;
        };
        loop {
            let next = self
                .graph
                .first_edge(idx, Direction::Outgoing)
                .or_else(|| self.graph.first_edge(idx, Direction::Incoming));
            match next {
                Some(edge_id) => {
                    self.graph.remove_edge(edge_id);
                }
                None => break,
            }
        }
    }

    /// Drop a node and all its edges. Used when a purge record lands.
    pub fn remove_node(&mut self, id: &IssueId) {
        let Some(idx) = self.nodes.remove(id) else {
            return;
        };
        self.graph.remove_node(idx);
        // remove_node moves the highest-index node into the vacated slot;
        // re-point its lookup entry.
        if let Some(moved) = self.graph.node_weight(idx) {
            self.nodes.insert(moved.clone(), idx);
        }
    }

    /// All edges touching `id`, any kind, sorted.
    #[must_use]
    pub fn edges_of(&self, id: &IssueId) -> Vec<DepEdge> {
        let Some(&idx) = self.nodes.get(id) else {
            return Vec::new();
        };
        let to_edge = |e: petgraph::graph::EdgeReference<'_, DepKind>| {
            DepEdge::new(
                self.graph[e.source()].clone(),
                self.graph[e.target()].clone(),
                *e.weight(),
            )
        };
        let mut edges: Vec<DepEdge> = self
            .graph
            .edges_directed(idx, Direction::Outgoing)
            .map(to_edge)
            .chain(
                self.graph
                    .edges_directed(idx, Direction::Incoming)
                    .map(to_edge),
            )
            .collect();
        edges.sort_unstable();
        edges.dedup();
        edges
    }

    /// Every edge in the graph, sorted. Feeds the reconciler's union.
    #[must_use]
    pub fn all_edges(&self) -> Vec<DepEdge> {
        let mut edges: Vec<DepEdge> = self
            .graph
            .edge_references()
            .map(|e| {
                DepEdge::new(
                    self.graph[e.source()].clone(),
                    self.graph[e.target()].clone(),
                    *e.weight(),
                )
            })
            .collect();
        edges.sort_unstable();
        edges
    }

    /// Issues whose `blocks` edges point at `id` (its upstream).
    #[must_use]
    pub fn blockers_of(&self, id: &IssueId) -> Vec<IssueId> {
        self.blocks_neighbors(id, Direction::Incoming)
    }

    /// Issues that `id` blocks (its downstream).
    #[must_use]
    pub fn dependents_of(&self, id: &IssueId) -> Vec<IssueId> {
        self.blocks_neighbors(id, Direction::Outgoing)
    }

    fn blocks_neighbors(&self, id: &IssueId, dir: Direction) -> Vec<IssueId> {
        let Some(&idx) = self.nodes.get(id) else {
            return Vec::new();
        };
        let mut out: Vec<IssueId> = self
            .graph
            .edges_directed(idx, dir)
            .filter(|e| *e.weight() == DepKind::Blocks)
            .map(|e| {
                let other = match dir {
                    Direction::Outgoing => e.target(),
                    Direction::Incoming => e.source(),
                };
                self.graph[other].clone()
            })
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Whether `id` has at least one blocker that is still live.
    ///
    /// Blockers missing from `issues` (purged, or never materialized)
    /// do not block.
    #[must_use]
    pub fn has_open_blocker(&self, id: &IssueId, issues: &BTreeMap<IssueId, Issue>) -> bool {
        self.blockers_of(id)
            .iter()
            .any(|blocker| issues.get(blocker).is_some_and(Issue::is_live))
    }

    /// All live issues with no open blocker, ordered by priority
    /// ascending, then creation time, then id.
    #[must_use]
    pub fn ready_set(&self, issues: &BTreeMap<IssueId, Issue>) -> Vec<IssueId> {
        self.schedule_set(issues, false)
    }

    /// All live issues with at least one open blocker, same ordering as
    /// [`DepGraph::ready_set`].
    #[must_use]
    pub fn blocked_set(&self, issues: &BTreeMap<IssueId, Issue>) -> Vec<IssueId> {
        self.schedule_set(issues, true)
    }

    fn schedule_set(&self, issues: &BTreeMap<IssueId, Issue>, blocked: bool) -> Vec<IssueId> {
        let mut picked: Vec<&Issue> = issues
            .values()
            .filter(|issue| issue.is_live())
            .filter(|issue| self.has_open_blocker(&issue.id, issues) == blocked)
            .collect();
        picked.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        picked.into_iter().map(|issue| issue.id.clone()).collect()
    }

    /// All cycles in the `blocks` subgraph, each as a sorted member list.
    #[must_use]
    pub fn cycles(&self) -> Vec<Vec<IssueId>> {
        let mut out: Vec<Vec<IssueId>> = cycles::find_cycles(&self.graph)
            .into_iter()
            .map(|component| {
                let mut ids = self.translate(&component);
                ids.sort_unstable();
                ids
            })
            .collect();
        out.sort_unstable();
        out
    }

    /// A total order over `issues` consistent with every `blocks` edge,
    /// ties broken by priority then id.
    ///
    /// Fails with the trapped cycle if the subgraph is not a DAG (which
    /// `add_edge` prevents; this can only trip on a hand-assembled or
    /// mid-merge graph).
    pub fn topological_order(
        &self,
        issues: &BTreeMap<IssueId, Issue>,
    ) -> Result<Vec<IssueId>, CycleError> {
        let mut in_degree: HashMap<&IssueId, usize> = HashMap::with_capacity(issues.len());
        for id in issues.keys() {
            let degree = self.nodes.get(id).map_or(0, |&idx| {
                self.graph
                    .edges_directed(idx, Direction::Incoming)
                    .filter(|e| *e.weight() == DepKind::Blocks)
                    .filter(|e| issues.contains_key(&self.graph[e.source()]))
                    .count()
            });
            in_degree.insert(id, degree);
        }

        let mut heap: BinaryHeap<Reverse<(Priority, &IssueId)>> = in_degree
            .iter()
            .filter(|&(_, &degree)| degree == 0)
            .filter_map(|(&id, _)| issues.get(id).map(|issue| Reverse((issue.priority, id))))
            .collect();

        let mut order: Vec<IssueId> = Vec::with_capacity(issues.len());
        while let Some(Reverse((_, id))) = heap.pop() {
            order.push(id.clone());
            let Some(&idx) = self.nodes.get(id) else {
                continue;
            };
            for edge in self.graph.edges(idx) {
                if *edge.weight() != DepKind::Blocks {
                    continue;
                }
                let succ = &self.graph[edge.target()];
                if let Some(degree) = in_degree.get_mut(succ) {
                    *degree -= 1;
                    if *degree == 0 {
                        if let Some(issue) = issues.get(succ) {
                            heap.push(Reverse((issue.priority, succ)));
                        }
                    }
                }
            }
        }

        if order.len() == issues.len() {
            return Ok(order);
        }

        let trapped: HashSet<NodeIndex> = in_degree
            .iter()
            .filter(|&(_, &degree)| degree > 0)
            .filter_map(|(id, _)| self.nodes.get(*id).copied())
            .collect();
        Err(CycleError {
            path: self.trapped_walk(&trapped),
        })
    }

    /// When Kahn's sweep stalls, every remaining node keeps an unplaced
    /// predecessor, so walking predecessors must close on itself.
    fn trapped_walk(&self, remaining: &HashSet<NodeIndex>) -> Vec<IssueId> {
        let Some(start) = remaining
            .iter()
            .copied()
            .min_by(|a, b| self.graph[*a].cmp(&self.graph[*b]))
        else {
            return Vec::new();
        };

        let mut order = vec![start];
        let mut seen: HashMap<NodeIndex, usize> = HashMap::from([(start, 0)]);
        let mut cursor = start;
        loop {
            let Some(pred) = self
                .graph
                .edges_directed(cursor, Direction::Incoming)
                .filter(|e| *e.weight() == DepKind::Blocks && remaining.contains(&e.source()))
                .map(|e| e.source())
                .min_by(|a, b| self.graph[*a].cmp(&self.graph[*b]))
            else {
                return Vec::new();
            };

            if let Some(&at) = seen.get(&pred) {
                // order[at..] walked backward from pred; reversed it is the
                // forward loop, with pred closing it at both ends.
                let mut walk = Vec::with_capacity(order.len() - at + 1);
                walk.push(self.graph[pred].clone());
                for &idx in order[at..].iter().rev() {
                    walk.push(self.graph[idx].clone());
                }
                return walk;
            }
            seen.insert(pred, order.len());
            order.push(pred);
            cursor = pred;
        }
    }

    fn translate(&self, walk: &[NodeIndex]) -> Vec<IssueId> {
        walk.iter().map(|&idx| self.graph[idx].clone()).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
