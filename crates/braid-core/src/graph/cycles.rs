//! Cycle detection over the `blocks` subgraph.
//!
//! Edge direction is `source -> target`, meaning source blocks target.
//! Adding `source -> target` closes a cycle exactly when `source` is
//! already reachable from `target` through existing `blocks` edges.
//!
//! Two entry points: [`would_close_cycle`] is the targeted check run on
//! every edge add (BFS, stops at the first hit), and [`find_cycles`] is
//! the full sweep (Tarjan SCC) used by repair tooling and the reconciler
//! after an edge union. Both ignore non-ordering edge kinds.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{EdgeFiltered, EdgeRef};

use crate::model::dependency::DepKind;
use crate::model::issue_id::IssueId;

/// A rejected dependency operation: the `blocks` subgraph would stop
/// being a DAG.
///
/// `path` walks the loop that the operation would close, starting and
/// ending on the same issue (`[b, a, b]` for a mutual block).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleError {
    pub path: Vec<IssueId>,
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dependency cycle: ")?;
        for (i, id) in self.path.iter().enumerate() {
            if i > 0 {
                write!(f, " -> ")?;
            }
            write!(f, "{id}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CycleError {}

/// Check whether adding `source -> target` would close a cycle.
///
/// Returns the closed walk (in node indexes, `source` first and last)
/// when it would; the caller translates indexes back to issue ids.
/// Only `blocks` edges are followed.
#[must_use]
pub fn would_close_cycle(
    graph: &DiGraph<IssueId, DepKind>,
    source: NodeIndex,
    target: NodeIndex,
) -> Option<Vec<NodeIndex>> {
    if source == target {
        return Some(vec![source, source]);
    }

    // BFS from `target` looking for `source`. Parent links let us rebuild
    // the concrete path for the error.
    let mut queue: VecDeque<NodeIndex> = VecDeque::from([target]);
    let mut visited: HashSet<NodeIndex> = HashSet::from([target]);
    let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();

    while let Some(current) = queue.pop_front() {
        if current == source {
            return Some(reconstruct_walk(source, target, &parent));
        }
        for edge in graph.edges(current) {
            if *edge.weight() != DepKind::Blocks {
                continue;
            }
            let next = edge.target();
            if visited.insert(next) {
                parent.insert(next, current);
                queue.push_back(next);
            }
        }
    }

    None
}

/// All cycles currently in the `blocks` subgraph.
///
/// Each entry is one strongly connected component with more than one
/// member (or a self-loop), in node indexes. Sorting and translation to
/// issue ids is the caller's concern.
#[must_use]
pub fn find_cycles(graph: &DiGraph<IssueId, DepKind>) -> Vec<Vec<NodeIndex>> {
    let blocks_only = EdgeFiltered::from_fn(graph, |edge| *edge.weight() == DepKind::Blocks);
    petgraph::algo::tarjan_scc(&blocks_only)
        .into_iter()
        .filter(|component| {
            component.len() > 1
                || component
                    .first()
                    .is_some_and(|&node| has_blocks_self_loop(graph, node))
        })
        .collect()
}

fn has_blocks_self_loop(graph: &DiGraph<IssueId, DepKind>, node: NodeIndex) -> bool {
    graph
        .edges_connecting(node, node)
        .any(|edge| *edge.weight() == DepKind::Blocks)
}

/// Parent links hold a BFS path `target -> ... -> source`. The closed
/// walk for the new edge `source -> target` is that path reversed, with
/// `source` prepended.
fn reconstruct_walk(
    source: NodeIndex,
    target: NodeIndex,
    parent: &HashMap<NodeIndex, NodeIndex>,
) -> Vec<NodeIndex> {
    let mut back = vec![source];
    let mut cursor = source;
    while cursor != target {
        match parent.get(&cursor) {
            Some(&next) => {
                cursor = next;
                back.push(cursor);
            }
            None => break,
        }
    }
    back.reverse();

    let mut walk = Vec::with_capacity(back.len() + 1);
    walk.push(source);
    walk.extend(back);
    walk
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::{CycleError, find_cycles, would_close_cycle};
    use crate::model::dependency::DepKind;
    use crate::model::issue_id::IssueId;
    use petgraph::graph::{DiGraph, NodeIndex};
    use std::collections::HashMap;

    fn id(name: &str) -> IssueId {
        IssueId::derive(name, 7, "cycle-tests", 0)
    }

    fn graph_with(
        nodes: &[&str],
        edges: &[(&str, &str, DepKind)],
    ) -> (DiGraph<IssueId, DepKind>, HashMap<String, NodeIndex>) {
        let mut graph = DiGraph::new();
        let mut map: HashMap<String, NodeIndex> = HashMap::new();

        for &node in nodes {
            let idx = graph.add_node(id(node));
            map.insert(node.to_string(), idx);
        }
        for &(from, to, kind) in edges {
            graph.add_edge(map[from], map[to], kind);
        }
        (graph, map)
    }

    fn names(graph: &DiGraph<IssueId, DepKind>, walk: &[NodeIndex]) -> Vec<IssueId> {
        walk.iter().map(|&idx| graph[idx].clone()).collect()
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let (graph, map) = graph_with(&["a"], &[]);
        let walk = would_close_cycle(&graph, map["a"], map["a"]).unwrap();
        assert_eq!(names(&graph, &walk), vec![id("a"), id("a")]);
    }

    #[test]
    fn mutual_block_walk_shape() {
        // Existing: a blocks b. Adding b -> a closes b -> a -> b.
        let (graph, map) = graph_with(&["a", "b"], &[("a", "b", DepKind::Blocks)]);
        let walk = would_close_cycle(&graph, map["b"], map["a"]).unwrap();
        assert_eq!(names(&graph, &walk), vec![id("b"), id("a"), id("b")]);
    }

    #[test]
    fn three_node_walk_shape() {
        // Existing: a -> b -> c. Adding c -> a closes c -> a -> b -> c.
        let (graph, map) = graph_with(
            &["a", "b", "c"],
            &[("a", "b", DepKind::Blocks), ("b", "c", DepKind::Blocks)],
        );
        let walk = would_close_cycle(&graph, map["c"], map["a"]).unwrap();
        assert_eq!(
            names(&graph, &walk),
            vec![id("c"), id("a"), id("b"), id("c")]
        );
    }

    #[test]
    fn safe_edges_are_not_cycles() {
        let (graph, map) = graph_with(
            &["a", "b", "c", "d"],
            &[("a", "b", DepKind::Blocks), ("b", "c", DepKind::Blocks)],
        );
        // Shortcut along the chain.
        assert!(would_close_cycle(&graph, map["a"], map["c"]).is_none());
        // Fresh root.
        assert!(would_close_cycle(&graph, map["d"], map["a"]).is_none());
    }

    #[test]
    fn non_ordering_edges_are_ignored() {
        // b -> a exists but only as hierarchy; a -> b is still safe.
        let (graph, map) = graph_with(&["a", "b"], &[("b", "a", DepKind::ParentChild)]);
        assert!(would_close_cycle(&graph, map["a"], map["b"]).is_none());
    }

    #[test]
    fn find_cycles_reports_sccs_and_self_loops() {
        let (graph, _) = graph_with(
            &["a", "b", "c", "d", "e", "f", "g"],
            &[
                ("a", "b", DepKind::Blocks),
                ("b", "a", DepKind::Blocks),
                ("c", "d", DepKind::Blocks),
                ("d", "e", DepKind::Blocks),
                ("e", "c", DepKind::Blocks),
                ("f", "f", DepKind::Blocks),
                ("g", "a", DepKind::Blocks),
            ],
        );

        let mut members: Vec<Vec<IssueId>> = find_cycles(&graph)
            .into_iter()
            .map(|component| {
                let mut ids = names(&graph, &component);
                ids.sort_unstable();
                ids
            })
            .collect();
        members.sort_unstable();

        let mut expected = vec![
            {
                let mut v = vec![id("a"), id("b")];
                v.sort_unstable();
                v
            },
            {
                let mut v = vec![id("c"), id("d"), id("e")];
                v.sort_unstable();
                v
            },
            vec![id("f")],
        ];
        expected.sort_unstable();
        assert_eq!(members, expected);
    }

    #[test]
    fn find_cycles_ignores_non_ordering_loops() {
        let (graph, _) = graph_with(
            &["a", "b"],
            &[
                ("a", "b", DepKind::ParentChild),
                ("b", "a", DepKind::ParentChild),
            ],
        );
        assert!(find_cycles(&graph).is_empty());
    }

    #[test]
    fn find_cycles_empty_on_dag() {
        let (graph, _) = graph_with(
            &["a", "b", "c"],
            &[("a", "b", DepKind::Blocks), ("a", "c", DepKind::Blocks)],
        );
        assert!(find_cycles(&graph).is_empty());
    }

    #[test]
    fn error_display_walks_the_loop() {
        let err = CycleError {
            path: vec![id("b"), id("a"), id("b")],
        };
        let rendered = err.to_string();
        assert!(rendered.starts_with("dependency cycle: "));
        assert_eq!(rendered.matches(" -> ").count(), 2);
        assert!(rendered.contains(id("a").as_str()));
    }
}
