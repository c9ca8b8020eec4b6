use petgraph::graph::NodeIndex;
use petgraph::Direction;
use std::collections::{HashMap, VecDeque};

use crate::dag::builder::OperationGraph;

/// A dependency cycle, with the path that closes it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Dependency cycle detected: {}", path.join(" -> "))]
pub struct DependencyCycle {
    /// Resource addresses along the cycle; the first entry is repeated at the end.
    pub path: Vec<String>,
}

/// Resolve the graph into stages using Kahn's algorithm.
///
/// Returns the stage of every node, indexed by node weight (the operation
/// index). Each node lands one stage after its deepest dependency, so every
/// node in a stage only depends on nodes in earlier stages.
pub fn resolve_stages<F>(graph: &OperationGraph, label: F) -> Result<Vec<usize>, DependencyCycle>
where
    F: Fn(usize) -> String,
{
    let mut in_degree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|idx| (idx, graph.neighbors_directed(idx, Direction::Incoming).count()))
        .collect();
    let mut stages = vec![0usize; graph.node_count()];

    let mut roots: Vec<NodeIndex> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(&idx, _)| idx)
        .collect();
    roots.sort();
    let mut queue: VecDeque<NodeIndex> = roots.into_iter().collect();
    let mut visited = 0;

    while let Some(node) = queue.pop_front() {
        visited += 1;
        let stage = stages[graph[node]];
        let mut next: Vec<NodeIndex> = graph.neighbors_directed(node, Direction::Outgoing).collect();
        next.sort();
        for neighbor in next {
            let slot = &mut stages[graph[neighbor]];
            *slot = (*slot).max(stage + 1);
            if let Some(deg) = in_degree.get_mut(&neighbor) {
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(neighbor);
                }
            }
        }
    }

    if visited < graph.node_count() {
        let path = find_cycle(graph)
            .map(|nodes| nodes.into_iter().map(|n| label(graph[n])).collect())
            .unwrap_or_default();
        return Err(DependencyCycle { path });
    }

    Ok(stages)
}

/// Find one cycle in the graph, returned as a closed path of nodes.
pub fn find_cycle(graph: &OperationGraph) -> Option<Vec<NodeIndex>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let mut color: HashMap<NodeIndex, Color> =
        graph.node_indices().map(|n| (n, Color::White)).collect();
    let mut stack: Vec<NodeIndex> = Vec::new();

    fn visit(
        graph: &OperationGraph,
        node: NodeIndex,
        color: &mut HashMap<NodeIndex, Color>,
        stack: &mut Vec<NodeIndex>,
    ) -> Option<Vec<NodeIndex>> {
        color.insert(node, Color::Gray);
        stack.push(node);
        let mut next: Vec<NodeIndex> = graph.neighbors_directed(node, Direction::Outgoing).collect();
        next.sort();
        for neighbor in next {
            match color.get(&neighbor).copied().unwrap_or(Color::White) {
                Color::Gray => {
                    let start = stack.iter().position(|&n| n == neighbor)?;
                    let mut cycle = stack[start..].to_vec();
                    cycle.push(neighbor);
                    return Some(cycle);
                }
                Color::White => {
                    if let Some(cycle) = visit(graph, neighbor, color, stack) {
                        return Some(cycle);
                    }
                }
                Color::Black => {}
            }
        }
        stack.pop();
        color.insert(node, Color::Black);
        None
    }

    let mut nodes: Vec<NodeIndex> = graph.node_indices().collect();
    nodes.sort();
    for node in nodes {
        if color.get(&node).copied() == Some(Color::White) {
            if let Some(cycle) = visit(graph, node, &mut color, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}
